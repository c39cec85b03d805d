#![doc(hidden)]

//! A small discrete-event engine.
//!
//! Tasks are stepped in batches. A batch runs every task due at the next pending instant,
//! in span order, including children spawned during the batch, and produces one commit on
//! the [Timeline]. Time passing between batches produces a delta.

pub mod task;

use crate::internal::engine::task::{Task, TaskContext, TaskStatus};
use crate::internal::timeline::{Cells, Effect, Event, Timeline, Topic};
use crate::public::directive::ActivityDirectiveId;
use derive_more::with_trait::Error as DeriveError;
use hifitime::Duration;
use immutable_chunkmap::map::MapM;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    Debug,
    derive_more::Display,
)]
#[display("span#{_0}")]
pub struct SpanId(u64);

impl SpanId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The record of one task's lifetime. A span ends when its task and all of its children
/// have completed.
#[derive(Clone, PartialEq, Debug)]
pub struct Span {
    pub parent: Option<SpanId>,
    pub type_name: Arc<str>,
    pub start: Duration,
    pub end: Option<Duration>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum StepResult {
    NoJobs,
    /// The next job is after the horizon; time has been advanced to the horizon.
    AtHorizon,
    Nominal {
        elapsed: Duration,
        topics: SmallVec<Topic, 4>,
    },
}

/// A task returned an error.
#[derive(DeriveError)]
pub struct EngineFailure {
    pub span: Option<SpanId>,
    pub cause: anyhow::Error,
}

impl Display for EngineFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.span {
            Some(span) => write!(f, "task in {span} failed: {}", self.cause),
            None => write!(f, "engine failed: {}", self.cause),
        }
    }
}

impl Debug for EngineFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Waiting {
    Nothing,
    Children,
    Finished,
}

struct TaskEntry {
    task: Box<dyn Task>,
    children: usize,
    waiting: Waiting,
}

impl TaskEntry {
    fn new(task: Box<dyn Task>) -> Self {
        Self {
            task,
            children: 0,
            waiting: Waiting::Nothing,
        }
    }
}

pub struct SimulationEngine {
    elapsed: Duration,
    initial_cells: Cells,
    cells: Cells,
    timeline: Timeline,
    tasks: BTreeMap<SpanId, TaskEntry>,
    unstarted: BTreeMap<SpanId, Duration>,
    queue: BTreeSet<(Duration, SpanId)>,
    spans: MapM<SpanId, Span>,
    next_span: u64,
}

impl SimulationEngine {
    pub fn new(initial_cells: Cells) -> Self {
        Self {
            elapsed: Duration::ZERO,
            cells: initial_cells.clone(),
            initial_cells,
            timeline: Timeline::default(),
            tasks: BTreeMap::new(),
            unstarted: BTreeMap::new(),
            queue: BTreeSet::new(),
            spans: MapM::new(),
            next_span: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn peek_next_time(&self) -> Option<Duration> {
        self.queue.first().map(|(time, _)| *time)
    }

    /// Runs the next batch, if it is due no later than `horizon`.
    pub fn step(&mut self, horizon: Duration) -> Result<StepResult, EngineFailure> {
        let Some(time) = self.peek_next_time() else {
            return Ok(StepResult::NoJobs);
        };
        if time > horizon {
            self.advance_to(horizon);
            return Ok(StepResult::AtHorizon);
        }
        self.advance_to(time);

        let mut events = vec![];
        let result = self.run_batch(time, &mut events);
        let mut topics: SmallVec<Topic, 4> = SmallVec::new();
        for event in &events {
            if !topics.contains(&event.topic) {
                topics.push(event.topic);
            }
        }
        self.timeline.push_commit(events);
        result?;

        Ok(StepResult::Nominal {
            elapsed: time,
            topics,
        })
    }

    /// Schedules a root task. Start times in the past are moved to the current time.
    pub fn schedule_task(&mut self, start: Duration, task: Box<dyn Task>) -> SpanId {
        let start = start.max(self.elapsed);
        let span = self.open_span(None, task.type_name(), start);
        self.tasks.insert(span, TaskEntry::new(task));
        self.unstarted.insert(span, start);
        self.queue.insert((start, span));
        span
    }

    /// Removes every root task that hasn't started yet and is scheduled strictly after `time`.
    pub fn unschedule_after(&mut self, time: Duration) {
        let doomed: Vec<(SpanId, Duration)> = self
            .unstarted
            .iter()
            .filter(|(_, start)| **start > time)
            .map(|(span, start)| (*span, *start))
            .collect();
        for (span, start) in doomed {
            self.unstarted.remove(&span);
            self.tasks.remove(&span);
            self.queue.remove(&(start, span));
            self.spans.remove_cow(&span);
        }
    }

    pub fn span(&self, span: SpanId) -> Option<&Span> {
        self.spans.get(&span)
    }

    pub fn has_span(&self, span: SpanId) -> bool {
        self.spans.get(&span).is_some()
    }

    pub fn span_is_complete(&self, span: SpanId) -> bool {
        self.span_end(span).is_some()
    }

    pub fn span_end(&self, span: SpanId) -> Option<Duration> {
        self.spans.get(&span).and_then(|s| s.end)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn initial_cells(&self) -> &Cells {
        &self.initial_cells
    }

    pub fn cells(&self) -> &Cells {
        &self.cells
    }

    /// Finds the directive a span belongs to, by looking for a directive marker emitted by
    /// the span or any of its ancestors.
    pub fn directive_for_span(
        &self,
        span: SpanId,
        activity_topic: Topic,
    ) -> Option<ActivityDirectiveId> {
        self.ancestry(span).into_iter().find_map(|ancestor| {
            self.timeline.events().find_map(|(_, event)| match event {
                Event {
                    topic,
                    effect: Effect::Marker(id),
                    provenance,
                } if *topic == activity_topic && *provenance == ancestor => Some(*id),
                _ => None,
            })
        })
    }

    /// The type names of a span and its ancestors, outermost first.
    pub fn trail(&self, span: SpanId) -> Vec<String> {
        let mut trail: Vec<String> = self
            .ancestry(span)
            .into_iter()
            .filter_map(|s| self.spans.get(&s).map(|record| record.type_name.to_string()))
            .collect();
        trail.reverse();
        trail
    }

    fn ancestry(&self, span: SpanId) -> Vec<SpanId> {
        let mut result = vec![];
        let mut current = Some(span);
        while let Some(s) = current {
            result.push(s);
            current = self.spans.get(&s).and_then(|record| record.parent);
        }
        result
    }

    /// Copies the engine. The copy shares no mutable state with the original.
    pub fn duplicate(&self) -> Self {
        Self {
            elapsed: self.elapsed,
            initial_cells: self.initial_cells.clone(),
            cells: self.cells.clone(),
            timeline: self.timeline.clone(),
            tasks: self
                .tasks
                .iter()
                .map(|(span, entry)| {
                    (
                        *span,
                        TaskEntry {
                            task: entry.task.duplicate(),
                            children: entry.children,
                            waiting: entry.waiting,
                        },
                    )
                })
                .collect(),
            unstarted: self.unstarted.clone(),
            queue: self.queue.clone(),
            spans: self.spans.clone(),
            next_span: self.next_span,
        }
    }

    fn advance_to(&mut self, time: Duration) {
        if time > self.elapsed {
            self.timeline.push_delta(time - self.elapsed);
            self.elapsed = time;
        }
    }

    fn open_span(&mut self, parent: Option<SpanId>, type_name: &str, start: Duration) -> SpanId {
        let span = SpanId(self.next_span);
        self.next_span += 1;
        self.spans.insert_cow(
            span,
            Span {
                parent,
                type_name: type_name.into(),
                start,
                end: None,
            },
        );
        span
    }

    fn run_batch(&mut self, time: Duration, events: &mut Vec<Event>) -> Result<(), EngineFailure> {
        while let Some(&(due, span)) = self.queue.first() {
            if due > time {
                break;
            }
            self.queue.pop_first();
            self.run_task(time, span, events)?;
        }
        Ok(())
    }

    fn run_task(
        &mut self,
        time: Duration,
        span: SpanId,
        events: &mut Vec<Event>,
    ) -> Result<(), EngineFailure> {
        let Some(mut entry) = self.tasks.remove(&span) else {
            return Ok(());
        };
        self.unstarted.remove(&span);

        let mut spawned = vec![];
        let status = entry.task.step(&mut TaskContext {
            now: time,
            span,
            cells: &mut self.cells,
            events,
            spawned: &mut spawned,
        });
        let status = status.map_err(|cause| EngineFailure {
            span: Some(span),
            cause,
        })?;

        for child in spawned {
            let child_span = self.open_span(Some(span), child.type_name(), time);
            self.tasks.insert(child_span, TaskEntry::new(child));
            self.queue.insert((time, child_span));
            entry.children += 1;
        }

        match status {
            TaskStatus::Completed if entry.children == 0 => self.close_span(span, time),
            TaskStatus::Completed => {
                entry.waiting = Waiting::Finished;
                self.tasks.insert(span, entry);
            }
            TaskStatus::Delayed(delay) => {
                self.queue.insert((time + delay.max(Duration::ZERO), span));
                self.tasks.insert(span, entry);
            }
            TaskStatus::AwaitingChildren if entry.children == 0 => {
                self.queue.insert((time, span));
                self.tasks.insert(span, entry);
            }
            TaskStatus::AwaitingChildren => {
                entry.waiting = Waiting::Children;
                self.tasks.insert(span, entry);
            }
        }
        Ok(())
    }

    fn close_span(&mut self, span: SpanId, time: Duration) {
        let mut current = Some(span);
        while let Some(closing) = current.take() {
            let Some(mut record) = self.spans.get(&closing).cloned() else {
                break;
            };
            record.end = Some(time);
            let parent = record.parent;
            self.spans.insert_cow(closing, record);

            let Some(parent) = parent else { break };
            let Some(parent_entry) = self.tasks.get_mut(&parent) else {
                break;
            };
            parent_entry.children -= 1;
            if parent_entry.children > 0 {
                break;
            }
            match parent_entry.waiting {
                Waiting::Nothing => {}
                Waiting::Children => {
                    parent_entry.waiting = Waiting::Nothing;
                    self.queue.insert((time, parent));
                }
                Waiting::Finished => {
                    self.tasks.remove(&parent);
                    current = Some(parent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::engine::task::{FnTask, ScriptedTask};
    use crate::internal::timeline::{TimePoint, Value};
    use hifitime::TimeUnits;

    const LEVEL: Topic = Topic::new(0);

    fn step_all(engine: &mut SimulationEngine) -> Result<Vec<Duration>, EngineFailure> {
        let mut times = vec![];
        while let StepResult::Nominal { elapsed, .. } = engine.step(Duration::MAX)? {
            times.push(elapsed);
        }
        Ok(times)
    }

    #[test]
    fn batches_run_in_time_order() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::from_iter([(LEVEL, Value::Real(0.0))]));
        let late = engine.schedule_task(
            5.seconds(),
            Box::new(ScriptedTask::new("Late").emit(LEVEL, Effect::Add(1.0))),
        );
        let early = engine.schedule_task(
            2.seconds(),
            Box::new(
                ScriptedTask::new("Early")
                    .emit(LEVEL, Effect::Add(10.0))
                    .wait(1.seconds())
                    .emit(LEVEL, Effect::Add(10.0)),
            ),
        );

        assert_eq!(Some(2.seconds()), engine.peek_next_time());
        assert_eq!(
            vec![2.seconds(), 3.seconds(), 5.seconds()],
            step_all(&mut engine)?
        );
        assert_eq!(Some(3.seconds()), engine.span_end(early));
        assert_eq!(Some(5.seconds()), engine.span_end(late));
        assert_eq!(Some(&Value::Real(21.0)), engine.cells().get(LEVEL));
        assert_eq!(5.seconds(), engine.timeline().end());
        Ok(())
    }

    #[test]
    fn parent_span_waits_for_children() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::new());
        let parent = engine.schedule_task(
            Duration::ZERO,
            Box::new(
                ScriptedTask::new("Parent")
                    .spawn(ScriptedTask::new("Child").wait(4.seconds()))
                    .spawn(ScriptedTask::new("Quick")),
            ),
        );
        step_all(&mut engine)?;
        assert_eq!(Some(4.seconds()), engine.span_end(parent));
        Ok(())
    }

    #[test]
    fn awaiting_children_resumes_parent() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::new());
        engine.schedule_task(
            1.seconds(),
            Box::new(
                ScriptedTask::new("Parent")
                    .spawn(
                        ScriptedTask::new("Child")
                            .wait(2.seconds())
                            .emit(LEVEL, Effect::Set(Value::Integer(1))),
                    )
                    .await_children()
                    .emit(LEVEL, Effect::Set(Value::Integer(2))),
            ),
        );
        step_all(&mut engine)?;
        assert_eq!(Some(&Value::Integer(2)), engine.cells().get(LEVEL));
        let (time, last) = engine.timeline().events().last().expect("events were emitted");
        assert_eq!(3.seconds(), time);
        assert_eq!(Effect::Set(Value::Integer(2)), last.effect);
        Ok(())
    }

    #[test]
    fn horizon_stops_time() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::new());
        engine.schedule_task(10.seconds(), Box::new(ScriptedTask::new("Far")));
        assert_eq!(StepResult::AtHorizon, engine.step(4.seconds())?);
        assert_eq!(4.seconds(), engine.elapsed());
        assert_eq!(
            Some(&TimePoint::Delta(4.seconds())),
            engine.timeline().get(0)
        );

        step_all(&mut engine)?;
        assert_eq!(StepResult::NoJobs, engine.step(Duration::MAX)?);
        Ok(())
    }

    #[test]
    fn unschedule_after_keeps_started_and_early_tasks() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::new());
        let started = engine.schedule_task(
            Duration::ZERO,
            Box::new(ScriptedTask::new("Long").wait(10.seconds())),
        );
        let early = engine.schedule_task(2.seconds(), Box::new(ScriptedTask::new("Early")));
        let late = engine.schedule_task(7.seconds(), Box::new(ScriptedTask::new("Late")));
        engine.step(Duration::MAX)?;

        engine.unschedule_after(2.seconds());
        assert!(engine.has_span(started));
        assert!(engine.has_span(early));
        assert!(!engine.has_span(late));
        assert_eq!(
            vec![2.seconds(), 10.seconds()],
            step_all(&mut engine)?
        );
        Ok(())
    }

    #[test]
    fn duplicates_are_independent() -> anyhow::Result<()> {
        let mut engine = SimulationEngine::new(Cells::from_iter([(LEVEL, Value::Real(0.0))]));
        engine.schedule_task(
            Duration::ZERO,
            Box::new(
                ScriptedTask::new("Pump")
                    .emit(LEVEL, Effect::Add(1.0))
                    .wait(1.seconds())
                    .emit(LEVEL, Effect::Add(1.0)),
            ),
        );
        engine.step(Duration::MAX)?;

        let mut copy = engine.duplicate();
        copy.schedule_task(
            Duration::ZERO,
            Box::new(ScriptedTask::new("Extra").emit(LEVEL, Effect::Add(100.0))),
        );
        step_all(&mut copy)?;
        step_all(&mut engine)?;

        assert_eq!(Some(&Value::Real(2.0)), engine.cells().get(LEVEL));
        assert_eq!(Some(&Value::Real(102.0)), copy.cells().get(LEVEL));
        assert_ne!(engine.timeline().len(), copy.timeline().len());
        Ok(())
    }

    #[test]
    fn failures_name_their_span() {
        let mut engine = SimulationEngine::new(Cells::new());
        let topic = Topic::new(9);
        let id = ActivityDirectiveId::new(4);
        let span = engine.schedule_task(
            Duration::ZERO,
            Box::new(FnTask::new("Announcer", move |context, _| {
                context.emit(topic, Effect::Marker(id));
                context.spawn(Box::new(ScriptedTask::new("Broken").fail("boom")));
                Ok(TaskStatus::AwaitingChildren)
            })),
        );

        let failure = match engine.step(Duration::MAX) {
            Err(failure) => failure,
            Ok(result) => panic!("expected a failure, got {result:?}"),
        };
        let failed = failure.span.expect("failure is tagged");
        assert_ne!(span, failed);
        assert_eq!(Some(id), engine.directive_for_span(failed, topic));
        assert_eq!(
            vec!["Announcer".to_string(), "Broken".to_string()],
            engine.trail(failed)
        );
        assert!(failure.to_string().contains("boom"));
    }
}
