use crate::internal::anchor::{Predecessor, ResolvedSchedule, resolve_with_threshold};
use crate::internal::engine::task::DirectiveTask;
use crate::internal::engine::{EngineFailure, SimulationEngine, Span, SpanId, StepResult};
use crate::internal::timeline::{Topic, TopicTable};
use crate::internal::tracker::Segment;
use crate::public::checkpoint::{CachedSimulationEngine, Correspondence, ResumedEngine};
use crate::public::config::{OrchestratorSettings, SimulationConfiguration};
use crate::public::directive::{ActivityDirectiveId, Schedule};
use crate::public::error::SimulationError;
use crate::public::model::MissionModel;
use crate::public::predicate::SimulationState;
use crate::public::store::CachedEngineStore;
use hifitime::{Duration, Epoch as Time};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything one simulation run needs to know about the plan.
pub struct Simulation<'a, M: MissionModel + ?Sized> {
    pub mission_model: &'a M,
    pub schedule: &'a Schedule,
    pub simulation_start: Time,
    pub simulation_duration: Duration,
    pub plan_start: Time,
    pub plan_duration: Duration,
    pub settings: &'a OrchestratorSettings,
    /// Polled between batches. Setting it ends the run early, without corrupting any snapshot.
    pub canceled: &'a AtomicBool,
}

/// Why a run ended. Failures are returned as [SimulationError] instead.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum SimulationOutcome {
    /// The stop predicate was satisfied.
    Stopped,
    /// The engine ran out of work, or reached the end of the simulation duration.
    Exhausted,
    Canceled,
}

/// Everything needed to compute simulation results, without computing them.
pub struct SimulationResultsInputs {
    /// The final state of the run, frozen.
    pub snapshot: Arc<CachedSimulationEngine>,
    pub simulation_start: Time,
    pub elapsed: Duration,
    pub activity_topic: Topic,
    pub topics: TopicTable,
    pub directive_spans: BTreeMap<ActivityDirectiveId, SpanId>,
    pub outcome: SimulationOutcome,
    /// Snapshots saved to the store during this run.
    pub checkpoints: usize,
}

impl SimulationResultsInputs {
    pub fn engine(&self) -> &SimulationEngine {
        self.snapshot.engine()
    }

    pub fn profiles(&self) -> BTreeMap<String, Vec<Segment>> {
        self.snapshot.tracker().profiles(self.elapsed)
    }

    pub fn profile(&self, name: &str) -> Result<Vec<Segment>, SimulationError> {
        self.snapshot.tracker().profile(name, self.elapsed)
    }

    pub fn span_of(&self, directive: ActivityDirectiveId) -> Option<&Span> {
        self.directive_spans
            .get(&directive)
            .and_then(|span| self.engine().span(*span))
    }
}

/// Turns resolved directives into engine tasks, as their predecessors allow.
struct DirectiveScheduler<'s, M: MissionModel + ?Sized> {
    model: &'s M,
    schedule: &'s Schedule,
    resolved: ResolvedSchedule,
    activity_topic: Topic,
    directive_spans: BTreeMap<ActivityDirectiveId, SpanId>,
    /// Directives with dependents that haven't been scheduled yet.
    awaiting: BTreeMap<ActivityDirectiveId, SpanId>,
}

impl<M: MissionModel + ?Sized> DirectiveScheduler<'_, M> {
    /// Reuses the spans of directives that the resumed engine already accounts for.
    fn adopt(
        &mut self,
        engine: &SimulationEngine,
        correspondence: &Correspondence,
        cached_spans: &BTreeMap<ActivityDirectiveId, SpanId>,
    ) {
        for (new_id, cached_id) in correspondence {
            let Some(span) = cached_spans.get(cached_id) else {
                continue;
            };
            if !engine.has_span(*span) {
                continue;
            }
            self.directive_spans.insert(*new_id, *span);
            if self.resolved.has_dependents(*new_id) {
                self.awaiting.insert(*new_id, *span);
            }
        }
    }

    fn schedule_after(
        &mut self,
        engine: &mut SimulationEngine,
        predecessor: Predecessor,
        base: Duration,
    ) -> Result<(), SimulationError> {
        for (id, offset) in self.resolved.get(predecessor).to_vec() {
            if let Some(span) = self.directive_spans.get(&id) {
                if self.resolved.has_dependents(id) {
                    self.awaiting.insert(id, *span);
                }
                continue;
            }
            let Some(directive) = self.schedule.get(&id) else {
                continue;
            };
            let activity = &directive.serialized_activity;
            let task = self.model.task_factory(activity).map_err(|cause| {
                SimulationError::ActivityInstantiation {
                    directive: id,
                    type_name: activity.type_name().to_string(),
                    cause,
                }
            })?;
            let span = engine.schedule_task(
                base + offset,
                Box::new(DirectiveTask::new(id, self.activity_topic, task)),
            );
            self.directive_spans.insert(id, span);
            if self.resolved.has_dependents(id) {
                self.awaiting.insert(id, span);
            }
        }
        Ok(())
    }

    /// Schedules the dependents of every awaited directive that has finished.
    fn schedule_ready(&mut self, engine: &mut SimulationEngine) -> Result<(), SimulationError> {
        loop {
            let ready: Vec<(ActivityDirectiveId, Duration)> = self
                .awaiting
                .iter()
                .filter_map(|(id, span)| engine.span_end(*span).map(|end| (*id, end)))
                .collect();
            if ready.is_empty() {
                return Ok(());
            }
            for (id, end) in ready {
                self.awaiting.remove(&id);
                self.schedule_after(engine, Predecessor::Directive(id), end)?;
            }
        }
    }
}

impl<M: MissionModel + ?Sized> Simulation<'_, M> {
    /// Simulates the plan, continuing from `cached`.
    ///
    /// `correspondence` maps directives of this plan to their counterparts in the snapshot's
    /// schedule, as returned by [crate::best_cached_engine]. Snapshots are saved to `store`
    /// whenever `should_checkpoint` is true, if the store has room for more than one.
    /// Otherwise the only snapshot saved is the final one, and only if `stop` or cancellation
    /// ended the run.
    #[allow(clippy::too_many_arguments)]
    pub fn simulate_with_checkpoints(
        &self,
        cached: Arc<CachedSimulationEngine>,
        correspondence: &Correspondence,
        should_checkpoint: impl Fn(&SimulationState<'_>) -> bool,
        stop: impl Fn(&SimulationState<'_>) -> bool,
        store: &mut (impl CachedEngineStore + ?Sized),
        configuration: &SimulationConfiguration,
        progress: &mut dyn FnMut(Duration),
    ) -> Result<SimulationResultsInputs, SimulationError> {
        let duplication_is_ok = store.capacity() > 1;
        let resumed = if duplication_is_ok {
            cached.duplicate()
        } else {
            store.clear(configuration);
            match Arc::try_unwrap(cached) {
                Ok(owned) => owned.into_resumed(),
                Err(shared) => shared.duplicate(),
            }
        };
        let ResumedEngine {
            ends_at,
            mut engine,
            mut tracker,
            activity_topic,
            directive_spans: cached_spans,
        } = resumed;

        engine.unschedule_after(ends_at);
        let mut elapsed = ends_at.max(Duration::ZERO);
        progress(elapsed);

        let mut resolved = resolve_with_threshold(
            self.schedule,
            self.plan_duration,
            self.settings.parallel_threshold,
        )?;
        resolved.adjust_plan_offsets(self.simulation_start - self.plan_start);
        if ends_at < Duration::ZERO {
            resolved.filter_out_negative_plan_offsets();
        } else {
            resolved.filter_out_plan_offsets_until(ends_at);
        }

        let mut scheduler = DirectiveScheduler {
            model: self.mission_model,
            schedule: self.schedule,
            resolved,
            activity_topic,
            directive_spans: BTreeMap::new(),
            awaiting: BTreeMap::new(),
        };
        scheduler.adopt(&engine, correspondence, &cached_spans);
        scheduler.schedule_after(&mut engine, Predecessor::Plan, Duration::ZERO)?;
        scheduler.schedule_ready(&mut engine)?;

        let schedule = Arc::new(self.schedule.clone());
        let mut checkpoints = 0;

        let outcome = loop {
            let next_time = engine.peek_next_time();
            if self.canceled.load(Ordering::Relaxed) {
                break SimulationOutcome::Canceled;
            }

            let checkpoint_now = duplication_is_ok
                && should_checkpoint(&SimulationState {
                    current_time: elapsed,
                    next_time,
                    engine: &engine,
                    schedule: self.schedule,
                    directive_spans: &scheduler.directive_spans,
                });
            if checkpoint_now {
                let continuing = engine.duplicate();
                let frozen = std::mem::replace(&mut engine, continuing);
                store.save(
                    Arc::new(CachedSimulationEngine::freeze(
                        elapsed,
                        schedule.clone(),
                        frozen,
                        tracker.clone(),
                        activity_topic,
                        scheduler.directive_spans.clone(),
                    )),
                    configuration,
                );
                checkpoints += 1;
                tracing::info!(ends_at = %elapsed, "saved checkpoint");
            }

            if self.canceled.load(Ordering::Relaxed) {
                break SimulationOutcome::Canceled;
            }
            if stop(&SimulationState {
                current_time: elapsed,
                next_time,
                engine: &engine,
                schedule: self.schedule,
                directive_spans: &scheduler.directive_spans,
            }) {
                break SimulationOutcome::Stopped;
            }

            match engine.step(self.simulation_duration) {
                Err(failure) => return Err(self.attribute(&engine, activity_topic, failure)),
                Ok(StepResult::NoJobs) => break SimulationOutcome::Exhausted,
                Ok(StepResult::AtHorizon) => {
                    elapsed = engine.elapsed();
                    progress(elapsed);
                    break SimulationOutcome::Exhausted;
                }
                Ok(StepResult::Nominal { elapsed: now, .. }) => {
                    elapsed = now;
                    progress(elapsed);
                    tracker.update_resources(engine.timeline(), elapsed, false);
                    scheduler.schedule_ready(&mut engine)?;
                }
            }
        };

        if outcome == SimulationOutcome::Canceled {
            tracing::warn!(elapsed = %elapsed, "simulation canceled");
        }

        tracker.update_resources(engine.timeline(), elapsed, true);
        let directive_spans = scheduler.directive_spans;
        let snapshot = Arc::new(CachedSimulationEngine::freeze(
            elapsed,
            schedule,
            engine,
            tracker,
            activity_topic,
            directive_spans.clone(),
        ));
        let resumable = matches!(outcome, SimulationOutcome::Stopped | SimulationOutcome::Canceled);
        if resumable && !duplication_is_ok {
            store.save(snapshot.clone(), configuration);
            checkpoints += 1;
            tracing::info!(ends_at = %elapsed, "saved final checkpoint");
        }

        Ok(SimulationResultsInputs {
            snapshot,
            simulation_start: self.simulation_start,
            elapsed,
            activity_topic,
            topics: self.mission_model.topics(),
            directive_spans,
            outcome,
            checkpoints,
        })
    }

    fn attribute(
        &self,
        engine: &SimulationEngine,
        activity_topic: Topic,
        failure: EngineFailure,
    ) -> SimulationError {
        let elapsed = engine.elapsed();
        SimulationError::Simulation {
            elapsed,
            instant: self.simulation_start + elapsed,
            directive: failure
                .span
                .and_then(|span| engine.directive_for_span(span, activity_topic)),
            trail: failure.span.map(|span| engine.trail(span)).unwrap_or_default(),
            cause: failure.cause,
        }
    }
}
