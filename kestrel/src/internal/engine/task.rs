#![doc(hidden)]

use crate::internal::engine::SpanId;
use crate::internal::timeline::{Cells, Effect, Event, Topic, Value};
use crate::public::directive::ActivityDirectiveId;
use anyhow::bail;
use hifitime::Duration;
use std::sync::Arc;

/// What a task wants to happen after one of its steps.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TaskStatus {
    Completed,
    /// Step again after the given duration.
    Delayed(Duration),
    /// Step again once every child spawned so far has completed.
    AwaitingChildren,
}

/// A resumable unit of simulated work.
///
/// Tasks must be duplicable, so that a snapshot of an engine can be continued independently
/// of the engine it was taken from.
pub trait Task: Send + Sync {
    fn type_name(&self) -> &str;
    fn step(&mut self, context: &mut TaskContext<'_>) -> anyhow::Result<TaskStatus>;
    fn duplicate(&self) -> Box<dyn Task>;
}

/// A task's view of the engine during one step.
pub struct TaskContext<'a> {
    pub(crate) now: Duration,
    pub(crate) span: SpanId,
    pub(crate) cells: &'a mut Cells,
    pub(crate) events: &'a mut Vec<Event>,
    pub(crate) spawned: &'a mut Vec<Box<dyn Task>>,
}

impl TaskContext<'_> {
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn span(&self) -> SpanId {
        self.span
    }

    /// Reads a cell, including the effects of events emitted earlier in the same batch.
    pub fn read(&self, topic: Topic) -> Option<&Value> {
        self.cells.get(topic)
    }

    pub fn emit(&mut self, topic: Topic, effect: Effect) {
        let event = Event {
            topic,
            effect,
            provenance: self.span,
        };
        self.cells.apply(&event);
        self.events.push(event);
    }

    /// Starts a child task at the current instant, in the current batch.
    pub fn spawn(&mut self, task: Box<dyn Task>) {
        self.spawned.push(task);
    }
}

/// Wraps the task of a directive, announcing the directive on the activity topic before
/// the first step.
pub(crate) struct DirectiveTask {
    directive: ActivityDirectiveId,
    activity_topic: Topic,
    announced: bool,
    inner: Box<dyn Task>,
}

impl DirectiveTask {
    pub(crate) fn new(
        directive: ActivityDirectiveId,
        activity_topic: Topic,
        inner: Box<dyn Task>,
    ) -> Self {
        Self {
            directive,
            activity_topic,
            announced: false,
            inner,
        }
    }
}

impl Task for DirectiveTask {
    fn type_name(&self) -> &str {
        self.inner.type_name()
    }

    fn step(&mut self, context: &mut TaskContext<'_>) -> anyhow::Result<TaskStatus> {
        if !self.announced {
            context.emit(self.activity_topic, Effect::Marker(self.directive));
            self.announced = true;
        }
        self.inner.step(context)
    }

    fn duplicate(&self) -> Box<dyn Task> {
        Box::new(Self {
            directive: self.directive,
            activity_topic: self.activity_topic,
            announced: self.announced,
            inner: self.inner.duplicate(),
        })
    }
}

#[derive(Clone, Debug)]
enum Instruction {
    Emit(Topic, Effect),
    Wait(Duration),
    Spawn(ScriptedTask),
    AwaitChildren,
    Fail(String),
}

/// A task described as a fixed list of instructions.
///
/// ```
/// # use kestrel::*;
/// # use hifitime::TimeUnits;
/// let heater = ScriptedTask::new("HeaterOn")
///     .emit(Topic::new(3), Effect::Set(Value::Boolean(true)))
///     .wait(10.minutes())
///     .emit(Topic::new(3), Effect::Set(Value::Boolean(false)));
/// ```
#[derive(Clone, Debug)]
pub struct ScriptedTask {
    type_name: Arc<str>,
    script: Vec<Instruction>,
    cursor: usize,
}

impl ScriptedTask {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.into(),
            script: vec![],
            cursor: 0,
        }
    }

    pub fn emit(mut self, topic: Topic, effect: Effect) -> Self {
        self.script.push(Instruction::Emit(topic, effect));
        self
    }

    pub fn wait(mut self, duration: Duration) -> Self {
        self.script.push(Instruction::Wait(duration));
        self
    }

    pub fn spawn(mut self, child: ScriptedTask) -> Self {
        self.script.push(Instruction::Spawn(child));
        self
    }

    pub fn await_children(mut self) -> Self {
        self.script.push(Instruction::AwaitChildren);
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.script.push(Instruction::Fail(message.into()));
        self
    }
}

impl Task for ScriptedTask {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn step(&mut self, context: &mut TaskContext<'_>) -> anyhow::Result<TaskStatus> {
        while let Some(instruction) = self.script.get(self.cursor) {
            self.cursor += 1;
            match instruction {
                Instruction::Emit(topic, effect) => context.emit(*topic, effect.clone()),
                Instruction::Wait(duration) => return Ok(TaskStatus::Delayed(*duration)),
                Instruction::Spawn(child) => context.spawn(Box::new(child.clone())),
                Instruction::AwaitChildren => return Ok(TaskStatus::AwaitingChildren),
                Instruction::Fail(message) => bail!("{message}"),
            }
        }
        Ok(TaskStatus::Completed)
    }

    fn duplicate(&self) -> Box<dyn Task> {
        Box::new(self.clone())
    }
}

type StepFn = dyn Fn(&mut TaskContext<'_>, usize) -> anyhow::Result<TaskStatus> + Send + Sync;

/// A task driven by a closure, for behavior that depends on the cells it reads.
///
/// The closure receives the number of steps taken before this one.
#[derive(Clone)]
pub struct FnTask {
    type_name: Arc<str>,
    step: Arc<StepFn>,
    steps_taken: usize,
}

impl FnTask {
    pub fn new(
        type_name: &str,
        step: impl Fn(&mut TaskContext<'_>, usize) -> anyhow::Result<TaskStatus> + Send + Sync + 'static,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            step: Arc::new(step),
            steps_taken: 0,
        }
    }
}

impl Task for FnTask {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn step(&mut self, context: &mut TaskContext<'_>) -> anyhow::Result<TaskStatus> {
        let status = (self.step)(context, self.steps_taken)?;
        self.steps_taken += 1;
        Ok(status)
    }

    fn duplicate(&self) -> Box<dyn Task> {
        Box::new(self.clone())
    }
}
