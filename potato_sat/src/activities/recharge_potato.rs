use crate::{BATTERY, MODE};
use kestrel::reexports::hifitime::TimeUnits;
use kestrel::{Effect, Result, Task, TaskContext, TaskStatus, Value};
use serde::{Deserialize, Serialize};

#[derive(Clone, Hash, Serialize, Deserialize)]
pub struct RechargePotato {
    pub amount: u32,
}

/// Charges one unit per second until `amount` units have been added.
#[derive(Clone)]
pub struct RechargeTask {
    remaining: u32,
    started: bool,
}

impl RechargeTask {
    pub fn new(args: RechargePotato) -> Self {
        Self {
            remaining: args.amount,
            started: false,
        }
    }
}

impl Task for RechargeTask {
    fn type_name(&self) -> &str {
        "RechargePotato"
    }

    fn step(&mut self, context: &mut TaskContext<'_>) -> Result<TaskStatus> {
        if !self.started {
            self.started = true;
            context.emit(MODE, Effect::Set(Value::Text("charging".into())));
        }
        if self.remaining == 0 {
            context.emit(MODE, Effect::Set(Value::Text("idle".into())));
            return Ok(TaskStatus::Completed);
        }
        self.remaining -= 1;
        context.emit(BATTERY, Effect::Add(1.0));
        Ok(TaskStatus::Delayed(1.seconds()))
    }

    fn duplicate(&self) -> Box<dyn Task> {
        Box::new(self.clone())
    }
}
