#![allow(dead_code)]

use hifitime::TimeUnits;
use kestrel::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const ODOMETER: Topic = Topic::new(0);
pub const HEARTBEAT: Topic = Topic::new(1);
pub const MODE: Topic = Topic::new(2);

#[derive(Serialize, Deserialize)]
pub struct DriveArgs {
    pub seconds: i64,
    pub distance: f64,
}

/// A toy rover. Every activity just waits and moves the odometer.
#[derive(Clone, Default)]
pub struct Rover {
    /// If set, a daemon bumps the heartbeat cell at this period, forever.
    pub heartbeat: Option<Duration>,
    /// Counts every task instantiation, across all runs.
    pub instantiations: Arc<AtomicUsize>,
}

impl Rover {
    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }
}

impl MissionModel for Rover {
    fn task_factory(&self, activity: &SerializedActivity) -> Result<Box<dyn Task>> {
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(match activity.type_name() {
            "Wait" => {
                let seconds: i64 = activity.arguments()?;
                Box::new(ScriptedTask::new("Wait").wait(seconds.seconds()))
            }
            "Drive" => {
                let args: DriveArgs = activity.arguments()?;
                Box::new(
                    ScriptedTask::new("Drive")
                        .emit(MODE, Effect::Set(Value::Text("driving".into())))
                        .wait(args.seconds.seconds())
                        .emit(ODOMETER, Effect::Add(args.distance))
                        .emit(MODE, Effect::Set(Value::Text("idle".into()))),
                )
            }
            "Explode" => Box::new(ScriptedTask::new("Explode").wait(1.seconds()).fail("kaboom")),
            "Survey" => Box::new(
                ScriptedTask::new("Survey")
                    .wait(1.seconds())
                    .spawn(ScriptedTask::new("Sample").wait(1.seconds()).fail("drill jammed"))
                    .await_children(),
            ),
            other => bail!("unknown activity type {other}"),
        })
    }

    fn resources(&self) -> Vec<(String, ResourceEvaluator)> {
        let odometer: ResourceEvaluator = Arc::new(|q: &mut Querier| {
            q.read(ODOMETER).cloned().unwrap_or(Value::Real(0.0))
        });
        let mode: ResourceEvaluator =
            Arc::new(|q: &mut Querier| q.read(MODE).cloned().unwrap_or(Value::Text("idle".into())));
        vec![("odometer".to_string(), odometer), ("mode".to_string(), mode)]
    }

    fn daemon(&self) -> Option<Box<dyn Task>> {
        let period = self.heartbeat?;
        Some(Box::new(FnTask::new("Heartbeat", move |context, _| {
            context.emit(HEARTBEAT, Effect::Add(1.0));
            Ok(TaskStatus::Delayed(period))
        })))
    }

    fn topics(&self) -> TopicTable {
        TopicTable::from_iter([(ODOMETER, "odometer"), (HEARTBEAT, "heartbeat"), (MODE, "mode")])
    }

    fn initial_cells(&self) -> Cells {
        Cells::from_iter([
            (ODOMETER, Value::Real(0.0)),
            (HEARTBEAT, Value::Real(0.0)),
            (MODE, Value::Text("idle".into())),
        ])
    }
}

pub fn id(n: u64) -> ActivityDirectiveId {
    ActivityDirectiveId::new(n)
}

pub fn wait(seconds: i64) -> SerializedActivity {
    SerializedActivity::new("Wait", &seconds).expect("i64 always encodes")
}

pub fn drive(seconds: i64, distance: f64) -> SerializedActivity {
    SerializedActivity::new("Drive", &DriveArgs { seconds, distance }).expect("args always encode")
}

pub fn at(offset: Duration, activity: SerializedActivity) -> ActivityDirective {
    ActivityDirective::new(offset, activity)
}

pub fn plan_start() -> Time {
    Time::from_gregorian_utc_at_midnight(2030, 1, 1)
}

pub fn configuration() -> SimulationConfiguration {
    SimulationConfiguration::new(7, plan_start())
}

/// Runs a whole plan of the given duration from `cached`.
pub fn run(
    model: &Rover,
    schedule: &Schedule,
    plan_duration: Duration,
    cached: Arc<CachedSimulationEngine>,
    correspondence: &Correspondence,
    should_checkpoint: impl Fn(&SimulationState<'_>) -> bool,
    stop: impl Fn(&SimulationState<'_>) -> bool,
    store: &mut impl CachedEngineStore,
) -> std::result::Result<SimulationResultsInputs, SimulationError> {
    let canceled = AtomicBool::new(false);
    let settings = OrchestratorSettings::default();
    Simulation {
        mission_model: model,
        schedule,
        simulation_start: plan_start(),
        simulation_duration: plan_duration,
        plan_start: plan_start(),
        plan_duration,
        settings: &settings,
        canceled: &canceled,
    }
    .simulate_with_checkpoints(
        cached,
        correspondence,
        should_checkpoint,
        stop,
        store,
        &configuration(),
        &mut |_| {},
    )
}

/// The real-valued profile of a resource, as (start, value) pairs.
pub fn starts(profile: &[Segment]) -> Vec<(Duration, f64)> {
    let mut now = Duration::ZERO;
    profile
        .iter()
        .map(|segment| {
            let start = now;
            now += segment.extent;
            (start, segment.value.as_real().unwrap_or(f64::NAN))
        })
        .collect()
}
