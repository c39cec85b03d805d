use crate::activities::recharge_potato::{RechargePotato, RechargeTask};
use kestrel::reexports::hifitime::{TimeScale, TimeUnits};
use kestrel::*;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod activities;

pub const BATTERY: Topic = Topic::new(0);
pub const MODE: Topic = Topic::new(1);

struct PotatoSat;

impl MissionModel for PotatoSat {
    fn task_factory(&self, activity: &SerializedActivity) -> Result<Box<dyn Task>> {
        match activity.type_name() {
            "RechargePotato" => Ok(Box::new(RechargeTask::new(activity.arguments()?))),
            "Photograph" => Ok(Box::new(
                ScriptedTask::new("Photograph")
                    .emit(MODE, Effect::Set(Value::Text("imaging".into())))
                    .emit(BATTERY, Effect::Add(-3.0))
                    .wait(2.seconds())
                    .emit(MODE, Effect::Set(Value::Text("idle".into()))),
            )),
            other => bail!("PotatoSat can't do {other}"),
        }
    }

    fn resources(&self) -> Vec<(String, ResourceEvaluator)> {
        let battery: ResourceEvaluator =
            Arc::new(|q: &mut Querier| q.read(BATTERY).cloned().unwrap_or(Value::Real(0.0)));
        let mode: ResourceEvaluator =
            Arc::new(|q: &mut Querier| q.read(MODE).cloned().unwrap_or(Value::Text("idle".into())));
        vec![("battery".to_string(), battery), ("mode".to_string(), mode)]
    }

    fn topics(&self) -> TopicTable {
        TopicTable::from_iter([(BATTERY, "battery"), (MODE, "mode")])
    }

    fn initial_cells(&self) -> Cells {
        Cells::from_iter([
            (BATTERY, Value::Real(0.0)),
            (MODE, Value::Text("idle".into())),
        ])
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kestrel=info,potato_sat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let plan_start = Time::now()?.to_time_scale(TimeScale::TAI);
    let horizon = PlanningHorizon::new(plan_start, plan_start + 10.minutes());
    let mut facade = CheckpointSimulationFacade::new(
        PotatoSat,
        InMemoryCachedEngineStore::new(8),
        horizon,
        SimulationConfiguration::new(1, plan_start),
    );

    let recharge = |amount| SerializedActivity::new("RechargePotato", &RechargePotato { amount });
    let photograph = SerializedActivity::without_arguments("Photograph");
    let mut plan = Schedule::from([
        (ActivityDirectiveId::new(1), ActivityDirective::new(5.seconds(), recharge(10)?)),
        (
            ActivityDirectiveId::new(2),
            ActivityDirective::new(30.seconds(), photograph.clone())
                .anchored_to(ActivityDirectiveId::new(1), false),
        ),
        (ActivityDirectiveId::new(3), ActivityDirective::new(5.minutes(), recharge(20)?)),
    ]);

    let first = facade.simulate(&plan, SimulationMode::AllActivities)?;
    tracing::info!(elapsed = %first.results.elapsed, "first plan simulated");

    // The scheduler decides to take another picture late in the plan.
    plan.insert(
        ActivityDirectiveId::new(4),
        ActivityDirective::new(7.minutes(), photograph),
    );
    let second = facade.simulate(&plan, SimulationMode::AllActivities)?;
    tracing::info!(
        reused_from = ?second.reused_from,
        elapsed = %second.results.elapsed,
        "second plan simulated"
    );

    let mut now = Duration::ZERO;
    for segment in second.results.profile("battery")? {
        println!("{}: battery = {:?}", plan_start + now, segment.value);
        now += segment.extent;
    }
    println!(
        "Simulated {} in total over two plans",
        facade.total_simulation_time()
    );

    Ok(())
}
