//! # Kestrel
//!
//! An incremental re-simulation control plane for Aerie-style spacecraft plans.
//!
//! A scheduler iterates over thousands of plan edits, and cannot afford to re-simulate a multi-day
//! plan from time zero on every one of them. Kestrel sits between the scheduler and a discrete
//! event engine and makes sure that previously simulated work is reused whenever it is still valid.
//! It does four things:
//!
//! - **Anchor resolution.** Activity directives may be anchored to the start or end of other directives,
//!   or to the start or end of the plan. The resolver collapses each anchor chain into either an
//!   absolute start time, or an offset from the completion of the one directive whose end time can't
//!   be known until it is simulated.
//! - **Checkpoint selection.** Every stored snapshot remembers the exact schedule it accounts for.
//!   For a new plan, each snapshot gets an *invalidation time*: the earliest moment at which the new
//!   plan could possibly disagree with it. Any snapshot that ends strictly before its invalidation time
//!   can be resumed, and the latest such snapshot wins.
//! - **Orchestration.** The engine is driven batch by batch, taking snapshots when a caller-supplied
//!   predicate says so, scheduling end-anchored directives as soon as their anchors finish, and
//!   stopping cooperatively on cancellation.
//! - **Lazy resource profiles.** Derived resources are only recomputed when a topic they actually read
//!   has changed, or when their own evaluation said they would go stale.
//!
//! ## Quick-start
//!
//! A mission model hands the engine tasks for serialized activities, and declares the resources
//! it wants profiles for.
//!
//! ```
//! use kestrel::*;
//! use hifitime::TimeUnits;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! struct Counter;
//!
//! const COUNT: Topic = Topic::new(0);
//!
//! impl MissionModel for Counter {
//!     fn task_factory(&self, activity: &SerializedActivity) -> Result<Box<dyn Task>> {
//!         match activity.type_name() {
//!             "Increment" => Ok(Box::new(
//!                 ScriptedTask::new("Increment")
//!                     .emit(COUNT, Effect::Add(1.0))
//!                     .wait(1.seconds()),
//!             )),
//!             other => bail!("unknown activity type {other}"),
//!         }
//!     }
//!
//!     fn resources(&self) -> Vec<(String, ResourceEvaluator)> {
//!         let count: ResourceEvaluator =
//!             Arc::new(|q: &mut Querier| q.read(COUNT).cloned().unwrap_or(Value::Real(0.0)));
//!         vec![("count".to_string(), count)]
//!     }
//!
//!     fn topics(&self) -> TopicTable {
//!         TopicTable::from_iter([(COUNT, "count")])
//!     }
//!
//!     fn initial_cells(&self) -> Cells {
//!         Cells::from_iter([(COUNT, Value::Real(0.0))])
//!     }
//! }
//!
//! # fn main() -> std::result::Result<(), SimulationError> {
//! let plan_start = Time::from_tai_seconds(0.0);
//! let mut schedule = Schedule::new();
//! schedule.insert(
//!     ActivityDirectiveId::new(1),
//!     ActivityDirective::new(2.seconds(), SerializedActivity::without_arguments("Increment")),
//! );
//!
//! let canceled = AtomicBool::new(false);
//! let settings = OrchestratorSettings::default();
//! let simulation = Simulation {
//!     mission_model: &Counter,
//!     schedule: &schedule,
//!     simulation_start: plan_start,
//!     simulation_duration: 10.seconds(),
//!     plan_start,
//!     plan_duration: 10.seconds(),
//!     settings: &settings,
//!     canceled: &canceled,
//! };
//!
//! let configuration = SimulationConfiguration::new(1, plan_start);
//! let mut store = InMemoryCachedEngineStore::new(2);
//! let results = simulation.simulate_with_checkpoints(
//!     CachedSimulationEngine::empty(&Counter, plan_start)?,
//!     &Correspondence::new(),
//!     no_condition(),
//!     once_all_activities_are_finished(),
//!     &mut store,
//!     &configuration,
//!     &mut |_| {},
//! )?;
//!
//! assert_eq!(3.seconds(), results.elapsed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Timekeeping
//!
//! Like the rest of the ecosystem this crate grew out of, Kestrel uses
//! [hifitime](https://docs.rs/hifitime/latest/hifitime/). Elapsed simulation time and directive
//! offsets are [Duration]s; wall-clock instants (plan start, simulation start, error reports)
//! are [Epoch][Time]s, renamed to [Time] for simplicity.

pub mod internal;
pub mod public;

pub use crate::internal::anchor::{Predecessor, ResolvedEntry, ResolvedSchedule};
pub use crate::internal::engine::task::{FnTask, ScriptedTask, Task, TaskContext, TaskStatus};
pub use crate::internal::engine::{EngineFailure, SimulationEngine, Span, SpanId, StepResult};
pub use crate::internal::timeline::{
    Cells, Effect, Event, TimePoint, Timeline, Topic, TopicTable, Value,
};
pub use crate::internal::tracker::{Querier, ResourceEvaluator, ResourceTracker, Segment};
pub use crate::public::checkpoint::{CachedSimulationEngine, Correspondence, best_cached_engine};
pub use crate::public::config::{OrchestratorSettings, SimulationConfiguration};
pub use crate::public::directive::{
    ActivityDirective, ActivityDirectiveId, Schedule, SerializedActivity,
};
pub use crate::public::error::SimulationError;
pub use crate::public::facade::{CheckpointSimulationFacade, FacadeRun, PlanningHorizon, SimulationMode};
pub use crate::public::model::MissionModel;
pub use crate::public::predicate::{
    SimulationState, checkpoint_at_end, desired_checkpoints, no_condition,
    once_all_activities_are_finished, or, spread_checkpoints, stop_once_activity_has_finished,
};
pub use crate::public::simulation::{Simulation, SimulationOutcome, SimulationResultsInputs};
pub use crate::public::store::{CachedEngineStore, EvictionPolicy, InMemoryCachedEngineStore};

pub use anyhow::{Context, Error, Result, anyhow, bail};
pub use hifitime::{Duration, Epoch as Time};

pub mod reexports {
    pub use anyhow;
    pub use hifitime;
}
