use crate::public::checkpoint::{CachedSimulationEngine, Correspondence, best_cached_engine};
use crate::public::config::{OrchestratorSettings, SimulationConfiguration};
use crate::public::directive::{ActivityDirectiveId, Schedule};
use crate::public::error::SimulationError;
use crate::public::model::MissionModel;
use crate::public::predicate::{
    SimulationState, no_condition, once_all_activities_are_finished, or, spread_checkpoints,
    stop_once_activity_has_finished,
};
use crate::public::simulation::{Simulation, SimulationResultsInputs};
use crate::public::store::CachedEngineStore;
use hifitime::{Duration, Epoch as Time};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

type BoxedPredicate = Box<dyn Fn(&SimulationState<'_>) -> bool + Send + Sync>;

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct PlanningHorizon {
    pub start: Time,
    pub end: Time,
}

impl PlanningHorizon {
    pub fn new(start: Time, end: Time) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SimulationMode {
    /// Simulate up to the given offset from the horizon start, never stopping early.
    Until(Duration),
    /// Simulate until the directive has finished.
    UntilActivityEnds(ActivityDirectiveId),
    /// Simulate until every directive has finished.
    AllActivities,
}

pub struct FacadeRun {
    pub results: SimulationResultsInputs,
    /// The plan as simulated. Directives that matched a reused snapshot carry the ids they
    /// had in that snapshot's schedule.
    pub schedule: Schedule,
    /// Maps each directive id of the submitted plan to the id it was simulated under.
    pub ids: BTreeMap<ActivityDirectiveId, ActivityDirectiveId>,
    /// How far into the plan the reused snapshot was, if one was reused.
    pub reused_from: Option<Duration>,
}

/// Simulates one plan after another, reusing as much previous work as possible.
pub struct CheckpointSimulationFacade<M: MissionModel, S: CachedEngineStore> {
    mission_model: M,
    store: S,
    horizon: PlanningHorizon,
    configuration: SimulationConfiguration,
    settings: OrchestratorSettings,
    canceled: Arc<AtomicBool>,
    total_simulation_time: Duration,
}

impl<M: MissionModel, S: CachedEngineStore> CheckpointSimulationFacade<M, S> {
    pub fn new(
        mission_model: M,
        store: S,
        horizon: PlanningHorizon,
        configuration: SimulationConfiguration,
    ) -> Self {
        Self {
            mission_model,
            store,
            horizon,
            configuration,
            settings: OrchestratorSettings::default(),
            canceled: Arc::new(AtomicBool::new(false)),
            total_simulation_time: Duration::ZERO,
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// A flag that cancels the current and all future runs when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.canceled.clone()
    }

    /// Simulated time actually computed, summed over every run. Reused time is not counted.
    pub fn total_simulation_time(&self) -> Duration {
        self.total_simulation_time
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn mission_model(&self) -> &M {
        &self.mission_model
    }

    pub fn simulate(
        &mut self,
        schedule: &Schedule,
        mode: SimulationMode,
    ) -> Result<FacadeRun, SimulationError> {
        let plan_duration = self.horizon.duration();
        let best = {
            let candidates = self.store.cached_engines(&self.configuration);
            best_cached_engine(schedule, &candidates, plan_duration)
        };
        let (cached, correspondence, reused_from) = match best {
            Some((engine, correspondence)) => {
                self.store.register_used(&engine);
                let ends_at = engine.ends_at();
                (engine, correspondence, Some(ends_at))
            }
            None => (
                CachedSimulationEngine::empty(&self.mission_model, self.horizon.start)?,
                Correspondence::new(),
                None,
            ),
        };

        let (simulated, ids) = replace_ids(schedule, &correspondence);
        let simulated_correspondence: Correspondence = correspondence
            .iter()
            .map(|(new, old)| (ids.get(new).copied().unwrap_or(*new), *old))
            .collect();

        let simulation_duration = match mode {
            SimulationMode::Until(time) => time,
            _ => plan_duration,
        };
        let from = cached.ends_at().max(Duration::ZERO);
        let spread = match self.settings.checkpoint_spread {
            0 => self.store.capacity(),
            n => n,
        };
        let checkpoints = spread_checkpoints(spread, from, simulation_duration);
        let (should_checkpoint, stop): (BoxedPredicate, BoxedPredicate) = match mode {
            SimulationMode::Until(_) => (Box::new(checkpoints), Box::new(no_condition())),
            SimulationMode::UntilActivityEnds(id) => {
                let simulated_id = ids.get(&id).copied().unwrap_or(id);
                (
                    Box::new(checkpoints),
                    Box::new(stop_once_activity_has_finished(simulated_id)),
                )
            }
            SimulationMode::AllActivities => (
                Box::new(or(checkpoints, once_all_activities_are_finished())),
                Box::new(once_all_activities_are_finished()),
            ),
        };

        let simulation = Simulation {
            mission_model: &self.mission_model,
            schedule: &simulated,
            simulation_start: self.horizon.start,
            simulation_duration,
            plan_start: self.horizon.start,
            plan_duration,
            settings: &self.settings,
            canceled: &self.canceled,
        };
        let results = simulation.simulate_with_checkpoints(
            cached,
            &simulated_correspondence,
            should_checkpoint,
            stop,
            &mut self.store,
            &self.configuration,
            &mut |_| {},
        )?;

        if results.elapsed > from {
            self.total_simulation_time += results.elapsed - from;
        }
        tracing::debug!(
            reused_from = ?reused_from,
            elapsed = %results.elapsed,
            outcome = ?results.outcome,
            "simulation finished"
        );

        Ok(FacadeRun {
            results,
            schedule: simulated,
            ids,
            reused_from,
        })
    }
}

/// Renames directives to the ids of their counterparts in a snapshot, rewriting anchors
/// to match.
///
/// If renaming would make two directives share an id, nothing is renamed.
fn replace_ids(
    schedule: &Schedule,
    correspondence: &Correspondence,
) -> (Schedule, BTreeMap<ActivityDirectiveId, ActivityDirectiveId>) {
    let mut ids: BTreeMap<ActivityDirectiveId, ActivityDirectiveId> = schedule
        .keys()
        .map(|id| (*id, correspondence.get(id).copied().unwrap_or(*id)))
        .collect();
    let distinct: BTreeSet<ActivityDirectiveId> = ids.values().copied().collect();
    if distinct.len() != ids.len() {
        tracing::debug!("directive ids collide with the snapshot's; keeping them as they are");
        ids = schedule.keys().map(|id| (*id, *id)).collect();
    }

    let replaced = schedule
        .iter()
        .map(|(id, directive)| {
            let mut directive = directive.clone();
            directive.anchor_id = directive
                .anchor_id
                .map(|anchor| ids.get(&anchor).copied().unwrap_or(anchor));
            (ids[id], directive)
        })
        .collect();
    (replaced, ids)
}
