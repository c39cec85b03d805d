use crate::internal::anchor::minimum_start_times;
use crate::internal::engine::{SimulationEngine, SpanId};
use crate::internal::timeline::Topic;
use crate::internal::tracker::ResourceTracker;
use crate::public::directive::{ActivityDirective, ActivityDirectiveId, Schedule};
use crate::public::error::SimulationError;
use crate::public::model::MissionModel;
use ahash::AHashMap;
use hifitime::{Duration, Epoch as Time};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Maps directive ids of a new plan to the ids of their value-identical counterparts in a
/// snapshot's schedule.
pub type Correspondence = BTreeMap<ActivityDirectiveId, ActivityDirectiveId>;

/// A frozen simulation, taken between two batches.
///
/// Snapshots are only handed out behind an [Arc] and are never mutated. To continue one, the
/// orchestrator duplicates it, or takes it by value if it holds the only reference.
pub struct CachedSimulationEngine {
    ends_at: Duration,
    schedule: Arc<Schedule>,
    engine: SimulationEngine,
    tracker: ResourceTracker,
    activity_topic: Topic,
    directive_spans: BTreeMap<ActivityDirectiveId, SpanId>,
}

/// The mutable parts of a snapshot, ready to be driven again.
pub(crate) struct ResumedEngine {
    pub ends_at: Duration,
    pub engine: SimulationEngine,
    pub tracker: ResourceTracker,
    pub activity_topic: Topic,
    pub directive_spans: BTreeMap<ActivityDirectiveId, SpanId>,
}

impl CachedSimulationEngine {
    /// A snapshot of a simulation that hasn't started yet, except for the first step of the
    /// model's daemon.
    ///
    /// Its `ends_at` is [Duration::MIN], so it is valid for every plan.
    pub fn empty<M: MissionModel + ?Sized>(
        model: &M,
        simulation_start: Time,
    ) -> Result<Arc<Self>, SimulationError> {
        let mut engine = SimulationEngine::new(model.initial_cells());
        if let Some(daemon) = model.daemon() {
            engine.schedule_task(Duration::ZERO, daemon);
            engine
                .step(Duration::MAX)
                .map_err(|failure| SimulationError::Simulation {
                    elapsed: engine.elapsed(),
                    instant: simulation_start + engine.elapsed(),
                    directive: None,
                    trail: failure.span.map(|s| engine.trail(s)).unwrap_or_default(),
                    cause: failure.cause,
                })?;
        }

        let mut tracker = ResourceTracker::new(model.initial_cells());
        for (name, evaluator) in model.resources() {
            tracker.track(name, evaluator);
        }

        Ok(Arc::new(Self {
            ends_at: Duration::MIN,
            schedule: Arc::new(Schedule::new()),
            engine,
            tracker,
            activity_topic: model.activity_topic(),
            directive_spans: BTreeMap::new(),
        }))
    }

    pub(crate) fn freeze(
        ends_at: Duration,
        schedule: Arc<Schedule>,
        engine: SimulationEngine,
        tracker: ResourceTracker,
        activity_topic: Topic,
        directive_spans: BTreeMap<ActivityDirectiveId, SpanId>,
    ) -> Self {
        Self {
            ends_at,
            schedule,
            engine,
            tracker,
            activity_topic,
            directive_spans,
        }
    }

    pub fn ends_at(&self) -> Duration {
        self.ends_at
    }

    /// The exact schedule this snapshot accounts for.
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn engine(&self) -> &SimulationEngine {
        &self.engine
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn activity_topic(&self) -> Topic {
        self.activity_topic
    }

    pub fn directive_spans(&self) -> &BTreeMap<ActivityDirectiveId, SpanId> {
        &self.directive_spans
    }

    pub(crate) fn duplicate(&self) -> ResumedEngine {
        ResumedEngine {
            ends_at: self.ends_at,
            engine: self.engine.duplicate(),
            tracker: self.tracker.clone(),
            activity_topic: self.activity_topic,
            directive_spans: self.directive_spans.clone(),
        }
    }

    pub(crate) fn into_resumed(self) -> ResumedEngine {
        ResumedEngine {
            ends_at: self.ends_at,
            engine: self.engine,
            tracker: self.tracker,
            activity_topic: self.activity_topic,
            directive_spans: self.directive_spans,
        }
    }
}

/// Picks the snapshot that gets furthest into the new plan without simulating anything
/// the new plan disagrees with.
///
/// Returns `None` if no candidate is usable, in which case simulation should start from
/// [CachedSimulationEngine::empty].
pub fn best_cached_engine(
    schedule: &Schedule,
    candidates: &[Arc<CachedSimulationEngine>],
    plan_duration: Duration,
) -> Option<(Arc<CachedSimulationEngine>, Correspondence)> {
    let mut best: Option<(Arc<CachedSimulationEngine>, Correspondence)> = None;
    for candidate in candidates {
        if let Some((current, _)) = &best {
            if candidate.ends_at <= current.ends_at {
                continue;
            }
        }
        let (invalidation, correspondence) =
            match invalidation_time(schedule, candidate.schedule(), plan_duration) {
                Ok(result) => result,
                Err(error) => {
                    tracing::debug!(ends_at = %candidate.ends_at, %error, "snapshot is unusable");
                    continue;
                }
            };
        if invalidation.is_none_or(|time| candidate.ends_at < time) {
            best = Some((candidate.clone(), correspondence));
        }
    }

    if let Some((engine, _)) = &best {
        tracing::info!(ends_at = %engine.ends_at, "Re-using simulation engine");
    }
    best
}

/// The earliest time at which a simulation of `new` could differ from a simulation of
/// `cached`, or None if they can't differ at all.
fn invalidation_time(
    new: &Schedule,
    cached: &Schedule,
    plan_duration: Duration,
) -> Result<(Option<Duration>, Correspondence), SimulationError> {
    let new_starts = minimum_start_times(new, plan_duration)?;
    let cached_starts = minimum_start_times(cached, plan_duration)?;
    let mut union = cached.clone();
    union.extend(new.iter().map(|(id, directive)| (*id, directive.clone())));
    let union_starts = minimum_start_times(&union, plan_duration)?;

    // Reversed, so that popping hands out the lowest id first.
    let mut available: AHashMap<&ActivityDirective, Vec<ActivityDirectiveId>> = AHashMap::new();
    for (id, directive) in cached.iter().rev() {
        available.entry(directive).or_default().push(*id);
    }

    let mut invalidation: Option<Duration> = None;
    let mut earliest = |time: Duration| {
        invalidation = Some(invalidation.map_or(time, |existing| existing.min(time)));
    };

    let mut correspondence = Correspondence::new();
    for (id, directive) in new {
        match available.get_mut(directive).and_then(Vec::pop) {
            Some(cached_id) => {
                // Identical directives still move if something they are anchored to moved.
                let (now, before) = (new_starts[id], cached_starts[&cached_id]);
                if now != before {
                    earliest(now.min(before));
                }
                correspondence.insert(*id, cached_id);
            }
            None => earliest(new_starts[id]),
        }
    }

    let matched: BTreeSet<ActivityDirectiveId> = correspondence.values().copied().collect();
    for id in cached.keys().filter(|id| !matched.contains(id)) {
        earliest(cached_starts[id].min(union_starts[id]));
    }

    Ok((invalidation, correspondence))
}
