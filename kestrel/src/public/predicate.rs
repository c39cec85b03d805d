//! Conditions evaluated by the orchestrator between batches, deciding when to take a
//! checkpoint and when to stop.

use crate::internal::engine::{SimulationEngine, SpanId};
use crate::public::directive::{ActivityDirectiveId, Schedule};
use hifitime::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A read-only view of a running simulation.
pub struct SimulationState<'a> {
    pub current_time: Duration,
    /// When the next batch is due. None if the engine has nothing left to do.
    pub next_time: Option<Duration>,
    pub engine: &'a SimulationEngine,
    pub schedule: &'a Schedule,
    pub directive_spans: &'a BTreeMap<ActivityDirectiveId, SpanId>,
}

/// True between the last batch at or before each of the given times, and the next batch.
pub fn desired_checkpoints(
    times: impl IntoIterator<Item = Duration>,
) -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    let times: Arc<[Duration]> = times.into_iter().collect();
    move |state: &SimulationState<'_>| {
        times.iter().any(|time| {
            state.current_time <= *time && state.next_time.is_none_or(|next| next > *time)
        })
    }
}

/// True whenever `stop` is, and once the engine runs out of work.
pub fn checkpoint_at_end(
    stop: impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync,
) -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    move |state: &SimulationState<'_>| stop(state) || state.next_time.is_none()
}

pub fn stop_once_activity_has_finished(
    directive: ActivityDirectiveId,
) -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    move |state: &SimulationState<'_>| {
        state
            .directive_spans
            .get(&directive)
            .is_some_and(|span| state.engine.span_is_complete(*span))
    }
}

/// True once every directive in the schedule has been scheduled and has finished.
pub fn once_all_activities_are_finished()
-> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    |state: &SimulationState<'_>| {
        state.schedule.keys().all(|directive| {
            state
                .directive_spans
                .get(directive)
                .is_some_and(|span| state.engine.span_is_complete(*span))
        })
    }
}

pub fn no_condition() -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    |_: &SimulationState<'_>| false
}

pub fn or(
    a: impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync,
    b: impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync,
) -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    move |state: &SimulationState<'_>| a(state) || b(state)
}

/// Asks for `count` checkpoints evenly spread over `(from, to]`.
pub fn spread_checkpoints(
    count: usize,
    from: Duration,
    to: Duration,
) -> impl Fn(&SimulationState<'_>) -> bool + Clone + Send + Sync {
    desired_checkpoints(spread_times(count, from, to))
}

pub(crate) fn spread_times(count: usize, from: Duration, to: Duration) -> Vec<Duration> {
    if count == 0 || to <= from {
        return vec![];
    }
    let start = from.total_nanoseconds();
    let span = to.total_nanoseconds() - start;
    (1..=count as i128)
        .map(|i| Duration::from_total_nanoseconds(start + span * i / count as i128))
        .collect()
}
