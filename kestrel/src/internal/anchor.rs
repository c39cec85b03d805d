#![doc(hidden)]

use crate::public::directive::{ActivityDirective, ActivityDirectiveId, Schedule};
use crate::public::error::SimulationError;
use hifitime::Duration;
use std::collections::{BTreeMap, BTreeSet};

/// Directive sets larger than this are split in half and resolved in parallel.
pub const PARALLEL_THRESHOLD: usize = 400;

/// What a resolved offset is measured from.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Predecessor {
    /// The offset is absolute, measured from the plan start.
    Plan,
    /// The offset is measured from the completion of this directive.
    Directive(ActivityDirectiveId),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ResolvedEntry {
    pub predecessor: Predecessor,
    pub directive: ActivityDirectiveId,
    pub offset: Duration,
}

/// A schedule with its anchor chains collapsed, grouped by predecessor.
///
/// Each list is sorted by directive id.
#[derive(Clone, Default, Eq, PartialEq, Debug)]
pub struct ResolvedSchedule(BTreeMap<Predecessor, Vec<(ActivityDirectiveId, Duration)>>);

impl ResolvedSchedule {
    pub fn get(&self, predecessor: Predecessor) -> &[(ActivityDirectiveId, Duration)] {
        self.0.get(&predecessor).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_dependents(&self, directive: ActivityDirectiveId) -> bool {
        self.0.contains_key(&Predecessor::Directive(directive))
    }

    pub fn predecessors(&self) -> impl Iterator<Item = Predecessor> + '_ {
        self.0.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = ResolvedEntry> + '_ {
        self.0.iter().flat_map(|(predecessor, list)| {
            list.iter().map(|(directive, offset)| ResolvedEntry {
                predecessor: *predecessor,
                directive: *directive,
                offset: *offset,
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of resolved directives.
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Shifts every plan-relative offset back by `difference`, for a simulation that starts
    /// `difference` after the plan does.
    pub fn adjust_plan_offsets(&mut self, difference: Duration) {
        if let Some(list) = self.0.get_mut(&Predecessor::Plan) {
            for (_, offset) in list {
                *offset -= difference;
            }
        }
    }

    /// Drops plan-relative entries that start strictly before `cutoff`.
    ///
    /// Entries anchored to the ends of other directives are kept.
    pub fn filter_out_plan_offsets_before(&mut self, cutoff: Duration) {
        if let Some(list) = self.0.get_mut(&Predecessor::Plan) {
            list.retain(|(_, offset)| *offset >= cutoff);
            if list.is_empty() {
                self.0.remove(&Predecessor::Plan);
            }
        }
    }

    pub fn filter_out_negative_plan_offsets(&mut self) {
        self.filter_out_plan_offsets_before(Duration::ZERO);
    }

    /// Drops plan-relative entries that start at or before `time`.
    pub fn filter_out_plan_offsets_until(&mut self, time: Duration) {
        if let Some(list) = self.0.get_mut(&Predecessor::Plan) {
            list.retain(|(_, offset)| *offset > time);
            if list.is_empty() {
                self.0.remove(&Predecessor::Plan);
            }
        }
    }

    fn push(&mut self, predecessor: Predecessor, directive: ActivityDirectiveId, offset: Duration) {
        self.0
            .entry(predecessor)
            .or_default()
            .push((directive, offset));
    }

    fn merge(&mut self, other: ResolvedSchedule) {
        for (predecessor, mut list) in other.0 {
            self.0.entry(predecessor).or_default().append(&mut list);
        }
    }

    fn sort(&mut self) {
        for list in self.0.values_mut() {
            list.sort_unstable_by_key(|(id, _)| *id);
        }
    }
}

/// Resolves every directive's anchor chain.
pub fn resolve(
    schedule: &Schedule,
    plan_duration: Duration,
) -> Result<ResolvedSchedule, SimulationError> {
    resolve_with_threshold(schedule, plan_duration, PARALLEL_THRESHOLD)
}

pub fn resolve_with_threshold(
    schedule: &Schedule,
    plan_duration: Duration,
    threshold: usize,
) -> Result<ResolvedSchedule, SimulationError> {
    validate_anchors(schedule)?;
    let ids: Vec<ActivityDirectiveId> = schedule.keys().copied().collect();
    if ids.len() > threshold {
        tracing::debug!(
            directives = ids.len(),
            threshold,
            "resolving anchors in parallel"
        );
    }
    let mut resolved = resolve_slice(schedule, &ids, plan_duration, threshold.max(1))?;
    resolved.sort();
    Ok(resolved)
}

fn resolve_slice(
    schedule: &Schedule,
    ids: &[ActivityDirectiveId],
    plan_duration: Duration,
    threshold: usize,
) -> Result<ResolvedSchedule, SimulationError> {
    if ids.len() > threshold {
        let (left, right) = ids.split_at(ids.len() / 2);
        let (left, right) = rayon::join(
            || resolve_slice(schedule, left, plan_duration, threshold),
            || resolve_slice(schedule, right, plan_duration, threshold),
        );
        let mut result = left?;
        result.merge(right?);
        Ok(result)
    } else {
        let mut result = ResolvedSchedule::default();
        for id in ids {
            let (predecessor, offset) = resolve_one(schedule, *id, plan_duration)?;
            result.push(predecessor, *id, offset);
        }
        Ok(result)
    }
}

/// Walks start anchors until reaching the plan or an end anchor.
///
/// An end anchor anywhere in the chain keys the entry on that anchor's target, with the
/// offsets summed up to it: B at end(A)+3s and C at start(B)+1s both wait on A, at 3s and 4s.
fn resolve_one(
    schedule: &Schedule,
    id: ActivityDirectiveId,
    plan_duration: Duration,
) -> Result<(Predecessor, Duration), SimulationError> {
    let mut visited = BTreeSet::new();
    let mut current = id;
    let mut offset = Duration::ZERO;
    loop {
        if !visited.insert(current) {
            return Err(SimulationError::AnchorCycle { directive: id });
        }
        let directive = lookup(schedule, id, current)?;
        offset += directive.start_offset;
        match directive.anchor_id {
            None if directive.anchored_to_start => return Ok((Predecessor::Plan, offset)),
            None => return Ok((Predecessor::Plan, offset + plan_duration)),
            Some(anchor) if directive.anchored_to_start => current = anchor,
            Some(anchor) => return Ok((Predecessor::Directive(anchor), offset)),
        }
    }
}

/// The earliest time each directive could start, assuming every activity it is
/// end-anchored to takes no time at all.
pub fn minimum_start_times(
    schedule: &Schedule,
    plan_duration: Duration,
) -> Result<BTreeMap<ActivityDirectiveId, Duration>, SimulationError> {
    let mut result = BTreeMap::new();
    for id in schedule.keys() {
        let mut visited = BTreeSet::new();
        let mut current = *id;
        let mut offset = Duration::ZERO;
        loop {
            if !visited.insert(current) {
                return Err(SimulationError::AnchorCycle { directive: *id });
            }
            let directive = lookup(schedule, *id, current)?;
            offset += directive.start_offset;
            match directive.anchor_id {
                Some(anchor) => current = anchor,
                None if directive.anchored_to_start => break,
                None => {
                    offset += plan_duration;
                    break;
                }
            }
        }
        result.insert(*id, offset);
    }
    Ok(result)
}

/// Checks that following anchors from every directive, through both start and end anchors,
/// always reaches the plan.
pub fn validate_anchors(schedule: &Schedule) -> Result<(), SimulationError> {
    let mut reaches_plan = BTreeSet::new();
    for id in schedule.keys() {
        let mut path = BTreeSet::new();
        let mut current = *id;
        loop {
            if reaches_plan.contains(&current) {
                break;
            }
            if !path.insert(current) {
                return Err(SimulationError::AnchorCycle { directive: *id });
            }
            match lookup(schedule, *id, current)?.anchor_id {
                Some(anchor) => current = anchor,
                None => break,
            }
        }
        reaches_plan.append(&mut path);
    }
    Ok(())
}

fn lookup(
    schedule: &Schedule,
    origin: ActivityDirectiveId,
    current: ActivityDirectiveId,
) -> Result<&ActivityDirective, SimulationError> {
    schedule
        .get(&current)
        .ok_or(SimulationError::MissingAnchor {
            directive: origin,
            anchor: current,
        })
}
