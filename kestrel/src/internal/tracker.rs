#![doc(hidden)]

//! Lazily maintained profiles of derived resources.
//!
//! The tracker replays an engine's [Timeline] onto its own copy of the cells, and only
//! re-evaluates a resource when one of two things happens: a topic the resource read during
//! its last evaluation is committed to, or the resource's self-reported validity runs out.

use crate::internal::timeline::{Cells, Event, TimePoint, Timeline, Topic, Value};
use crate::public::error::SimulationError;
use ahash::AHashMap;
use hifitime::Duration;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type ResourceEvaluator = Arc<dyn Fn(&mut Querier<'_>) -> Value + Send + Sync>;

/// A resource evaluator's view of the cells.
///
/// Every topic read through the querier becomes a subscription of the resource.
pub struct Querier<'a> {
    cells: &'a Cells,
    now: Duration,
    topics: SmallVec<Topic, 4>,
    expiry: Option<Duration>,
}

impl<'a> Querier<'a> {
    pub fn read(&mut self, topic: Topic) -> Option<&'a Value> {
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self.cells.get(topic)
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Declares that the computed value goes stale after `duration`, even if nothing it
    /// read changes.
    pub fn expires_in(&mut self, duration: Duration) {
        self.expiry = Some(match self.expiry {
            Some(existing) => existing.min(duration),
            None => duration,
        });
    }
}

/// A constant piece of a profile.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub extent: Duration,
    pub value: Value,
}

#[derive(Clone)]
struct TrackedResource {
    evaluator: ResourceEvaluator,
    segments: Vec<Segment>,
    last: Option<(Duration, Value)>,
    /// None means the resource never goes stale on its own.
    expiry: Option<Duration>,
    topics: SmallVec<Topic, 4>,
}

impl TrackedResource {
    fn new(evaluator: ResourceEvaluator, expiry: Duration) -> Self {
        Self {
            evaluator,
            segments: vec![],
            last: None,
            expiry: Some(expiry),
            topics: SmallVec::new(),
        }
    }
}

#[derive(Clone, Default)]
struct Subscriptions(AHashMap<Topic, BTreeSet<String>>);

impl Subscriptions {
    fn subscribe(&mut self, name: &str, old: &[Topic], new: &[Topic]) {
        for topic in old {
            if let Some(subscribers) = self.0.get_mut(topic) {
                subscribers.remove(name);
            }
        }
        for topic in new {
            self.0.entry(*topic).or_default().insert(name.to_string());
        }
    }

    /// Removes and returns every subscriber of the topic.
    fn invalidate_topic(&mut self, topic: Topic) -> BTreeSet<String> {
        self.0.remove(&topic).unwrap_or_default()
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Clone)]
pub struct ResourceTracker {
    resources: BTreeMap<String, TrackedResource>,
    subscriptions: Subscriptions,
    cells: Cells,
    cursor: usize,
    now: Duration,
    /// The unconsumed remainder of a delta that was split at a window boundary.
    pending: Option<Duration>,
    recomputations: u64,
}

impl ResourceTracker {
    pub fn new(initial_cells: Cells) -> Self {
        Self {
            resources: BTreeMap::new(),
            subscriptions: Subscriptions::default(),
            cells: initial_cells,
            cursor: 0,
            now: Duration::ZERO,
            pending: None,
            recomputations: 0,
        }
    }

    /// Starts tracking a resource. It is first evaluated on the next update.
    pub fn track(&mut self, name: impl Into<String>, evaluator: ResourceEvaluator) {
        self.resources
            .insert(name.into(), TrackedResource::new(evaluator, self.now));
    }

    /// Forgets all progress and starts over against new cells.
    pub fn reset(&mut self, initial_cells: Cells) {
        self.cells = initial_cells;
        self.cursor = 0;
        self.now = Duration::ZERO;
        self.pending = None;
        self.subscriptions.clear();
        for resource in self.resources.values_mut() {
            *resource = TrackedResource::new(resource.evaluator.clone(), Duration::ZERO);
        }
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Total number of evaluations performed, across all resources.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    /// Brings every profile up to date over `[now, end)`, or `[now, end]` if `inclusive`.
    pub fn update_resources(&mut self, timeline: &Timeline, end: Duration, inclusive: bool) {
        let in_window = |time: Duration| if inclusive { time <= end } else { time < end };
        loop {
            let earliest = self.earliest_expiry();
            match earliest {
                Some(due) if due <= self.now && in_window(due) => {
                    self.drain_commits(timeline);
                    self.recompute_due();
                    continue;
                }
                _ => {}
            }

            if self.now >= end {
                if inclusive && self.drain_commits(timeline) {
                    continue;
                }
                break;
            }

            let target = earliest.map_or(end, |due| due.min(end));
            if !self.advance_toward(timeline, target) {
                break;
            }
        }
    }

    /// The profile of a resource, with its last value held until `until`.
    pub fn profile(&self, name: &str, until: Duration) -> Result<Vec<Segment>, SimulationError> {
        let resource = self
            .resources
            .get(name)
            .ok_or_else(|| SimulationError::UnknownResource {
                name: name.to_string(),
            })?;
        Ok(Self::close_profile(resource, until))
    }

    pub fn profiles(&self, until: Duration) -> BTreeMap<String, Vec<Segment>> {
        self.resources
            .iter()
            .map(|(name, resource)| (name.clone(), Self::close_profile(resource, until)))
            .collect()
    }

    fn close_profile(resource: &TrackedResource, until: Duration) -> Vec<Segment> {
        let mut segments = resource.segments.clone();
        if let Some((since, value)) = &resource.last {
            if until >= *since {
                segments.push(Segment {
                    extent: until - *since,
                    value: value.clone(),
                });
            }
        }
        segments
    }

    fn earliest_expiry(&self) -> Option<Duration> {
        self.resources.values().filter_map(|r| r.expiry).min()
    }

    /// Consumes one time point, or the part of a delta that reaches `target`.
    ///
    /// Returns false if the timeline has nothing more to offer.
    fn advance_toward(&mut self, timeline: &Timeline, target: Duration) -> bool {
        if let Some(rest) = self.pending.take() {
            self.advance_by(rest, target);
            return true;
        }
        let Some(point) = timeline.get(self.cursor) else {
            return false;
        };
        self.cursor += 1;
        match point {
            TimePoint::Delta(delta) => self.advance_by(*delta, target),
            TimePoint::Commit { events, topics } => self.apply_commit(events, topics),
        }
        true
    }

    fn advance_by(&mut self, delta: Duration, target: Duration) {
        if self.now + delta > target {
            let step = target - self.now;
            self.pending = Some(delta - step);
            self.now = target;
        } else {
            self.now += delta;
        }
    }

    /// Applies every commit at the current instant. Returns whether there were any.
    fn drain_commits(&mut self, timeline: &Timeline) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let mut applied = false;
        while let Some(TimePoint::Commit { events, topics }) = timeline.get(self.cursor) {
            self.cursor += 1;
            self.apply_commit(events, topics);
            applied = true;
        }
        applied
    }

    fn apply_commit(&mut self, events: &[Event], topics: &[Topic]) {
        for event in events {
            self.cells.apply(event);
        }
        for topic in topics {
            for name in self.subscriptions.invalidate_topic(*topic) {
                if let Some(resource) = self.resources.get_mut(&name) {
                    resource.expiry = Some(self.now);
                }
            }
        }
    }

    fn recompute_due(&mut self) {
        let now = self.now;
        let due: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| r.expiry.is_some_and(|e| e <= now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in due {
            self.recompute(&name);
        }
    }

    fn recompute(&mut self, name: &str) {
        let now = self.now;
        let Some(resource) = self.resources.get_mut(name) else {
            return;
        };

        let mut querier = Querier {
            cells: &self.cells,
            now,
            topics: SmallVec::new(),
            expiry: None,
        };
        let value = (resource.evaluator)(&mut querier);
        let Querier { topics, expiry, .. } = querier;

        resource.last = match resource.last.take() {
            Some((since, previous)) if now > since => {
                resource.segments.push(Segment {
                    extent: now - since,
                    value: previous,
                });
                Some((now, value))
            }
            Some((since, _)) => Some((since, value)),
            None => Some((now, value)),
        };

        self.subscriptions.subscribe(name, &resource.topics, &topics);
        resource.topics = topics;
        resource.expiry = expiry.map(|d| now + d.max(Duration::EPSILON));
        self.recomputations += 1;
        tracing::trace!(resource = name, time = %now, "recomputed resource");
    }
}
