#![doc(hidden)]

use crate::internal::engine::SpanId;
use crate::public::directive::ActivityDirectiveId;
use derive_more::Display;
use hifitime::Duration;
use immutable_chunkmap::map::MapM;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A channel that events are emitted on, and that resources subscribe to.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Debug, Display,
)]
#[display("topic#{_0}")]
pub struct Topic(u32);

impl Topic {
    /// The topic directive tasks announce themselves on, unless a model picks another one.
    pub const DIRECTIVE_MARKERS: Topic = Topic(u32::MAX);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Human-readable names for a model's topics.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct TopicTable(BTreeMap<Topic, String>);

impl TopicTable {
    pub fn insert(&mut self, topic: Topic, name: impl Into<String>) {
        self.0.insert(topic, name.into());
    }

    pub fn name(&self, topic: Topic) -> Option<&str> {
        self.0.get(&topic).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(Topic, S)> for TopicTable {
    fn from_iter<I: IntoIterator<Item = (Topic, S)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(t, s)| (t, s.into())).collect())
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize, Debug)]
pub enum Value {
    Real(f64),
    Integer(i64),
    Boolean(bool),
    Text(Arc<str>),
    Directive(ActivityDirectiveId),
}

impl Value {
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(r) => Some(*r),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Effect {
    Set(Value),
    /// Adds to a numeric cell. Missing or non-numeric cells are treated as zero.
    Add(f64),
    Marker(ActivityDirectiveId),
}

#[derive(Clone, PartialEq, Debug)]
pub struct Event {
    pub topic: Topic,
    pub effect: Effect,
    /// The span of the task that emitted this event.
    pub provenance: SpanId,
}

/// One step of a [Timeline]: either time passing, or a batch of events happening at one instant.
#[derive(Clone, PartialEq, Debug)]
pub enum TimePoint {
    Delta(Duration),
    Commit {
        events: Vec<Event>,
        topics: SmallVec<Topic, 4>,
    },
}

/// The append-only record of everything an engine has done.
///
/// The sum of all deltas is always equal to [Timeline::end].
#[derive(Clone, Default, Debug)]
pub struct Timeline {
    points: Vec<TimePoint>,
    end: Duration,
}

impl Timeline {
    pub fn push_delta(&mut self, delta: Duration) {
        if delta > Duration::ZERO {
            self.end += delta;
            self.points.push(TimePoint::Delta(delta));
        }
    }

    pub fn push_commit(&mut self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut topics: SmallVec<Topic, 4> = SmallVec::new();
        for event in &events {
            if !topics.contains(&event.topic) {
                topics.push(event.topic);
            }
        }
        self.points.push(TimePoint::Commit { events, topics });
    }

    pub fn points(&self) -> &[TimePoint] {
        &self.points
    }

    pub fn get(&self, index: usize) -> Option<&TimePoint> {
        self.points.get(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn end(&self) -> Duration {
        self.end
    }

    /// Iterates over every event alongside the elapsed time it was committed at.
    pub fn events(&self) -> impl Iterator<Item = (Duration, &Event)> {
        let mut now = Duration::ZERO;
        self.points.iter().flat_map(move |point| {
            let events: &[Event] = match point {
                TimePoint::Delta(d) => {
                    now += *d;
                    &[]
                }
                TimePoint::Commit { events, .. } => events,
            };
            let at = now;
            events.iter().map(move |e| (at, e))
        })
    }
}

/// The current value of every topic.
///
/// Backed by a persistent map, so cloning is cheap and clones never observe each other's writes.
#[derive(Clone, Default)]
pub struct Cells(MapM<Topic, Value>);

impl Cells {
    pub fn new() -> Self {
        Self(MapM::new())
    }

    pub fn get(&self, topic: Topic) -> Option<&Value> {
        self.0.get(&topic)
    }

    pub fn set(&mut self, topic: Topic, value: Value) {
        self.0.insert_cow(topic, value);
    }

    pub fn apply(&mut self, event: &Event) {
        match &event.effect {
            Effect::Set(value) => self.set(event.topic, value.clone()),
            Effect::Add(amount) => {
                let current = self.get(event.topic).and_then(Value::as_real).unwrap_or(0.0);
                self.set(event.topic, Value::Real(current + amount));
            }
            Effect::Marker(id) => self.set(event.topic, Value::Directive(*id)),
        }
    }
}

impl FromIterator<(Topic, Value)> for Cells {
    fn from_iter<I: IntoIterator<Item = (Topic, Value)>>(iter: I) -> Self {
        let mut cells = Cells::new();
        for (topic, value) in iter {
            cells.set(topic, value);
        }
        cells
    }
}
