use bincode::config::standard;
use derive_more::Display;
use hifitime::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unique activity directive ID.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Debug, Display,
)]
#[display("directive#{_0}")]
pub struct ActivityDirectiveId(u64);

impl ActivityDirectiveId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// An activity type name plus its bincode-encoded arguments.
///
/// The control plane never looks inside the arguments; it only compares them.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct SerializedActivity {
    type_name: String,
    arguments: Vec<u8>,
}

impl SerializedActivity {
    pub fn new(type_name: impl Into<String>, arguments: &impl Serialize) -> anyhow::Result<Self> {
        Ok(Self {
            type_name: type_name.into(),
            arguments: bincode::serde::encode_to_vec(arguments, standard())?,
        })
    }

    pub fn without_arguments(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            arguments: vec![],
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn arguments<A: DeserializeOwned>(&self) -> anyhow::Result<A> {
        Ok(bincode::serde::decode_from_slice(&self.arguments, standard())?.0)
    }
}

/// A request to run an activity, placed relative to the plan or to another directive.
///
/// With no anchor, the directive is placed relative to the plan start (or plan end, if
/// `anchored_to_start` is false). Otherwise it is placed relative to the start or end of
/// the directive it is anchored to.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct ActivityDirective {
    pub start_offset: Duration,
    pub serialized_activity: SerializedActivity,
    pub anchor_id: Option<ActivityDirectiveId>,
    pub anchored_to_start: bool,
}

impl ActivityDirective {
    /// A directive placed `start_offset` after the plan start.
    pub fn new(start_offset: Duration, serialized_activity: SerializedActivity) -> Self {
        Self {
            start_offset,
            serialized_activity,
            anchor_id: None,
            anchored_to_start: true,
        }
    }

    pub fn anchored_to(mut self, anchor: ActivityDirectiveId, to_start: bool) -> Self {
        self.anchor_id = Some(anchor);
        self.anchored_to_start = to_start;
        self
    }

    pub fn anchored_to_plan_end(mut self) -> Self {
        self.anchor_id = None;
        self.anchored_to_start = false;
        self
    }
}

pub type Schedule = BTreeMap<ActivityDirectiveId, ActivityDirective>;
