use crate::internal::anchor::PARALLEL_THRESHOLD;
use hifitime::Epoch as Time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything besides the plan that a simulation result depends on.
///
/// Snapshots are only ever reused between simulations with equal configurations.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SimulationConfiguration {
    pub mission_model_id: u64,
    pub simulation_start: Time,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl SimulationConfiguration {
    pub fn new(mission_model_id: u64, simulation_start: Time) -> Self {
        Self {
            mission_model_id,
            simulation_start,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Tuning knobs for the orchestrator.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Plans with more directives than this resolve their anchors in parallel.
    pub parallel_threshold: usize,
    /// How many evenly spaced checkpoints the facade asks for. Zero means one per store slot.
    pub checkpoint_spread: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            parallel_threshold: PARALLEL_THRESHOLD,
            checkpoint_spread: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_use_defaults() -> anyhow::Result<()> {
        let settings: OrchestratorSettings = serde_json::from_str(r#"{"checkpoint_spread": 3}"#)?;
        assert_eq!(PARALLEL_THRESHOLD, settings.parallel_threshold);
        assert_eq!(3, settings.checkpoint_spread);
        Ok(())
    }

    #[test]
    fn configurations_differ_by_arguments() {
        let start = Time::from_tai_seconds(0.0);
        let plain = SimulationConfiguration::new(1, start);
        let tweaked = plain.clone().with_argument("battery", "full");
        assert_ne!(plain, tweaked);
        assert_eq!(tweaked, tweaked.clone());
    }
}
