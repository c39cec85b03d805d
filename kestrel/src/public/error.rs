use crate::public::directive::ActivityDirectiveId;
use derive_more::with_trait::Error as DeriveError;
use hifitime::{Duration, Epoch as Time};
use std::fmt::{Display, Formatter};

/// Everything that can abort a simulation.
///
/// Failing to find a reusable checkpoint is not an error; see [crate::best_cached_engine].
#[derive(Debug, DeriveError)]
pub enum SimulationError {
    /// Following the anchors from `directive` leads back to a directive already visited.
    AnchorCycle { directive: ActivityDirectiveId },
    MissingAnchor {
        directive: ActivityDirectiveId,
        anchor: ActivityDirectiveId,
    },
    /// A task failed while the engine was running.
    Simulation {
        elapsed: Duration,
        instant: Time,
        /// The directive whose task (or one of its descendants) failed, if the failure
        /// could be traced back to one.
        directive: Option<ActivityDirectiveId>,
        /// Activity type names from the outermost enclosing task down to the failing one.
        trail: Vec<String>,
        cause: anyhow::Error,
    },
    ActivityInstantiation {
        directive: ActivityDirectiveId,
        type_name: String,
        cause: anyhow::Error,
    },
    UnknownResource { name: String },
}

impl Display for SimulationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulationError::AnchorCycle { directive } => {
                write!(f, "anchors of {directive} form a cycle")
            }
            SimulationError::MissingAnchor { directive, anchor } => {
                write!(f, "{directive} is anchored to {anchor}, which is not in the plan")
            }
            SimulationError::Simulation {
                elapsed,
                instant,
                directive,
                trail,
                cause,
            } => {
                write!(f, "simulation failed at {elapsed} ({instant})")?;
                if let Some(directive) = directive {
                    write!(f, " in {directive}")?;
                }
                if !trail.is_empty() {
                    write!(f, " [{}]", trail.join(" > "))?;
                }
                write!(f, ": {cause}")
            }
            SimulationError::ActivityInstantiation {
                directive,
                type_name,
                cause,
            } => write!(
                f,
                "could not instantiate {type_name} activity for {directive}: {cause}"
            ),
            SimulationError::UnknownResource { name } => {
                write!(f, "no resource named {name} is tracked")
            }
        }
    }
}
