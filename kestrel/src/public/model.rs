use crate::internal::engine::task::Task;
use crate::internal::timeline::{Cells, Topic, TopicTable};
use crate::internal::tracker::ResourceEvaluator;
use crate::public::directive::SerializedActivity;

/// The boundary between the control plane and a mission's behavior.
///
/// The control plane never interprets activities itself. It asks the model to turn each
/// [SerializedActivity] into a [Task], and asks it which resources to keep profiles of.
pub trait MissionModel: Send + Sync {
    /// Instantiates the task for an activity. Errors abort the simulation.
    fn task_factory(&self, activity: &SerializedActivity) -> anyhow::Result<Box<dyn Task>>;

    fn resources(&self) -> Vec<(String, ResourceEvaluator)>;

    /// A task started at time zero of every simulation, before any directive.
    fn daemon(&self) -> Option<Box<dyn Task>> {
        None
    }

    fn topics(&self) -> TopicTable;

    fn initial_cells(&self) -> Cells;

    /// The topic directive tasks announce themselves on.
    fn activity_topic(&self) -> Topic {
        Topic::DIRECTIVE_MARKERS
    }
}
