//! # Progress Snapshots
//!
//! A `Progress` is an immutable picture of one node in an execution tree,
//! taken at send time. `step_proportion` is how many of the parent's steps
//! this node stands for; the root uses its own total.

use serde::Deserialize;
use serde::Serialize;

use crate::id::TaskId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub task_id: TaskId,
    pub step_proportion: u64,
    pub total_step_count: u64,
    pub total_worked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_progress: Vec<Progress>,
}

impl Progress {
    /// Completed fraction in `[0, 1]`. Overshoot is clamped here and only
    /// here; the counters themselves are reported as-is.
    pub fn ratio(&self) -> f64 {
        if self.finished {
            return 1.0;
        }
        if self.total_step_count == 0 {
            return 0.0;
        }
        (self.total_worked as f64 / self.total_step_count as f64).min(1.0)
    }

    /// Depth-first search for a node by task id.
    pub fn find(&self, task_id: TaskId) -> Option<&Progress> {
        if self.task_id == task_id {
            return Some(self);
        }
        self.sub_progress.iter().find_map(|child| child.find(task_id))
    }
}
