use std::collections::HashMap;
use std::fmt::Write;

use crate::engine::{Link, TaskExecution, TaskId, TaskState};
use crate::workflow::Workflow;

/// Execution metrics gathered while a workflow runs.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Timings of every body executed in this process.
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    pub fn execution(&self, id: TaskId) -> Option<&TaskExecution> {
        self.execution_times.get(&id)
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by state.
    ///
    /// * **Green**: Succeeded
    /// * **Blue**: Restored from an earlier attempt
    /// * **Red**: Failed
    /// * **Grey**: Never ran
    pub fn render_mermaid(&self, wf: &Workflow) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph TD");

        for task in wf.tasks() {
            let name = task.name.replace('"', "\\\"");
            let id = task.id.get();

            let label = match self.execution_times.get(&task.id) {
                Some(exec) => format!("{:.2?}", exec.duration),
                None => format!("{:?}", task.state),
            };

            let color = match task.state {
                TaskState::Succeeded => "#90EE90",
                TaskState::Skipped => "#ADD8E6",
                TaskState::Failed => "#F08080",
                TaskState::Pending | TaskState::Ready | TaskState::Running => "#D3D3D3",
            };

            let _ = writeln!(f, "    {id}[\"{name}\\n{label}\"]");
            let _ = writeln!(f, "    style {id} fill:{color}");

            match task.link {
                Link::Root => {}
                Link::Child(parent) => {
                    let _ = writeln!(f, "    {} --> {id}", parent.get());
                }
                Link::FollowOn(pred) => {
                    let _ = writeln!(f, "    {} -. follow-on .-> {id}", pred.get());
                }
            }
        }

        f
    }
}
