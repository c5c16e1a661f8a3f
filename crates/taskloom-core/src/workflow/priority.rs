//! Effective priority resolution.

use taskloom_types::workflow::{Priority, TaskSpec, WorkflowSpec};

/// Most specific wins: per-run override, then task default, then workflow
/// default, then the global baseline.
pub fn resolve_priority(
    run_override: Option<Priority>,
    task_default: Option<Priority>,
    workflow_default: Option<Priority>,
) -> Priority {
    run_override
        .or(task_default)
        .or(workflow_default)
        .unwrap_or(Priority::BASELINE)
}

/// Resolve the priority of `task` within `workflow` for one run.
pub fn resolve_task_priority(
    run_override: Option<Priority>,
    task: &TaskSpec,
    workflow: &WorkflowSpec,
) -> Priority {
    resolve_priority(run_override, task.default_priority, workflow.default_priority)
}
