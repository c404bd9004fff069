use crate::recovery::ErrorCategory;

/// Notifications sent from the execution thread to the controller.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    StateChanged(crate::engine::ExecutionState),
    Progress { current: usize, total: usize },
    StepStarted { step_id: String, name: String },
    StepFinished { step_id: String, success: bool },
    RowCompleted { row: usize, success: bool },
    Error {
        category: ErrorCategory,
        message: String,
        row: Option<usize>,
        step: Option<String>,
    },
    Finished(crate::engine::RunSummary),
}
