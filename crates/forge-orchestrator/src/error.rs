use forge_providers::ProviderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planner response is not a valid plan: {0}")]
    Parse(String),

    #[error("invalid plan: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl PlanError {
    pub fn code(&self) -> &'static str {
        match self {
            PlanError::Parse(_) => "PLAN_PARSE_FAILED",
            PlanError::Validation(_) => "PLAN_INVALID",
            PlanError::Provider(_) => "PROVIDER_ERROR",
        }
    }
}

/// Structural problems that make a plan unexecutable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("task at position {index} has an empty id")]
    EmptyTaskId { index: usize },

    #[error("duplicate task id `{id}`")]
    DuplicateTaskId { id: String },

    #[error("task `{task}` depends on itself")]
    SelfDependency { task: String },

    #[error("task `{task}` depends on `{dependency}`, which comes later in the plan")]
    ForwardDependency { task: String, dependency: String },

    #[error("task `{task}` depends on unknown task `{dependency}`")]
    UnknownDependency { task: String, dependency: String },

    #[error("task `{task}` targets unsafe path `{path}`")]
    UnsafePath { task: String, path: String },
}

/// A single task's generation attempt failed; the run carries on.
#[derive(Debug, Error)]
#[error("task `{task_id}` failed: {source}")]
pub struct TaskError {
    pub task_id: String,
    #[source]
    pub source: ProviderError,
}
