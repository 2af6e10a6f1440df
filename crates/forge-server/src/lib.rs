use std::sync::Arc;

use forge_core::GenerationConfig;
use forge_orchestrator::{GenerationExecutor, TaskPlanner};
use forge_providers::GenerationClient;

mod http;

pub use http::{app_router, serve};

/// Shared handles for request handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<dyn GenerationClient>,
    pub planner: TaskPlanner,
    pub executor: GenerationExecutor,
}

impl AppState {
    pub fn new(client: Arc<dyn GenerationClient>, generation: &GenerationConfig) -> Self {
        let planner =
            TaskPlanner::new(client.clone()).with_temperature(generation.planning_temperature);
        let executor = GenerationExecutor::new(client.clone())
            .with_temperature(generation.generation_temperature)
            .with_event_buffer(generation.event_buffer);
        Self {
            client,
            planner,
            executor,
        }
    }
}
