use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::Level;
use uuid::Uuid;

use forge_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use forge_providers::{CompletionRequest, GenerationClient};
use forge_types::{ChatMessage, ProjectBrief, Task, TaskKind, TaskPlan};

use crate::prompts::{build_planning_prompt, PLANNING_SYSTEM_PROMPT};
use crate::validate::validate_tasks;
use crate::PlanError;

pub const PLANNING_TEMPERATURE: f32 = 0.3;
pub const PLANNING_MAX_TOKENS: u32 = 2048;

/// Tasks and project brief decoded from a planning response.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanDraft {
    pub tasks: Vec<Task>,
    pub project: Option<ProjectBrief>,
}

#[derive(Debug, Deserialize)]
struct TaskDescriptor {
    id: String,
    title: String,
    description: String,
    #[serde(rename = "type")]
    kind: TaskKind,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

impl From<TaskDescriptor> for Task {
    fn from(value: TaskDescriptor) -> Self {
        Task::new(value.id, value.title, value.kind)
            .with_description(value.description)
            .with_files(value.files)
            .with_dependencies(value.dependencies)
    }
}

#[derive(Debug, Deserialize)]
struct PlanEnvelope {
    tasks: Vec<TaskDescriptor>,
    #[serde(default)]
    project: Option<ProjectBrief>,
}

/// Turns a natural-language request into a validated [`TaskPlan`] with one
/// non-streamed model call.
#[derive(Clone)]
pub struct TaskPlanner {
    client: Arc<dyn GenerationClient>,
    temperature: f32,
}

impl TaskPlanner {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self {
            client,
            temperature: PLANNING_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub async fn create_plan(
        &self,
        user_prompt: &str,
        context: &Map<String, Value>,
    ) -> Result<TaskPlan, PlanError> {
        let info = self.client.info();
        let project_id =
            context_project_id(context).unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::debug!(
            prompt = %redact_text(user_prompt),
            project_id = %project_id,
            "planning request"
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(PLANNING_SYSTEM_PROMPT),
            ChatMessage::user(build_planning_prompt(user_prompt, context)),
        ])
        .temperature(self.temperature)
        .max_tokens(Some(PLANNING_MAX_TOKENS));

        let drafted = async {
            let completion = self.client.complete(request).await?;
            let draft = parse_plan_response(&completion.content)?;
            validate_tasks(&draft.tasks)?;
            Ok::<_, PlanError>(draft)
        }
        .await;

        let draft = match drafted {
            Ok(draft) => draft,
            Err(err) => {
                let detail = err.to_string();
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent {
                        event: "plan.failed",
                        component: "orchestrator.planner",
                        project_id: Some(&project_id),
                        provider_id: Some(&info.provider_id),
                        model_id: Some(&info.model_id),
                        status: Some("failed"),
                        error_code: Some(err.code()),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
                return Err(err);
            }
        };

        let mut plan = TaskPlan::new(project_id, draft.tasks);
        plan.project = draft.project;

        let detail = format!("{} tasks", plan.tasks.len());
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent {
                event: "plan.created",
                component: "orchestrator.planner",
                project_id: Some(&plan.project_id),
                plan_id: Some(&plan.id),
                provider_id: Some(&info.provider_id),
                model_id: Some(&info.model_id),
                status: Some("pending"),
                detail: Some(&detail),
                ..Default::default()
            },
        );
        Ok(plan)
    }
}

/// Strictly decodes a planning response: a JSON array of task descriptors or
/// an object with a `tasks` array, optionally wrapped in one ```` ```json ````
/// fence. Dependencies are not checked here.
pub fn parse_plan_response(raw: &str) -> Result<PlanDraft, PlanError> {
    let payload = json_payload(raw);
    let value: Value =
        serde_json::from_str(payload).map_err(|err| PlanError::Parse(err.to_string()))?;

    let is_envelope = matches!(&value, Value::Object(root) if root.contains_key("tasks"));
    let (descriptors, project) = if value.is_array() {
        let tasks: Vec<TaskDescriptor> =
            serde_json::from_value(value).map_err(|err| PlanError::Parse(err.to_string()))?;
        (tasks, None)
    } else if is_envelope {
        let envelope: PlanEnvelope =
            serde_json::from_value(value).map_err(|err| PlanError::Parse(err.to_string()))?;
        (envelope.tasks, envelope.project)
    } else {
        return Err(PlanError::Parse(
            "expected a task array or an object with a `tasks` array".to_string(),
        ));
    };

    Ok(PlanDraft {
        tasks: descriptors.into_iter().map(Task::from).collect(),
        project,
    })
}

fn json_payload(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(newline) = rest.find('\n') else {
        return trimmed;
    };
    let (tag, body) = rest.split_at(newline);
    let tag = tag.trim();
    if !tag.is_empty() && !tag.eq_ignore_ascii_case("json") {
        return trimmed;
    }
    match body.trim_end().strip_suffix("```") {
        Some(inner) => inner.trim(),
        None => trimmed,
    }
}

fn context_project_id(context: &Map<String, Value>) -> Option<String> {
    ["project_id", "projectId"]
        .iter()
        .filter_map(|key| context.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedClient;
    use crate::ValidationError;
    use forge_providers::ProviderError;
    use forge_types::{ChatRole, PlanStatus, TaskStatus};
    use serde_json::json;

    const TODO_PLAN: &str = r#"{
        "project": {
            "name": "todo-app",
            "description": "A small todo list",
            "framework": "nextjs",
            "language": "typescript"
        },
        "tasks": [
            {"id": "schema", "title": "Todo schema", "description": "Prisma model", "type": "schema",
             "files": ["prisma/schema.prisma"], "dependencies": []},
            {"id": "api", "title": "Todo API", "description": "CRUD routes", "type": "api",
             "files": ["src/app/api/todos/route.ts"], "dependencies": ["schema"]},
            {"id": "ui", "title": "Todo list", "description": "List component", "type": "component",
             "files": ["src/components/TodoList.tsx"], "dependencies": ["api"]}
        ]
    }"#;

    fn planner(replies: Vec<Result<String, ProviderError>>) -> (TaskPlanner, Arc<ScriptedClient>) {
        let client = ScriptedClient::new(replies);
        (TaskPlanner::new(client.clone()), client)
    }

    #[tokio::test]
    async fn todo_app_plan_is_decoded_in_order() {
        let (planner, client) = planner(vec![Ok(TODO_PLAN.to_string())]);
        let context = json!({"framework": "nextjs", "project_id": "proj-7"});
        let plan = planner
            .create_plan("Build a todo app", context.as_object().expect("object"))
            .await
            .expect("plan");

        assert_eq!(plan.project_id, "proj-7");
        assert_eq!(plan.status, PlanStatus::Pending);
        let ids: Vec<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["schema", "api", "ui"]);
        assert!(plan.tasks.iter().all(|t| t.status == TaskStatus::Pending));
        assert_eq!(plan.tasks[1].kind, TaskKind::Api);
        assert_eq!(
            plan.project.as_ref().map(|p| p.name.as_str()),
            Some("todo-app")
        );

        let requests = client.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(!request.stream);
        assert!((request.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(request.messages[0].role, ChatRole::System);
        assert!(request.messages[1]
            .content
            .starts_with("Build a todo app\n\nFramework: nextjs"));
    }

    #[tokio::test]
    async fn non_topological_response_is_rejected_not_reordered() {
        let reply = r#"[
            {"id": "ui", "title": "Todo list", "description": "List", "type": "component", "dependencies": ["api"]},
            {"id": "api", "title": "Todo API", "description": "Routes", "type": "api"}
        ]"#;
        let (planner, client) = planner(vec![Ok(reply.to_string())]);
        let err = planner
            .create_plan("Build a todo app", &Map::new())
            .await
            .expect_err("forward dependency");
        assert!(matches!(
            err,
            PlanError::Validation(ValidationError::ForwardDependency { ref task, ref dependency })
                if task == "ui" && dependency == "api"
        ));
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let (planner, _) = planner(vec![Err(ProviderError::Status {
            status: 500,
            detail: "upstream".to_string(),
        })]);
        let err = planner
            .create_plan("anything", &Map::new())
            .await
            .expect_err("provider error");
        assert!(matches!(err, PlanError::Provider(ProviderError::Status { status: 500, .. })));
        assert_eq!(err.code(), "PROVIDER_ERROR");
    }

    #[tokio::test]
    async fn generated_project_id_when_context_has_none() {
        let (planner, _) = planner(vec![Ok("[]".to_string())]);
        let plan = planner
            .create_plan("empty", &Map::new())
            .await
            .expect("plan");
        assert!(plan.tasks.is_empty());
        assert!(Uuid::parse_str(&plan.project_id).is_ok());
    }

    #[test]
    fn accepts_bare_array_with_optional_fields_defaulted() {
        let draft = parse_plan_response(
            r#"[{"id": "t1", "title": "Config", "description": "tsconfig", "type": "config"}]"#,
        )
        .expect("draft");
        assert_eq!(draft.project, None);
        assert_eq!(draft.tasks.len(), 1);
        assert!(draft.tasks[0].files.is_empty());
        assert!(draft.tasks[0].dependencies.is_empty());
    }

    #[test]
    fn accepts_single_json_fence() {
        let raw = format!("```json\n{TODO_PLAN}\n```");
        assert_eq!(parse_plan_response(&raw).expect("draft").tasks.len(), 3);

        let untagged = "```\n[]\n```";
        assert!(parse_plan_response(untagged).expect("draft").tasks.is_empty());
    }

    #[test]
    fn rejects_prose_missing_fields_and_unknown_types() {
        let prose = format!("Sure! Here is the plan:\n```json\n{TODO_PLAN}\n```");
        assert!(matches!(parse_plan_response(&prose), Err(PlanError::Parse(_))));

        let missing_title = r#"[{"id": "t1", "description": "d", "type": "api"}]"#;
        let err = parse_plan_response(missing_title).expect_err("missing title");
        assert!(err.to_string().contains("title"));

        let bad_type = r#"[{"id": "t1", "title": "t", "description": "d", "type": "database"}]"#;
        assert!(matches!(parse_plan_response(bad_type), Err(PlanError::Parse(_))));

        let wrong_shape = r#"{"steps": []}"#;
        assert!(matches!(parse_plan_response(wrong_shape), Err(PlanError::Parse(_))));
    }
}
