use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use forge_orchestrator::PlanError;
use forge_providers::{CompletionRequest, ProviderError};
use forge_types::{ChatMessage, ChatStreamEvent, PlanStatus, TaskPlan};

use crate::AppState;

const KEEP_ALIVE_SECS: u64 = 10;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlanInput {
    prompt: String,
    #[serde(default)]
    context: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ExecuteInput {
    plan: TaskPlan,
    #[serde(default, alias = "projectId")]
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatInput {
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ChatInput {
    fn into_request(self) -> CompletionRequest {
        let request = CompletionRequest::new(self.messages).max_tokens(self.max_tokens);
        match self.temperature {
            Some(temperature) => request.temperature(temperature),
            None => request,
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("forge engine listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route("/api/generate/plan", post(generate_plan))
        .route("/api/generate/execute", post(generate_execute))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .layer(cors)
        .with_state(state)
}

fn error_response(status: StatusCode, code: &str, error: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorEnvelope {
            error: error.into(),
            code: Some(code.to_string()),
        }),
    )
        .into_response()
}

/// Maps a body that failed to decode onto the error envelope.
fn rejection_response(rejection: JsonRejection) -> Response {
    error_response(rejection.status(), "INVALID_REQUEST", rejection.body_text())
}

fn plan_error_response(err: &PlanError) -> Response {
    let status = match err {
        PlanError::Provider(_) => StatusCode::BAD_GATEWAY,
        PlanError::Parse(_) | PlanError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    error_response(status, err.code(), err.to_string())
}

fn provider_error_response(err: &ProviderError) -> Response {
    error_response(StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", err.to_string())
}

fn sse_data<T: Serialize>(payload: &T) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(payload).unwrap_or_default()))
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let info = state.client.info();
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "provider": info.provider_id,
        "model": info.model_id,
        "maxTokens": info.max_tokens,
    }))
}

async fn generate_plan(
    State(state): State<AppState>,
    payload: Result<Json<PlanInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return rejection_response(rejection),
    };
    if input.prompt.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "prompt is required");
    }
    match state.planner.create_plan(&input.prompt, &input.context).await {
        Ok(plan) => Json(json!({ "plan": plan })).into_response(),
        Err(err) => plan_error_response(&err),
    }
}

async fn generate_execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return rejection_response(rejection),
    };
    let mut plan = input.plan;
    if let Some(project_id) = input.project_id.filter(|id| !id.trim().is_empty()) {
        plan.project_id = project_id;
    }
    // resubmitting the plan is the approval step
    plan.status = PlanStatus::Approved;

    let run = match state.executor.execute(plan) {
        Ok(run) => run,
        Err(err) => return plan_error_response(&err),
    };
    tracing::info!(plan_id = run.plan_id(), "generation stream opened");

    // The report handle is detached; dropping the response stream cancels the run.
    let (events, _report) = run.into_parts();
    let stream = events.map(|event| sse_data(&event));
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
        .into_response()
}

async fn chat(
    State(state): State<AppState>,
    payload: Result<Json<ChatInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return rejection_response(rejection),
    };
    if input.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "messages are required");
    }
    match state.client.complete(input.into_request()).await {
        Ok(completion) => Json(json!({
            "message": completion.content,
            "usage": completion.usage,
        }))
        .into_response(),
        Err(err) => provider_error_response(&err),
    }
}

async fn chat_stream(
    State(state): State<AppState>,
    payload: Result<Json<ChatInput>, JsonRejection>,
) -> Response {
    let input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return rejection_response(rejection),
    };
    if input.messages.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", "messages are required");
    }
    let client = state.client.clone();
    let request = input.into_request().streaming(true);
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let stream = async_stream::stream! {
        // cancels the provider stream once the client disconnects
        let _guard = guard;
        match client.stream(request, cancel).await {
            Ok(mut tokens) => {
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(content) => {
                            yield sse_data(&ChatStreamEvent::Token { content });
                        }
                        Err(err) => {
                            yield sse_data(&ChatStreamEvent::Error { message: err.to_string() });
                            return;
                        }
                    }
                }
                yield sse_data(&ChatStreamEvent::Complete);
            }
            Err(err) => {
                yield sse_data(&ChatStreamEvent::Error { message: err.to_string() });
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(KEEP_ALIVE_SECS)))
        .into_response()
}
