use std::fs;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use forge_core::{AppConfig, ConfigStore, DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT};
use forge_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
    WorkerGuard,
};
use forge_orchestrator::{GenerationExecutor, RunState, TaskPlanner};
use forge_providers::{CompletionRequest, GenerationClient, OpenAiCompatibleClient};
use forge_server::{serve, AppState};
use forge_types::{ChatMessage, PlanStatus};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "forge-engine")]
#[command(about = "Plan and generate projects from a natural-language prompt")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct RuntimeArgs {
    #[arg(long)]
    state_dir: Option<String>,
    /// Project config file; defaults to `<state_dir>/config.json`.
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP and SSE API.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Print the task plan for a prompt as JSON.
    Plan {
        prompt: String,
        /// JSON object, `@file` or `-` for stdin.
        #[arg(long)]
        context: Option<String>,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Plan a prompt and, once approved with `--yes`, stream the generation
    /// events to stdout as SSE frames.
    Run {
        prompt: String,
        #[arg(long)]
        context: Option<String>,
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
    /// Stream a single chat reply to stdout.
    Chat {
        message: String,
        #[arg(long)]
        temperature: Option<f32>,
        #[command(flatten)]
        runtime: RuntimeArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Engine, &state_dir)?;
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let (client, config) = build_runtime(&state_dir, &runtime).await?;
            let info = client.info();
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "engine.started",
                    component: "engine.main",
                    provider_id: Some(&info.provider_id),
                    model_id: Some(&info.model_id),
                    status: Some("ok"),
                    detail: Some(&format!("listening on http://{addr}")),
                    ..Default::default()
                },
            );
            info!("state dir: {}", state_dir.display());
            serve(addr, AppState::new(client, &config.generation)).await?;
        }
        Command::Plan {
            prompt,
            context,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Cli, &state_dir)?;
            let context = read_context(context.as_deref())?;
            let (client, config) = build_runtime(&state_dir, &runtime).await?;
            let plan = TaskPlanner::new(client)
                .with_temperature(config.generation.planning_temperature)
                .create_plan(&prompt, &context)
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Run {
            prompt,
            context,
            yes,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Cli, &state_dir)?;
            let context = read_context(context.as_deref())?;
            let (client, config) = build_runtime(&state_dir, &runtime).await?;
            let mut plan = TaskPlanner::new(client.clone())
                .with_temperature(config.generation.planning_temperature)
                .create_plan(&prompt, &context)
                .await?;
            // stdout carries only SSE frames
            eprintln!("{}", serde_json::to_string_pretty(&plan)?);
            if !yes {
                eprintln!("plan not approved; re-run with --yes to generate it");
                return Ok(());
            }

            plan.status = PlanStatus::Approved;
            let executor = GenerationExecutor::new(client)
                .with_temperature(config.generation.generation_temperature)
                .with_event_buffer(config.generation.event_buffer);
            let (mut events, report) = executor.execute(plan)?.into_parts();
            let mut stdout = std::io::stdout();
            while let Some(event) = events.next().await {
                stdout.write_all(event.to_sse_frame().as_bytes())?;
                stdout.flush()?;
            }
            let report = report.await.context("generation run panicked")?;
            eprintln!(
                "{} tasks completed, {} failed, {} files",
                report.completed_tasks(),
                report.failed_tasks(),
                report.files_emitted
            );
            if report.state == RunState::Aborted {
                anyhow::bail!("generation run aborted");
            }
        }
        Command::Chat {
            message,
            temperature,
            runtime,
        } => {
            let state_dir = resolve_state_dir(runtime.state_dir.clone());
            let _log_guard = init_logging(ProcessKind::Cli, &state_dir)?;
            let (client, _) = build_runtime(&state_dir, &runtime).await?;
            let mut request = CompletionRequest::new(vec![ChatMessage::user(message)]);
            if let Some(temperature) = temperature {
                request = request.temperature(temperature);
            }
            let mut tokens = client
                .stream(request.streaming(true), CancellationToken::new())
                .await?;
            let mut stdout = std::io::stdout();
            while let Some(token) = tokens.next().await {
                stdout.write_all(token?.as_bytes())?;
                stdout.flush()?;
            }
            println!();
        }
    }

    Ok(())
}

fn init_logging(process: ProcessKind, state_dir: &Path) -> anyhow::Result<WorkerGuard> {
    let logs_dir = canonical_logs_dir_from_root(state_dir);
    let (guard, log_info) = init_process_logging(process, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some("jsonl logging initialized"),
            ..Default::default()
        },
    );
    info!("logging initialized: {:?}", log_info);
    Ok(guard)
}

async fn build_runtime(
    state_dir: &Path,
    args: &RuntimeArgs,
) -> anyhow::Result<(Arc<dyn GenerationClient>, AppConfig)> {
    let config_path = args
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("config.json"));
    let store = ConfigStore::new(&config_path, build_cli_overrides(args))
        .await
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let config = store.get().await;
    if config.provider.api_key.is_none() {
        tracing::warn!("no provider api key configured; set FORGE_API_KEY or pass --api-key");
    }
    let client = OpenAiCompatibleClient::new(config.provider.clone())
        .context("failed to configure generation client")?;
    Ok((Arc::new(client), config))
}

fn build_cli_overrides(args: &RuntimeArgs) -> Option<Value> {
    let mut provider = Map::new();
    if let Some(api_key) = &args.api_key {
        provider.insert("api_key".to_string(), Value::String(api_key.clone()));
    }
    if let Some(base_url) = &args.base_url {
        provider.insert("base_url".to_string(), Value::String(base_url.clone()));
    }
    if let Some(model) = &args.model {
        provider.insert("model".to_string(), Value::String(model.clone()));
    }
    if let Some(max_tokens) = args.max_tokens {
        provider.insert("max_tokens".to_string(), Value::from(max_tokens));
    }
    if provider.is_empty() {
        return None;
    }
    let mut root = Map::new();
    root.insert("provider".to_string(), Value::Object(provider));
    Some(Value::Object(root))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("FORGE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_dir()
        .map(|dir| dir.join("forge"))
        .unwrap_or_else(|| PathBuf::from(".forge"))
}

fn read_context(input: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    let Some(input) = input else {
        return Ok(Map::new());
    };
    let value = read_json_arg(input)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("context must be a JSON object"),
    }
}

fn read_json_arg(input: &str) -> anyhow::Result<Value> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(serde_json::from_str(&buf)?);
    }
    if let Some(path) = input.strip_prefix('@') {
        let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        return Ok(serde_json::from_str(&raw)?);
    }
    Ok(serde_json::from_str(input)?)
}
