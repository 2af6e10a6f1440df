use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Level;

use forge_observability::{emit_event, ObservabilityEvent, ProcessKind};
use forge_providers::{ClientInfo, CompletionRequest, GenerationClient};
use forge_types::{
    ChatMessage, GeneratedFile, PlanStatus, StreamEvent, Task, TaskPlan, TaskStatus,
};

use crate::prompts::{build_task_prompt, generation_system_prompt};
use crate::{extract_files, validate_plan, PlanError, TaskError};

pub const GENERATION_TEMPERATURE: f32 = 0.3;
pub const DEFAULT_EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    /// The consumer went away before the run finished.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub files: Vec<GeneratedFile>,
}

/// Final state of a run, available once its event stream has ended.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub plan: TaskPlan,
    pub state: RunState,
    pub files_emitted: usize,
}

impl RunReport {
    pub fn completed_tasks(&self) -> usize {
        self.plan.count_with_status(TaskStatus::Completed)
    }

    pub fn failed_tasks(&self) -> usize {
        self.plan.count_with_status(TaskStatus::Failed)
    }
}

/// Handle to a spawned run: its event stream plus the report it ends with.
/// Dropping the events cancels the run.
pub struct GenerationRun {
    plan_id: String,
    events: mpsc::Receiver<StreamEvent>,
    report: JoinHandle<RunReport>,
}

impl GenerationRun {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }

    pub fn into_parts(self) -> (ReceiverStream<StreamEvent>, JoinHandle<RunReport>) {
        (ReceiverStream::new(self.events), self.report)
    }

    /// Drains every event, then waits for the report.
    pub async fn collect(mut self) -> Result<(Vec<StreamEvent>, RunReport), JoinError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let report = self.report.await?;
        Ok((events, report))
    }
}

/// Generates an approved plan task by task, strictly in plan order.
#[derive(Clone)]
pub struct GenerationExecutor {
    client: Arc<dyn GenerationClient>,
    temperature: f32,
    event_buffer: usize,
}

impl GenerationExecutor {
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self {
            client,
            temperature: GENERATION_TEMPERATURE,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer.max(1);
        self
    }

    /// Validates `plan` and starts generating it on a background task.
    ///
    /// Validation errors are returned before any event exists. Must be called
    /// from within a tokio runtime.
    pub fn execute(&self, plan: TaskPlan) -> Result<GenerationRun, PlanError> {
        validate_plan(&plan)?;
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let plan_id = plan.id.clone();
        let executor = self.clone();
        let report = tokio::spawn(async move { executor.run(plan, tx).await });
        Ok(GenerationRun {
            plan_id,
            events: rx,
            report,
        })
    }

    /// Runs a plan that [`execute`](Self::execute) already validated, pushing
    /// events into `sink`.
    ///
    /// A closed sink aborts the run: the in-flight task ends `failed`, tasks
    /// not yet started stay `pending`, and no `complete` event is sent.
    pub(crate) async fn run(
        &self,
        mut plan: TaskPlan,
        sink: mpsc::Sender<StreamEvent>,
    ) -> RunReport {
        let info = self.client.info();
        plan.status = PlanStatus::Generating;
        log_run(Level::INFO, "run.started", &plan, &info, "running", None);

        let mut files_emitted = 0;
        for index in 0..plan.tasks.len() {
            if sink.is_closed() {
                return abort(plan, None, files_emitted, &info);
            }

            plan.tasks[index].status = TaskStatus::Generating;
            let task = plan.tasks[index].clone();
            if sink
                .send(StreamEvent::TaskStart { task: task.clone() })
                .await
                .is_err()
            {
                plan.tasks[index].status = TaskStatus::Pending;
                return abort(plan, None, files_emitted, &info);
            }

            let result = tokio::select! {
                result = self.generate(&task) => result,
                _ = sink.closed() => return abort(plan, Some(index), files_emitted, &info),
            };

            match result {
                Ok(outcome) => {
                    for file in outcome.files {
                        if sink.send(StreamEvent::file(file)).await.is_err() {
                            return abort(plan, Some(index), files_emitted, &info);
                        }
                        files_emitted += 1;
                    }
                    plan.tasks[index].status = TaskStatus::Completed;
                    let complete = StreamEvent::TaskComplete {
                        task_id: outcome.task_id,
                    };
                    if sink.send(complete).await.is_err() {
                        return abort(plan, None, files_emitted, &info);
                    }
                }
                Err(err) => {
                    plan.tasks[index].status = TaskStatus::Failed;
                    let message = err.source.to_string();
                    emit_event(
                        Level::WARN,
                        ProcessKind::Engine,
                        ObservabilityEvent {
                            event: "task.failed",
                            component: "orchestrator.executor",
                            project_id: Some(&plan.project_id),
                            plan_id: Some(&plan.id),
                            task_id: Some(&err.task_id),
                            provider_id: Some(&info.provider_id),
                            model_id: Some(&info.model_id),
                            status: Some("failed"),
                            error_code: Some("PROVIDER_ERROR"),
                            detail: Some(&message),
                        },
                    );
                    if sink
                        .send(StreamEvent::task_error(err.task_id, message))
                        .await
                        .is_err()
                    {
                        return abort(plan, None, files_emitted, &info);
                    }
                }
            }
        }

        if sink.send(StreamEvent::Complete).await.is_err() {
            return abort(plan, None, files_emitted, &info);
        }
        plan.status = PlanStatus::Completed;
        let summary = format!(
            "{} completed, {} failed, {} files",
            plan.count_with_status(TaskStatus::Completed),
            plan.count_with_status(TaskStatus::Failed),
            files_emitted
        );
        log_run(
            Level::INFO,
            "run.finished",
            &plan,
            &info,
            "completed",
            Some(&summary),
        );
        RunReport {
            plan,
            state: RunState::Completed,
            files_emitted,
        }
    }

    async fn generate(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(generation_system_prompt()),
            ChatMessage::user(build_task_prompt(task)),
        ])
        .temperature(self.temperature);

        let completion = self
            .client
            .complete(request)
            .await
            .map_err(|source| TaskError {
                task_id: task.id.clone(),
                source,
            })?;

        let files = extract_files(&completion.content);
        if files.is_empty() {
            tracing::warn!(task_id = %task.id, "model response contained no file blocks");
        }
        Ok(TaskOutcome {
            task_id: task.id.clone(),
            files,
        })
    }
}

fn abort(
    mut plan: TaskPlan,
    in_flight: Option<usize>,
    files_emitted: usize,
    info: &ClientInfo,
) -> RunReport {
    if let Some(task) = in_flight.and_then(|index| plan.tasks.get_mut(index)) {
        task.status = TaskStatus::Failed;
    }
    plan.status = PlanStatus::Failed;
    log_run(
        Level::WARN,
        "run.aborted",
        &plan,
        info,
        "aborted",
        Some("event consumer disconnected"),
    );
    RunReport {
        plan,
        state: RunState::Aborted,
        files_emitted,
    }
}

fn log_run(
    level: Level,
    event: &str,
    plan: &TaskPlan,
    info: &ClientInfo,
    status: &str,
    detail: Option<&str>,
) {
    emit_event(
        level,
        ProcessKind::Engine,
        ObservabilityEvent {
            event,
            component: "orchestrator.executor",
            project_id: Some(&plan.project_id),
            plan_id: Some(&plan.id),
            provider_id: Some(&info.provider_id),
            model_id: Some(&info.model_id),
            status: Some(status),
            detail,
            ..Default::default()
        },
    );
}
