//! Request handler — coordinates routing, decision execution, task state,
//! and event delivery for every A2A method.
//!
//! The [`RequestHandler`] trait is what the transport layer dispatches to;
//! [`BrokerRequestHandler`] is the implementation that wires together the
//! device registry, intent router, task manager, worker pool, and the
//! outbound agent client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::client::endpoints::AgentEndpointRegistry;
use crate::client::AgentClient;
use crate::config::BrokerConfig;
use crate::device::registry::DeviceRegistry;
use crate::error::{BrokerError, BrokerResult};
use crate::router::{Decision, IntentRouter, RouteInput, RouteOrigin};
use crate::types::{
    GetTaskParams, ListTasksParams, ListTasksResponse, Message, PushConfigIdParams,
    SendMessageParams, SendMessageResponse, StreamEvent, StreamOrigin, Task, TaskIdParams,
    TaskPushNotificationConfig, TaskState,
};
use crate::worker::{JobKind, WorkerPool};

use super::task_manager::TaskManager;

/// Handler interface for all A2A methods. One method per JSON-RPC method;
/// the transport layer translates envelopes to these calls.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// `message/send` — create or continue a task.
    async fn on_message_send(&self, params: SendMessageParams) -> BrokerResult<SendMessageResponse>;

    /// `message/stream` — create or continue a task, returning its ordered
    /// event stream.
    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> BrokerResult<broadcast::Receiver<StreamEvent>>;

    /// `tasks/get`.
    async fn on_get_task(&self, params: GetTaskParams) -> BrokerResult<Task>;

    /// `tasks/list`.
    async fn on_list_tasks(&self, params: ListTasksParams) -> BrokerResult<ListTasksResponse>;

    /// `tasks/cancel`.
    async fn on_cancel_task(&self, params: TaskIdParams) -> BrokerResult<Task>;

    /// `tasks/resubscribe` — re-attach to a live task's event stream.
    async fn on_resubscribe(
        &self,
        params: TaskIdParams,
    ) -> BrokerResult<broadcast::Receiver<StreamEvent>>;

    /// `tasks/pushNotificationConfig/set`.
    async fn on_set_push_config(
        &self,
        params: TaskPushNotificationConfig,
    ) -> BrokerResult<TaskPushNotificationConfig>;

    /// `tasks/pushNotificationConfig/get`.
    async fn on_get_push_config(
        &self,
        params: PushConfigIdParams,
    ) -> BrokerResult<TaskPushNotificationConfig>;

    /// `tasks/pushNotificationConfig/list`.
    async fn on_list_push_configs(
        &self,
        params: TaskIdParams,
    ) -> BrokerResult<Vec<TaskPushNotificationConfig>>;

    /// `tasks/pushNotificationConfig/delete`.
    async fn on_delete_push_config(&self, params: PushConfigIdParams) -> BrokerResult<()>;
}

/// Shared context cloned into decision-execution jobs.
#[derive(Clone)]
struct ExecutionCtx {
    tasks: Arc<TaskManager>,
    registry: Arc<DeviceRegistry>,
    endpoints: Arc<AgentEndpointRegistry>,
    default_tool_timeout: Duration,
    delegate_max_attempts: u32,
    delegate_timeout: Duration,
}

/// The broker's [`RequestHandler`] implementation.
pub struct BrokerRequestHandler {
    tasks: Arc<TaskManager>,
    registry: Arc<DeviceRegistry>,
    endpoints: Arc<AgentEndpointRegistry>,
    router: Arc<IntentRouter>,
    workers: Arc<WorkerPool>,
    /// Cancellation tokens for tasks with in-flight jobs.
    cancels: Mutex<HashMap<String, CancellationToken>>,
    blocking_timeout: Duration,
    default_tool_timeout: Duration,
    delegate_max_attempts: u32,
    delegate_timeout: Duration,
}

impl BrokerRequestHandler {
    /// Wire a handler from its collaborators.
    pub fn new(
        tasks: Arc<TaskManager>,
        registry: Arc<DeviceRegistry>,
        endpoints: Arc<AgentEndpointRegistry>,
        router: Arc<IntentRouter>,
        workers: Arc<WorkerPool>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            tasks,
            registry,
            endpoints,
            router,
            workers,
            cancels: Mutex::new(HashMap::new()),
            blocking_timeout: config.blocking_request_timeout(),
            default_tool_timeout: config.tool_timeout(),
            delegate_max_attempts: config.delegate_max_attempts,
            delegate_timeout: config.delegate_timeout(),
        }
    }

    fn ctx(&self) -> ExecutionCtx {
        ExecutionCtx {
            tasks: Arc::clone(&self.tasks),
            registry: Arc::clone(&self.registry),
            endpoints: Arc::clone(&self.endpoints),
            default_tool_timeout: self.default_tool_timeout,
            delegate_max_attempts: self.delegate_max_attempts,
            delegate_timeout: self.delegate_timeout,
        }
    }

    /// Reject sends whose accepted output modes exclude everything the
    /// broker can produce. No task is allocated for these.
    fn check_output_modes(params: &SendMessageParams) -> BrokerResult<()> {
        let Some(modes) = params
            .configuration
            .as_ref()
            .and_then(|c| c.accepted_output_modes.as_ref())
        else {
            return Ok(());
        };
        if modes.is_empty() {
            return Ok(());
        }

        let producible = ["text/plain", "application/json"];
        let acceptable = modes.iter().any(|mode| {
            mode == "*/*"
                || producible.contains(&mode.as_str())
                || mode.ends_with("/*")
                    && producible
                        .iter()
                        .any(|p| p.starts_with(mode.trim_end_matches('*')))
        });
        if acceptable {
            Ok(())
        } else {
            Err(BrokerError::content_type_not_supported(format!(
                "none of the accepted output modes ({}) can be produced",
                modes.join(", ")
            )))
        }
    }

    /// Resolve-or-create the task for a send. Returns the task and whether
    /// this call should kick off a routing pass: a freshly created task
    /// always routes, a parked (`input-required`) continuation resumes,
    /// and everything else — a task already being worked, or a stream
    /// redelivery deduplicated onto an existing task — just absorbs the
    /// message.
    async fn resolve_task(&self, params: &SendMessageParams) -> BrokerResult<(Task, bool)> {
        if let Some(ref task_id) = params.message.task_id {
            // Continuation of an existing task.
            let task = self
                .tasks
                .append_message(task_id, params.message.clone())
                .await?;
            let resume = task.status.state == TaskState::InputRequired;
            return Ok((task, resume));
        }

        let push_config = params
            .configuration
            .as_ref()
            .and_then(|c| c.push_notification_config.clone());
        let task = self
            .tasks
            .create_task(params.message.clone(), push_config)
            .await?;

        // A deduplicated stream-origin create returns the original task,
        // whose history does not start with this call's message.
        let created_here = task
            .history
            .as_ref()
            .and_then(|h| h.first())
            .map(|m| m.message_id == params.message.message_id)
            .unwrap_or(false);
        Ok((task, created_here))
    }

    /// Build the router input for a message, resolving stream provenance
    /// to the device's system prompt.
    async fn route_input(&self, message: &Message) -> RouteInput {
        let origin = match StreamOrigin::from_message(message) {
            Some(origin) => {
                let system_prompt = self
                    .registry
                    .get(&origin.device_id)
                    .await
                    .and_then(|d| d.system_prompt);
                RouteOrigin::DeviceStream {
                    device_id: origin.device_id,
                    seq: origin.seq,
                    system_prompt,
                }
            }
            None => RouteOrigin::Request,
        };
        RouteInput {
            text: message.text_content(),
            origin,
        }
    }

    /// Route the message and hand the decision to the worker pool.
    ///
    /// A pool refusal (overloaded) fails the task immediately.
    async fn dispatch(&self, task: &Task, message: &Message) -> BrokerResult<()> {
        let input = self.route_input(message).await;
        let devices = self.registry.snapshot().await;
        let endpoints = self.endpoints.enabled().await;
        let decision = self.router.route(&input, &devices, &endpoints).await;
        debug!(task_id = %task.id, decision = ?decision, "Routing decision");

        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert(task.id.clone(), cancel.clone());

        let kind = match &decision {
            Decision::Device { .. } => JobKind::DeviceToolInvoke,
            Decision::Delegate { .. } => JobKind::AgentDelegate,
            _ => JobKind::LlmCall,
        };

        let ctx = self.ctx();
        let task_id = task.id.clone();
        let job_cancel = cancel.clone();
        let submit = self
            .workers
            .submit(kind, cancel, async move {
                execute_decision(ctx, task_id, decision, job_cancel).await;
            })
            .await;

        if let Err(e) = submit {
            warn!(task_id = %task.id, error = %e, "Worker pool refused the job");
            self.cancels.lock().await.remove(&task.id);
            self.tasks.fail(&task.id, &e).await?;
            return Ok(());
        }
        Ok(())
    }

    /// Wait until the task reaches a terminal or input-required state, or
    /// the deadline elapses (which fails the task with `Timeout`).
    async fn wait_blocking(
        &self,
        task_id: &str,
        mut rx: broadcast::Receiver<StreamEvent>,
    ) -> BrokerResult<()> {
        let deadline = tokio::time::Instant::now() + self.blocking_timeout;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    let err = BrokerError::Timeout(format!(
                        "blocking send deadline of {:?} elapsed",
                        self.blocking_timeout
                    ));
                    if let Some(token) = self.cancels.lock().await.remove(task_id) {
                        token.cancel();
                    }
                    // The job may have completed in the same instant.
                    let _ = self.tasks.fail(task_id, &err).await;
                    return Ok(());
                }
                event = rx.recv() => event,
            };

            match event {
                Ok(StreamEvent::StatusUpdate(update)) => {
                    if update.r#final || update.status.state == TaskState::InputRequired {
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(task_id = %task_id, missed = n, "Blocking waiter lagged");
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for BrokerRequestHandler {
    async fn on_message_send(&self, params: SendMessageParams) -> BrokerResult<SendMessageResponse> {
        Self::check_output_modes(&params)?;
        let (task, dispatch) = self.resolve_task(&params).await?;
        let rx = if task.status.state.is_terminal() {
            None
        } else {
            Some(self.tasks.subscribe(&task.id).await?)
        };
        if dispatch {
            self.dispatch(&task, &params.message).await?;
        }

        let config = params.configuration.unwrap_or_default();
        if config.blocking.unwrap_or(false) {
            if let Some(rx) = rx {
                self.wait_blocking(&task.id, rx).await?;
            }
        }

        let task = self.tasks.get(&task.id, config.history_length).await?;
        Ok(SendMessageResponse::Task(task))
    }

    async fn on_message_send_stream(
        &self,
        params: SendMessageParams,
    ) -> BrokerResult<broadcast::Receiver<StreamEvent>> {
        Self::check_output_modes(&params)?;
        let (task, dispatch) = self.resolve_task(&params).await?;
        let rx = self.tasks.subscribe(&task.id).await?;
        if dispatch {
            self.dispatch(&task, &params.message).await?;
        }
        Ok(rx)
    }

    async fn on_get_task(&self, params: GetTaskParams) -> BrokerResult<Task> {
        self.tasks.get(&params.id, params.history_length).await
    }

    async fn on_list_tasks(&self, params: ListTasksParams) -> BrokerResult<ListTasksResponse> {
        self.tasks.list(&params).await
    }

    async fn on_cancel_task(&self, params: TaskIdParams) -> BrokerResult<Task> {
        let task = self.tasks.cancel(&params.id, None).await?;
        // Release the worker slot held by the task's job, if any.
        if let Some(token) = self.cancels.lock().await.remove(&params.id) {
            token.cancel();
        }
        Ok(task)
    }

    async fn on_resubscribe(
        &self,
        params: TaskIdParams,
    ) -> BrokerResult<broadcast::Receiver<StreamEvent>> {
        self.tasks.subscribe(&params.id).await
    }

    async fn on_set_push_config(
        &self,
        params: TaskPushNotificationConfig,
    ) -> BrokerResult<TaskPushNotificationConfig> {
        self.tasks
            .set_push_config(&params.task_id, params.push_notification_config)
            .await
    }

    async fn on_get_push_config(
        &self,
        params: PushConfigIdParams,
    ) -> BrokerResult<TaskPushNotificationConfig> {
        self.tasks
            .get_push_config(&params.id, &params.push_notification_config_id)
            .await
    }

    async fn on_list_push_configs(
        &self,
        params: TaskIdParams,
    ) -> BrokerResult<Vec<TaskPushNotificationConfig>> {
        self.tasks.list_push_configs(&params.id).await
    }

    async fn on_delete_push_config(&self, params: PushConfigIdParams) -> BrokerResult<()> {
        self.tasks
            .delete_push_config(&params.id, &params.push_notification_config_id)
            .await
    }
}

// ---------------------------------------------------------------------------
// Decision execution
// ---------------------------------------------------------------------------

/// Run one routing decision to completion, transitioning the task as work
/// proceeds. Runs on a pool worker; failures fail the task rather than
/// propagating.
async fn execute_decision(
    ctx: ExecutionCtx,
    task_id: String,
    decision: Decision,
    cancel: CancellationToken,
) {
    let result = match decision {
        Decision::Local { reply } => execute_local(&ctx, &task_id, reply).await,
        Decision::Clarify { question } => execute_clarify(&ctx, &task_id, question).await,
        Decision::Device {
            device_id,
            tool_id,
            arguments,
        } => execute_device(&ctx, &task_id, &device_id, &tool_id, arguments, cancel).await,
        Decision::Delegate { agent_id } => execute_delegate(&ctx, &task_id, &agent_id).await,
        Decision::Reject { reason } => {
            ctx.tasks
                .transition(
                    &task_id,
                    TaskState::Rejected,
                    Some(Message::agent_text(reason)),
                )
                .await
                .map(|_| ())
        }
    };

    if let Err(e) = result {
        // A task canceled mid-flight is already terminal; anything else
        // becomes the task's failure.
        match ctx.tasks.fail(&task_id, &e).await {
            Ok(_) => {}
            Err(BrokerError::TaskNotCancelable { .. }) => {
                debug!(task_id = %task_id, "Task already terminal, dropping late failure");
            }
            Err(persist_err) => {
                error!(task_id = %task_id, error = %persist_err, "Failed to record task failure");
            }
        }
    }
}

async fn execute_local(ctx: &ExecutionCtx, task_id: &str, reply: String) -> BrokerResult<()> {
    ctx.tasks
        .transition(task_id, TaskState::Working, None)
        .await?;
    let reply_message = Message::agent_text(if reply.is_empty() {
        "Done.".to_string()
    } else {
        reply
    });
    ctx.tasks
        .append_message(task_id, reply_message.clone())
        .await?;
    ctx.tasks
        .transition(task_id, TaskState::Completed, Some(reply_message))
        .await?;
    Ok(())
}

async fn execute_clarify(ctx: &ExecutionCtx, task_id: &str, question: String) -> BrokerResult<()> {
    ctx.tasks
        .transition(task_id, TaskState::Working, None)
        .await?;
    ctx.tasks
        .transition(
            task_id,
            TaskState::InputRequired,
            Some(Message::agent_text(question)),
        )
        .await?;
    Ok(())
}

async fn execute_device(
    ctx: &ExecutionCtx,
    task_id: &str,
    device_id: &str,
    tool_id: &str,
    arguments: serde_json::Value,
    cancel: CancellationToken,
) -> BrokerResult<()> {
    ctx.tasks
        .transition(task_id, TaskState::Working, None)
        .await?;

    let device = ctx
        .registry
        .get(device_id)
        .await
        .ok_or_else(|| BrokerError::DeviceGone(format!("device '{}' is not registered", device_id)))?;
    let port = ctx
        .registry
        .port(device_id)
        .await
        .ok_or_else(|| BrokerError::DeviceGone(format!("device '{}' has no attached port", device_id)))?;

    let timeout = device
        .tool(tool_id)
        .and_then(|t| t.timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(ctx.default_tool_timeout);

    let correlation_id = Uuid::new_v4().to_string();
    let outcome = tokio::time::timeout(
        timeout,
        port.invoke(tool_id, arguments, &correlation_id, cancel),
    )
    .await
    .map_err(|_| BrokerError::Timeout(format!("tool '{}' on '{}' timed out", tool_id, device_id)))??;

    ctx.tasks
        .add_artifact(task_id, outcome.parts, Some(format!("{} result", tool_id)))
        .await?;
    ctx.tasks
        .transition(
            task_id,
            TaskState::Completed,
            Some(Message::agent_text(format!(
                "Tool '{}' on device '{}' completed.",
                tool_id, device_id
            ))),
        )
        .await?;
    Ok(())
}

async fn execute_delegate(ctx: &ExecutionCtx, task_id: &str, agent_id: &str) -> BrokerResult<()> {
    ctx.tasks
        .transition(task_id, TaskState::Working, None)
        .await?;

    let endpoint = ctx
        .endpoints
        .get(agent_id)
        .await
        .filter(|e| e.enabled)
        .ok_or_else(|| {
            BrokerError::invalid_agent_response(format!("agent '{}' is not available", agent_id))
        })?;

    // Forward the task's latest user message without broker-local ids.
    let task = ctx.tasks.get(task_id, None).await?;
    let mut forwarded = task
        .history
        .as_ref()
        .and_then(|h| h.iter().rev().find(|m| m.role == crate::types::Role::User))
        .cloned()
        .ok_or_else(|| BrokerError::internal_error("task has no user message to forward"))?;
    forwarded.task_id = None;
    forwarded.context_id = None;
    forwarded.metadata = None;

    let client = AgentClient::for_endpoint(&endpoint, None, ctx.delegate_timeout)
        .with_retry(ctx.delegate_max_attempts, Duration::from_millis(500));
    let response = client
        .send_message(SendMessageParams {
            message: forwarded,
            configuration: None,
            metadata: None,
        })
        .await?;

    match response {
        SendMessageResponse::Message(reply) => {
            ctx.endpoints.record_success(agent_id).await;
            ctx.tasks.append_message(task_id, reply.clone()).await?;
            ctx.tasks
                .transition(task_id, TaskState::Completed, Some(reply))
                .await?;
            Ok(())
        }
        SendMessageResponse::Task(remote) => match remote.status.state {
            TaskState::Completed => {
                ctx.endpoints.record_success(agent_id).await;
                for artifact in remote.artifacts.unwrap_or_default() {
                    ctx.tasks
                        .add_artifact(task_id, artifact.parts, artifact.name)
                        .await?;
                }
                let note = remote
                    .status
                    .message
                    .unwrap_or_else(|| Message::agent_text(format!("Delegated to '{}'.", agent_id)));
                ctx.tasks
                    .transition(task_id, TaskState::Completed, Some(note))
                    .await?;
                Ok(())
            }
            TaskState::Failed | TaskState::Canceled | TaskState::Rejected => {
                Err(BrokerError::invalid_agent_response(format!(
                    "agent '{}' ended the delegated task in state {}",
                    agent_id, remote.status.state
                )))
            }
            other => {
                // The peer accepted the work but has not finished it; hand
                // the remote task id back so the client can follow up.
                ctx.endpoints.record_success(agent_id).await;
                let mut note = Message::agent_text(format!(
                    "Delegated to '{}' as remote task {} (state: {}).",
                    agent_id, remote.id, other
                ));
                note.reference_task_ids = Some(vec![remote.id.clone()]);
                ctx.tasks.append_message(task_id, note.clone()).await?;
                ctx.tasks
                    .transition(task_id, TaskState::Completed, Some(note))
                    .await?;
                Ok(())
            }
        },
    }
}
