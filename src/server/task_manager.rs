//! Task manager — the singleton owner of tasks, their histories,
//! artifacts, subscribers, and push subscriptions.
//!
//! All mutation of one task happens under that task's exclusive section,
//! which is what gives every subscriber the same total event order. The
//! state machine is enforced here: terminal states are absorbing, and only
//! the legal edges are accepted:
//!
//! ```text
//! submitted      → working | rejected | canceled | failed
//! working        → input-required | auth-required | completed | canceled | failed
//! input-required → working | canceled | failed
//! auth-required  → working | completed | canceled | failed
//! ```
//!
//! Tasks synthesized from device streams carry a `(device_id, seq)` origin
//! key; creation is idempotent per key, which makes scan-loop redelivery
//! harmless.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, BrokerResult};
use crate::repository::Repository;
use crate::types::{
    Artifact, ListTasksParams, ListTasksResponse, Message, PushNotificationConfig, StreamEvent,
    StreamOrigin, Task, TaskArtifactUpdateEvent, TaskPushNotificationConfig, TaskState,
    TaskStatus, TaskStatusUpdateEvent,
};

use super::event_queue::EventQueue;
use super::push::PushDeliveryQueue;

/// The task lifecycle singleton.
pub struct TaskManager {
    repository: Arc<dyn Repository>,
    push: Arc<PushDeliveryQueue>,
    /// Live per-task event queues.
    queues: Mutex<HashMap<String, EventQueue>>,
    /// Per-task exclusive sections. Cross-task operations take no global lock.
    sections: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Scan-origin dedup index: `(device_id, seq)` → task id.
    origins: Mutex<HashMap<StreamOrigin, String>>,
    /// Whether state changes append displaced status messages to history.
    record_transitions: bool,
    /// Whether push notifications are enabled for this deployment.
    push_enabled: bool,
}

impl TaskManager {
    /// Create a task manager over the given repository and push queue.
    pub fn new(
        repository: Arc<dyn Repository>,
        push: Arc<PushDeliveryQueue>,
        record_transitions: bool,
        push_enabled: bool,
    ) -> Self {
        Self {
            repository,
            push,
            queues: Mutex::new(HashMap::new()),
            sections: Mutex::new(HashMap::new()),
            origins: Mutex::new(HashMap::new()),
            record_transitions,
            push_enabled,
        }
    }

    /// Rebuild the origin dedup index from persisted tasks.
    pub async fn hydrate(&self) -> BrokerResult<()> {
        let all = self
            .repository
            .list_tasks(&ListTasksParams::default())
            .await?;
        let mut origins = self.origins.lock().await;
        for task in &all.tasks {
            if let Some(origin) = task
                .metadata
                .as_ref()
                .and_then(|m| m.get(crate::types::STREAM_ORIGIN_KEY))
                .and_then(|v| serde_json::from_value::<StreamOrigin>(v.clone()).ok())
            {
                origins.insert(origin, task.id.clone());
            }
        }
        info!(tasks = all.tasks.len(), "Task manager hydrated");
        Ok(())
    }

    async fn section(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut sections = self.sections.lock().await;
        sections
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, task_id: &str) -> BrokerResult<Task> {
        self.repository
            .get_task(task_id)
            .await?
            .ok_or_else(|| BrokerError::task_not_found(task_id.to_string()))
    }

    /// Emit an event under the caller-held section: queue fan-out plus push
    /// delivery to every registered target.
    async fn emit(&self, task_id: &str, event: StreamEvent) {
        {
            let queues = self.queues.lock().await;
            if let Some(queue) = queues.get(task_id) {
                queue.publish(event.clone());
            }
        }

        if !self.push_enabled {
            return;
        }
        // Push targets only receive status/artifact update envelopes.
        if !matches!(
            event,
            StreamEvent::StatusUpdate(_) | StreamEvent::ArtifactUpdate(_)
        ) {
            return;
        }
        match self.repository.list_push_configs(task_id).await {
            Ok(configs) => {
                for config in configs {
                    self.push
                        .enqueue(task_id, config.push_notification_config, event.clone())
                        .await;
                }
            }
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to load push configs"),
        }
    }

    // ------------------------------------------------------------------
    // Creation & messages
    // ------------------------------------------------------------------

    /// Create a task in `submitted` state from an initial message.
    ///
    /// When the message carries a stream origin key, creation is
    /// idempotent: a second call with the same `(device_id, seq)` returns
    /// the originally created task.
    pub async fn create_task(
        &self,
        message: Message,
        push_config: Option<PushNotificationConfig>,
    ) -> BrokerResult<Task> {
        let origin = StreamOrigin::from_message(&message);

        if let Some(ref origin) = origin {
            let origins = self.origins.lock().await;
            if let Some(existing_id) = origins.get(origin) {
                debug!(
                    device_id = %origin.device_id,
                    seq = origin.seq,
                    task_id = %existing_id,
                    "Duplicate stream origin, returning existing task"
                );
                let existing_id = existing_id.clone();
                drop(origins);
                return self.load(&existing_id).await;
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let context_id = message
            .context_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let metadata = origin.as_ref().map(|o| {
            serde_json::json!({
                crate::types::STREAM_ORIGIN_KEY: serde_json::to_value(o).unwrap_or_default()
            })
        });

        let task = Task {
            id: task_id.clone(),
            context_id,
            kind: "task".to_string(),
            status: TaskStatus {
                state: TaskState::Submitted,
                message: None,
                timestamp: Some(Utc::now().to_rfc3339()),
            },
            artifacts: None,
            history: Some(vec![message]),
            metadata,
        };

        self.repository.save_task(task.clone()).await?;

        if let Some(origin) = origin {
            self.origins.lock().await.insert(origin, task_id.clone());
        }
        self.queues
            .lock()
            .await
            .insert(task_id.clone(), EventQueue::with_default_capacity());

        if let Some(config) = push_config {
            self.set_push_config(&task_id, config).await?;
        }

        debug!(task_id = %task.id, "Created new task");
        Ok(task)
    }

    /// Append a user message to a live task (multi-turn continuation).
    pub async fn append_message(
        &self,
        task_id: &str,
        message: Message,
    ) -> BrokerResult<Task> {
        let section = self.section(task_id).await;
        let _guard = section.lock().await;

        let mut task = self.load(task_id).await?;
        if task.status.state.is_terminal() {
            return Err(BrokerError::task_not_cancelable(format!(
                "task {} is closed (state: {})",
                task_id, task.status.state
            )));
        }

        // Displace the current status message into history before appending.
        if let Some(status_msg) = task.status.message.take() {
            task.history.get_or_insert_with(Vec::new).push(status_msg);
        }
        task.history.get_or_insert_with(Vec::new).push(message);

        self.repository.save_task(task.clone()).await?;
        Ok(task)
    }

    /// Retrieve a task, trimming history to the requested length.
    pub async fn get(&self, task_id: &str, history_length: Option<usize>) -> BrokerResult<Task> {
        let mut task = self.load(task_id).await?;
        Self::trim_history(&mut task, history_length);
        Ok(task)
    }

    /// List tasks through the repository.
    pub async fn list(&self, params: &ListTasksParams) -> BrokerResult<ListTasksResponse> {
        self.repository.list_tasks(params).await
    }

    /// The task id previously created for a stream origin, if any.
    pub async fn find_by_origin(&self, origin: &StreamOrigin) -> Option<String> {
        self.origins.lock().await.get(origin).cloned()
    }

    /// Keep the most recent `max` history messages.
    fn trim_history(task: &mut Task, max: Option<usize>) {
        if let Some(max) = max {
            if max > 0 {
                if let Some(ref mut history) = task.history {
                    if history.len() > max {
                        let start = history.len() - max;
                        *history = history.split_off(start);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn legal_transition(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Submitted, Working)
                | (Submitted, Rejected)
                | (Submitted, Canceled)
                | (Submitted, Failed)
                | (Working, InputRequired)
                | (Working, AuthRequired)
                | (Working, Completed)
                | (Working, Canceled)
                | (Working, Failed)
                | (InputRequired, Working)
                | (InputRequired, Canceled)
                | (InputRequired, Failed)
                | (AuthRequired, Working)
                | (AuthRequired, Completed)
                | (AuthRequired, Canceled)
                | (AuthRequired, Failed)
        )
    }

    /// Transition a task, appending history and emitting a status-update
    /// event. Idempotent when the task is already in `to_state` with the
    /// same note; illegal edges are rejected.
    pub async fn transition(
        &self,
        task_id: &str,
        to_state: TaskState,
        note: Option<Message>,
    ) -> BrokerResult<Task> {
        let section = self.section(task_id).await;
        let _guard = section.lock().await;

        let mut task = self.load(task_id).await?;
        let from = task.status.state;

        if from == to_state {
            let same_note = match (&task.status.message, &note) {
                (None, None) => true,
                (Some(a), Some(b)) => a.text_content() == b.text_content(),
                _ => false,
            };
            if same_note {
                debug!(task_id = %task_id, state = %to_state, "Transition is a no-op");
                return Ok(task);
            }
        }

        // Terminal states are absorbing even for note-only updates.
        if from.is_terminal() {
            return Err(BrokerError::task_not_cancelable(format!(
                "task {} is closed (state: {})",
                task_id, from
            )));
        }
        if from != to_state && !Self::legal_transition(from, to_state) {
            return Err(BrokerError::invalid_request(format!(
                "illegal task transition {} -> {}",
                from, to_state
            )));
        }

        // Displace the previous status message into history.
        if self.record_transitions {
            if let Some(prev) = task.status.message.take() {
                task.history.get_or_insert_with(Vec::new).push(prev);
            }
        }

        task.status = TaskStatus {
            state: to_state,
            message: note,
            timestamp: Some(Utc::now().to_rfc3339()),
        };
        self.repository.save_task(task.clone()).await?;

        let event = StreamEvent::StatusUpdate(TaskStatusUpdateEvent {
            task_id: task.id.clone(),
            context_id: task.context_id.clone(),
            kind: "status-update".to_string(),
            status: task.status.clone(),
            r#final: to_state.is_terminal(),
            metadata: None,
        });
        self.emit(task_id, event).await;

        debug!(task_id = %task_id, from = %from, to = %to_state, "Task transitioned");

        if to_state.is_terminal() {
            // The final event has been published; close and drop the queue
            // so late publishes cannot reorder after it.
            let queue = self.queues.lock().await.remove(task_id);
            if let Some(queue) = queue {
                queue.close();
            }
            self.sections.lock().await.remove(task_id);
        }

        Ok(task)
    }

    /// Cancel a task. Fails with `TaskNotCancelable` from terminal states.
    pub async fn cancel(&self, task_id: &str, note: Option<Message>) -> BrokerResult<Task> {
        self.transition(task_id, TaskState::Canceled, note).await
    }

    /// Fail a task, attaching the failure kind to the terminal status.
    pub async fn fail(&self, task_id: &str, error: &BrokerError) -> BrokerResult<Task> {
        let note = Message::agent_text(format!("{}: {}", error.failure_kind(), error));
        self.transition(task_id, TaskState::Failed, Some(note)).await
    }

    // ------------------------------------------------------------------
    // Artifacts
    // ------------------------------------------------------------------

    /// Apply an artifact chunk: `append=false` adds or replaces the
    /// artifact, `append=true` extends an existing one (chunks for unknown
    /// artifacts are ignored), `last_chunk=true` seals it.
    pub async fn append_artifact_chunk(
        &self,
        event: TaskArtifactUpdateEvent,
    ) -> BrokerResult<Task> {
        let task_id = event.task_id.clone();
        let section = self.section(&task_id).await;
        let _guard = section.lock().await;

        let mut task = self.load(&task_id).await?;
        if task.status.state.is_terminal() {
            return Err(BrokerError::task_not_cancelable(format!(
                "task {} is closed (state: {})",
                task_id, task.status.state
            )));
        }

        Self::apply_artifact(&mut task, &event);
        self.repository.save_task(task.clone()).await?;
        self.emit(&task_id, StreamEvent::ArtifactUpdate(event)).await;
        Ok(task)
    }

    fn apply_artifact(task: &mut Task, event: &TaskArtifactUpdateEvent) {
        let artifacts = task.artifacts.get_or_insert_with(Vec::new);
        let artifact_id = &event.artifact.artifact_id;
        let append = event.append.unwrap_or(false);
        let existing_idx = artifacts.iter().position(|a| &a.artifact_id == artifact_id);

        if !append {
            if let Some(idx) = existing_idx {
                debug!(artifact_id = %artifact_id, task_id = %task.id, "Replacing artifact");
                artifacts[idx] = event.artifact.clone();
            } else {
                debug!(artifact_id = %artifact_id, task_id = %task.id, "Adding new artifact");
                artifacts.push(event.artifact.clone());
            }
        } else if let Some(idx) = existing_idx {
            debug!(artifact_id = %artifact_id, task_id = %task.id, "Appending parts to artifact");
            artifacts[idx].parts.extend(event.artifact.parts.clone());
        } else {
            warn!(
                artifact_id = %artifact_id,
                task_id = %task.id,
                "Received append=true for nonexistent artifact. Ignoring chunk."
            );
        }
    }

    /// Convenience: publish a single sealed artifact built from parts.
    pub async fn add_artifact(
        &self,
        task_id: &str,
        parts: Vec<crate::types::Part>,
        name: Option<String>,
    ) -> BrokerResult<Task> {
        let task = self.load(task_id).await?;
        self.append_artifact_chunk(TaskArtifactUpdateEvent {
            task_id: task_id.to_string(),
            context_id: task.context_id,
            kind: "artifact-update".to_string(),
            artifact: Artifact {
                artifact_id: Uuid::new_v4().to_string(),
                name,
                description: None,
                parts,
                metadata: None,
            },
            append: Some(false),
            last_chunk: Some(true),
            metadata: None,
        })
        .await
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe to a live task's event stream.
    ///
    /// The receiver sees all events published after this call; a client
    /// that reconnects should pair this with a `tasks/get` snapshot.
    pub async fn subscribe(&self, task_id: &str) -> BrokerResult<broadcast::Receiver<StreamEvent>> {
        let task = self.load(task_id).await?;
        if task.status.state.is_terminal() {
            return Err(BrokerError::task_not_cancelable(format!(
                "task {} is closed (state: {})",
                task_id, task.status.state
            )));
        }

        let mut queues = self.queues.lock().await;
        let queue = queues
            .entry(task_id.to_string())
            .or_insert_with(EventQueue::with_default_capacity);
        Ok(queue.subscribe())
    }

    // ------------------------------------------------------------------
    // Push subscriptions
    // ------------------------------------------------------------------

    fn ensure_push_enabled(&self) -> BrokerResult<()> {
        if self.push_enabled {
            Ok(())
        } else {
            Err(BrokerError::push_notification_not_supported(
                "push notifications are disabled",
            ))
        }
    }

    /// Register (or replace) a push config for a task. Generates a config
    /// id when the client did not supply one.
    pub async fn set_push_config(
        &self,
        task_id: &str,
        mut config: PushNotificationConfig,
    ) -> BrokerResult<TaskPushNotificationConfig> {
        self.ensure_push_enabled()?;
        // Validate the task exists before accepting the subscription.
        self.load(task_id).await?;

        if config.id.is_none() {
            config.id = Some(Uuid::new_v4().to_string());
        }
        let bound = TaskPushNotificationConfig {
            task_id: task_id.to_string(),
            push_notification_config: config,
        };
        self.repository.save_push_config(bound.clone()).await?;
        Ok(bound)
    }

    /// Fetch one push config.
    pub async fn get_push_config(
        &self,
        task_id: &str,
        config_id: &str,
    ) -> BrokerResult<TaskPushNotificationConfig> {
        self.ensure_push_enabled()?;
        self.repository
            .get_push_config(task_id, config_id)
            .await?
            .ok_or_else(|| {
                BrokerError::invalid_params(format!(
                    "no push config '{}' for task {}",
                    config_id, task_id
                ))
            })
    }

    /// List a task's push configs.
    pub async fn list_push_configs(
        &self,
        task_id: &str,
    ) -> BrokerResult<Vec<TaskPushNotificationConfig>> {
        self.ensure_push_enabled()?;
        self.load(task_id).await?;
        self.repository.list_push_configs(task_id).await
    }

    /// Delete one push config.
    pub async fn delete_push_config(&self, task_id: &str, config_id: &str) -> BrokerResult<()> {
        self.ensure_push_enabled()?;
        self.repository.delete_push_config(task_id, config_id).await
    }
}
