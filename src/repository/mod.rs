//! Repository port — durable storage behind the in-memory owners.
//!
//! The registry, task manager, scan loop, and endpoint registry all write
//! through to a [`Repository`]. Reads are served from memory; the store is
//! the source of truth only at startup. [`InMemoryRepository`] backs tests
//! and single-process deployments; [`FileRepository`](file::FileRepository)
//! persists JSON files per record.

pub mod file;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::endpoints::AgentEndpoint;
use crate::device::Device;
use crate::error::BrokerResult;
use crate::types::{ListTasksParams, ListTasksResponse, Task, TaskPushNotificationConfig};

/// Durable storage for broker state.
///
/// Implementations must be `Send + Sync`; all methods take `&self` and use
/// interior mutability.
#[async_trait]
pub trait Repository: Send + Sync {
    // -- Tasks --

    /// Save or overwrite a task.
    async fn save_task(&self, task: Task) -> BrokerResult<()>;

    /// Retrieve a task by id.
    async fn get_task(&self, task_id: &str) -> BrokerResult<Option<Task>>;

    /// Delete a task by id. Succeeds silently when absent.
    async fn delete_task(&self, task_id: &str) -> BrokerResult<()>;

    /// List tasks with contextId/state filters and page-token pagination.
    async fn list_tasks(&self, params: &ListTasksParams) -> BrokerResult<ListTasksResponse>;

    // -- Devices --

    /// Save or overwrite a device record.
    async fn save_device(&self, device: Device) -> BrokerResult<()>;

    /// Retrieve a device by id.
    async fn get_device(&self, device_id: &str) -> BrokerResult<Option<Device>>;

    /// Delete a device record (deregistration tombstone).
    async fn delete_device(&self, device_id: &str) -> BrokerResult<()>;

    /// List all device records.
    async fn list_devices(&self) -> BrokerResult<Vec<Device>>;

    // -- Push configs --

    /// Save a push config. The config's `id` must be set by the caller.
    async fn save_push_config(&self, config: TaskPushNotificationConfig) -> BrokerResult<()>;

    /// Retrieve one push config by task + config id.
    async fn get_push_config(
        &self,
        task_id: &str,
        config_id: &str,
    ) -> BrokerResult<Option<TaskPushNotificationConfig>>;

    /// List all push configs for a task.
    async fn list_push_configs(&self, task_id: &str)
        -> BrokerResult<Vec<TaskPushNotificationConfig>>;

    /// Delete one push config. Succeeds silently when absent.
    async fn delete_push_config(&self, task_id: &str, config_id: &str) -> BrokerResult<()>;

    // -- Stream high-water marks --

    /// The last stream sequence number dispatched for a device.
    async fn get_watermark(&self, device_id: &str) -> BrokerResult<Option<u64>>;

    /// Persist the high-water mark for a device.
    async fn set_watermark(&self, device_id: &str, seq: u64) -> BrokerResult<()>;

    // -- External agent endpoints --

    /// Save or overwrite an agent endpoint.
    async fn save_endpoint(&self, endpoint: AgentEndpoint) -> BrokerResult<()>;

    /// List all agent endpoints.
    async fn list_endpoints(&self) -> BrokerResult<Vec<AgentEndpoint>>;

    /// Delete an agent endpoint. Succeeds silently when absent.
    async fn delete_endpoint(&self, agent_id: &str) -> BrokerResult<()>;
}

/// In-memory repository backed by `HashMap`s.
///
/// Suitable for development, testing, and short-lived instances. All data
/// is lost when the process exits. Thread-safe via `tokio::sync::RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    /// Task insertion order for deterministic listing/pagination.
    task_order: Arc<RwLock<Vec<String>>>,
    devices: Arc<RwLock<HashMap<String, Device>>>,
    push_configs: Arc<RwLock<HashMap<String, Vec<TaskPushNotificationConfig>>>>,
    watermarks: Arc<RwLock<HashMap<String, u64>>>,
    endpoints: Arc<RwLock<HashMap<String, AgentEndpoint>>>,
}

impl InMemoryRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared pagination walk over an ordered id list; used by both repository
/// implementations so file and memory stores page identically.
pub(crate) fn paginate_tasks(
    cache: &HashMap<String, Task>,
    order: &[String],
    params: &ListTasksParams,
) -> ListTasksResponse {
    let start_idx = if let Some(ref token) = params.page_token {
        match order.iter().position(|id| id == token) {
            Some(pos) => pos + 1,
            None => {
                warn!(page_token = %token, "Invalid page token, starting from beginning");
                0
            }
        }
    } else {
        0
    };

    let page_size = params.page_size.unwrap_or(usize::MAX);
    let mut tasks = Vec::new();
    let mut last_id: Option<String> = None;

    for id in order.iter().skip(start_idx) {
        if tasks.len() >= page_size {
            break;
        }
        if let Some(task) = cache.get(id) {
            if let Some(ref ctx_id) = params.context_id {
                if task.context_id != *ctx_id {
                    continue;
                }
            }
            if let Some(ref statuses) = params.status {
                if !statuses.contains(&task.status.state) {
                    continue;
                }
            }
            last_id = Some(id.clone());
            tasks.push(task.clone());
        }
    }

    let next_page_token = if tasks.len() == page_size {
        last_id.filter(|last| {
            let last_pos = order.iter().position(|id| id == last).unwrap_or(0);
            last_pos + 1 < order.len()
        })
    } else {
        None
    };

    ListTasksResponse {
        tasks,
        next_page_token,
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_task(&self, task: Task) -> BrokerResult<()> {
        let task_id = task.id.clone();
        let mut tasks = self.tasks.write().await;
        let is_new = !tasks.contains_key(&task_id);
        tasks.insert(task_id.clone(), task);
        if is_new {
            self.task_order.write().await.push(task_id.clone());
        }
        debug!(task_id = %task_id, is_new = is_new, "Task saved");
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> BrokerResult<Option<Task>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn delete_task(&self, task_id: &str) -> BrokerResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_some() {
            self.task_order.write().await.retain(|id| id != task_id);
            debug!(task_id = %task_id, "Task deleted");
        }
        Ok(())
    }

    async fn list_tasks(&self, params: &ListTasksParams) -> BrokerResult<ListTasksResponse> {
        let tasks = self.tasks.read().await;
        let order = self.task_order.read().await;
        Ok(paginate_tasks(&tasks, &order, params))
    }

    async fn save_device(&self, device: Device) -> BrokerResult<()> {
        self.devices
            .write()
            .await
            .insert(device.device_id.clone(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> BrokerResult<Option<Device>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn delete_device(&self, device_id: &str) -> BrokerResult<()> {
        self.devices.write().await.remove(device_id);
        Ok(())
    }

    async fn list_devices(&self) -> BrokerResult<Vec<Device>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn save_push_config(&self, config: TaskPushNotificationConfig) -> BrokerResult<()> {
        let mut configs = self.push_configs.write().await;
        let entry = configs.entry(config.task_id.clone()).or_default();
        let config_id = config.push_notification_config.id.clone();
        entry.retain(|c| c.push_notification_config.id != config_id);
        entry.push(config);
        Ok(())
    }

    async fn get_push_config(
        &self,
        task_id: &str,
        config_id: &str,
    ) -> BrokerResult<Option<TaskPushNotificationConfig>> {
        Ok(self.push_configs.read().await.get(task_id).and_then(|v| {
            v.iter()
                .find(|c| c.push_notification_config.id.as_deref() == Some(config_id))
                .cloned()
        }))
    }

    async fn list_push_configs(
        &self,
        task_id: &str,
    ) -> BrokerResult<Vec<TaskPushNotificationConfig>> {
        Ok(self
            .push_configs
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_push_config(&self, task_id: &str, config_id: &str) -> BrokerResult<()> {
        if let Some(entry) = self.push_configs.write().await.get_mut(task_id) {
            entry.retain(|c| c.push_notification_config.id.as_deref() != Some(config_id));
        }
        Ok(())
    }

    async fn get_watermark(&self, device_id: &str) -> BrokerResult<Option<u64>> {
        Ok(self.watermarks.read().await.get(device_id).copied())
    }

    async fn set_watermark(&self, device_id: &str, seq: u64) -> BrokerResult<()> {
        self.watermarks
            .write()
            .await
            .insert(device_id.to_string(), seq);
        Ok(())
    }

    async fn save_endpoint(&self, endpoint: AgentEndpoint) -> BrokerResult<()> {
        self.endpoints
            .write()
            .await
            .insert(endpoint.agent_id.clone(), endpoint);
        Ok(())
    }

    async fn list_endpoints(&self) -> BrokerResult<Vec<AgentEndpoint>> {
        Ok(self.endpoints.read().await.values().cloned().collect())
    }

    async fn delete_endpoint(&self, agent_id: &str) -> BrokerResult<()> {
        self.endpoints.write().await.remove(agent_id);
        Ok(())
    }
}
