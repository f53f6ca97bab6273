//! File-based repository — persists each record as a JSON file.
//!
//! Layout under the root directory:
//!
//! ```text
//! tasks/{task_id}.json
//! devices/{device_id}.json
//! push/{task_id}/{config_id}.json
//! endpoints/{agent_id}.json
//! watermarks.json
//! ```
//!
//! Records are cached in memory at startup; writes go to disk first, then
//! update the cache. Suitable for restart-with-state single-node
//! deployments and for debugging with external tools watching the tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::endpoints::AgentEndpoint;
use crate::device::Device;
use crate::error::{BrokerError, BrokerResult};
use crate::types::{ListTasksParams, ListTasksResponse, Task, TaskPushNotificationConfig};

use super::{paginate_tasks, Repository};

/// File-backed [`Repository`]. Thread-safe via `tokio::sync::RwLock`.
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
    tasks: Arc<RwLock<HashMap<String, Task>>>,
    task_order: Arc<RwLock<Vec<String>>>,
    devices: Arc<RwLock<HashMap<String, Device>>>,
    push_configs: Arc<RwLock<HashMap<String, Vec<TaskPushNotificationConfig>>>>,
    watermarks: Arc<RwLock<HashMap<String, u64>>>,
    endpoints: Arc<RwLock<HashMap<String, AgentEndpoint>>>,
}

fn io_err(what: &str, e: std::io::Error) -> BrokerError {
    BrokerError::internal_error(format!("{}: {}", what, e))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> BrokerResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| BrokerError::internal_error(format!("failed to serialize record: {}", e)))?;
    fs::write(path, json)
        .await
        .map_err(|e| io_err("failed to write record file", e))
}

async fn remove_file_if_exists(path: &Path) -> BrokerResult<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err("failed to delete record file", e)),
    }
}

/// Load every `*.json` in a directory, keyed by the record's own id.
async fn load_dir<T: DeserializeOwned>(
    dir: &Path,
    id_of: impl Fn(&T) -> String,
) -> BrokerResult<Vec<(String, T)>> {
    let mut out = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(io_err("failed to read record directory", e)),
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(record) => {
                    let id = id_of(&record);
                    out.push((id, record));
                }
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to parse record JSON file");
                }
            },
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read record file");
            }
        }
    }
    Ok(out)
}

impl FileRepository {
    /// Open (or initialize) a file repository rooted at `root`.
    pub async fn open(root: PathBuf) -> BrokerResult<Self> {
        for sub in ["tasks", "devices", "push", "endpoints"] {
            fs::create_dir_all(root.join(sub))
                .await
                .map_err(|e| io_err("failed to create repository directory", e))?;
        }

        let repo = Self {
            root,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            task_order: Arc::new(RwLock::new(Vec::new())),
            devices: Arc::new(RwLock::new(HashMap::new())),
            push_configs: Arc::new(RwLock::new(HashMap::new())),
            watermarks: Arc::new(RwLock::new(HashMap::new())),
            endpoints: Arc::new(RwLock::new(HashMap::new())),
        };
        repo.load_from_disk().await?;
        Ok(repo)
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(format!("{}.json", task_id))
    }

    fn device_path(&self, device_id: &str) -> PathBuf {
        self.root.join("devices").join(format!("{}.json", device_id))
    }

    fn push_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("push").join(task_id)
    }

    fn endpoint_path(&self, agent_id: &str) -> PathBuf {
        self.root
            .join("endpoints")
            .join(format!("{}.json", agent_id))
    }

    fn watermarks_path(&self) -> PathBuf {
        self.root.join("watermarks.json")
    }

    async fn load_from_disk(&self) -> BrokerResult<()> {
        // Tasks, sorted by id for a deterministic initial order.
        let mut loaded = load_dir::<Task>(&self.root.join("tasks"), |t| t.id.clone()).await?;
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        {
            let mut tasks = self.tasks.write().await;
            let mut order = self.task_order.write().await;
            for (id, task) in loaded {
                if !tasks.contains_key(&id) {
                    order.push(id.clone());
                }
                tasks.insert(id, task);
            }
        }

        // Devices.
        {
            let loaded =
                load_dir::<Device>(&self.root.join("devices"), |d| d.device_id.clone()).await?;
            let mut devices = self.devices.write().await;
            for (id, device) in loaded {
                devices.insert(id, device);
            }
        }

        // Push configs, one subdirectory per task.
        {
            let push_root = self.root.join("push");
            let mut configs = self.push_configs.write().await;
            let mut entries = match fs::read_dir(&push_root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return self.load_rest().await
                }
                Err(e) => return Err(io_err("failed to read push directory", e)),
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let task_id = match path.file_name().and_then(|n| n.to_str()) {
                    Some(name) => name.to_string(),
                    None => continue,
                };
                let loaded = load_dir::<TaskPushNotificationConfig>(&path, |c| {
                    c.push_notification_config.id.clone().unwrap_or_default()
                })
                .await?;
                configs.insert(task_id, loaded.into_iter().map(|(_, c)| c).collect());
            }
        }

        self.load_rest().await
    }

    async fn load_rest(&self) -> BrokerResult<()> {
        // Endpoints.
        {
            let loaded =
                load_dir::<AgentEndpoint>(&self.root.join("endpoints"), |e| e.agent_id.clone())
                    .await?;
            let mut endpoints = self.endpoints.write().await;
            for (id, endpoint) in loaded {
                endpoints.insert(id, endpoint);
            }
        }

        // Watermarks (single JSON map).
        match fs::read_to_string(self.watermarks_path()).await {
            Ok(contents) => match serde_json::from_str::<HashMap<String, u64>>(&contents) {
                Ok(map) => *self.watermarks.write().await = map,
                Err(e) => warn!(error = %e, "Failed to parse watermarks file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("failed to read watermarks file", e)),
        }

        let tasks = self.tasks.read().await.len();
        let devices = self.devices.read().await.len();
        debug!(tasks, devices, "Repository loaded from disk");
        Ok(())
    }
}

#[async_trait]
impl Repository for FileRepository {
    async fn save_task(&self, task: Task) -> BrokerResult<()> {
        let task_id = task.id.clone();
        write_json(&self.task_path(&task_id), &task).await?;

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
        remove_file_if_exists(&self.task_path(task_id)).await?;
        let mut tasks = self.tasks.write().await;
        if tasks.remove(task_id).is_some() {
            self.task_order.write().await.retain(|id| id != task_id);
        }
        Ok(())
    }

    async fn list_tasks(&self, params: &ListTasksParams) -> BrokerResult<ListTasksResponse> {
        let tasks = self.tasks.read().await;
        let order = self.task_order.read().await;
        Ok(paginate_tasks(&tasks, &order, params))
    }

    async fn save_device(&self, device: Device) -> BrokerResult<()> {
        write_json(&self.device_path(&device.device_id), &device).await?;
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
        remove_file_if_exists(&self.device_path(device_id)).await?;
        self.devices.write().await.remove(device_id);
        Ok(())
    }

    async fn list_devices(&self) -> BrokerResult<Vec<Device>> {
        Ok(self.devices.read().await.values().cloned().collect())
    }

    async fn save_push_config(&self, config: TaskPushNotificationConfig) -> BrokerResult<()> {
        let config_id = config
            .push_notification_config
            .id
            .clone()
            .ok_or_else(|| BrokerError::invalid_params("push config id must be set"))?;
        let dir = self.push_dir(&config.task_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_err("failed to create push config directory", e))?;
        write_json(&dir.join(format!("{}.json", config_id)), &config).await?;

        let mut configs = self.push_configs.write().await;
        let entry = configs.entry(config.task_id.clone()).or_default();
        entry.retain(|c| c.push_notification_config.id.as_deref() != Some(config_id.as_str()));
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
        remove_file_if_exists(&self.push_dir(task_id).join(format!("{}.json", config_id))).await?;
        if let Some(entry) = self.push_configs.write().await.get_mut(task_id) {
            entry.retain(|c| c.push_notification_config.id.as_deref() != Some(config_id));
        }
        Ok(())
    }

    async fn get_watermark(&self, device_id: &str) -> BrokerResult<Option<u64>> {
        Ok(self.watermarks.read().await.get(device_id).copied())
    }

    async fn set_watermark(&self, device_id: &str, seq: u64) -> BrokerResult<()> {
        let snapshot = {
            let mut marks = self.watermarks.write().await;
            marks.insert(device_id.to_string(), seq);
            marks.clone()
        };
        write_json(&self.watermarks_path(), &snapshot).await
    }

    async fn save_endpoint(&self, endpoint: AgentEndpoint) -> BrokerResult<()> {
        write_json(&self.endpoint_path(&endpoint.agent_id), &endpoint).await?;
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
        remove_file_if_exists(&self.endpoint_path(agent_id)).await?;
        self.endpoints.write().await.remove(agent_id);
        Ok(())
    }
}
