//! Durable task storage.
//!
//! Whole-file JSON persistence at `{data_dir}/tasks.json`: the in-memory map
//! is loaded once at construction and flushed back after every mutation.
//! Tasks are appended and point-updated by id, never deleted - terminal
//! tasks remain for history. Concurrent point updates against different ids
//! are safe; the single worker invocation per task is the only writer a
//! record normally sees.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::task::Task;

/// In-memory task map with disk persistence.
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    storage_path: PathBuf,
}

impl TaskStore {
    /// Create a store, loading any existing task list from disk.
    pub fn new(storage_path: PathBuf) -> Self {
        let tasks = match Self::load_from_path(&storage_path) {
            Ok(loaded) => {
                if !loaded.is_empty() {
                    tracing::info!(
                        "Loaded {} tasks from {}",
                        loaded.len(),
                        storage_path.display()
                    );
                }
                loaded
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load tasks from {}: {}, starting empty",
                    storage_path.display(),
                    e
                );
                HashMap::new()
            }
        };

        Self {
            tasks: RwLock::new(tasks),
            storage_path,
        }
    }

    fn load_from_path(path: &PathBuf) -> Result<HashMap<Uuid, Task>, std::io::Error> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(path)?;
        let tasks: Vec<Task> = serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(tasks.into_iter().map(|t| (t.id, t)).collect())
    }

    async fn save_to_disk(&self) -> Result<(), std::io::Error> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<&Task> = tasks.values().collect();
        list.sort_by_key(|t| t.created_at);

        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&list)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.storage_path, contents)?;
        Ok(())
    }

    /// Append a new task.
    pub async fn append(&self, task: Task) -> Result<(), std::io::Error> {
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(task.id, task);
        }
        self.save_to_disk().await
    }

    /// Point update by id, refreshing `updated_at`.
    ///
    /// Returns the stored task, or None if the id is unknown.
    pub async fn update(&self, mut task: Task) -> Result<Option<Task>, std::io::Error> {
        task.updated_at = chrono::Utc::now();
        let stored = {
            let mut tasks = self.tasks.write().await;
            if !tasks.contains_key(&task.id) {
                return Ok(None);
            }
            tasks.insert(task.id, task.clone());
            task
        };
        self.save_to_disk().await?;
        Ok(Some(stored))
    }

    pub async fn get(&self, id: Uuid) -> Option<Task> {
        let tasks = self.tasks.read().await;
        tasks.get(&id).cloned()
    }

    /// All tasks, most recently created first.
    pub async fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut list: Vec<Task> = tasks.values().cloned().collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }
}

/// Shared task store handle.
pub type SharedTaskStore = Arc<TaskStore>;
