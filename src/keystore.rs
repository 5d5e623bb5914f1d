//! Run-scoped map from task id to its computed fingerprint.
//!
//! The executor publishes a task's key here before the task returns, so a
//! dependent that has awaited its dependencies can always read their keys.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::graph::{Task, TaskId};

#[derive(Default)]
pub struct TaskKeyStore {
    by_id: Mutex<HashMap<TaskId, String>>,
}

impl TaskKeyStore {
    pub fn new() -> TaskKeyStore {
        TaskKeyStore::default()
    }

    pub fn get(&self, task_id: &str) -> Option<String> {
        self.by_id.lock().unwrap().get(task_id).cloned()
    }

    pub fn set(&self, task_id: &str, task_key: String) {
        self.by_id.lock().unwrap().insert(task_id.to_string(), task_key);
    }

    /// The keys of a task's dependencies, in declaration order.  Fails if
    /// any dependency has not published its key yet.
    pub fn dep_keys(&self, task: &Task) -> anyhow::Result<Vec<String>> {
        let by_id = self.by_id.lock().unwrap();
        let mut keys = Vec::with_capacity(task.dependencies.len());
        for dep in &task.dependencies {
            match by_id.get(dep) {
                Some(key) => keys.push(key.clone()),
                None => anyhow::bail!("missing dependency task key for {}", dep),
            }
        }
        Ok(keys)
    }
}
