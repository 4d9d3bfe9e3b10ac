use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::JobError;

/// A job body. Implemented by collaborator code; the coordinator only
/// ever invokes it through the dispatch wrapper, which contains errors
/// and panics at the boundary.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, params: &serde_json::Value) -> Result<(), JobError>;
}

/// Maps rule `job_name`s to handlers. Rules whose name has no entry here
/// are skipped at reload time.
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered handler names, sorted for deterministic output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
