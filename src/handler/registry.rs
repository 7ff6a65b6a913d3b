//! Registry mapping task types to handlers.
//!
//! Each executor owns its own registry; there is no process-wide instance.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::errors::{Result, TaskError};
use crate::handler::TaskHandler;

/// Registry for task handlers
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its task type. Never overwrites.
    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let task_type = handler.task_type().to_string();
        if task_type.is_empty() {
            return Err(TaskError::InvalidHandler(
                "handler task type cannot be empty".to_string(),
            ));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains_key(&task_type) {
            return Err(TaskError::HandlerAlreadyRegistered { task_type });
        }
        handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .get(task_type)
            .cloned()
            .ok_or_else(|| TaskError::HandlerNotFound {
                task_type: task_type.to_string(),
            })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.list())
            .finish()
    }
}
