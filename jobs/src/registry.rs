//! Explicit handler registry built once at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::handler::JobHandler;

/// Maps queue names to their handlers.
///
/// Built at process start and shared by reference with the runtime, the
/// producer and the dead-letter sweeper.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its declared queue name.
    ///
    /// # Errors
    ///
    /// Returns an error if another handler already owns the queue.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> Result<(), RegistryError> {
        let name = handler.descriptor().name.clone();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateQueue(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder-style registration.
    ///
    /// # Errors
    ///
    /// Returns an error if another handler already owns the queue.
    pub fn with(mut self, handler: Arc<dyn JobHandler>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Returns the handler bound to a queue.
    #[must_use]
    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    /// Returns the handler bound to a queue or an error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownQueue`] if nothing is registered.
    pub fn require(&self, queue: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.get(queue)
            .ok_or_else(|| RegistryError::UnknownQueue(queue.to_string()))
    }

    /// Iterates over all handlers in queue-name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn JobHandler>> {
        self.handlers.values()
    }

    /// Returns the registered queue names.
    #[must_use]
    pub fn queue_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Returns the number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::QueueDescriptor;
    use crate::error::JobError;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop(QueueDescriptor);

    #[async_trait]
    impl JobHandler for Noop {
        fn descriptor(&self) -> &QueueDescriptor {
            &self.0
        }

        async fn process(&self, _payload: &Value) -> Result<Value, JobError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_registry_register_and_get() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(Noop(QueueDescriptor::new("b"))))
            .and_then(|r| r.with(Arc::new(Noop(QueueDescriptor::new("a")))))
            .expect("registry");

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.queue_names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
        assert_eq!(
            registry.require("c").err(),
            Some(RegistryError::UnknownQueue("c".to_string()))
        );
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(Arc::new(Noop(QueueDescriptor::new("a"))))
            .expect("first");
        let err = registry
            .register(Arc::new(Noop(QueueDescriptor::new("a"))))
            .expect_err("duplicate");
        assert_eq!(err, RegistryError::DuplicateQueue("a".to_string()));
    }
}
