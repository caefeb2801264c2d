//! Registry mapping job types to their handlers.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::RegistryError;
use crate::handler::JobHandler;

/// Thread-safe map from job type to handler.
///
/// Shared between the processor and its workers as `Arc<HandlerRegistry>`,
/// so handlers registered after the pool started are visible to it.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its job type.
    ///
    /// Fails if the type is empty or a handler for it already exists; the
    /// existing handler is kept.
    pub fn register<H: JobHandler>(&self, handler: H) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(handler))
    }

    /// Register an already shared handler.
    pub fn register_arc(&self, handler: Arc<dyn JobHandler>) -> Result<(), RegistryError> {
        let job_type = handler.job_type().to_string();
        if job_type.trim().is_empty() {
            return Err(RegistryError::EmptyType);
        }

        let mut handlers = self.write();
        if handlers.contains_key(&job_type) {
            return Err(RegistryError::Duplicate(job_type));
        }

        tracing::info!(job_type = %job_type, "Registered job handler");
        handlers.insert(job_type, handler);
        Ok(())
    }

    /// Look up the handler for a job type.
    pub fn get_handler(&self, job_type: &str) -> Result<Arc<dyn JobHandler>, RegistryError> {
        self.read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_type.to_string()))
    }

    /// Check if a handler exists for a job type.
    pub fn has_handler(&self, job_type: &str) -> bool {
        self.read().contains_key(job_type)
    }

    /// List all registered job types, sorted.
    pub fn list_handlers(&self) -> Vec<String> {
        let mut types: Vec<String> = self.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn JobHandler>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn JobHandler>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.list_handlers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_handler;

    #[test]
    fn duplicate_registration_is_rejected() -> Result<(), RegistryError> {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(job_handler!("email", |_ctx, _job| Ok(())))?;
        assert_eq!(registry.list_handlers().len(), 1);

        let second = registry.register(job_handler!("email", |_ctx, _job| Err("other".into())));
        assert!(matches!(second, Err(RegistryError::Duplicate(ref t)) if t == "email"));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_type_is_rejected() {
        let registry = HandlerRegistry::new();
        let result = registry.register(job_handler!("  ", |_ctx, _job| Ok(())));
        assert!(matches!(result, Err(RegistryError::EmptyType)));
        assert!(registry.is_empty());
    }

    #[test]
    fn lookup_and_listing() -> Result<(), RegistryError> {
        let registry = HandlerRegistry::new();
        registry.register(job_handler!("sms", |_ctx, _job| Ok(())))?;
        registry.register(job_handler!("email", |_ctx, _job| Ok(())))?;

        assert_eq!(registry.get_handler("sms")?.job_type(), "sms");
        assert!(registry.has_handler("email"));
        assert!(matches!(
            registry.get_handler("fax"),
            Err(RegistryError::NotFound(ref t)) if t == "fax"
        ));
        assert_eq!(registry.list_handlers(), vec!["email", "sms"]);
        Ok(())
    }
}
