use std::collections::BTreeMap;
use std::sync::Arc;

use error_stack::Report;

use super::mock::MockProvider;
use super::InitConfig;
use super::InitFn;
use super::Provider;
use super::ProviderError;

/// Backends selectable by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, InitFn>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the backends shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(MockProvider::NAME, MockProvider::init);
        registry
    }

    /// Adds or replaces a backend.
    pub fn register<F>(&mut self, name: impl Into<String>, init: F) -> &mut Self
    where
        F: Fn(InitConfig) -> Result<Arc<dyn Provider>, Report<ProviderError>>
            + Send
            + Sync
            + 'static,
    {
        self.providers.insert(name.into(), Arc::new(init));
        self
    }

    pub fn get(&self, name: &str) -> Option<InitFn> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn builtin_registry_contains_mock() {
        let registry = ProviderRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["mock"]);
        assert!(registry.get("mock").is_some());
        assert!(registry.get("aws").is_none());
    }

    #[test]
    fn register_replaces_existing_entry() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("custom", |_| {
                Err(Report::new(ProviderError::Backend {
                    message: "first".to_string(),
                }))
            })
            .register("custom", |_| {
                Err(Report::new(ProviderError::Backend {
                    message: "second".to_string(),
                }))
            });
        assert_eq!(registry.names().len(), 1);
    }
}
