//! Scheme-based transport selection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use url::Url;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportFactory};

/// Maps URI schemes to the factories that build transports for them.
///
/// A registry is created once per client library instance and shared by
/// reference; there is no process-wide default.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    factories: RwLock<HashMap<String, Arc<dyn TransportFactory>>>,
}

impl TransportRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for its scheme, replacing any previous registration.
    pub fn register(&self, factory: Arc<dyn TransportFactory>) {
        let scheme = factory.scheme().to_ascii_lowercase();
        self.factories.write().insert(scheme, factory);
    }

    /// Builder-style variant of [`register`](Self::register).
    #[must_use]
    pub fn with_factory(self, factory: Arc<dyn TransportFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Returns the factory for `scheme`, if any.
    pub fn factory(&self, scheme: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .read()
            .get(&scheme.to_ascii_lowercase())
            .cloned()
    }

    /// Returns `true` if a factory is registered for `scheme`.
    pub fn supports(&self, scheme: &str) -> bool {
        self.factories
            .read()
            .contains_key(&scheme.to_ascii_lowercase())
    }

    /// Lists the registered schemes.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.read().keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Creates an unstarted transport for `uri` using the factory for its scheme.
    pub fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>> {
        let factory = self
            .factory(uri.scheme())
            .ok_or_else(|| TransportError::UnknownScheme(uri.scheme().to_string()))?;
        factory.create(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct RefusingFactory;

    impl TransportFactory for RefusingFactory {
        fn scheme(&self) -> &str {
            "refuse"
        }

        fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>> {
            Err(TransportError::ConnectionFailed(format!("refusing {uri}")))
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let registry = TransportRegistry::new();
        let uri = Url::parse("nope://host:1").unwrap();
        let err = registry.create(&uri).unwrap_err();
        assert_eq!(err, TransportError::UnknownScheme("nope".into()));
    }

    #[test]
    fn test_dispatch_by_scheme() {
        let registry = TransportRegistry::new().with_factory(Arc::new(RefusingFactory));
        assert!(registry.supports("REFUSE"));
        assert_eq!(registry.schemes(), vec!["refuse".to_string()]);

        let uri = Url::parse("refuse://host:1").unwrap();
        let err = registry.create(&uri).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
