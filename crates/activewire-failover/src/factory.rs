//! Factory for `failover:` URIs.

use std::sync::Arc;

use url::Url;

use activewire_transport_traits::{Transport, TransportFactory, TransportRegistry, TransportResult};

use crate::transport::FailoverTransport;

/// Creates [`FailoverTransport`]s whose children come from `registry`.
///
/// The registry usually does not contain this factory itself, so nested
/// `failover:` URIs are rejected as an unknown scheme.
#[derive(Debug, Clone)]
pub struct FailoverTransportFactory {
    registry: Arc<TransportRegistry>,
}

impl FailoverTransportFactory {
    /// Creates a factory resolving child URIs through `registry`.
    pub fn new(registry: Arc<TransportRegistry>) -> Self {
        Self { registry }
    }
}

impl TransportFactory for FailoverTransportFactory {
    fn scheme(&self) -> &str {
        "failover"
    }

    fn create(&self, uri: &Url) -> TransportResult<Arc<dyn Transport>> {
        let transport = FailoverTransport::from_uri(uri.as_str(), Arc::clone(&self.registry))?;
        Ok(Arc::new(transport))
    }
}
