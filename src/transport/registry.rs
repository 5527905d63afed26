//! Transport registry for scheme-based transport resolution.

use std::collections::HashMap;
use std::sync::Arc;

use super::{ToolTransport, TransportFactory};
use crate::descriptor::ServerDescriptor;
use crate::error::{Result, ToolHostError};

/// Registry mapping endpoint schemes to their factories.
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory for all schemes it declares.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        for scheme in factory.schemes() {
            self.factories
                .insert(scheme.to_ascii_lowercase(), factory.clone());
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Create a transport for a descriptor by looking up its endpoint scheme.
    pub fn create(&self, descriptor: &ServerDescriptor) -> Result<Arc<dyn ToolTransport>> {
        let scheme = descriptor.scheme();
        self.factories
            .get(scheme)
            .ok_or_else(|| {
                ToolHostError::Configuration(format!(
                    "server '{}': no transport registered for scheme '{scheme}'",
                    descriptor.name()
                ))
            })?
            .create(descriptor)
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for TransportRegistry {
    /// HTTP(S), plus stdio when the `stdio` feature is enabled.
    fn default() -> Self {
        let registry = Self::new().with_factory(Arc::new(super::HttpTransportFactory));
        #[cfg(feature = "stdio")]
        let registry = registry.with_factory(Arc::new(super::StdioTransportFactory));
        registry
    }
}
