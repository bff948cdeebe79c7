use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use super::processor::{BypassFactory, ProcessorFactory};
use crate::errors::StageError;

/// Maps scheme names (`"bypass"`, `"rtsp-mux"`, ...) to processor factories.
///
/// Built explicitly and handed to whoever opens stages; dropping it drops
/// the factories it owns.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: HashMap<String, Arc<dyn ProcessorFactory>>,
}

impl ProcessorRegistry {
    pub fn new() -> ProcessorRegistry {
        ProcessorRegistry::default()
    }

    /// A registry with the built-in `bypass` processor.
    pub fn with_defaults() -> ProcessorRegistry {
        let mut registry = ProcessorRegistry::new();
        registry.factories.insert("bypass".to_string(), Arc::new(BypassFactory));
        registry
    }

    pub fn register(&mut self, scheme: &str, factory: Arc<dyn ProcessorFactory>) -> Result<(), StageError> {
        if self.factories.contains_key(scheme) {
            return Err(StageError::DuplicateProcessor(scheme.to_string()));
        }
        debug!("registering {} processor `{}`", factory.kind(), scheme);
        self.factories.insert(scheme.to_string(), factory);
        Ok(())
    }

    pub fn unregister(&mut self, scheme: &str) -> Option<Arc<dyn ProcessorFactory>> {
        self.factories.remove(scheme)
    }

    pub fn get(&self, scheme: &str) -> Result<Arc<dyn ProcessorFactory>, StageError> {
        self.factories
            .get(scheme)
            .cloned()
            .ok_or_else(|| StageError::UnknownProcessor(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry").field("schemes", &self.schemes()).finish()
    }
}
