use serde_derive::{Deserialize, Serialize};

use super::core::{normalize_name, Backing};
use super::errors::{FifoError, Result};
use super::queue::ELEMENT_HEADER_SIZE;

pub const DEFAULT_CAPACITY: usize = 1 << 20;

/// Queue settings as they appear in a `[fifo]` table of a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FifoConfig {
    pub capacity: usize,
    pub blocking: bool,
    /// Name of the shared segment; a process-local queue when absent.
    pub shared_name: Option<String>,
}

impl Default for FifoConfig {
    fn default() -> Self {
        FifoConfig {
            capacity: DEFAULT_CAPACITY,
            blocking: true,
            shared_name: None,
        }
    }
}

impl FifoConfig {
    pub fn builder() -> FifoConfigBuilder {
        FifoConfigBuilder::default()
    }

    pub fn backing(&self) -> Backing {
        match &self.shared_name {
            Some(name) => Backing::Shared(name.clone()),
            None => Backing::Local,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity <= ELEMENT_HEADER_SIZE {
            return Err(FifoError::Configuration(format!(
                "capacity {} must exceed {}",
                self.capacity, ELEMENT_HEADER_SIZE
            )));
        }
        if let Some(name) = &self.shared_name {
            normalize_name(name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FifoConfigBuilder {
    capacity: Option<usize>,
    blocking: Option<bool>,
    shared_name: Option<String>,
}

impl FifoConfigBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = Some(blocking);
        self
    }

    pub fn shared_name(mut self, name: impl Into<String>) -> Self {
        self.shared_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<FifoConfig> {
        let defaults = FifoConfig::default();
        let cfg = FifoConfig {
            capacity: self.capacity.unwrap_or(defaults.capacity),
            blocking: self.blocking.unwrap_or(defaults.blocking),
            shared_name: self.shared_name,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() -> Result<()> {
        let cfg = FifoConfig::builder().shared_name("frames").build()?;
        assert_eq!(cfg.capacity, DEFAULT_CAPACITY);
        assert!(cfg.blocking);
        assert_eq!(cfg.backing(), Backing::Shared("frames".to_string()));
        Ok(())
    }

    #[test]
    fn builder_validates() {
        assert!(matches!(
            FifoConfig::builder().capacity(4).build(),
            Err(FifoError::Configuration(_))
        ));
        assert!(matches!(
            FifoConfig::builder().shared_name("a/b").build(),
            Err(FifoError::Configuration(_))
        ));
    }
}
