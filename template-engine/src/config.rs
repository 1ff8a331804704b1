//! Engine configuration

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Execution settings shared by every template run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Templates running at once against a target
    pub template_concurrency: usize,
    /// Sequences running at once within one template
    pub sequence_concurrency: usize,
    /// Per-request timeout in seconds
    pub request_timeout: u64,
    /// How long to wait for an OOB interaction, in seconds
    pub oob_timeout: u64,
    /// Lifetime of cached scope material, in seconds
    pub material_cache_ttl: u64,
    /// Truncate response bodies past this many bytes
    pub max_response_size: Option<usize>,
    /// Upstream proxy URL for HTTP requests
    pub proxy: Option<String>,
    pub debug_request: bool,
    pub debug_response: bool,
    /// OOB provider used when a template needs one
    pub default_oob_provider: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            template_concurrency: 10,
            sequence_concurrency: 2,
            request_timeout: 10,
            oob_timeout: 5,
            material_cache_ttl: 30,
            max_response_size: None,
            proxy: None,
            debug_request: false,
            debug_response: false,
            default_oob_provider: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> EngineResult<Self> {
        let config: EngineConfig = toml::from_str(source)
            .map_err(|err| EngineError::configuration("engine", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.template_concurrency == 0 {
            return Err(EngineError::configuration("engine", "template_concurrency must be at least 1"));
        }
        if self.sequence_concurrency == 0 {
            return Err(EngineError::configuration("engine", "sequence_concurrency must be at least 1"));
        }
        if self.request_timeout == 0 {
            return Err(EngineError::configuration("engine", "request_timeout must be at least 1 second"));
        }
        if let Some(proxy) = &self.proxy {
            url::Url::parse(proxy)
                .map_err(|err| EngineError::configuration("engine", format!("invalid proxy {}: {}", proxy, err)))?;
        }
        Ok(())
    }

    pub fn with_template_concurrency(mut self, value: usize) -> Self {
        self.template_concurrency = value;
        self
    }

    pub fn with_sequence_concurrency(mut self, value: usize) -> Self {
        self.sequence_concurrency = value;
        self
    }

    pub fn with_request_timeout(mut self, seconds: u64) -> Self {
        self.request_timeout = seconds;
        self
    }

    pub fn with_oob_timeout(mut self, seconds: u64) -> Self {
        self.oob_timeout = seconds;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_oob_provider(mut self, name: impl Into<String>) -> Self {
        self.default_oob_provider = Some(name.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn oob_timeout(&self) -> Duration {
        Duration::from_secs(self.oob_timeout)
    }

    pub fn material_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.material_cache_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.template_concurrency, 10);
        assert_eq!(config.sequence_concurrency, 2);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_loading() {
        let config = EngineConfig::from_toml_str(
            "template_concurrency = 4\nproxy = \"http://127.0.0.1:8080\"\ndebug_response = true\n",
        )
        .expect("valid config");
        assert_eq!(config.template_concurrency, 4);
        assert_eq!(config.sequence_concurrency, 2);
        assert!(config.debug_response);
        assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:8080"));
    }

    #[test]
    fn test_rejections() {
        assert!(EngineConfig::from_toml_str("unknown_field = 1").is_err());
        assert!(EngineConfig::from_toml_str("sequence_concurrency = 0").is_err());
        assert!(EngineConfig::from_toml_str("proxy = \"not a url\"").is_err());
        assert!(EngineConfig::default().with_template_concurrency(0).validate().is_err());
    }
}
