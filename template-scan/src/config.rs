//! Scanner configuration file

use crate::logging::LoggingConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use template_engine::EngineConfig;

/// Contents of the `--config` TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl ScanConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&source).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: ScanConfig = toml::from_str(source)?;
        config.engine.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sections() {
        let config = ScanConfig::from_toml_str(
            r#"
[engine]
template_concurrency = 3
request_timeout = 4

[logging]
level = "debug"
json_format = true
"#,
        )
        .unwrap();
        assert_eq!(config.engine.template_concurrency, 3);
        assert_eq!(config.engine.request_timeout, 4);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert!(config.logging.enable_colors);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        assert_eq!(ScanConfig::from_toml_str("").unwrap(), ScanConfig::default());
    }

    #[test]
    fn test_invalid_engine_section() {
        assert!(ScanConfig::from_toml_str("[engine]\nsequence_concurrency = 0\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        std::fs::write(&path, "[engine]\nproxy = \"http://127.0.0.1:8080\"\n").unwrap();
        let config = ScanConfig::from_file(&path).unwrap();
        assert_eq!(config.engine.proxy.as_deref(), Some("http://127.0.0.1:8080"));
        assert!(ScanConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
