//! Out-of-band callback providers

use crate::error::OobError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Direct interaction lookup: token to observed protocol
pub type OobChecker = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Address handed to the target and the token used to poll for interactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobToken {
    pub url: String,
    pub token: String,
}

/// Source of reverse-connection addresses (DNS log, HTTP callback server)
#[async_trait]
pub trait OobProvider: Send + Sync {
    /// Allocate a fresh callback address
    async fn acquire(&self) -> Result<OobToken, OobError>;

    /// Wait up to `timeout` for an interaction on `token`; returns its protocol
    async fn poll(&self, token: &str, timeout: Duration) -> Result<Option<String>, OobError>;
}

/// Named OOB providers passed to the engine
#[derive(Clone, Default)]
pub struct OobRegistry {
    providers: Arc<DashMap<String, Arc<dyn OobProvider>>>,
    default_name: Option<String>,
}

impl std::fmt::Debug for OobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.providers.iter().map(|entry| entry.key().clone()).collect();
        f.debug_struct("OobRegistry")
            .field("providers", &names)
            .field("default_name", &self.default_name)
            .finish()
    }
}

impl OobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider; the first one registered becomes the default
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn OobProvider>) {
        let name = name.into();
        debug!(provider = %name, "registered OOB provider");
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<dyn OobProvider>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default_name = Some(name.into());
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider by name, or the default one when `name` is `None`
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn OobProvider>, OobError> {
        let name = match name.or(self.default_name.as_deref()) {
            Some(name) => name,
            None => {
                return Err(OobError::UnknownProvider {
                    name: "<default>".to_string(),
                })
            }
        };
        self.providers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OobError::UnknownProvider {
                name: name.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl OobProvider for Fixed {
        async fn acquire(&self) -> Result<OobToken, OobError> {
            Ok(OobToken {
                url: "abc.oob.test".into(),
                token: "abc".into(),
            })
        }

        async fn poll(&self, token: &str, _timeout: Duration) -> Result<Option<String>, OobError> {
            Ok((token == "abc").then(|| "dns".to_string()))
        }
    }

    #[tokio::test]
    async fn test_registry_default_and_lookup() {
        let registry = OobRegistry::new().with_provider("fixed", Arc::new(Fixed));
        assert_eq!(registry.default_name(), Some("fixed"));

        let provider = registry.get(None).expect("default provider");
        let token = provider.acquire().await.expect("token");
        assert_eq!(token.url, "abc.oob.test");
        assert_eq!(
            provider.poll(&token.token, Duration::from_millis(10)).await.ok().flatten(),
            Some("dns".to_string())
        );

        assert!(matches!(
            registry.get(Some("missing")),
            Err(OobError::UnknownProvider { .. })
        ));
        assert!(OobRegistry::new().get(None).is_err());
    }
}
