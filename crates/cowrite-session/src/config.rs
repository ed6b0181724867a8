//! Connection manager configuration

use cowrite_storage::{CacheBackend, CacheOptions};
use cowrite_transport::TransportConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Relay base URL; rooms live at `{relay_url}/{document_id}`
    pub relay_url: String,
    /// Local durable cache; `None` runs every session without one
    pub cache: Option<CacheBackend>,
    pub cache_options: CacheOptions,
    /// Upper bound on waiting for the cache's initial load during open
    pub cache_sync_timeout: Duration,
    pub transport: TransportConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:1234".into(),
            cache: None,
            cache_options: CacheOptions::default(),
            cache_sync_timeout: Duration::from_secs(2),
            transport: TransportConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_relay(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, cache: CacheBackend) -> Self {
        self.cache = Some(cache);
        self
    }
}
