use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::upstream_client::UpstreamClientConfig;

pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("config field {field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Final, merged configuration used by the running process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Route definition file (YAML or JSON).
    pub routes_path: PathBuf,
    /// Client, provider and model catalog file (YAML or JSON).
    pub catalog_path: PathBuf,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_body_bytes: usize,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn upstream(&self) -> UpstreamClientConfig {
        UpstreamClientConfig {
            proxy: self.proxy.clone(),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            stream_idle_timeout: self.stream_idle_timeout,
        }
    }
}

/// Optional layer used for merging config. `Some` wins on overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub routes_path: Option<PathBuf>,
    pub catalog_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub stream_idle_timeout: Option<Duration>,
    pub max_body_bytes: Option<usize>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.routes_path.is_some() {
            self.routes_path = other.routes_path;
        }
        if other.catalog_path.is_some() {
            self.catalog_path = other.catalog_path;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.connect_timeout.is_some() {
            self.connect_timeout = other.connect_timeout;
        }
        if other.request_timeout.is_some() {
            self.request_timeout = other.request_timeout;
        }
        if other.stream_idle_timeout.is_some() {
            self.stream_idle_timeout = other.stream_idle_timeout;
        }
        if other.max_body_bytes.is_some() {
            self.max_body_bytes = other.max_body_bytes;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, ConfigError> {
        let defaults = UpstreamClientConfig::default();
        let config = GatewayConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8787),
            routes_path: self.routes_path.ok_or(ConfigError::MissingField("routes"))?,
            catalog_path: self.catalog_path.ok_or(ConfigError::MissingField("catalog"))?,
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            stream_idle_timeout: self.stream_idle_timeout.unwrap_or(defaults.stream_idle_timeout),
            max_body_bytes: self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        };
        for (field, value) in [
            ("connect_timeout", config.connect_timeout),
            ("request_timeout", config.request_timeout),
            ("stream_idle_timeout", config.stream_idle_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if config.max_body_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_body_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(config)
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            routes_path: Some(value.routes_path),
            catalog_path: Some(value.catalog_path),
            proxy: value.proxy,
            connect_timeout: Some(value.connect_timeout),
            request_timeout: Some(value.request_timeout),
            stream_idle_timeout: Some(value.stream_idle_timeout),
            max_body_bytes: Some(value.max_body_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> GatewayConfigPatch {
        GatewayConfigPatch {
            routes_path: Some("routes.yaml".into()),
            catalog_path: Some("catalog.yaml".into()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let config = base().into_config().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:8787");
        assert_eq!(config.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(config.request_timeout, Duration::from_secs(600));
        assert!(config.proxy.is_none());
    }

    #[test]
    fn overlay_keeps_values_the_patch_leaves_unset() {
        let mut patch = base();
        patch.port = Some(9000);
        patch.overlay(GatewayConfigPatch {
            host: Some("0.0.0.0".into()),
            ..Default::default()
        });
        let config = patch.into_config().unwrap();
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn rejects_missing_files_and_zero_timeouts() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("routes")));

        let mut patch = base();
        patch.stream_idle_timeout = Some(Duration::ZERO);
        let err = patch.into_config().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "stream_idle_timeout", .. }));
    }
}
