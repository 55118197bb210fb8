use std::path::PathBuf;
use std::time::Duration;

use aigate_core::GatewayConfigPatch;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "aigate", version, about = "OpenAI-compatible LLM API gateway")]
pub(crate) struct Cli {
    /// Bind host.
    #[arg(long, env = "AIGATE_HOST")]
    pub(crate) host: Option<String>,
    /// Bind port.
    #[arg(long, env = "AIGATE_PORT")]
    pub(crate) port: Option<u16>,
    /// Route definition file (YAML or JSON).
    #[arg(long, env = "AIGATE_ROUTES")]
    pub(crate) routes: Option<PathBuf>,
    /// Client, provider and model catalog (YAML or JSON).
    #[arg(long, env = "AIGATE_CATALOG")]
    pub(crate) catalog: Option<PathBuf>,
    /// Optional outbound proxy for upstream requests.
    #[arg(long, env = "AIGATE_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "AIGATE_CONNECT_TIMEOUT_SECS")]
    pub(crate) connect_timeout_secs: Option<u64>,
    #[arg(long, env = "AIGATE_REQUEST_TIMEOUT_SECS")]
    pub(crate) request_timeout_secs: Option<u64>,
    /// Longest gap between two chunks of a streamed upstream body.
    #[arg(long, env = "AIGATE_STREAM_IDLE_TIMEOUT_SECS")]
    pub(crate) stream_idle_timeout_secs: Option<u64>,
    #[arg(long, env = "AIGATE_MAX_BODY_BYTES")]
    pub(crate) max_body_bytes: Option<usize>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: sanitize(self.host),
            port: self.port,
            routes_path: self.routes,
            catalog_path: self.catalog,
            proxy: sanitize(self.proxy),
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
            stream_idle_timeout: self.stream_idle_timeout_secs.map(Duration::from_secs),
            max_body_bytes: self.max_body_bytes,
        }
    }
}

/// Blank values and unresolved `${VAR}` placeholders count as unset.
fn sanitize(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() || (trimmed.starts_with("${") && trimmed.ends_with('}')) {
        return None;
    }
    Some(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_become_a_patch() {
        let cli = Cli::try_parse_from([
            "aigate",
            "--routes",
            "routes.yaml",
            "--catalog",
            "catalog.yaml",
            "--proxy",
            "${AIGATE_PROXY}",
            "--stream-idle-timeout-secs",
            "30",
        ])
        .unwrap();
        let patch = cli.into_patch();
        assert_eq!(patch.proxy, None);
        assert_eq!(patch.stream_idle_timeout, Some(Duration::from_secs(30)));
        let config = patch.into_config().unwrap();
        assert_eq!(config.routes_path, PathBuf::from("routes.yaml"));
    }
}
