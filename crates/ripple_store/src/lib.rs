use std::net::SocketAddr as EmbedSocketAddr;
use std::path::PathBuf as EmbedPathBuf;
use std::time::Duration as EmbedDuration;

include!("main.rs");

/// Minimal configuration for running a replica inside another process
/// (integration tests, multi-node harnesses).
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub cluster: String,
    pub listen: EmbedSocketAddr,
    pub data_dir: EmbedPathBuf,
    pub view_change_period: EmbedDuration,
    pub timeout: EmbedDuration,
    pub request_timeout: EmbedDuration,
}

impl EmbeddedNodeConfig {
    pub fn new(cluster: String, listen: EmbedSocketAddr, data_dir: EmbedPathBuf) -> Self {
        Self {
            cluster,
            listen,
            data_dir,
            view_change_period: EmbedDuration::from_secs(1),
            timeout: EmbedDuration::from_secs(5),
            request_timeout: EmbedDuration::from_secs(5),
        }
    }
}

/// Build `ServeArgs` from an embedded configuration through the regular CLI
/// parser, so embedded nodes and real ones go through identical validation.
pub fn build_serve_args(config: &EmbeddedNodeConfig) -> anyhow::Result<ServeArgs> {
    let argv = vec![
        "ripple-store-serve".to_string(),
        "--cluster".to_string(),
        config.cluster.clone(),
        "--port".to_string(),
        config.listen.port().to_string(),
        "--filepath".to_string(),
        config.data_dir.to_string_lossy().to_string(),
        "--view-change-period-ms".to_string(),
        config.view_change_period.as_millis().to_string(),
        "--timeout-ms".to_string(),
        config.timeout.as_millis().to_string(),
        "--request-timeout-ms".to_string(),
        config.request_timeout.as_millis().to_string(),
        "--no-repl".to_string(),
    ];
    ServeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!("invalid node config: {err}"))
}

/// Spawn an embedded replica from a high-level configuration.
pub async fn spawn_embedded_node_from_config(
    config: &EmbeddedNodeConfig,
) -> anyhow::Result<EmbeddedNode> {
    let args = build_serve_args(config)?;
    spawn_embedded_node(args).await
}
