use std::net::SocketAddr;

use serde::Serialize;

use crate::plugin::PluginType;
use crate::runner::Options;

/// The one-line JSON handshake emitted on standard output at startup, which
/// tells the host where and what the plugin is serving.
#[derive(Debug, Serialize)]
pub struct PluginMeta {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub grpc_address: String,
    pub stats_address: Option<String>,
    pub enable_tls: bool,
    pub enable_pprof: bool,
    pub enable_stats: bool,
    pub tasks_limit: i64,
    pub instances_limit: i64,
}

impl PluginMeta {
    pub fn new(
        name: &str,
        version: &str,
        plugin_type: PluginType,
        grpc_address: SocketAddr,
        stats_address: Option<SocketAddr>,
        options: &Options,
    ) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            plugin_type,
            grpc_address: grpc_address.to_string(),
            stats_address: stats_address.map(|address| address.to_string()),
            enable_tls: options.enable_tls,
            enable_pprof: options.enable_pprof,
            enable_stats: options.enable_stats,
            // No per-plugin limits are enforced by this library.
            tasks_limit: -1,
            instances_limit: -1,
        }
    }
}

/// Prints the handshake line. Logs go to standard error, so this is the only
/// write to standard output in server mode.
pub(crate) fn print_handshake(meta: &PluginMeta) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string(meta)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn handshake_serializes_to_a_single_json_line() {
        let options = Options::try_parse_from(["plugin"]).unwrap();
        let meta = PluginMeta::new(
            "example",
            "1.0.0",
            PluginType::Collector,
            "127.0.0.1:56789".parse().unwrap(),
            Some("127.0.0.1:56790".parse().unwrap()),
            &options,
        );

        let line = serde_json::to_string(&meta).unwrap();
        assert!(!line.contains('\n'));

        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["name"], "example");
        assert_eq!(parsed["type"], "collector");
        assert_eq!(parsed["grpc_address"], "127.0.0.1:56789");
        assert_eq!(parsed["stats_address"], "127.0.0.1:56790");
        assert_eq!(parsed["tasks_limit"], -1);
    }
}
