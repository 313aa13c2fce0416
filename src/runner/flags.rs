use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use crate::service::DEFAULT_MAX_MISSED_PINGS;

/// Command-line options of a plugin process.
#[derive(Debug, Parser)]
#[command(about = "Runs the plugin as a gRPC server for a host agent", disable_version_flag = true)]
pub struct Options {
    /// IP address on which the gRPC server will be served.
    #[arg(long = "grpc-ip", default_value = "127.0.0.1")]
    pub grpc_ip: IpAddr,

    /// Port on which the gRPC server will be served (0 picks an ephemeral port).
    #[arg(long = "grpc-port", default_value_t = 0)]
    pub grpc_port: u16,

    /// Minimal level of logged messages (panic, fatal, error, warn, info, debug, trace or 0-6).
    #[arg(long = "log-level", default_value = "warn", value_parser = parse_log_level)]
    pub log_level: LevelFilter,

    /// Advertise the profiling endpoint to the host.
    #[arg(long = "enable-pprof")]
    pub enable_pprof: bool,

    /// Advertise the statistics endpoint to the host.
    #[arg(long = "enable-stats")]
    pub enable_stats: bool,

    /// Run the plugin standalone: load one task and print collected metrics.
    #[arg(long = "debug-mode")]
    pub debug_mode: bool,

    /// Task configuration used in debug mode.
    #[arg(long = "plugin-config", default_value = "{}")]
    pub plugin_config: String,

    /// Interval after which a missing ping counts against the plugin (0 disables).
    #[arg(long = "ping-timeout", default_value = "3s", value_parser = parse_duration)]
    pub ping_timeout: Duration,

    /// Number of missed pings tolerated before shutdown (0 disables).
    #[arg(long = "ping-max-missed", default_value_t = DEFAULT_MAX_MISSED_PINGS)]
    pub ping_max_missed: u32,

    /// Serve gRPC over mutually-authenticated TLS.
    #[arg(long = "enable-tls")]
    pub enable_tls: bool,

    /// Path to the server certificate (PEM).
    #[arg(long = "tls-server-cert")]
    pub tls_server_cert: Option<PathBuf>,

    /// Path to the server private key (PEM).
    #[arg(long = "tls-server-key")]
    pub tls_server_key: Option<PathBuf>,

    /// Path to the CA bundle used to verify client certificates (PEM).
    #[arg(long = "tls-client-ca")]
    pub tls_client_ca: Option<PathBuf>,
}

impl Options {
    pub fn validate(&self) -> Result<(), String> {
        if self.enable_tls
            && (self.tls_server_cert.is_none()
                || self.tls_server_key.is_none()
                || self.tls_client_ca.is_none())
        {
            return Err(
                "TLS requires --tls-server-cert, --tls-server-key and --tls-client-ca".to_string(),
            );
        }
        Ok(())
    }
}

fn parse_log_level(level: &str) -> Result<LevelFilter, String> {
    // Accept the level as an int (0-6), mapped onto tracing's levels.
    if let Ok(numeric) = level.parse::<u8>() {
        return match numeric {
            0 | 1 => Ok(LevelFilter::ERROR),
            2 => Ok(LevelFilter::WARN),
            3 => Ok(LevelFilter::INFO),
            4 => Ok(LevelFilter::DEBUG),
            5 | 6 => Ok(LevelFilter::TRACE),
            _ => Err(format!("log level out of range: {numeric}")),
        };
    }

    match level {
        "panic" | "fatal" | "error" => Ok(LevelFilter::ERROR),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "info" => Ok(LevelFilter::INFO),
        "debug" => Ok(LevelFilter::DEBUG),
        "trace" => Ok(LevelFilter::TRACE),
        "off" => Ok(LevelFilter::OFF),
        _ => Err(format!("unknown log level: {level}")),
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::try_parse_from(std::iter::once("plugin").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_match_the_process_contract() {
        let options = parse(&[]);

        assert_eq!(options.grpc_ip.to_string(), "127.0.0.1");
        assert_eq!(options.grpc_port, 0);
        assert_eq!(options.log_level, LevelFilter::WARN);
        assert_eq!(options.ping_timeout, Duration::from_secs(3));
        assert_eq!(options.ping_max_missed, 3);
        assert_eq!(options.plugin_config, "{}");
        assert!(!options.debug_mode);
    }

    #[test]
    fn log_levels_accept_names_and_numbers() {
        assert_eq!(parse(&["--log-level", "trace"]).log_level, LevelFilter::TRACE);
        assert_eq!(parse(&["--log-level", "fatal"]).log_level, LevelFilter::ERROR);
        assert_eq!(parse(&["--log-level", "5"]).log_level, LevelFilter::TRACE);
        assert_eq!(parse(&["--log-level", "2"]).log_level, LevelFilter::WARN);
        assert!(Options::try_parse_from(["plugin", "--log-level", "9"]).is_err());
        assert!(Options::try_parse_from(["plugin", "--log-level", "verbose"]).is_err());
    }

    #[test]
    fn ping_flags_parse_durations() {
        let options = parse(&["--ping-timeout", "250ms", "--ping-max-missed", "5"]);
        assert_eq!(options.ping_timeout, Duration::from_millis(250));
        assert_eq!(options.ping_max_missed, 5);

        assert_eq!(parse(&["--ping-timeout", "0"]).ping_timeout, Duration::ZERO);
    }

    #[test]
    fn tls_options_must_be_complete() {
        let incomplete = parse(&["--enable-tls", "--tls-server-cert", "cert.pem"]);
        assert!(incomplete.validate().is_err());

        let complete = parse(&[
            "--enable-tls",
            "--tls-server-cert",
            "cert.pem",
            "--tls-server-key",
            "key.pem",
            "--tls-client-ca",
            "ca.pem",
        ]);
        assert!(complete.validate().is_ok());
    }

    #[test]
    fn rejects_unexpected_arguments() {
        assert!(Options::try_parse_from(["plugin", "stray"]).is_err());
    }
}
