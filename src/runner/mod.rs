//! Process entry points: flag parsing, logging setup, the startup handshake
//! and the exit-code contract.

mod flags;
mod meta;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::manager::{ContextManager, PublisherContextManager};
use crate::plugin::{Collector, Publisher, StreamingCollector};
use crate::service::{serve_collector, serve_publisher, InfoSource, ShutdownReason, StatsServer};

pub use flags::Options;
pub use meta::PluginMeta;

/// Exit code used when the process is interrupted by the user (SIGINT).
pub const INTERRUPT_EXIT_CODE: u8 = 130;

const DEBUG_TASK_ID: &str = "debug-task";

/// Runs a collector plugin process to completion.
pub fn start_collector(collector: impl Collector, name: &str, version: &str) -> ExitCode {
    let options = Options::parse();
    let manager = Arc::new(ContextManager::new(collector, name, version));
    run(options, Plugin::Collector(manager))
}

/// Runs a streaming-collector plugin process to completion.
pub fn start_streaming_collector(
    collector: impl StreamingCollector,
    name: &str,
    version: &str,
) -> ExitCode {
    let options = Options::parse();
    let manager = Arc::new(ContextManager::new_streaming(collector, name, version));
    run(options, Plugin::Collector(manager))
}

/// Runs a publisher plugin process to completion.
pub fn start_publisher(publisher: impl Publisher, name: &str, version: &str) -> ExitCode {
    let options = Options::parse();
    let manager = Arc::new(PublisherContextManager::new(publisher, name, version));
    run(options, Plugin::Publisher(manager))
}

enum Plugin {
    Collector(Arc<ContextManager>),
    Publisher(Arc<PublisherContextManager>),
}

fn run(options: Options, plugin: Plugin) -> ExitCode {
    init_tracing(options.log_level);

    if let Err(message) = options.validate() {
        eprintln!("Invalid plugin options ({message})");
        return to_exit_code(exitcode::USAGE);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Can't start the plugin runtime ({error})");
            return to_exit_code(exitcode::SOFTWARE);
        }
    };

    runtime.block_on(run_async(options, plugin))
}

async fn run_async(options: Options, plugin: Plugin) -> ExitCode {
    if options.debug_mode {
        return match plugin {
            Plugin::Collector(manager) => debug_collect(&manager, &options).await,
            Plugin::Publisher(_) => {
                eprintln!("Debug mode is only supported for collector plugins");
                to_exit_code(exitcode::USAGE)
            }
        };
    }

    let listener = match TcpListener::bind((options.grpc_ip, options.grpc_port)).await {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("Can't acquire the gRPC listener ({error})");
            return to_exit_code(exitcode::IOERR);
        }
    };
    let address = match listener.local_addr() {
        Ok(address) => address,
        Err(error) => {
            eprintln!("Can't read the gRPC listener address ({error})");
            return to_exit_code(exitcode::IOERR);
        }
    };

    let tls = match load_tls(&options) {
        Ok(tls) => tls,
        Err(message) => {
            eprintln!("Invalid TLS configuration ({message})");
            return to_exit_code(exitcode::CONFIG);
        }
    };

    let stats_server = match start_stats_server(&options, &plugin).await {
        Ok(stats_server) => stats_server,
        Err(message) => {
            eprintln!("Can't start the stats server ({message})");
            return to_exit_code(exitcode::IOERR);
        }
    };
    let stats_address = stats_server.as_ref().map(StatsServer::address);

    let handshake = match &plugin {
        Plugin::Collector(manager) => PluginMeta::new(
            manager.name(),
            manager.version(),
            manager.plugin_type(),
            address,
            stats_address,
            &options,
        ),
        Plugin::Publisher(manager) => PluginMeta::new(
            manager.name(),
            manager.version(),
            crate::plugin::PluginType::Publisher,
            address,
            stats_address,
            &options,
        ),
    };
    if let Err(error) = meta::print_handshake(&handshake) {
        eprintln!("Can't emit the startup handshake ({error})");
        return to_exit_code(exitcode::SOFTWARE);
    }
    info!(%address, "plugin started");

    let serve = async {
        match plugin {
            Plugin::Collector(manager) => {
                serve_collector(
                    manager,
                    listener,
                    tls,
                    stats_server,
                    options.ping_timeout,
                    options.ping_max_missed,
                )
                .await
            }
            Plugin::Publisher(manager) => {
                serve_publisher(
                    manager,
                    listener,
                    tls,
                    stats_server,
                    options.ping_timeout,
                    options.ping_max_missed,
                )
                .await
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
            ExitCode::from(INTERRUPT_EXIT_CODE)
        }
        result = serve => match result {
            Ok(reason @ ShutdownReason::RequestedKill) => {
                info!(%reason, "plugin shut down");
                to_exit_code(reason.exit_code())
            }
            Ok(reason) => {
                error!(%reason, "major error occurred - plugin will be shut down");
                to_exit_code(reason.exit_code())
            }
            Err(error) => {
                error!(%error, "grpc server failed");
                to_exit_code(exitcode::SOFTWARE)
            }
        }
    }
}

/// Standalone mode: loads one task with `--plugin-config`, runs a single
/// collect and prints the produced metrics.
async fn debug_collect(manager: &ContextManager, options: &Options) -> ExitCode {
    if let Err(error) = manager
        .load(DEBUG_TASK_ID, options.plugin_config.as_bytes(), &[])
        .await
    {
        error!(%error, "can't load the debug task");
        return to_exit_code(exitcode::SOFTWARE);
    }

    match manager.collect(DEBUG_TASK_ID).await {
        Ok(metrics) => {
            for metric in &metrics {
                println!("{metric}");
            }
            to_exit_code(exitcode::OK)
        }
        Err(error) => {
            error!(%error, "debug collect failed");
            to_exit_code(exitcode::SOFTWARE)
        }
    }
}

/// Binds and starts the statistics listener when `--enable-stats` is set.
/// The listener is handed to the server orchestrator, which closes it after
/// graceful-stop.
async fn start_stats_server(
    options: &Options,
    plugin: &Plugin,
) -> Result<Option<StatsServer>, String> {
    if !options.enable_stats {
        return Ok(None);
    }

    let listener = TcpListener::bind((options.grpc_ip, 0))
        .await
        .map_err(|error| error.to_string())?;

    let info: InfoSource = match plugin {
        Plugin::Collector(manager) => {
            let manager = Arc::clone(manager);
            Arc::new(move || manager.request_info())
        }
        Plugin::Publisher(manager) => {
            let manager = Arc::clone(manager);
            Arc::new(move || manager.request_info())
        }
    };

    let stats_server = StatsServer::start(listener, info)
        .await
        .map_err(|error| error.to_string())?;
    Ok(Some(stats_server))
}

fn load_tls(options: &Options) -> Result<Option<ServerTlsConfig>, String> {
    if !options.enable_tls {
        return Ok(None);
    }

    let (cert, key, ca) = match (
        &options.tls_server_cert,
        &options.tls_server_key,
        &options.tls_client_ca,
    ) {
        (Some(cert), Some(key), Some(ca)) => (cert, key, ca),
        _ => return Err("missing TLS material paths".to_string()),
    };

    let cert = std::fs::read(cert).map_err(|error| format!("server cert: {error}"))?;
    let key = std::fs::read(key).map_err(|error| format!("server key: {error}"))?;
    let ca = std::fs::read(ca).map_err(|error| format!("client CA: {error}"))?;

    // Clients without a verifiable certificate are rejected.
    Ok(Some(
        ServerTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .client_ca_root(Certificate::from_pem(ca)),
    ))
}

fn init_tracing(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // Logs go to stderr; stdout carries the startup handshake.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn to_exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
