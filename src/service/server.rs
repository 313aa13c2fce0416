use std::sync::Arc;
use std::time::Duration;

use plugin_proto::pluginrpc::{
    collector_server::CollectorServer, controller_server::ControllerServer,
    publisher_server::PublisherServer,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::server::Router;
use tonic::transport::{Server, ServerTlsConfig};
use tracing::{debug, warn};

use super::{CollectService, ControlService, PublishService, ShutdownReason, StatsServer};
use crate::manager::{ContextManager, PublisherContextManager};

/// How long in-flight RPCs are given to finish once shutdown is signaled.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves the collector and controller services until the host kills the
/// plugin, the ping watchdog expires, or the transport fails. Returns the
/// shutdown cause.
pub async fn serve_collector(
    manager: Arc<ContextManager>,
    listener: TcpListener,
    tls: Option<ServerTlsConfig>,
    stats: Option<StatsServer>,
    ping_timeout: Duration,
    max_missed_pings: u32,
) -> Result<ShutdownReason, tonic::transport::Error> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let control = ControlService::new(shutdown_tx, ping_timeout, max_missed_pings);
    let collect = CollectService::new(Arc::clone(&manager));

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    let router = builder
        .add_service(ControllerServer::new(control))
        .add_service(CollectorServer::new(collect));

    let reason = serve_until_shutdown(router, listener, shutdown_rx).await;
    // The stats listener outlives the RPC handlers; close it after
    // graceful-stop.
    if let Some(stats) = stats {
        stats.close().await;
    }
    manager.shutdown();
    Ok(reason)
}

/// Publisher-side counterpart of [`serve_collector`].
pub async fn serve_publisher(
    manager: Arc<PublisherContextManager>,
    listener: TcpListener,
    tls: Option<ServerTlsConfig>,
    stats: Option<StatsServer>,
    ping_timeout: Duration,
    max_missed_pings: u32,
) -> Result<ShutdownReason, tonic::transport::Error> {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let control = ControlService::new(shutdown_tx, ping_timeout, max_missed_pings);
    let publish = PublishService::new(Arc::clone(&manager));

    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    let router = builder
        .add_service(ControllerServer::new(control))
        .add_service(PublisherServer::new(publish));

    let reason = serve_until_shutdown(router, listener, shutdown_rx).await;
    // The stats listener outlives the RPC handlers; close it after
    // graceful-stop.
    if let Some(stats) = stats {
        stats.close().await;
    }
    manager.shutdown();
    Ok(reason)
}

async fn serve_until_shutdown(
    router: Router,
    listener: TcpListener,
    mut shutdown_rx: mpsc::Receiver<ShutdownReason>,
) -> ShutdownReason {
    let incoming = TcpListenerStream::new(listener);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut serve = tokio::spawn(router.serve_with_incoming_shutdown(incoming, async {
        let _ = stop_rx.await;
    }));

    let mut serve_finished = false;
    let reason = tokio::select! {
        received = shutdown_rx.recv() => match received {
            Some(reason) => reason,
            None => ShutdownReason::Fault {
                message: "control channel closed unexpectedly".to_string(),
            },
        },
        result = &mut serve => {
            serve_finished = true;
            ShutdownReason::Fault { message: serve_failure(result) }
        }
    };

    if !serve_finished {
        // Try to complete the remaining RPCs; stop by force past the
        // deadline.
        let _ = stop_tx.send(());
        match tokio::time::timeout(GRACEFUL_STOP_TIMEOUT, &mut serve).await {
            Ok(_) => debug!("grpc server stopped gracefully"),
            Err(_) => {
                serve.abort();
                warn!("grpc server couldn't have been stopped gracefully; some metrics might have been lost");
            }
        }
    }

    reason
}

fn serve_failure(result: Result<Result<(), tonic::transport::Error>, JoinError>) -> String {
    match result {
        Ok(Ok(())) => "grpc server stopped unexpectedly".to_string(),
        Ok(Err(error)) => error.to_string(),
        Err(join_error) => join_error.to_string(),
    }
}
