use std::fmt;
use std::time::Duration;

use plugin_proto::pluginrpc::{
    controller_server::Controller, KillRequest, KillResponse, PingRequest, PingResponse,
};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_MISSED_PINGS: u32 = 3;

/// Why the plugin process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The host sent an explicit Kill; a normal exit.
    RequestedKill,
    /// The liveness watchdog expired.
    PingTimeout { missed: u32, timeout: Duration },
    /// The transport failed underneath us.
    Fault { message: String },
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::RequestedKill => exitcode::OK,
            ShutdownReason::PingTimeout { .. } | ShutdownReason::Fault { .. } => {
                exitcode::SOFTWARE
            }
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::RequestedKill => f.write_str("kill requested"),
            ShutdownReason::PingTimeout { missed, timeout } => write!(
                f,
                "ping message missed {missed} times (timeout: {})",
                humantime::format_duration(*timeout)
            ),
            ShutdownReason::Fault { message } => f.write_str(message),
        }
    }
}

/// The control service: receives pings and kill requests from the host and
/// drives the liveness watchdog.
pub struct ControlService {
    ping: mpsc::Sender<()>,
    shutdown: mpsc::Sender<ShutdownReason>,
}

impl ControlService {
    /// Spawns the liveness monitor and returns the service. A zero ping
    /// timeout or a zero missed-ping allowance disables enforcement; pings
    /// are then drained without effect.
    pub fn new(
        shutdown: mpsc::Sender<ShutdownReason>,
        ping_timeout: Duration,
        max_missed: u32,
    ) -> Self {
        let (ping_tx, ping_rx) = mpsc::channel(1);

        if ping_timeout.is_zero() || max_missed == 0 {
            tokio::spawn(drain(ping_rx));
        } else {
            tokio::spawn(monitor(ping_rx, shutdown.clone(), ping_timeout, max_missed));
        }

        Self {
            ping: ping_tx,
            shutdown,
        }
    }
}

#[tonic::async_trait]
impl Controller for ControlService {
    async fn ping(&self, _: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        debug!("grpc ping received");
        let _ = self.ping.send(()).await;
        Ok(Response::new(PingResponse {}))
    }

    async fn kill(&self, _: Request<KillRequest>) -> Result<Response<KillResponse>, Status> {
        debug!("grpc kill received");
        let _ = self.shutdown.send(ShutdownReason::RequestedKill).await;
        Ok(Response::new(KillResponse {}))
    }
}

async fn drain(mut ping: mpsc::Receiver<()>) {
    while ping.recv().await.is_some() {}
}

async fn monitor(
    mut ping: mpsc::Receiver<()>,
    shutdown: mpsc::Sender<ShutdownReason>,
    timeout: Duration,
    max_missed: u32,
) {
    let mut missed = 0u32;

    loop {
        tokio::select! {
            received = ping.recv() => {
                if received.is_none() {
                    return;
                }
                missed = 0;
            }
            () = tokio::time::sleep(timeout) => {
                missed += 1;
                warn!(missed, max = max_missed, "ping timeout occurred");

                if missed >= max_missed {
                    let _ = shutdown
                        .send(ShutdownReason::PingTimeout { missed, timeout })
                        .await;
                    return;
                }
            }
        }
    }
}
