//! The statistics HTTP listener: a shared resource that outlives the RPC
//! handlers and is closed after graceful-stop.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Response, Server};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::manager::PluginInfo;

/// Provider of the document served by the statistics listener.
pub type InfoSource = Arc<dyn Fn() -> PluginInfo + Send + Sync>;

/// Serves the plugin info/statistics document as JSON on every request.
/// Started before the gRPC server when `--enable-stats` is set.
pub struct StatsServer {
    address: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatsServer {
    pub async fn start(listener: TcpListener, info: InfoSource) -> Result<Self, hyper::Error> {
        let incoming = AddrIncoming::from_listener(listener)?;
        let address = incoming.local_addr();

        let make_service = make_service_fn(move |_connection| {
            let info = Arc::clone(&info);
            async move {
                Ok::<_, Infallible>(service_fn(move |_request| {
                    let info = Arc::clone(&info);
                    async move {
                        let body = serde_json::to_vec(&info()).unwrap_or_default();
                        let mut response = Response::new(Body::from(body));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                        Ok::<_, Infallible>(response)
                    }
                }))
            }
        });

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let server = Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        let handle = tokio::spawn(async move {
            if let Err(error) = server.await {
                warn!(%error, "stats server failed");
            }
        });

        debug!(%address, "stats server started");
        Ok(Self {
            address,
            cancel,
            handle,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Stops accepting connections and waits for in-flight requests to
    /// finish.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::plugin::PluginType;
    use crate::stats::Stats;

    fn info_fixture() -> InfoSource {
        Arc::new(|| PluginInfo {
            name: "stats-test".to_string(),
            version: "1.0.0".to_string(),
            plugin_type: PluginType::Collector,
            metrics: vec!["/test/**".to_string()],
            groups: Default::default(),
            loaded_tasks: 0,
            stats: Stats::default().snapshot(),
        })
    }

    #[tokio::test]
    async fn serves_the_statistics_document_until_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = StatsServer::start(listener, info_fixture()).await.unwrap();
        let address = server.address();

        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.contains("200 OK"));
        assert!(response.contains(r#""name":"stats-test""#));
        assert!(response.contains(r#""metrics":["/test/**"]"#));

        server.close().await;
        assert!(TcpStream::connect(address).await.is_err());
    }
}
