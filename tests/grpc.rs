//! End-to-end tests driving the plugin gRPC surface with a real client, the
//! way the host agent does.

use std::sync::Arc;
use std::time::Duration;

use plugin_proto::pluginrpc::{
    collector_client::CollectorClient, controller_client::ControllerClient,
    metric_value::DataVariant, publisher_client::PublisherClient, CollectRequest, InfoRequest,
    KillRequest, LoadCollectorRequest, LoadPublisherRequest, Metric, MetricValue,
    NamespaceElement, PingRequest, PublishRequest, Time, UnloadCollectorRequest,
    UnloadPublisherRequest,
};
use telemetry_plugin::manager::{ContextManager, PublisherContextManager};
use telemetry_plugin::service::{
    serve_collector, serve_publisher, InfoSource, ShutdownReason, StatsServer,
};
use telemetry_plugin::test_util::{CollectingPublisher, TestCollector, TestStreamingCollector};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::Code;

type ServerHandle = JoinHandle<Result<ShutdownReason, tonic::transport::Error>>;

async fn start_collector_server(
    manager: Arc<ContextManager>,
    ping_timeout: Duration,
    max_missed: u32,
) -> (String, ServerHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_collector(
        manager,
        listener,
        None,
        None,
        ping_timeout,
        max_missed,
    ));
    (format!("http://{address}"), server)
}

async fn start_publisher_server(manager: Arc<PublisherContextManager>) -> (String, ServerHandle) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_publisher(
        manager,
        listener,
        None,
        None,
        Duration::ZERO,
        0,
    ));
    (format!("http://{address}"), server)
}

async fn connect(endpoint: &str) -> Channel {
    for _ in 0..50 {
        let endpoint = Channel::from_shared(endpoint.to_string()).unwrap();
        if let Ok(channel) = endpoint.connect().await {
            return channel;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {endpoint}");
}

async fn load_collector_task(
    client: &mut CollectorClient<Channel>,
    task_id: &str,
    selectors: &[&str],
) {
    client
        .load(LoadCollectorRequest {
            task_id: task_id.to_string(),
            json_config: b"{}".to_vec(),
            metric_selectors: selectors.iter().map(ToString::to_string).collect(),
        })
        .await
        .unwrap();
}

async fn collect_chunks(
    client: &mut CollectorClient<Channel>,
    task_id: &str,
) -> Vec<Vec<Metric>> {
    let mut stream = client
        .collect(CollectRequest {
            task_id: task_id.to_string(),
        })
        .await
        .unwrap()
        .into_inner();

    let mut chunks = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        chunks.push(response.metric_set);
    }
    chunks
}

fn namespace_string(metric: &Metric) -> String {
    metric
        .namespace
        .iter()
        .map(|element| {
            if element.name.is_empty() {
                format!("/{}", element.value)
            } else {
                format!("/[{}={}]", element.name, element.value)
            }
        })
        .collect()
}

fn proto_metric(segments: &[&str], value: i64) -> Metric {
    Metric {
        namespace: segments
            .iter()
            .map(|segment| NamespaceElement {
                name: String::new(),
                value: segment.to_string(),
                description: String::new(),
            })
            .collect(),
        value: Some(MetricValue {
            data_variant: Some(DataVariant::VInt64(value)),
        }),
        tags: Default::default(),
        timestamp: Some(Time {
            sec: 1_700_000_000,
            nsec: 0,
        }),
        description: String::new(),
        unit: String::new(),
    }
}

#[tokio::test]
async fn collector_lifecycle_with_chunked_stream() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting_sequence(250),
        "chunker",
        "1.0.0",
    ));
    let (endpoint, server) = start_collector_server(manager, Duration::ZERO, 0).await;

    let channel = connect(&endpoint).await;
    let mut collector = CollectorClient::new(channel.clone());
    let mut controller = ControllerClient::new(channel);

    controller.ping(PingRequest {}).await.unwrap();

    load_collector_task(&mut collector, "task-1", &[]).await;

    // 250 metrics arrive as chunks of 100, 100 and 50, in emission order.
    let chunks = collect_chunks(&mut collector, "task-1").await;
    assert_eq!(
        chunks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![100, 100, 50]
    );

    let names: Vec<String> = chunks.iter().flatten().map(namespace_string).collect();
    assert_eq!(names[0], "/test/group/m0");
    assert_eq!(names[100], "/test/group/m100");
    assert_eq!(names[249], "/test/group/m249");

    collector
        .unload(UnloadCollectorRequest {
            task_id: "task-1".to_string(),
        })
        .await
        .unwrap();

    controller.kill(KillRequest {}).await.unwrap();
    let reason = server.await.unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::RequestedKill);
}

#[tokio::test]
async fn host_filter_is_applied_on_the_wire() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting(&[("/test/group/m1", 7), ("/test/group/m2", 9)]),
        "filtered",
        "1.0.0",
    ));
    let (endpoint, _server) = start_collector_server(manager, Duration::ZERO, 0).await;

    let channel = connect(&endpoint).await;
    let mut collector = CollectorClient::new(channel);

    load_collector_task(&mut collector, "task-1", &["/test/group/m1"]).await;

    let metrics: Vec<Metric> = collect_chunks(&mut collector, "task-1")
        .await
        .into_iter()
        .flatten()
        .collect();

    assert_eq!(metrics.len(), 1);
    assert_eq!(namespace_string(&metrics[0]), "/test/group/m1");
    assert_eq!(
        metrics[0].value.as_ref().unwrap().data_variant,
        Some(DataVariant::VInt64(7))
    );
}

#[tokio::test]
async fn streaming_collector_flushes_full_chunks() {
    let manager = Arc::new(ContextManager::new_streaming(
        TestStreamingCollector::emitting_sequence(150),
        "streamer",
        "1.0.0",
    ));
    let (endpoint, _server) = start_collector_server(manager, Duration::ZERO, 0).await;

    let channel = connect(&endpoint).await;
    let mut collector = CollectorClient::new(channel);

    load_collector_task(&mut collector, "task-1", &[]).await;

    let chunks = collect_chunks(&mut collector, "task-1").await;
    assert_eq!(
        chunks.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![100, 50]
    );
}

#[tokio::test]
async fn task_lifecycle_errors_map_onto_status_codes() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting(&[]),
        "statuses",
        "1.0.0",
    ));
    let (endpoint, _server) = start_collector_server(manager, Duration::ZERO, 0).await;

    let channel = connect(&endpoint).await;
    let mut collector = CollectorClient::new(channel);

    load_collector_task(&mut collector, "task-1", &[]).await;

    let double_load = collector
        .load(LoadCollectorRequest {
            task_id: "task-1".to_string(),
            json_config: b"{}".to_vec(),
            metric_selectors: Vec::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(double_load.code(), Code::AlreadyExists);

    let unknown_collect = collector
        .collect(CollectRequest {
            task_id: "never-loaded".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(unknown_collect.code(), Code::NotFound);

    let unknown_unload = collector
        .unload(UnloadCollectorRequest {
            task_id: "never-loaded".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(unknown_unload.code(), Code::NotFound);

    let bad_config = collector
        .load(LoadCollectorRequest {
            task_id: "task-2".to_string(),
            json_config: b"not json".to_vec(),
            metric_selectors: Vec::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(bad_config.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn info_reports_the_plugin_definition() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting(&[]),
        "describable",
        "2.3.4",
    ));
    let (endpoint, _server) = start_collector_server(manager, Duration::ZERO, 0).await;

    let channel = connect(&endpoint).await;
    let mut collector = CollectorClient::new(channel);

    let response = collector.info(InfoRequest::default()).await.unwrap();
    let info: serde_json::Value = serde_json::from_slice(&response.into_inner().info).unwrap();

    assert_eq!(info["name"], "describable");
    assert_eq!(info["version"], "2.3.4");
    assert_eq!(info["type"], "collector");
    assert_eq!(info["metrics"][0], "/test/**");
}

#[tokio::test]
async fn publisher_reassembles_chunks_in_order() {
    let publisher = CollectingPublisher::new();
    let received = publisher.received();
    let manager = Arc::new(PublisherContextManager::new(
        publisher,
        "test-publisher",
        "1.0.0",
    ));
    let (endpoint, server) = start_publisher_server(manager).await;

    let channel = connect(&endpoint).await;
    let mut publisher_client = PublisherClient::new(channel.clone());
    let mut controller = ControllerClient::new(channel);

    publisher_client
        .load(LoadPublisherRequest {
            task_id: "pub-1".to_string(),
            json_config: b"{}".to_vec(),
        })
        .await
        .unwrap();

    let requests = tokio_stream::iter(vec![
        PublishRequest {
            task_id: "pub-1".to_string(),
            metric_set: vec![
                proto_metric(&["example", "group1", "metric1"], 11),
                proto_metric(&["example", "group1", "metric2"], 12),
            ],
        },
        PublishRequest {
            task_id: "pub-1".to_string(),
            metric_set: vec![proto_metric(&["example", "group2", "metric1"], 21)],
        },
    ]);
    publisher_client.publish(requests).await.unwrap();

    {
        let metrics = received.lock().unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(
            metrics[0].namespace().to_string(),
            "/example/group1/metric1"
        );
        assert_eq!(
            metrics[1].namespace().to_string(),
            "/example/group1/metric2"
        );
        assert_eq!(
            metrics[2].namespace().to_string(),
            "/example/group2/metric1"
        );
    }

    publisher_client
        .unload(UnloadPublisherRequest {
            task_id: "pub-1".to_string(),
        })
        .await
        .unwrap();

    controller.kill(KillRequest {}).await.unwrap();
    let reason = server.await.unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::RequestedKill);
}

#[tokio::test]
async fn stats_listener_closes_after_graceful_stop() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting(&[]),
        "stats-enabled",
        "1.0.0",
    ));

    let stats_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let info: InfoSource = {
        let manager = Arc::clone(&manager);
        Arc::new(move || manager.request_info())
    };
    let stats = StatsServer::start(stats_listener, info).await.unwrap();
    let stats_address = stats.address();

    let grpc_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let grpc_address = grpc_listener.local_addr().unwrap();
    let server = tokio::spawn(serve_collector(
        manager,
        grpc_listener,
        None,
        Some(stats),
        Duration::ZERO,
        0,
    ));

    // The stats listener is reachable while the plugin serves.
    {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(stats_address).await.unwrap();
        stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.contains(r#""name":"stats-enabled""#));
    }

    let channel = connect(&format!("http://{grpc_address}")).await;
    let mut controller = ControllerClient::new(channel);
    controller.kill(KillRequest {}).await.unwrap();

    let reason = server.await.unwrap().unwrap();
    assert_eq!(reason, ShutdownReason::RequestedKill);

    // Closed after graceful-stop: fresh connections are refused.
    assert!(tokio::net::TcpStream::connect(stats_address).await.is_err());
}

#[tokio::test]
async fn missing_pings_shut_the_server_down() {
    let manager = Arc::new(ContextManager::new(
        TestCollector::emitting(&[]),
        "watchdogged",
        "1.0.0",
    ));
    let (_endpoint, server) =
        start_collector_server(manager, Duration::from_millis(100), 3).await;

    let reason = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        reason,
        ShutdownReason::PingTimeout {
            missed: 3,
            timeout: Duration::from_millis(100)
        }
    );
}
