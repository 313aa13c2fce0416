use std::sync::Arc;

use futures::stream::StreamExt;
use plugin_proto::pluginrpc::{
    collector_server::Collector, CollectRequest, CollectResponse, InfoRequest, InfoResponse,
    LoadCollectorRequest, LoadCollectorResponse, UnloadCollectorRequest, UnloadCollectorResponse,
};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::debug;

use super::{convert, into_status};
use crate::manager::ContextManager;

/// Maximum number of metrics carried by one chunk of the collect stream.
pub const MAX_COLLECT_CHUNK_SIZE: usize = 100;

/// The collector service: task lifecycle plus the chunked collect stream.
pub struct CollectService {
    manager: Arc<ContextManager>,
}

impl CollectService {
    pub fn new(manager: Arc<ContextManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Collector for CollectService {
    type CollectStream = futures::stream::BoxStream<'static, Result<CollectResponse, Status>>;

    async fn collect(
        &self,
        request: Request<CollectRequest>,
    ) -> Result<Response<Self::CollectStream>, Status> {
        let task_id = request.into_inner().task_id;
        debug!(%task_id, "grpc collect received");

        let schema = self.manager.schema();

        if self.manager.is_streaming() {
            // Metrics drain through a channel so full chunks are flushed
            // while user code is still running.
            let (sender, mut receiver) = mpsc::channel(MAX_COLLECT_CHUNK_SIZE);
            let manager = Arc::clone(&self.manager);
            let streaming_task = tokio::spawn({
                let task_id = task_id.clone();
                async move { manager.streaming_collect(&task_id, sender).await }
            });

            let stream = async_stream::stream! {
                let mut chunk = Vec::new();
                while let Some(metric) = receiver.recv().await {
                    chunk.push(convert::metric_to_proto(&metric, Some(schema.as_ref())));
                    if chunk.len() == MAX_COLLECT_CHUNK_SIZE {
                        yield Ok(CollectResponse { metric_set: std::mem::take(&mut chunk) });
                    }
                }
                if !chunk.is_empty() {
                    yield Ok(CollectResponse { metric_set: chunk });
                }

                match streaming_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => yield Err(into_status(error)),
                    Err(join_error) => yield Err(Status::internal(join_error.to_string())),
                }
            };
            return Ok(Response::new(stream.boxed()));
        }

        // Spawned so the operation runs to completion even if the host
        // cancels the RPC; the task slot is released only after user code
        // returns.
        let metrics = {
            let manager = Arc::clone(&self.manager);
            let task_id = task_id.clone();
            tokio::spawn(async move { manager.collect(&task_id).await })
                .await
                .map_err(|join_error| Status::internal(join_error.to_string()))?
                .map_err(into_status)?
        };
        debug!(%task_id, count = metrics.len(), "metrics collected");

        let chunks: Vec<Result<CollectResponse, Status>> = metrics
            .chunks(MAX_COLLECT_CHUNK_SIZE)
            .map(|chunk| {
                Ok(CollectResponse {
                    metric_set: chunk
                        .iter()
                        .map(|metric| convert::metric_to_proto(metric, Some(schema.as_ref())))
                        .collect(),
                })
            })
            .collect();

        Ok(Response::new(futures::stream::iter(chunks).boxed()))
    }

    async fn load(
        &self,
        request: Request<LoadCollectorRequest>,
    ) -> Result<Response<LoadCollectorResponse>, Status> {
        let request = request.into_inner();
        debug!(task_id = %request.task_id, "grpc load received");

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            manager
                .load(
                    &request.task_id,
                    &request.json_config,
                    &request.metric_selectors,
                )
                .await
        })
        .await
        .map_err(|join_error| Status::internal(join_error.to_string()))?
        .map_err(into_status)?;
        Ok(Response::new(LoadCollectorResponse {}))
    }

    async fn unload(
        &self,
        request: Request<UnloadCollectorRequest>,
    ) -> Result<Response<UnloadCollectorResponse>, Status> {
        let request = request.into_inner();
        debug!(task_id = %request.task_id, "grpc unload received");

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.unload(&request.task_id).await })
            .await
            .map_err(|join_error| Status::internal(join_error.to_string()))?
            .map_err(into_status)?;
        Ok(Response::new(UnloadCollectorResponse {}))
    }

    async fn info(&self, _: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
        debug!("grpc info received");

        let info = self.manager.request_info();
        let info = serde_json::to_vec(&info)
            .map_err(|error| Status::internal(format!("can't serialize plugin info: {error}")))?;
        Ok(Response::new(InfoResponse { info }))
    }
}
