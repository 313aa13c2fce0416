use std::sync::Arc;

use plugin_proto::pluginrpc::{
    publisher_server::Publisher, LoadPublisherRequest, LoadPublisherResponse, PublishRequest,
    PublishResponse, UnloadPublisherRequest, UnloadPublisherResponse,
};
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use super::{convert, into_status};
use crate::manager::PublisherContextManager;

/// The publisher service: task lifecycle plus chunk reassembly of the
/// client-streamed publish call.
pub struct PublishService {
    manager: Arc<PublisherContextManager>,
}

impl PublishService {
    pub fn new(manager: Arc<PublisherContextManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Publisher for PublishService {
    async fn publish(
        &self,
        request: Request<Streaming<PublishRequest>>,
    ) -> Result<Response<PublishResponse>, Status> {
        let mut stream = request.into_inner();

        let mut task_id: Option<String> = None;
        let mut metrics = Vec::new();
        while let Some(chunk) = stream.message().await? {
            debug!(task_id = %chunk.task_id, count = chunk.metric_set.len(), "grpc publish chunk received");
            task_id.get_or_insert(chunk.task_id);
            metrics.extend(chunk.metric_set.into_iter().map(convert::metric_from_proto));
        }

        let task_id =
            task_id.ok_or_else(|| Status::invalid_argument("empty publish stream"))?;

        // Spawned so the operation runs to completion even if the host
        // cancels the RPC; the task slot is released only after user code
        // returns.
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.publish(&task_id, metrics).await })
            .await
            .map_err(|join_error| Status::internal(join_error.to_string()))?
            .map_err(into_status)?;
        Ok(Response::new(PublishResponse {}))
    }

    async fn load(
        &self,
        request: Request<LoadPublisherRequest>,
    ) -> Result<Response<LoadPublisherResponse>, Status> {
        let request = request.into_inner();
        debug!(task_id = %request.task_id, "grpc load received");

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.load(&request.task_id, &request.json_config).await })
            .await
            .map_err(|join_error| Status::internal(join_error.to_string()))?
            .map_err(into_status)?;
        Ok(Response::new(LoadPublisherResponse {}))
    }

    async fn unload(
        &self,
        request: Request<UnloadPublisherRequest>,
    ) -> Result<Response<UnloadPublisherResponse>, Status> {
        let request = request.into_inner();
        debug!(task_id = %request.task_id, "grpc unload received");

        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move { manager.unload(&request.task_id).await })
            .await
            .map_err(|join_error| Status::internal(join_error.to_string()))?
            .map_err(into_status)?;
        Ok(Response::new(UnloadPublisherResponse {}))
    }
}
