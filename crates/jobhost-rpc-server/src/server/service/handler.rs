//! gRPC endpoint workers connect to.
//!
//! This module defines [`FunctionRpcService`], the implementation of the
//! `FunctionRpc` service. Every worker opens one `EventStream` call. The first
//! message on it must be `StartStream` naming the worker id the host assigned
//! at launch; the stream is then handed to the channel waiting for that id and
//! the handler returns the channel's outbound half as the response stream.

use crate::server::channel::{AttachedStream, InboundStream, StreamRegistry};
use core::{pin::Pin, time::Duration};
use futures::StreamExt;
use jobhost_rpc_core::{
    Error,
    proto::{StreamingMessage, function_rpc_server::FunctionRpc, streaming_message::Content},
};
use tokio::sync::mpsc;
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};

/// Accepts worker streams and routes them to their channels.
#[derive(Clone)]
pub struct FunctionRpcService {
    registry: StreamRegistry,
    stream_buffer_size: usize,
    start_stream_timeout: Duration,
}

impl FunctionRpcService {
    pub fn new(
        registry: StreamRegistry,
        stream_buffer_size: usize,
        start_stream_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            stream_buffer_size,
            start_stream_timeout,
        }
    }

    /// Reads `StartStream` from `inbound` and attaches the rest of the stream
    /// to the waiting channel. Returns the receiver of the host's messages to
    /// that worker.
    pub(crate) async fn accept(
        &self,
        mut inbound: InboundStream,
    ) -> Result<ReceiverStream<Result<StreamingMessage, Status>>, Status> {
        let first = match tokio::time::timeout(self.start_stream_timeout, inbound.next()).await {
            Ok(Some(message)) => message?,
            Ok(None) => {
                return Err(Error::InvalidRequest {
                    reason: "stream closed before StartStream".to_owned(),
                }
                .into());
            }
            Err(_) => {
                return Err(Error::Timeout {
                    operation: "StartStream".to_owned(),
                    after: self.start_stream_timeout,
                }
                .into());
            }
        };

        let kind = first.kind();
        let Some(Content::StartStream(start)) = first.content else {
            return Err(Error::InvalidRequest {
                reason: format!("expected StartStream, got {kind}"),
            }
            .into());
        };

        let (tx, rx) = mpsc::channel(self.stream_buffer_size);
        let attached = AttachedStream {
            worker_id: start.worker_id.clone(),
            inbound,
            outbound: tx,
        };
        if self.registry.attach(attached).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!(worker_id = %start.worker_id, "Refusing stream from unknown worker");
            return Err(Status::not_found(format!(
                "no worker with id {} is expected",
                start.worker_id
            )));
        }

        #[cfg(feature = "tracing")]
        tracing::info!(worker_id = %start.worker_id, "Worker stream attached");
        Ok(ReceiverStream::new(rx))
    }
}

#[tonic::async_trait]
impl FunctionRpc for FunctionRpcService {
    type EventStreamStream = Pin<Box<dyn Stream<Item = Result<StreamingMessage, Status>> + Send>>;

    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(remote = ?req.remote_addr())))]
    async fn event_stream(
        &self,
        req: Request<Streaming<StreamingMessage>>,
    ) -> Result<Response<Self::EventStreamStream>, Status> {
        let inbound: InboundStream = Box::pin(req.into_inner());
        let outbound = self.accept(inbound).await?;
        Ok(Response::new(Box::pin(outbound)))
    }
}
