//! Request/response multiplexing over one worker stream.

use super::pending::{PendingRequests, cancelled};
use core::{pin::Pin, time::Duration};
use futures::{Stream, StreamExt};
use jobhost_rpc_core::{Error, proto::StreamingMessage};
use std::sync::Arc;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tonic::Status;

type Result<T, E = Error> = core::result::Result<T, E>;

/// Inbound half of a worker stream.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<StreamingMessage, Status>> + Send>>;

/// Outbound half of a worker stream, as served back to the worker.
pub type OutboundSender = mpsc::Sender<Result<StreamingMessage, Status>>;

/// A worker stream that has announced itself with `StartStream`.
pub struct AttachedStream {
    pub worker_id: String,
    pub inbound: InboundStream,
    pub outbound: OutboundSender,
}

/// Sends messages to one worker and matches its responses to waiting
/// callers by correlation id.
pub struct RpcTransport {
    worker_id: String,
    outbound: OutboundSender,
    pending: Arc<PendingRequests>,
}

impl RpcTransport {
    pub fn new(worker_id: impl Into<String>, outbound: OutboundSender) -> Self {
        let worker_id = worker_id.into();
        Self {
            pending: PendingRequests::new(worker_id.clone()),
            worker_id,
            outbound,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Writes `message` to the worker, stamping a fresh correlation id when
    /// it has none. Gives up with `Timeout` when the worker does not make room
    /// for it within `timeout`. Returns the id used.
    pub async fn send(&self, mut message: StreamingMessage, timeout: Duration) -> Result<String> {
        if message.request_id.is_empty() {
            message.request_id = uuid::Uuid::new_v4().to_string();
        }
        let request_id = message.request_id.clone();
        let operation = message.kind();
        match tokio::time::timeout(timeout, self.write(message)).await {
            Ok(written) => written.map(|()| request_id),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_owned(),
                after: timeout,
            }),
        }
    }

    /// Sends `message` and waits for the response carrying the same
    /// correlation id.
    pub async fn send_and_await_response(
        &self,
        message: StreamingMessage,
        timeout: Duration,
    ) -> Result<StreamingMessage> {
        self.request(message, timeout, None).await
    }

    /// Like [`send_and_await_response`](Self::send_and_await_response), but
    /// gives up with `RequestCancelled` once `cancel` fires.
    pub async fn send_and_await_cancellable(
        &self,
        message: StreamingMessage,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        self.request(message, timeout, Some(cancel)).await
    }

    async fn request(
        &self,
        mut message: StreamingMessage,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<StreamingMessage> {
        if message.request_id.is_empty() {
            message.request_id = uuid::Uuid::new_v4().to_string();
        }
        let operation = message.kind();
        let deadline = Instant::now() + timeout;
        // Register before writing so a fast response cannot slip past. The
        // write shares the request's deadline; returning early drops the
        // waiter, which removes its entry.
        let waiter = self.pending.register(&message.request_id)?;
        tokio::select! {
            written = self.write(message) => written?,
            () = tokio::time::sleep_until(deadline) => {
                return Err(Error::Timeout {
                    operation: operation.to_owned(),
                    after: timeout,
                });
            }
            () = cancelled(cancel) => return Err(Error::RequestCancelled),
            () = self.pending.closed() => return Err(self.pending.closed_error()),
        }
        waiter.wait_until(deadline, timeout, operation, cancel).await
    }

    async fn write(&self, message: StreamingMessage) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            worker_id = %self.worker_id,
            request_id = %message.request_id,
            kind = message.kind(),
            "Sending message"
        );
        self.outbound
            .send(Ok(message))
            .await
            .map_err(|_| Error::ChannelClosed {
                worker_id: self.worker_id.clone(),
            })
    }

    /// Routes an inbound message to its waiter. Returns the message when no
    /// waiter claims it.
    pub fn route(&self, message: StreamingMessage) -> Option<StreamingMessage> {
        if message.request_id.is_empty() {
            return Some(message);
        }
        self.pending.resolve(message)
    }

    /// Fails every outstanding request, including ones still waiting for
    /// room on the outbound stream, and refuses new ones.
    pub fn close(&self) {
        let _failed = self.pending.close_all();
        #[cfg(feature = "tracing")]
        if _failed > 0 {
            tracing::debug!(worker_id = %self.worker_id, failed = _failed, "Closed transport with pending requests");
        }
    }
}

/// Reads `inbound` until it ends, routing responses through `transport` and
/// handing everything else to `on_unsolicited`. Closes the transport on exit.
pub async fn read_loop<F>(
    mut inbound: InboundStream,
    transport: Arc<RpcTransport>,
    stop: CancellationToken,
    mut on_unsolicited: F,
) where
    F: FnMut(StreamingMessage) + Send,
{
    loop {
        let next = tokio::select! {
            () = stop.cancelled() => break,
            next = inbound.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                if let Some(message) = transport.route(message) {
                    on_unsolicited(message);
                }
            }
            Some(Err(_status)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(worker_id = %transport.worker_id(), status = %_status, "Worker stream failed");
                break;
            }
            None => break,
        }
    }
    transport.close();
    #[cfg(feature = "tracing")]
    tracing::debug!(worker_id = %transport.worker_id(), "Worker stream read loop stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jobhost_rpc_core::proto::{
        WorkerStatusRequest, WorkerStatusResponse, streaming_message::Content,
    };
    use tokio_stream::wrappers::ReceiverStream;

    /// An in-memory worker connection: the transport under test plus the
    /// worker's ends of both halves.
    pub(crate) struct Harness {
        pub transport: Arc<RpcTransport>,
        pub to_host: mpsc::Sender<Result<StreamingMessage, Status>>,
        pub from_host: mpsc::Receiver<Result<StreamingMessage, Status>>,
        pub stop: CancellationToken,
        pub unsolicited: mpsc::UnboundedReceiver<StreamingMessage>,
    }

    pub(crate) fn harness() -> Harness {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (un_tx, un_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(RpcTransport::new("worker-1", out_tx));
        let stop = CancellationToken::new();
        tokio::spawn(read_loop(
            Box::pin(ReceiverStream::new(in_rx)),
            transport.clone(),
            stop.clone(),
            move |m| {
                let _ = un_tx.send(m);
            },
        ));
        Harness {
            transport,
            to_host: in_tx,
            from_host: out_rx,
            stop,
            unsolicited: un_rx,
        }
    }

    fn status_request() -> StreamingMessage {
        StreamingMessage::new(Content::WorkerStatusRequest(WorkerStatusRequest {}))
    }

    fn status_response(id: &str) -> StreamingMessage {
        StreamingMessage::new(Content::WorkerStatusResponse(WorkerStatusResponse {}))
            .with_request_id(id)
    }

    #[tokio::test]
    async fn send_stamps_a_correlation_id() {
        let mut h = harness();
        let id = h
            .transport
            .send(status_request(), Duration::from_secs(1))
            .await
            .unwrap();
        let sent = h.from_host.recv().await.unwrap().unwrap();
        assert_eq!(sent.request_id, id);
        assert_eq!(uuid::Uuid::parse_str(&id).unwrap().get_version_num(), 4);
    }

    #[tokio::test]
    async fn responses_match_by_id_not_by_order() {
        let mut h = harness();
        let first = {
            let t = h.transport.clone();
            tokio::spawn(async move {
                t.send_and_await_response(
                    status_request().with_request_id("first"),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        let second = {
            let t = h.transport.clone();
            tokio::spawn(async move {
                t.send_and_await_response(
                    status_request().with_request_id("second"),
                    Duration::from_secs(5),
                )
                .await
            })
        };

        // Both requests are on the wire before either is answered.
        for _ in 0..2 {
            h.from_host.recv().await.unwrap().unwrap();
        }
        h.to_host.send(Ok(status_response("second"))).await.unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.request_id, "second");
        assert!(!first.is_finished());
        assert_eq!(h.transport.pending().len(), 1);

        h.to_host.send(Ok(status_response("first"))).await.unwrap();
        assert_eq!(first.await.unwrap().unwrap().request_id, "first");
        assert!(h.transport.pending().is_empty());
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let h = harness();
        let err = h
            .transport
            .send_and_await_response(status_request(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { after, .. } if after == Duration::from_millis(100)));
        assert!(h.transport.pending().is_empty());
    }

    #[tokio::test]
    async fn unmatched_messages_are_handed_on() {
        let mut h = harness();
        h.to_host.send(Ok(status_response("nobody"))).await.unwrap();
        let m = h.unsolicited.recv().await.unwrap();
        assert_eq!(m.request_id, "nobody");
    }

    #[tokio::test]
    async fn stream_end_fails_outstanding_requests() {
        let h = harness();
        let waiting = {
            let t = h.transport.clone();
            tokio::spawn(async move {
                t.send_and_await_response(status_request(), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(h.to_host);

        assert!(matches!(
            waiting.await.unwrap(),
            Err(Error::ChannelClosed { .. })
        ));
        assert!(h.transport.pending().is_closed());
        assert!(
            h.transport
                .send_and_await_response(status_request(), Duration::from_secs(1))
                .await
                .is_err()
        );
    }

    /// Fills the outbound buffer as a worker that stopped reading would.
    async fn fill_outbound(h: &Harness) {
        while h.transport.outbound.capacity() > 0 {
            h.transport
                .send(status_request(), Duration::from_secs(1))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn stalled_outbound_still_times_out() {
        let h = harness();
        fill_outbound(&h).await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            h.transport
                .send_and_await_response(status_request(), Duration::from_millis(100)),
        )
        .await
        .expect("request outlived its own timeout");
        assert!(matches!(outcome, Err(Error::Timeout { .. })), "{outcome:?}");
        assert!(h.transport.pending().is_empty());

        let err = h
            .transport
            .send(status_request(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn stalled_outbound_honors_cancel_and_close() {
        let h = harness();
        fill_outbound(&h).await;

        let token = CancellationToken::new();
        let cancelled = {
            let t = h.transport.clone();
            let token = token.clone();
            tokio::spawn(async move {
                t.send_and_await_cancellable(status_request(), Duration::from_secs(30), &token)
                    .await
            })
        };
        let closed = {
            let t = h.transport.clone();
            tokio::spawn(async move {
                t.send_and_await_response(status_request(), Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.transport.pending().len(), 2);

        token.cancel();
        assert_eq!(cancelled.await.unwrap().unwrap_err(), Error::RequestCancelled);
        h.transport.close();
        assert!(matches!(
            closed.await.unwrap(),
            Err(Error::ChannelClosed { .. })
        ));
        assert!(h.transport.pending().is_empty());
    }
}
