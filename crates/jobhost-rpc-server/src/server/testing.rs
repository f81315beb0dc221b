//! In-memory workers for unit tests.
//!
//! A fake worker answers the host over a pair of `mpsc` channels exactly like
//! a real worker would over gRPC: it acknowledges init with its capabilities,
//! loads every function except `broken`, and echoes invocation inputs back as
//! outputs (the first input doubles as the return value). An input named
//! `log` is written back as a user log line first; an input named `fail`
//! turns the response into a user-code failure.

use crate::server::{
    channel::{
        AttachedStream, ChannelOptions, ChannelParts, EventSender, WorkerChannel, WorkerEvent,
    },
    codec::Codec,
    dispatcher::ChannelFactory,
};
use jobhost_rpc_core::{
    Error, Result,
    proto::{
        FunctionLoadResponse, InvocationRequest, InvocationResponse, RpcException, RpcLog,
        StatusResult, StreamingMessage, WorkerInitResponse, WorkerStatusResponse, rpc_log,
        streaming_message::Content, typed_data::Data,
    },
    types::{
        HANDLES_INVOCATION_CANCEL_MESSAGE, HANDLES_WORKER_TERMINATE_MESSAGE,
        TYPED_DATA_COLLECTION, WORKER_STATUS,
    },
};
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub(crate) struct WorkerBehavior {
    pub fail_init: bool,
    /// Never answer `WorkerInitRequest`.
    pub silent: bool,
    /// Record invocations without answering them.
    pub hold_invocations: bool,
    /// Stop reading from the host after the first invocation, leaving the
    /// stream open.
    pub stall_on_invocation: bool,
    /// Capacity of the host-to-worker buffer.
    pub host_buffer: usize,
    pub capabilities: Vec<&'static str>,
}

impl Default for WorkerBehavior {
    fn default() -> Self {
        Self {
            fail_init: false,
            silent: false,
            hold_invocations: false,
            stall_on_invocation: false,
            host_buffer: 64,
            capabilities: vec![
                TYPED_DATA_COLLECTION,
                HANDLES_INVOCATION_CANCEL_MESSAGE,
                HANDLES_WORKER_TERMINATE_MESSAGE,
                WORKER_STATUS,
            ],
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Seen {
    invocations: usize,
    cancels: Vec<String>,
    terminated: bool,
}

/// Test handle on a running fake worker.
#[derive(Clone)]
pub(crate) struct FakeWorker {
    seen: watch::Receiver<Seen>,
    disconnect: CancellationToken,
}

impl FakeWorker {
    pub fn invocations_seen(&self) -> usize {
        self.seen.borrow().invocations
    }

    pub async fn wait_for_invocations(&self, n: usize) {
        let mut seen = self.seen.clone();
        let _ = seen.wait_for(|seen| seen.invocations >= n).await;
    }

    pub async fn wait_for_cancel(&self, invocation_id: &str) {
        let mut seen = self.seen.clone();
        let _ = seen
            .wait_for(|seen| seen.cancels.iter().any(|id| id == invocation_id))
            .await;
    }

    pub async fn wait_for_terminate(&self) {
        let mut seen = self.seen.clone();
        let _ = seen.wait_for(|seen| seen.terminated).await;
    }

    /// Drops the worker's end of the stream, as a crash would.
    pub fn disconnect(&self) {
        self.disconnect.cancel();
    }
}

pub(crate) fn spawn_fake_worker(
    worker_id: &str,
    behavior: WorkerBehavior,
) -> (AttachedStream, FakeWorker) {
    let (to_host, inbound) = mpsc::channel(64);
    let (outbound, mut from_host) = mpsc::channel(behavior.host_buffer);
    let (seen_tx, seen) = watch::channel(Seen::default());
    let disconnect = CancellationToken::new();

    let stop = disconnect.clone();
    tokio::spawn(async move {
        loop {
            let message: StreamingMessage = tokio::select! {
                () = stop.cancelled() => break,
                message = from_host.recv() => match message {
                    Some(Ok(message)) => message,
                    _ => break,
                },
            };
            let invocation = matches!(message.content, Some(Content::InvocationRequest(_)));
            for reply in respond(&behavior, &seen_tx, message) {
                if to_host.send(Ok(reply)).await.is_err() {
                    return;
                }
            }
            if invocation && behavior.stall_on_invocation {
                // Keep both ends alive without draining the host's writes.
                stop.cancelled().await;
                drop(from_host);
                return;
            }
        }
    });

    let stream = AttachedStream {
        worker_id: worker_id.to_owned(),
        inbound: Box::pin(ReceiverStream::new(inbound)),
        outbound,
    };
    (stream, FakeWorker { seen, disconnect })
}

fn respond(
    behavior: &WorkerBehavior,
    seen: &watch::Sender<Seen>,
    message: StreamingMessage,
) -> Vec<StreamingMessage> {
    let request_id = message.request_id;
    let reply = |content| vec![StreamingMessage::new(content).with_request_id(request_id.clone())];
    let Some(content) = message.content else {
        return Vec::new();
    };

    match content {
        Content::WorkerInitRequest(_) if behavior.silent => Vec::new(),
        Content::WorkerInitRequest(_) => reply(Content::WorkerInitResponse(WorkerInitResponse {
            worker_version: "1.0.0".to_owned(),
            capabilities: behavior
                .capabilities
                .iter()
                .map(|name| ((*name).to_owned(), "true".to_owned()))
                .collect(),
            result: Some(if behavior.fail_init {
                StatusResult::failure(RpcException {
                    message: "init refused".to_owned(),
                    ..Default::default()
                })
            } else {
                StatusResult::success()
            }),
        })),
        Content::FunctionLoadRequest(load) => {
            let result = if load.function_id == "broken" {
                StatusResult::failure(RpcException {
                    message: "SyntaxError: unexpected token".to_owned(),
                    ..Default::default()
                })
            } else {
                StatusResult::success()
            };
            reply(Content::FunctionLoadResponse(FunctionLoadResponse {
                function_id: load.function_id,
                result: Some(result),
            }))
        }
        Content::InvocationRequest(invocation) => {
            seen.send_modify(|seen| seen.invocations += 1);
            if behavior.hold_invocations {
                return Vec::new();
            }
            echo(invocation, request_id)
        }
        Content::InvocationCancel(cancel) => {
            seen.send_modify(|seen| seen.cancels.push(cancel.invocation_id));
            Vec::new()
        }
        Content::WorkerStatusRequest(_) => reply(Content::WorkerStatusResponse(WorkerStatusResponse {})),
        Content::WorkerTerminate(_) => {
            seen.send_modify(|seen| seen.terminated = true);
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn echo(invocation: InvocationRequest, request_id: String) -> Vec<StreamingMessage> {
    let input = |name: &str| {
        invocation
            .input_data
            .iter()
            .find(|binding| binding.name == name)
            .and_then(|binding| binding.data.as_ref())
            .and_then(|data| data.data.clone())
    };

    let mut replies = Vec::new();
    if let Some(Data::String(line)) = input("log") {
        replies.push(StreamingMessage::new(Content::RpcLog(RpcLog {
            invocation_id: invocation.invocation_id.clone(),
            category: "Function.User".to_owned(),
            level: rpc_log::Level::Information as i32,
            message: line,
            log_category: rpc_log::RpcLogCategory::User as i32,
            ..Default::default()
        })));
    }
    let result = match input("fail") {
        Some(Data::String(message)) => StatusResult::failure(RpcException {
            message,
            r#type: "Error".to_owned(),
            is_user_exception: true,
            ..Default::default()
        }),
        _ => StatusResult::success(),
    };

    replies.push(
        StreamingMessage::new(Content::InvocationResponse(InvocationResponse {
            invocation_id: invocation.invocation_id,
            return_value: invocation
                .input_data
                .first()
                .and_then(|binding| binding.data.clone()),
            output_data: invocation.input_data,
            result: Some(result),
        }))
        .with_request_id(request_id),
    );
    replies
}

fn channel_for(
    worker_id: &str,
    stream: AttachedStream,
    options: ChannelOptions,
    events: EventSender,
) -> Arc<WorkerChannel> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(stream);
    WorkerChannel::new(ChannelParts {
        worker_id: worker_id.to_owned(),
        language: "echo".to_owned(),
        process: None,
        stream: rx,
        registry: None,
        codec: Arc::new(Codec::new()),
        options,
        events,
    })
}

/// An unstarted `echo` channel already connected to a fake worker.
pub(crate) fn fake_channel(
    worker_id: &str,
    behavior: WorkerBehavior,
    options: ChannelOptions,
) -> (
    Arc<WorkerChannel>,
    FakeWorker,
    mpsc::UnboundedReceiver<WorkerEvent>,
) {
    let (stream, worker) = spawn_fake_worker(worker_id, behavior);
    let (events, events_rx) = mpsc::unbounded_channel();
    let channel = channel_for(worker_id, stream, options, events);
    (channel, worker, events_rx)
}

/// Hands out channels backed by fake workers.
pub(crate) struct FakeFactory {
    behavior: WorkerBehavior,
    /// Behavior of every worker after the first.
    replacement: Option<WorkerBehavior>,
    options: ChannelOptions,
    /// Number of leading `create` calls that fail.
    failing: usize,
    created: AtomicUsize,
    workers: Mutex<Vec<FakeWorker>>,
}

impl FakeFactory {
    pub fn new(behavior: WorkerBehavior) -> Self {
        Self {
            behavior,
            replacement: None,
            options: ChannelOptions::default(),
            failing: 0,
            created: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_options(mut self, options: ChannelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn then(mut self, behavior: WorkerBehavior) -> Self {
        self.replacement = Some(behavior);
        self
    }

    pub fn failing_creates(mut self, n: usize) -> Self {
        self.failing = n;
        self
    }

    /// Calls to `create`, failed ones included.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn workers(&self) -> Vec<FakeWorker> {
        self.workers.lock().clone()
    }
}

impl ChannelFactory for FakeFactory {
    fn create(&self, language: &str, events: EventSender) -> Result<Arc<WorkerChannel>> {
        assert_eq!(language, "echo");
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        if n < self.failing {
            return Err(Error::WorkerStart {
                reason: format!("fake create {n} refused"),
            });
        }
        let worker_id = format!("fake-{n}");
        let behavior = match (&self.replacement, self.workers.lock().is_empty()) {
            (Some(replacement), false) => replacement.clone(),
            _ => self.behavior.clone(),
        };
        let (stream, worker) = spawn_fake_worker(&worker_id, behavior);
        self.workers.lock().push(worker);
        Ok(channel_for(&worker_id, stream, self.options.clone(), events))
    }
}
