//! One live connection to one worker process.
//!
//! A [`WorkerChannel`] owns the worker's process (when the host launched
//! one), the transport over its stream, the capabilities it negotiated and
//! the invocations currently executing on it. Lifecycle:
//!
//! ```text
//! Created -> Initializing -> Ready <-> Invoking -> ShuttingDown -> Disposed
//! ```
//!
//! Once ready, a monitor task watches the process and the stream. The first
//! of process exit or stream loss is reported to the dispatcher as a
//! [`WorkerEvent`]; nothing is reported for a channel the host is disposing.

use super::{
    registry::StreamRegistry,
    transport::{AttachedStream, RpcTransport, read_loop},
};
use crate::server::{
    capabilities::Capabilities,
    codec::Codec,
    dispatcher::invocation::{InvocationContext, InvocationLogs, InvocationOutput, UserLog},
    metadata::FunctionMetadata,
    process::{ExitDisposition, ExitSignal, ProcessExit, WorkerProcess},
    telemetry::{
        decrement_ready_workers, increment_invocation_failures, increment_invocations,
        increment_ready_workers, record_invocation_duration,
    },
};
use core::time::Duration;
use jobhost_rpc_core::{
    Error, Result,
    proto::{
        FunctionLoadRequest, InvocationCancel, InvocationRequest, RpcException, RpcLog,
        StatusResult, StreamingMessage, WorkerInitRequest, WorkerStatusRequest, WorkerTerminate,
        rpc_log, status_result, streaming_message::Content,
    },
    types::{
        DEFAULT_INVOCATION_TIMEOUT, DEFAULT_PROCESS_START_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
        DEFAULT_WORKER_INIT_TIMEOUT, HANDLES_INVOCATION_CANCEL_MESSAGE,
        HANDLES_WORKER_TERMINATE_MESSAGE, IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS,
        PROCESS_EXIT_TIMEOUT, RAW_HTTP_BODY_BYTES, RPC_HTTP_BODY_ONLY, TYPED_DATA_COLLECTION,
        USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP, WORKER_STATUS,
    },
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub host_version: String,
    pub worker_directory: String,
    pub function_app_directory: String,
    /// From process start until the worker's `StartStream`.
    pub process_start_timeout: Duration,
    pub init_timeout: Duration,
    /// Function loads and status requests.
    pub request_timeout: Duration,
    pub invocation_timeout: Duration,
    /// How long a worker told to terminate may take before it is killed.
    pub terminate_grace_period: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            host_version: env!("CARGO_PKG_VERSION").to_owned(),
            worker_directory: String::new(),
            function_app_directory: String::new(),
            process_start_timeout: DEFAULT_PROCESS_START_TIMEOUT,
            init_timeout: DEFAULT_WORKER_INIT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            terminate_grace_period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Initializing,
    Ready,
    /// Ready, with at least one invocation executing.
    Invoking,
    ShuttingDown,
    Disposed,
}

/// Something happened to a worker that the dispatcher must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The worker crashed, its stream broke or its startup failed.
    Error {
        worker_id: String,
        language: String,
        error: Error,
    },
    /// The worker exited asking for a replacement.
    Restart { worker_id: String, language: String },
    /// The worker exited cleanly.
    Closed { worker_id: String, language: String },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            Self::Error { worker_id, .. }
            | Self::Restart { worker_id, .. }
            | Self::Closed { worker_id, .. } => worker_id,
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub state: ChannelState,
    /// Round trip of a status request; `None` when the worker does not answer
    /// status requests.
    pub latency: Option<Duration>,
}

/// Everything a new channel is built from.
pub struct ChannelParts {
    pub worker_id: String,
    pub language: String,
    /// The process to launch, or `None` for a worker started elsewhere.
    pub process: Option<WorkerProcess>,
    /// Where the worker's stream will be delivered once it connects.
    pub stream: oneshot::Receiver<AttachedStream>,
    /// Reservation to release when the channel goes away.
    pub registry: Option<StreamRegistry>,
    pub codec: Arc<Codec>,
    pub options: ChannelOptions,
    pub events: EventSender,
}

struct Executing {
    function_name: String,
    logs: InvocationLogs,
}

pub struct WorkerChannel {
    worker_id: String,
    language: String,
    executable: String,
    options: ChannelOptions,
    codec: Arc<Codec>,
    events: EventSender,
    registry: Option<StreamRegistry>,
    state: Mutex<ChannelState>,
    capabilities: OnceLock<Capabilities>,
    process: tokio::sync::Mutex<Option<WorkerProcess>>,
    stream: Mutex<Option<oneshot::Receiver<AttachedStream>>>,
    transport: OnceLock<Arc<RpcTransport>>,
    functions: RwLock<HashMap<String, Arc<FunctionMetadata>>>,
    load_errors: RwLock<HashMap<String, Error>>,
    executing: Mutex<HashMap<String, Executing>>,
    executing_count: watch::Sender<usize>,
    stop: CancellationToken,
}

impl WorkerChannel {
    pub fn new(parts: ChannelParts) -> Arc<Self> {
        let executable = parts
            .process
            .as_ref()
            .map_or_else(|| parts.language.clone(), WorkerProcess::executable);
        Arc::new(Self {
            executable,
            worker_id: parts.worker_id,
            language: parts.language,
            options: parts.options,
            codec: parts.codec,
            events: parts.events,
            registry: parts.registry,
            state: Mutex::new(ChannelState::Created),
            capabilities: OnceLock::new(),
            process: tokio::sync::Mutex::new(parts.process),
            stream: Mutex::new(Some(parts.stream)),
            transport: OnceLock::new(),
            functions: RwLock::new(HashMap::new()),
            load_errors: RwLock::new(HashMap::new()),
            executing: Mutex::new(HashMap::new()),
            executing_count: watch::Sender::new(0),
            stop: CancellationToken::new(),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn state(&self) -> ChannelState {
        let state = *self.state.lock();
        if state == ChannelState::Ready && *self.executing_count.borrow() > 0 {
            ChannelState::Invoking
        } else {
            state
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state(), ChannelState::Ready | ChannelState::Invoking)
    }

    /// Capabilities negotiated in the init handshake. Empty before that.
    pub fn capabilities(&self) -> &Capabilities {
        static NONE: OnceLock<Capabilities> = OnceLock::new();
        self.capabilities
            .get()
            .unwrap_or_else(|| NONE.get_or_init(Capabilities::default))
    }

    pub fn get_capability_state(&self, name: &str) -> Option<&str> {
        self.capabilities().get_capability_state(name)
    }

    /// Starts the process (if any), waits for its stream and runs the init
    /// handshake. On success the channel is `Ready`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker_id = %self.worker_id)))]
    pub async fn start_worker_process(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != ChannelState::Created {
                return Err(Error::WorkerStart {
                    reason: format!("channel {} already started", self.worker_id),
                });
            }
            *state = ChannelState::Initializing;
        }

        let exit = {
            let mut process = self.process.lock().await;
            match process.as_mut() {
                Some(process) => {
                    process.start().await?;
                    Some(process.exit_signal())
                }
                None => None,
            }
        };

        let attached = self.await_stream(exit.clone()).await?;
        let transport = Arc::new(RpcTransport::new(
            self.worker_id.clone(),
            attached.outbound,
        ));
        // Start is guarded by the state check above, so this is the only set.
        let _ = self.transport.set(transport.clone());

        let stream_closed = CancellationToken::new();
        {
            let weak = Arc::downgrade(self);
            let transport = transport.clone();
            let stop = self.stop.clone();
            let stream_closed = stream_closed.clone();
            tokio::spawn(async move {
                read_loop(attached.inbound, transport, stop, move |message| {
                    if let Some(channel) = Weak::upgrade(&weak) {
                        channel.on_unsolicited(message);
                    }
                })
                .await;
                stream_closed.cancel();
            });
        }

        self.initialize(&transport, exit.clone()).await?;

        {
            let mut state = self.state.lock();
            if *state != ChannelState::Initializing {
                return Err(Error::ServiceShutdown);
            }
            *state = ChannelState::Ready;
        }
        increment_ready_workers();

        #[cfg(feature = "tracing")]
        tracing::info!(
            language = %self.language,
            capabilities = self.capabilities().len(),
            "Worker channel ready"
        );

        tokio::spawn(Arc::clone(self).monitor(exit, stream_closed));
        Ok(())
    }

    async fn await_stream(&self, exit: Option<ExitSignal>) -> Result<AttachedStream> {
        let stream = self
            .stream
            .lock()
            .take()
            .ok_or_else(|| Error::WorkerStart {
                reason: "worker stream already claimed".to_owned(),
            })?;
        let timeout = self.options.process_start_timeout;

        tokio::select! {
            res = tokio::time::timeout(timeout, stream) => match res {
                Ok(Ok(attached)) => Ok(attached),
                Ok(Err(_)) => Err(Error::WorkerStart {
                    reason: "stream reservation was dropped".to_owned(),
                }),
                Err(_) => Err(Error::Timeout {
                    operation: "StartStream".to_owned(),
                    after: timeout,
                }),
            },
            exit = wait_exit(exit) => Err(self.exit_error(&exit)),
            () = self.stop.cancelled() => Err(Error::ServiceShutdown),
        }
    }

    async fn initialize(&self, transport: &RpcTransport, exit: Option<ExitSignal>) -> Result<()> {
        let request = StreamingMessage::new(Content::WorkerInitRequest(WorkerInitRequest {
            host_version: self.options.host_version.clone(),
            capabilities: host_capabilities(),
            worker_directory: self.options.worker_directory.clone(),
            function_app_directory: self.options.function_app_directory.clone(),
        }));

        let response = tokio::select! {
            res = transport.send_and_await_response(request, self.options.init_timeout) => res?,
            exit = wait_exit(exit) => return Err(self.exit_error(&exit)),
        };

        let Some(Content::WorkerInitResponse(init)) = response.content else {
            return Err(Error::WorkerInit {
                reason: format!("expected WorkerInitResponse, got {}", response.kind()),
            });
        };
        if let Err(exception) = check_status(init.result.as_ref()) {
            return Err(Error::WorkerInit {
                reason: exception.map_or_else(|| "no reason given".to_owned(), |e| e.message),
            });
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(worker_version = %init.worker_version, "Worker initialized");
        let _ = self.capabilities.set(Capabilities::new(init.capabilities));
        Ok(())
    }

    async fn monitor(self: Arc<Self>, exit: Option<ExitSignal>, stream_closed: CancellationToken) {
        let event = tokio::select! {
            () = self.stop.cancelled() => return,
            exit = wait_exit(exit.clone()) => self.exit_event(&exit),
            () = stream_closed.cancelled() => {
                // The process exit usually trails the stream; prefer its code.
                match exit {
                    Some(signal) => match tokio::time::timeout(PROCESS_EXIT_TIMEOUT, signal.wait()).await {
                        Ok(exit) => self.exit_event(&exit),
                        Err(_) => self.stream_lost(),
                    },
                    None => self.stream_lost(),
                }
            }
        };
        if self.stop.is_cancelled() || self.is_disposing() {
            return;
        }
        if let Some(transport) = self.transport.get() {
            transport.close();
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(worker_id = %self.worker_id, event = ?event, "Worker channel lost");
        let _ = self.events.send(event);
    }

    fn is_disposing(&self) -> bool {
        matches!(
            *self.state.lock(),
            ChannelState::ShuttingDown | ChannelState::Disposed
        )
    }

    fn stream_lost(&self) -> WorkerEvent {
        WorkerEvent::Error {
            worker_id: self.worker_id.clone(),
            language: self.language.clone(),
            error: Error::ChannelClosed {
                worker_id: self.worker_id.clone(),
            },
        }
    }

    fn exit_error(&self, exit: &ProcessExit) -> Error {
        match exit.disposition(&self.executable) {
            ExitDisposition::Failed(error) => error,
            ExitDisposition::Closed | ExitDisposition::Restart => Error::WorkerStart {
                reason: format!(
                    "worker {} exited with code {:?} before it was ready",
                    self.worker_id, exit.code
                ),
            },
        }
    }

    fn exit_event(&self, exit: &ProcessExit) -> WorkerEvent {
        let worker_id = self.worker_id.clone();
        let language = self.language.clone();
        match exit.disposition(&self.executable) {
            ExitDisposition::Closed => WorkerEvent::Closed {
                worker_id,
                language,
            },
            ExitDisposition::Restart => WorkerEvent::Restart {
                worker_id,
                language,
            },
            ExitDisposition::Failed(error) => WorkerEvent::Error {
                worker_id,
                language,
                error,
            },
        }
    }

    fn ready_transport(&self) -> Result<Arc<RpcTransport>> {
        match (self.is_ready(), self.transport.get()) {
            (true, Some(transport)) => Ok(transport.clone()),
            _ => Err(Error::ChannelClosed {
                worker_id: self.worker_id.clone(),
            }),
        }
    }

    /// Registers the functions this channel accepts invocations for.
    pub fn setup_function_invocation_buffers(&self, functions: &[Arc<FunctionMetadata>]) {
        let mut buffers = self.functions.write();
        for function in functions {
            buffers.insert(function.function_id.clone(), Arc::clone(function));
        }
    }

    /// Sends one load request per registered function and records the
    /// failures; they are replayed to every invocation of that function.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker_id = %self.worker_id)))]
    pub async fn send_function_load_requests(&self) -> Result<()> {
        let transport = self.ready_transport()?;
        let functions: Vec<_> = self.functions.read().values().cloned().collect();

        let loads = functions.iter().map(|function| {
            let transport = &transport;
            async move {
                let request = StreamingMessage::new(Content::FunctionLoadRequest(
                    FunctionLoadRequest {
                        function_id: function.function_id.clone(),
                        metadata: Some(function.to_rpc()),
                    },
                ));
                let res = transport
                    .send_and_await_response(request, self.options.request_timeout)
                    .await;
                (function.function_id.clone(), res)
            }
        });

        for (function_id, res) in futures::future::join_all(loads).await {
            let message = match res {
                Ok(StreamingMessage {
                    content: Some(Content::FunctionLoadResponse(load)),
                    ..
                }) => match check_status(load.result.as_ref()) {
                    Ok(()) => continue,
                    Err(exception) => {
                        exception.map_or_else(|| "load failed".to_owned(), |e| e.message)
                    }
                },
                Ok(other) => format!("expected FunctionLoadResponse, got {}", other.kind()),
                Err(e @ Error::ChannelClosed { .. }) => return Err(e),
                Err(e) => e.to_string(),
            };

            #[cfg(feature = "tracing")]
            tracing::warn!(%function_id, %message, "Function failed to load");
            self.load_errors.write().insert(
                function_id.clone(),
                Error::FunctionLoad {
                    function_id,
                    message,
                },
            );
        }
        Ok(())
    }

    pub fn load_error(&self, function_id: &str) -> Option<Error> {
        self.load_errors.read().get(function_id).cloned()
    }

    /// Sends an invocation. The result is delivered through the context's
    /// result slot once the worker answers, the invocation times out, is
    /// cancelled, or the channel goes away.
    ///
    /// Returns an error only when the invocation could not be handed to this
    /// channel; the result slot carries the same error.
    pub async fn send_invocation_request(self: &Arc<Self>, mut ctx: InvocationContext) -> Result<()> {
        if ctx.cancellation.is_cancelled() {
            ctx.complete(Err(Error::RequestCancelled));
            return Ok(());
        }

        let function_id = ctx.function.function_id.clone();
        if let Some(error) = self.load_error(&function_id) {
            ctx.complete(Err(error));
            return Ok(());
        }
        if !self.functions.read().contains_key(&function_id) {
            let error = Error::FunctionNotLoaded {
                function_id,
                worker_id: self.worker_id.clone(),
            };
            ctx.complete(Err(error.clone()));
            return Err(error);
        }
        let transport = match self.ready_transport() {
            Ok(transport) => transport,
            Err(error) => {
                ctx.complete(Err(error.clone()));
                return Err(error);
            }
        };

        let capabilities = self.capabilities();
        let request = InvocationRequest {
            invocation_id: ctx.invocation_id.clone(),
            function_id,
            input_data: self.codec.encode_bindings(&ctx.inputs, capabilities),
            trigger_metadata: self.codec.encode_map(&ctx.trigger_metadata, capabilities),
        };

        self.executing.lock().insert(
            ctx.invocation_id.clone(),
            Executing {
                function_name: ctx.function.name.clone(),
                logs: ctx.logs().clone(),
            },
        );
        self.executing_count.send_modify(|n| *n += 1);
        increment_invocations();

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = channel
                .execute(&transport, request, &ctx.cancellation)
                .await;

            record_invocation_duration(started.elapsed().as_secs_f64() * 1000.0);
            if outcome.is_err() {
                increment_invocation_failures();
            }
            channel.finish(&ctx.invocation_id);
            ctx.complete(outcome);
        });
        Ok(())
    }

    async fn execute(
        &self,
        transport: &RpcTransport,
        request: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationOutput> {
        let invocation_id = request.invocation_id.clone();
        let message = StreamingMessage::new(Content::InvocationRequest(request));
        let response = match transport
            .send_and_await_cancellable(message, self.options.invocation_timeout, cancel)
            .await
        {
            Ok(response) => response,
            Err(Error::RequestCancelled) => {
                if self.capabilities().handles_invocation_cancel() {
                    let notice = StreamingMessage::new(Content::InvocationCancel(InvocationCancel {
                        invocation_id,
                        grace_period: None,
                    }));
                    if let Err(_e) = transport.send(notice, self.options.request_timeout).await {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(error = %_e, "Could not send InvocationCancel");
                    }
                }
                return Err(Error::RequestCancelled);
            }
            Err(e) => return Err(e),
        };

        let Some(Content::InvocationResponse(response)) = response.content else {
            return Err(Error::channel(format!(
                "expected InvocationResponse, got {}",
                response.kind()
            )));
        };

        match status_of(response.result.as_ref()) {
            status_result::Status::Success => Ok(InvocationOutput {
                outputs: self.codec.decode_bindings(&response.output_data)?,
                return_value: response
                    .return_value
                    .as_ref()
                    .map(|value| self.codec.from_wire(value))
                    .transpose()?,
            }),
            status_result::Status::Cancelled => Err(Error::RequestCancelled),
            status_result::Status::Failure => Err(invocation_error(
                response.result.and_then(|result| result.exception),
            )),
        }
    }

    fn finish(&self, invocation_id: &str) {
        if self.executing.lock().remove(invocation_id).is_some() {
            self.executing_count.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    pub fn is_executing_invocation(&self, invocation_id: &str) -> bool {
        self.executing.lock().contains_key(invocation_id)
    }

    pub fn executing_invocations(&self) -> usize {
        *self.executing_count.borrow()
    }

    /// Resolves once no invocation is executing on this channel.
    pub async fn drain_invocations(&self) {
        let mut rx = self.executing_count.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub async fn get_worker_status(&self) -> Result<WorkerStatus> {
        let transport = self.ready_transport()?;
        let latency = if self.capabilities().worker_status() {
            let started = Instant::now();
            let request = StreamingMessage::new(Content::WorkerStatusRequest(WorkerStatusRequest {}));
            let response = transport
                .send_and_await_response(request, self.options.request_timeout)
                .await?;
            if !matches!(response.content, Some(Content::WorkerStatusResponse(_))) {
                return Err(Error::channel(format!(
                    "expected WorkerStatusResponse, got {}",
                    response.kind()
                )));
            }
            Some(started.elapsed())
        } else {
            None
        };
        Ok(WorkerStatus {
            worker_id: self.worker_id.clone(),
            state: self.state(),
            latency,
        })
    }

    fn on_unsolicited(&self, message: StreamingMessage) {
        match message.content {
            Some(Content::RpcLog(log)) => self.on_log(log),
            _other => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    worker_id = %self.worker_id,
                    request_id = %message.request_id,
                    kind = _other.as_ref().map_or("Empty", Content::kind),
                    "Dropping message with no waiter"
                );
            }
        }
    }

    fn on_log(&self, log: RpcLog) {
        let level = rpc_log::Level::try_from(log.level).unwrap_or(rpc_log::Level::Information);
        let system = log.log_category == rpc_log::RpcLogCategory::System as i32;

        if system {
            log_at(level, &self.worker_id, None, &log.category, &log.message);
            return;
        }

        let executing = self.executing.lock();
        let Some(invocation) = executing.get(&log.invocation_id) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(invocation_id = %log.invocation_id, "Dropping log for unknown invocation");
            return;
        };
        log_at(
            level,
            &self.worker_id,
            Some((&invocation.function_name, &log.invocation_id)),
            &log.category,
            &log.message,
        );
        invocation.logs.push(UserLog {
            level,
            category: log.category,
            message: crate::server::process::sanitize(&log.message),
        });
    }

    /// Stops the worker: fails everything still pending, asks the worker to
    /// terminate when it understands that, then kills the process. Bounded
    /// by the terminate grace period plus the kill wait, even when the worker
    /// no longer reads its stream.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(worker_id = %self.worker_id)))]
    pub async fn dispose(&self) {
        let was_ready = {
            let mut state = self.state.lock();
            if matches!(*state, ChannelState::ShuttingDown | ChannelState::Disposed) {
                return;
            }
            let was_ready = *state == ChannelState::Ready;
            *state = ChannelState::ShuttingDown;
            was_ready
        };
        if was_ready {
            decrement_ready_workers();
        }

        self.stop.cancel();
        let transport = self.transport.get();
        if let Some(transport) = transport {
            transport.close();
        }

        let process = self.process.lock().await;
        if let Some(transport) = transport.filter(|_| self.capabilities().handles_worker_terminate()) {
            let grace = self.options.terminate_grace_period;
            let deadline = Instant::now() + grace;
            let terminate = StreamingMessage::new(Content::WorkerTerminate(WorkerTerminate {
                grace_period: prost_types::Duration::try_from(grace).ok(),
            }));
            match (transport.send(terminate, grace).await, process.as_ref()) {
                (Ok(_), Some(process)) => {
                    process
                        .wait_for_exit(deadline.saturating_duration_since(Instant::now()))
                        .await;
                }
                (Ok(_), None) => {}
                (Err(_e), _) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_e, "Could not send WorkerTerminate");
                }
            }
        }

        if let Some(process) = process.as_ref() {
            process.kill().await;
        }
        if let Some(registry) = &self.registry {
            registry.forget(&self.worker_id);
        }

        *self.state.lock() = ChannelState::Disposed;
        #[cfg(feature = "tracing")]
        tracing::info!("Worker channel disposed");
    }
}

async fn wait_exit(exit: Option<ExitSignal>) -> ProcessExit {
    match exit {
        Some(signal) => signal.wait().await,
        None => std::future::pending().await,
    }
}

/// Capabilities the host announces in `WorkerInitRequest`.
fn host_capabilities() -> HashMap<String, String> {
    [
        RAW_HTTP_BODY_BYTES,
        RPC_HTTP_BODY_ONLY,
        TYPED_DATA_COLLECTION,
        IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS,
        USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP,
        HANDLES_WORKER_TERMINATE_MESSAGE,
        HANDLES_INVOCATION_CANCEL_MESSAGE,
        WORKER_STATUS,
    ]
    .into_iter()
    .map(|name| (name.to_owned(), "true".to_owned()))
    .collect()
}

/// A missing result counts as success.
fn status_of(result: Option<&StatusResult>) -> status_result::Status {
    result.map_or(status_result::Status::Success, |result| {
        status_result::Status::try_from(result.status).unwrap_or(status_result::Status::Failure)
    })
}

fn check_status(result: Option<&StatusResult>) -> core::result::Result<(), Option<RpcException>> {
    match status_of(result) {
        status_result::Status::Success => Ok(()),
        _ => Err(result.and_then(|result| result.exception.clone())),
    }
}

fn invocation_error(exception: Option<RpcException>) -> Error {
    let exception = exception.unwrap_or_default();
    Error::Invocation {
        message: exception.message,
        stack_trace: exception.stack_trace,
        type_name: exception.r#type,
        is_user_exception: exception.is_user_exception,
    }
}

fn log_at(
    level: rpc_log::Level,
    worker_id: &str,
    invocation: Option<(&str, &str)>,
    category: &str,
    message: &str,
) {
    #[cfg(feature = "tracing")]
    {
        let (function, invocation_id) = invocation.unwrap_or_default();
        macro_rules! emit {
            ($mac:ident) => {
                tracing::$mac!(
                    worker_id,
                    function,
                    invocation_id,
                    category,
                    "{}",
                    crate::server::process::sanitize(message)
                )
            };
        }
        match level {
            rpc_log::Level::Trace => emit!(trace),
            rpc_log::Level::Debug => emit!(debug),
            rpc_log::Level::Information => emit!(info),
            rpc_log::Level::Warning => emit!(warn),
            rpc_log::Level::Error | rpc_log::Level::Critical => emit!(error),
            rpc_log::Level::None => {}
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (level, worker_id, invocation, category, message);
}
