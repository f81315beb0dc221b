//! The invocation dispatcher.
//!
//! [`FunctionDispatcher`] owns the channel pool of the active worker runtime,
//! starts workers on demand, routes invocations to ready channels and
//! recovers from worker failures. Worker events are consumed by a background
//! loop; each event is handled on its own task so a slow restart never holds
//! up the next event. Restarts themselves are serialized.

use super::{
    factory::ChannelFactory,
    invocation::{InvocationContext, InvocationOutput},
    state::{DispatcherState, ErrorBucket},
    wait::{WaitOutcome, delay_until_initialized_or_shutdown, readiness_deadline},
};
use crate::server::{
    channel::{EventSender, WorkerEvent, WorkerStatus},
    codec::HostValue,
    metadata::FunctionMetadata,
    pool::ChannelPool,
    telemetry::increment_worker_restarts,
};
use core::time::Duration;
use jobhost_rpc_core::{
    Error, Result,
    types::{DEFAULT_PROCESS_START_TIMEOUT, DEFAULT_READY_POLL_INTERVAL},
};
use parking_lot::{Mutex, RwLock};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Hook through which the dispatcher stops the whole host.
pub trait ApplicationLifetime: Send + Sync {
    fn stop_application(&self);
}

/// Stops the host by cancelling a token the binary waits on.
impl ApplicationLifetime for CancellationToken {
    fn stop_application(&self) {
        self.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Language of the workers this dispatcher runs.
    pub worker_runtime: String,
    pub process_count: usize,
    pub max_process_count: usize,
    pub process_startup_interval: Duration,
    pub process_restart_interval: Duration,
    /// Upper bound on draining invocations at shutdown.
    pub process_shutdown_timeout: Duration,
    pub process_start_timeout: Duration,
    pub ready_poll_interval: Duration,
    /// Worker errors tolerated before giving up. Defaults to three per
    /// allowed process.
    pub error_events_threshold: Option<usize>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            worker_runtime: String::new(),
            process_count: 1,
            max_process_count: 10,
            process_startup_interval: Duration::from_secs(10),
            process_restart_interval: Duration::from_secs(10),
            process_shutdown_timeout: Duration::from_secs(10),
            process_start_timeout: DEFAULT_PROCESS_START_TIMEOUT,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            error_events_threshold: None,
        }
    }
}

impl DispatcherOptions {
    pub fn error_events_threshold(&self) -> usize {
        self.error_events_threshold
            .unwrap_or_else(|| self.max_process_count.saturating_mul(3))
    }
}

struct Inner {
    options: DispatcherOptions,
    factory: Arc<dyn ChannelFactory>,
    lifetime: Arc<dyn ApplicationLifetime>,
    state: RwLock<DispatcherState>,
    pool: ChannelPool,
    functions: RwLock<Vec<Arc<FunctionMetadata>>>,
    errors: Mutex<ErrorBucket>,
    restart_lock: tokio::sync::Mutex<()>,
    events: EventSender,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    application_stopped: AtomicBool,
    stop: CancellationToken,
}

/// Entry point of the host for running functions on out-of-process workers.
#[derive(Clone)]
pub struct FunctionDispatcher {
    inner: Arc<Inner>,
}

impl FunctionDispatcher {
    pub fn new(
        options: DispatcherOptions,
        factory: Arc<dyn ChannelFactory>,
        lifetime: Arc<dyn ApplicationLifetime>,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                options,
                factory,
                lifetime,
                state: RwLock::new(DispatcherState::Default),
                pool: ChannelPool::new(),
                functions: RwLock::new(Vec::new()),
                errors: Mutex::new(ErrorBucket::default()),
                restart_lock: tokio::sync::Mutex::new(()),
                events,
                event_rx: Mutex::new(Some(event_rx)),
                application_stopped: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.pool.len()
    }

    /// Channels of the active runtime that are ready for invocations.
    pub fn ready_count(&self) -> usize {
        self.inner.pool.ready_count(&self.inner.options.worker_runtime)
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionMetadata>> {
        self.inner
            .functions
            .read()
            .iter()
            .find(|function| function.name == name || function.function_id == name)
            .cloned()
    }

    /// Registers the indexed functions and, when any of them runs on the
    /// configured runtime, starts its workers in the background.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub fn initialize(&self, functions: Vec<FunctionMetadata>) {
        self.inner.spawn_event_loop();
        *self.inner.functions.write() = functions.into_iter().map(Arc::new).collect();

        let runtime_functions = self.inner.runtime_functions().len();
        #[cfg(feature = "tracing")]
        tracing::info!(
            runtime = %self.inner.options.worker_runtime,
            functions = runtime_functions,
            "Function dispatcher initialized"
        );
        if runtime_functions > 0 {
            self.inner.begin_start();
        }
    }

    /// Hands an invocation to a ready worker of the function's language.
    ///
    /// Waits for the dispatcher to become ready first. The result is
    /// delivered through the context's result slot; every error returned here
    /// has also been written there.
    pub async fn invoke(&self, mut ctx: InvocationContext) -> Result<()> {
        let inner = &self.inner;
        let language = ctx.function.language().to_owned();
        if language != inner.options.worker_runtime {
            return fail(&mut ctx, Error::NoWorkerAvailable { language });
        }
        if inner.state() == DispatcherState::Default {
            inner.begin_start();
        }

        let deadline = readiness_deadline(
            inner.options.error_events_threshold(),
            inner.options.process_start_timeout,
        );
        match delay_until_initialized_or_shutdown(
            || inner.state(),
            inner.options.ready_poll_interval,
            deadline,
        )
        .await
        {
            WaitOutcome::Ready => {}
            WaitOutcome::Shutdown => return fail(&mut ctx, Error::ServiceShutdown),
            WaitOutcome::TimedOut => {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    ?deadline,
                    "Worker runtime never became ready; stopping the host"
                );
                inner.stop_application();
                return fail(
                    &mut ctx,
                    Error::Timeout {
                        operation: "dispatcher initialization".to_owned(),
                        after: deadline,
                    },
                );
            }
        }

        match inner.pool.next_ready(&language) {
            Some(channel) => channel.send_invocation_request(ctx).await,
            None => fail(&mut ctx, Error::NoWorkerAvailable { language }),
        }
    }

    /// Invokes `function` by name and waits for its outputs.
    pub async fn invoke_function(
        &self,
        function: &str,
        inputs: Vec<(String, HostValue)>,
    ) -> Result<InvocationOutput> {
        let metadata = self.function(function).ok_or_else(|| Error::InvalidRequest {
            reason: format!("unknown function {function}"),
        })?;
        let (ctx, pending) = InvocationContext::new(metadata, inputs);
        // The same error reaches the result slot.
        let _ = self.invoke(ctx).await;
        pending.result().await
    }

    pub async fn worker_statuses(&self) -> Vec<WorkerStatus> {
        let channels: Vec<_> = self
            .inner
            .pool
            .channels()
            .into_iter()
            .filter(|channel| channel.is_ready())
            .collect();
        let requests = channels.iter().map(|channel| channel.get_worker_status());

        futures::future::join_all(requests)
            .await
            .into_iter()
            .filter_map(|status| match status {
                Ok(status) => Some(status),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_e, "Worker status request failed");
                    None
                }
            })
            .collect()
    }

    /// Restarts the worker executing `invocation_id`. Returns whether such a
    /// worker was found.
    pub async fn restart_worker_with_invocation_id(&self, invocation_id: &str) -> bool {
        let Some(channel) = self.inner.pool.find_by_invocation(invocation_id) else {
            return false;
        };
        #[cfg(feature = "tracing")]
        tracing::info!(worker_id = %channel.worker_id(), %invocation_id, "Restarting worker on request");
        Arc::clone(&self.inner)
            .dispose_and_restart(channel.worker_id().to_owned(), channel.language().to_owned())
            .await;
        true
    }

    /// Stops accepting invocations, drains the in-flight ones and disposes
    /// every channel.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.write();
            if *state == DispatcherState::Disposed {
                return;
            }
            *state = DispatcherState::Disposed;
        }
        self.inner.stop.cancel();
        self.inner
            .pool
            .shutdown(self.inner.options.process_shutdown_timeout)
            .await;
    }
}

fn fail(ctx: &mut InvocationContext, error: Error) -> Result<()> {
    ctx.complete(Err(error.clone()));
    Err(error)
}

impl Inner {
    fn state(&self) -> DispatcherState {
        *self.state.read()
    }

    /// Moves to `next` unless the dispatcher has been disposed.
    fn set_state(&self, next: DispatcherState) {
        let mut state = self.state.write();
        if *state != DispatcherState::Disposed {
            *state = next;
        }
    }

    fn is_disposed(&self) -> bool {
        self.state() == DispatcherState::Disposed
    }

    fn runtime_functions(&self) -> Vec<Arc<FunctionMetadata>> {
        self.functions
            .read()
            .iter()
            .filter(|function| function.language() == self.options.worker_runtime)
            .cloned()
            .collect()
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.event_rx.lock().take() else {
            return;
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = inner.stop.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                tokio::spawn(Arc::clone(&inner).handle_event(event));
            }
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker event loop stopped");
        });
    }

    /// `Default -> Initializing`, then starts the configured number of
    /// workers one after the other.
    fn begin_start(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if *state != DispatcherState::Default {
                return;
            }
            *state = DispatcherState::Initializing;
        }
        self.spawn_event_loop();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for i in 0..inner.options.process_count {
                if i > 0 {
                    tokio::select! {
                        () = inner.stop.cancelled() => return,
                        () = tokio::time::sleep(inner.options.process_startup_interval) => {}
                    }
                }
                if inner.is_disposed() {
                    return;
                }
                if !inner.start_channel().await {
                    inner.restart_worker_channel().await;
                }
            }
        });
    }

    /// Creates, starts and loads one channel. Start failures are reported as
    /// a worker error event so they go through the same recovery path as a
    /// crash. A channel created after shutdown is disposed right away.
    ///
    /// Returns `false` when the factory could not create a channel; the error
    /// is already counted against the restart budget.
    async fn start_channel(self: &Arc<Self>) -> bool {
        let language = self.options.worker_runtime.clone();
        let channel = match self.factory.create(&language, self.events.clone()) {
            Ok(channel) => channel,
            Err(_error) => {
                let _errors = self.errors.lock().record(Instant::now());
                #[cfg(feature = "tracing")]
                tracing::error!(error = %_error, %language, errors = _errors, "Could not create worker channel");
                return false;
            }
        };
        channel.setup_function_invocation_buffers(&self.runtime_functions());

        let added = {
            // Shutdown marks the state before draining the pool.
            let state = self.state.read();
            let open = *state != DispatcherState::Disposed;
            if open {
                self.pool.add(channel.clone());
            }
            open
        };
        if !added {
            #[cfg(feature = "tracing")]
            tracing::debug!(worker_id = %channel.worker_id(), "Dispatcher disposed, dropping new channel");
            channel.dispose().await;
            return true;
        }

        let started = async {
            channel.start_worker_process().await?;
            channel.send_function_load_requests().await
        };
        match started.await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::info!(worker_id = %channel.worker_id(), %language, "Worker started");
                self.set_state(DispatcherState::Initialized);
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::error!(worker_id = %channel.worker_id(), %error, "Worker failed to start");
                let _ = self.events.send(WorkerEvent::Error {
                    worker_id: channel.worker_id().to_owned(),
                    language,
                    error,
                });
            }
        }
        true
    }

    async fn handle_event(self: Arc<Self>, event: WorkerEvent) {
        if self.is_disposed() {
            return;
        }
        match event {
            WorkerEvent::Closed { worker_id, .. } => {
                #[cfg(feature = "tracing")]
                tracing::info!(%worker_id, "Worker exited normally");
                if let Some(channel) = self.pool.remove(&worker_id) {
                    channel.dispose().await;
                }
            }
            WorkerEvent::Restart {
                worker_id,
                language,
            } => {
                #[cfg(feature = "tracing")]
                tracing::info!(%worker_id, "Worker asked to be restarted");
                self.dispose_and_restart(worker_id, language).await;
            }
            WorkerEvent::Error {
                worker_id,
                language,
                error: _error,
            } => {
                let _errors = self.errors.lock().record(Instant::now());
                #[cfg(feature = "tracing")]
                tracing::error!(%worker_id, %language, error = %_error, errors = _errors, "Worker error");
                self.dispose_and_restart(worker_id, language).await;
            }
        }
    }

    /// Disposes the channel of `worker_id` and starts a replacement when it
    /// belonged to the active runtime. Does nothing for a channel that is
    /// already gone.
    async fn dispose_and_restart(self: Arc<Self>, worker_id: String, language: String) {
        let Some(channel) = self.pool.remove(&worker_id) else {
            return;
        };
        channel.dispose().await;

        if language != self.options.worker_runtime || self.is_disposed() {
            return;
        }
        if self.pool.ready_count(&language) == 0 {
            self.set_state(DispatcherState::WorkerProcessRestarting);
        }
        self.restart_worker_channel().await;
    }

    /// Starts a replacement channel after the restart interval, retrying
    /// while the factory fails and the error budget lasts. Stops the host
    /// once the budget is spent and no channel is left.
    async fn restart_worker_channel(self: &Arc<Self>) {
        loop {
            let errors = self.errors.lock().len();
            let threshold = self.options.error_events_threshold();
            if errors >= threshold {
                if self.pool.is_empty() {
                    #[cfg(feature = "tracing")]
                    tracing::error!(
                        errors,
                        runtime = %self.options.worker_runtime,
                        "Exceeded worker restart retry count; stopping the host"
                    );
                    self.stop_application();
                }
                return;
            }

            let _guard = self.restart_lock.lock().await;
            tokio::select! {
                () = self.stop.cancelled() => return,
                () = tokio::time::sleep(self.options.process_restart_interval) => {}
            }
            if self.is_disposed() {
                return;
            }
            increment_worker_restarts();
            #[cfg(feature = "tracing")]
            tracing::info!(errors, threshold, "Restarting worker");
            {
                let mut state = self.state.write();
                if *state == DispatcherState::WorkerProcessRestarting {
                    *state = DispatcherState::Initializing;
                }
            }
            if self.start_channel().await {
                return;
            }
        }
    }

    /// Stops the host at most once.
    fn stop_application(&self) {
        if !self.application_stopped.swap(true, Ordering::SeqCst) {
            self.lifetime.stop_application();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{
        channel::ChannelOptions,
        testing::{FakeFactory, WorkerBehavior},
    };
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingLifetime(AtomicUsize);

    impl ApplicationLifetime for CountingLifetime {
        fn stop_application(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingLifetime {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn echo_function(name: &str) -> FunctionMetadata {
        FunctionMetadata {
            name: name.to_owned(),
            function_id: name.to_owned(),
            language: Some("echo".to_owned()),
            ..Default::default()
        }
    }

    fn options() -> DispatcherOptions {
        DispatcherOptions {
            worker_runtime: "echo".to_owned(),
            process_startup_interval: Duration::from_millis(10),
            process_restart_interval: Duration::from_millis(10),
            process_shutdown_timeout: Duration::from_millis(200),
            process_start_timeout: Duration::from_secs(2),
            ready_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn dispatcher(
        options: DispatcherOptions,
        factory: Arc<FakeFactory>,
    ) -> (FunctionDispatcher, Arc<CountingLifetime>) {
        let lifetime = Arc::new(CountingLifetime::default());
        let dispatcher = FunctionDispatcher::new(options, factory, lifetime.clone());
        (dispatcher, lifetime)
    }

    async fn wait_for_state(dispatcher: &FunctionDispatcher, state: DispatcherState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn first_invocation_starts_workers_lazily() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        dispatcher.inner.functions.write().push(Arc::new(echo_function("hello")));
        assert_eq!(dispatcher.state(), DispatcherState::Default);

        let output = dispatcher
            .invoke_function("hello", vec![("name".into(), HostValue::from("world"))])
            .await
            .unwrap();
        assert_eq!(output.return_value, Some(HostValue::from("world")));
        assert_eq!(dispatcher.state(), DispatcherState::Initialized);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn invocations_spread_over_all_workers() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let options = DispatcherOptions {
            process_count: 2,
            ..options()
        };
        let (dispatcher, _) = dispatcher(options, factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.inner.pool.ready_count("echo") < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        for _ in 0..4 {
            dispatcher.invoke_function("hello", Vec::new()).await.unwrap();
        }
        let workers = factory.workers();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|worker| worker.invocations_seen() == 2));
    }

    #[tokio::test]
    async fn wrong_language_is_rejected_without_waiting() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        let mut python = echo_function("py");
        python.language = Some("python".to_owned());
        dispatcher.initialize(vec![python]);

        let err = dispatcher.invoke_function("py", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::NoWorkerAvailable { .. }));
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn crashed_worker_is_replaced() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let (dispatcher, lifetime) = dispatcher(options(), factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);
        wait_for_state(&dispatcher, DispatcherState::Initialized).await;

        factory.workers()[0].disconnect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.created() < 2 || dispatcher.inner.pool.ready_count("echo") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.invoke_function("hello", Vec::new()).await.unwrap();
        assert_eq!(dispatcher.channel_count(), 1);
        assert_eq!(lifetime.calls(), 0);
    }

    #[tokio::test]
    async fn replacement_start_passes_through_initializing() {
        // The replacement connects but never answers init.
        let factory = Arc::new(
            FakeFactory::new(WorkerBehavior::default())
                .with_options(ChannelOptions {
                    init_timeout: Duration::from_secs(60),
                    ..Default::default()
                })
                .then(WorkerBehavior {
                    silent: true,
                    ..Default::default()
                }),
        );
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);
        wait_for_state(&dispatcher, DispatcherState::Initialized).await;

        factory.workers()[0].disconnect();
        wait_until(|| factory.created() == 2).await;
        wait_for_state(&dispatcher, DispatcherState::Initializing).await;
        assert_eq!(dispatcher.ready_count(), 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failed_channel_creation_is_retried() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()).failing_creates(1));
        let (dispatcher, lifetime) = dispatcher(options(), factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);

        wait_for_state(&dispatcher, DispatcherState::Initialized).await;
        assert_eq!(factory.created(), 2);
        assert_eq!(dispatcher.inner.errors.lock().len(), 1);
        dispatcher.invoke_function("hello", Vec::new()).await.unwrap();
        assert_eq!(lifetime.calls(), 0);
    }

    #[tokio::test]
    async fn failing_factory_exhausts_the_error_budget() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()).failing_creates(10));
        let options = DispatcherOptions {
            error_events_threshold: Some(2),
            ..options()
        };
        let (dispatcher, lifetime) = dispatcher(options, factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);

        wait_until(|| lifetime.calls() > 0).await;
        assert_eq!(factory.created(), 2);
        assert_eq!(dispatcher.channel_count(), 0);
    }

    #[tokio::test]
    async fn channel_started_after_shutdown_is_disposed() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        dispatcher.shutdown().await;

        dispatcher.inner.start_channel().await;
        assert_eq!(factory.created(), 1);
        assert_eq!(dispatcher.channel_count(), 0);
        assert_eq!(dispatcher.state(), DispatcherState::Disposed);
    }

    #[tokio::test]
    async fn exhausted_restarts_stop_the_host_once() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior {
            fail_init: true,
            ..Default::default()
        }));
        let options = DispatcherOptions {
            error_events_threshold: Some(2),
            ..options()
        };
        let (dispatcher, lifetime) = dispatcher(options, factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);

        tokio::time::timeout(Duration::from_secs(5), async {
            while lifetime.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // The first start plus one restart per tolerated error.
        assert_eq!(factory.created(), 2);
        assert_eq!(dispatcher.channel_count(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lifetime.calls(), 1);
    }

    #[tokio::test]
    async fn unready_dispatcher_stops_the_host_from_the_invocation_path() {
        // The worker connects but never answers init.
        let factory = Arc::new(
            FakeFactory::new(WorkerBehavior {
                silent: true,
                ..Default::default()
            })
            .with_options(ChannelOptions {
                init_timeout: Duration::from_secs(60),
                ..Default::default()
            }),
        );
        let options = DispatcherOptions {
            error_events_threshold: Some(0),
            process_start_timeout: Duration::from_millis(100),
            ..options()
        };
        let (dispatcher, lifetime) = dispatcher(options, factory);
        dispatcher.initialize(vec![echo_function("hello")]);

        let err = dispatcher.invoke_function("hello", Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
        assert_eq!(dispatcher.state(), DispatcherState::Initializing);
        assert_eq!(lifetime.calls(), 1);

        // A second stuck invocation does not stop the host again.
        let _ = dispatcher.invoke_function("hello", Vec::new()).await;
        assert_eq!(lifetime.calls(), 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_fails_new_and_in_flight_invocations() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior {
            hold_invocations: true,
            ..Default::default()
        }));
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);
        wait_for_state(&dispatcher, DispatcherState::Initialized).await;

        let in_flight = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.invoke_function("hello", Vec::new()).await })
        };
        factory.workers()[0].wait_for_invocations(1).await;

        dispatcher.shutdown().await;
        assert!(matches!(
            in_flight.await.unwrap(),
            Err(Error::ChannelClosed { .. })
        ));
        assert_eq!(
            dispatcher.invoke_function("hello", Vec::new()).await,
            Err(Error::ServiceShutdown)
        );
        assert_eq!(dispatcher.state(), DispatcherState::Disposed);
    }

    #[tokio::test]
    async fn restart_by_invocation_id() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior {
            hold_invocations: true,
            ..Default::default()
        }));
        let (dispatcher, _) = dispatcher(options(), factory.clone());
        dispatcher.initialize(vec![echo_function("hello")]);
        wait_for_state(&dispatcher, DispatcherState::Initialized).await;

        let function = dispatcher.function("hello").unwrap();
        let (ctx, pending) = InvocationContext::new(function, Vec::new());
        let invocation_id = pending.invocation_id().to_owned();
        dispatcher.invoke(ctx).await.unwrap();
        factory.workers()[0].wait_for_invocations(1).await;

        assert!(!dispatcher.restart_worker_with_invocation_id("unknown").await);
        assert!(dispatcher.restart_worker_with_invocation_id(&invocation_id).await);
        assert!(pending.result().await.is_err());
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn statuses_cover_ready_workers() {
        let factory = Arc::new(FakeFactory::new(WorkerBehavior::default()));
        let (dispatcher, _) = dispatcher(options(), factory);
        dispatcher.initialize(vec![echo_function("hello")]);
        wait_for_state(&dispatcher, DispatcherState::Initialized).await;

        let statuses = dispatcher.worker_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert!(statuses[0].latency.is_some());
    }
}
