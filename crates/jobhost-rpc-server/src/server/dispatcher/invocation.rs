//! Per-invocation context and its single-assignment result slot.

use crate::server::{codec::HostValue, metadata::FunctionMetadata};
use jobhost_rpc_core::{Error, Result, proto::rpc_log};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Values produced by a successful invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    pub outputs: Vec<(String, HostValue)>,
    pub return_value: Option<HostValue>,
}

impl InvocationOutput {
    pub fn output(&self, name: &str) -> Option<&HostValue> {
        self.outputs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// A user-category log line the worker emitted during the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLog {
    pub level: rpc_log::Level,
    pub category: String,
    pub message: String,
}

/// Shared log sink of one invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationLogs(Arc<Mutex<Vec<UserLog>>>);

impl InvocationLogs {
    pub fn push(&self, log: UserLog) {
        self.0.lock().push(log);
    }

    pub fn snapshot(&self) -> Vec<UserLog> {
        self.0.lock().clone()
    }
}

type Outcome = Result<InvocationOutput>;

/// One call of a user function, on its way to a worker.
#[derive(Debug)]
pub struct InvocationContext {
    pub function: Arc<FunctionMetadata>,
    pub invocation_id: String,
    pub inputs: Vec<(String, HostValue)>,
    pub trigger_metadata: Vec<(String, HostValue)>,
    pub cancellation: CancellationToken,
    logs: InvocationLogs,
    result: Option<oneshot::Sender<Outcome>>,
}

impl InvocationContext {
    /// Creates a context with a fresh invocation id, plus the handle its
    /// result will be delivered to.
    pub fn new(
        function: Arc<FunctionMetadata>,
        inputs: Vec<(String, HostValue)>,
    ) -> (Self, PendingInvocation) {
        Self::with_id(function, uuid::Uuid::new_v4().to_string(), inputs)
    }

    pub fn with_id(
        function: Arc<FunctionMetadata>,
        invocation_id: String,
        inputs: Vec<(String, HostValue)>,
    ) -> (Self, PendingInvocation) {
        let (tx, rx) = oneshot::channel();
        let logs = InvocationLogs::default();
        let cancellation = CancellationToken::new();
        let pending = PendingInvocation {
            invocation_id: invocation_id.clone(),
            cancellation: cancellation.clone(),
            logs: logs.clone(),
            rx,
        };
        let ctx = Self {
            function,
            invocation_id,
            inputs,
            trigger_metadata: Vec::new(),
            cancellation,
            logs,
            result: Some(tx),
        };
        (ctx, pending)
    }

    pub fn with_trigger_metadata(mut self, metadata: Vec<(String, HostValue)>) -> Self {
        self.trigger_metadata = metadata;
        self
    }

    pub fn logs(&self) -> &InvocationLogs {
        &self.logs
    }

    /// Fills the result slot. Only the first call has any effect.
    pub fn complete(&mut self, outcome: Outcome) -> bool {
        match self.result.take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.result.is_none()
    }
}

/// Caller side of an invocation: awaits the result and can cancel.
#[derive(Debug)]
pub struct PendingInvocation {
    invocation_id: String,
    cancellation: CancellationToken,
    logs: InvocationLogs,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingInvocation {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    /// Host-side cancellation. The worker may keep running the function.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn logs(&self) -> Vec<UserLog> {
        self.logs.snapshot()
    }

    /// Waits for the result. A context dropped without a result reports a
    /// channel error rather than hanging.
    pub async fn result(self) -> Result<InvocationOutput> {
        self.rx.await.unwrap_or_else(|_| {
            Err(Error::channel(format!(
                "invocation {} was dropped without a result",
                self.invocation_id
            )))
        })
    }
}
