//! Correlation table of in-flight requests.
//!
//! Every waiter owns a `oneshot` sender stored under its correlation id.
//! Resolution always happens by *removing* the sender under the lock, so a
//! request is resolved at most once no matter whether the response, the
//! deadline, a cancellation or channel teardown gets there first. The waiter
//! side removes its own entry on drop, so an abandoned wait never leaves an
//! orphan behind.

use core::time::Duration;
use jobhost_rpc_core::{Error, Result, proto::StreamingMessage};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;

type Waiter = oneshot::Sender<Result<StreamingMessage>>;

#[derive(Default)]
struct Table {
    waiters: HashMap<String, Waiter>,
    closed: bool,
}

pub struct PendingRequests {
    worker_id: String,
    table: Mutex<Table>,
    closed: CancellationToken,
}

impl PendingRequests {
    pub fn new(worker_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            worker_id: worker_id.into(),
            table: Mutex::new(Table::default()),
            closed: CancellationToken::new(),
        })
    }

    /// Registers a waiter for `request_id`.
    ///
    /// # Errors
    ///
    /// - `ChannelClosed` once the table has been closed.
    /// - `InvalidRequest` if a waiter for the id already exists.
    pub fn register(self: &Arc<Self>, request_id: &str) -> Result<PendingResponse> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock();
        if table.closed {
            return Err(self.closed_error());
        }
        if table.waiters.contains_key(request_id) {
            return Err(Error::InvalidRequest {
                reason: format!("duplicate correlation id {request_id}"),
            });
        }
        table.waiters.insert(request_id.to_owned(), tx);
        Ok(PendingResponse {
            request_id: request_id.to_owned(),
            rx,
            table: Arc::clone(self),
        })
    }

    /// Hands `message` to the waiter registered under its correlation id.
    /// Returns the message back when nobody is waiting for it.
    pub fn resolve(&self, message: StreamingMessage) -> Option<StreamingMessage> {
        let waiter = self.table.lock().waiters.remove(&message.request_id);
        match waiter {
            Some(tx) => {
                // The receiver may have been dropped in the meantime; the
                // entry is gone either way.
                let _ = tx.send(Ok(message));
                None
            }
            None => Some(message),
        }
    }

    /// Fails the waiter for `request_id`, if it is still pending.
    pub fn fail(&self, request_id: &str, error: Error) -> bool {
        let waiter = self.table.lock().waiters.remove(request_id);
        waiter.map(|tx| tx.send(Err(error))).is_some()
    }

    /// Fails every pending waiter with `ChannelClosed` and refuses new ones.
    pub fn close_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.table.lock();
            table.closed = true;
            table.waiters.drain().collect()
        };
        self.closed.cancel();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(self.closed_error()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }

    /// Resolves once [`close_all`](Self::close_all) has run.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn len(&self) -> usize {
        self.table.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &str) -> bool {
        self.table.lock().waiters.remove(request_id).is_some()
    }

    pub(crate) fn closed_error(&self) -> Error {
        Error::ChannelClosed {
            worker_id: self.worker_id.clone(),
        }
    }
}

/// The waiting half of a registered request.
pub struct PendingResponse {
    request_id: String,
    rx: oneshot::Receiver<Result<StreamingMessage>>,
    table: Arc<PendingRequests>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Waits for the response, at most `timeout`.
    pub async fn wait(self, timeout: Duration, operation: &str) -> Result<StreamingMessage> {
        self.wait_until(Instant::now() + timeout, timeout, operation, None)
            .await
    }

    /// Like [`wait`](Self::wait), but also gives up with `RequestCancelled`
    /// once `cancel` fires.
    pub async fn wait_cancellable(
        self,
        timeout: Duration,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<StreamingMessage> {
        self.wait_until(Instant::now() + timeout, timeout, operation, Some(cancel))
            .await
    }

    /// Waits until `deadline`. `timeout` is the budget reported when the
    /// deadline passes.
    pub(crate) async fn wait_until(
        mut self,
        deadline: Instant,
        timeout: Duration,
        operation: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<StreamingMessage> {
        let give_up = tokio::select! {
            res = &mut self.rx => return Self::received(res, &self.table),
            () = tokio::time::sleep_until(deadline) => Error::Timeout {
                operation: operation.to_owned(),
                after: timeout,
            },
            () = cancelled(cancel) => Error::RequestCancelled,
        };

        if self.table.remove(&self.request_id) {
            return Err(give_up);
        }
        // A resolver took the waiter just before we did and is about to send.
        let res = (&mut self.rx).await;
        Self::received(res, &self.table)
    }

    fn received(
        res: core::result::Result<Result<StreamingMessage>, oneshot::error::RecvError>,
        table: &PendingRequests,
    ) -> Result<StreamingMessage> {
        match res {
            Ok(outcome) => outcome,
            Err(_) => Err(table.closed_error()),
        }
    }
}

/// Resolves when `token` fires; never when there is none.
pub(crate) async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.remove(&self.request_id);
    }
}
