//! Rendezvous between launched worker processes and the streams they open.
//!
//! Before a process is started its channel registers the worker id it
//! assigned. When the worker dials in, the gRPC handler reads `StartStream`
//! and hands the stream to whoever registered that id. Streams announcing an
//! unknown worker id are refused.

use super::transport::AttachedStream;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;

#[derive(Clone, Default)]
pub struct StreamRegistry {
    waiting: Arc<Mutex<HashMap<String, oneshot::Sender<AttachedStream>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `worker_id` and returns the receiver its stream will arrive
    /// on. A second reservation replaces the first.
    pub fn expect(&self, worker_id: &str) -> oneshot::Receiver<AttachedStream> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(worker_id.to_owned(), tx);
        rx
    }

    /// Delivers `stream` to its reservation. Gives the stream back when no
    /// live reservation exists.
    pub fn attach(&self, stream: AttachedStream) -> Result<(), AttachedStream> {
        let waiter = self.waiting.lock().remove(&stream.worker_id);
        match waiter {
            Some(tx) => tx.send(stream),
            None => Err(stream),
        }
    }

    pub fn forget(&self, worker_id: &str) {
        self.waiting.lock().remove(worker_id);
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
