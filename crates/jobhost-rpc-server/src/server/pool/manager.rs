//! Pool of live worker channels.
//!
//! This module defines the [`ChannelPool`] struct, which holds every channel
//! the dispatcher has created, ready or not. Invocations are distributed over
//! the ready channels of a language using round-robin scheduling, and the pool
//! supports a phased shutdown: drain in-flight invocations, then dispose every
//! channel.

use crate::server::channel::WorkerChannel;
use core::time::Duration;
use parking_lot::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio::time::timeout;

/// The set of channels owned by one dispatcher.
#[derive(Default)]
pub struct ChannelPool {
    channels: RwLock<Vec<Arc<WorkerChannel>>>,
    next_channel: AtomicUsize,
}

impl ChannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, channel: Arc<WorkerChannel>) {
        self.channels.write().push(channel);
    }

    /// Removes the channel with `worker_id`. Only the caller that gets
    /// `Some` back owns its disposal.
    pub fn remove(&self, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        let mut channels = self.channels.write();
        let idx = channels
            .iter()
            .position(|channel| channel.worker_id() == worker_id)?;
        Some(channels.remove(idx))
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<WorkerChannel>> {
        self.channels
            .read()
            .iter()
            .find(|channel| channel.worker_id() == worker_id)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Arc<WorkerChannel>> {
        self.channels.read().clone()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ready_count(&self, language: &str) -> usize {
        self.channels
            .read()
            .iter()
            .filter(|channel| channel.language() == language && channel.is_ready())
            .count()
    }

    /// Picks the next ready channel for `language` (round-robin).
    ///
    /// Uses a relaxed atomic increment; fairness across languages is not a
    /// goal.
    pub fn next_ready(&self, language: &str) -> Option<Arc<WorkerChannel>> {
        let ready: Vec<_> = self
            .channels
            .read()
            .iter()
            .filter(|channel| channel.language() == language && channel.is_ready())
            .cloned()
            .collect();
        if ready.is_empty() {
            return None;
        }
        let idx = self.next_channel.fetch_add(1, Ordering::Relaxed) % ready.len();
        ready.into_iter().nth(idx)
    }

    /// The channel currently executing `invocation_id`, if any.
    pub fn find_by_invocation(&self, invocation_id: &str) -> Option<Arc<WorkerChannel>> {
        self.channels
            .read()
            .iter()
            .find(|channel| channel.is_executing_invocation(invocation_id))
            .cloned()
    }

    /// Gracefully shuts down every channel in the pool.
    ///
    /// - Waits up to `drain_timeout` for in-flight invocations to finish.
    /// - Disposes every channel; whatever is still pending fails.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let channels: Vec<_> = self.channels.write().drain(..).collect();

        // === Phase 1: Wait for in-flight invocations to drain ===
        let _inflight: usize = channels
            .iter()
            .map(|channel| channel.executing_invocations())
            .sum();
        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight invocations ({_inflight} active)");

        let drain = futures::future::join_all(
            channels.iter().map(|channel| channel.drain_invocations()),
        );
        match timeout(drain_timeout, drain).await {
            Ok(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight invocations drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} invocations still active)",
                    channels
                        .iter()
                        .map(|channel| channel.executing_invocations())
                        .sum::<usize>()
                );
            }
        }

        // === Phase 2: Dispose every channel ===
        #[cfg(feature = "tracing")]
        tracing::debug!("Disposing {} worker channels", channels.len());
        futures::future::join_all(channels.iter().map(|channel| channel.dispose())).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Channel pool shutdown complete");
    }
}
