use jobhost_rpc_core::types::WORKER_RESTART_ERROR_INTERVAL;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

/// Lifecycle of the dispatcher as a whole.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatcherState {
    /// No worker has been requested yet.
    #[default]
    Default,
    Initializing,
    Initialized,
    /// No ready channel is left and a replacement is being started.
    WorkerProcessRestarting,
    Disposed,
}

/// Recent worker errors. An error arriving more than `window` after the
/// previous one starts a fresh bucket.
#[derive(Debug)]
pub struct ErrorBucket {
    errors: VecDeque<Instant>,
    window: Duration,
}

impl Default for ErrorBucket {
    fn default() -> Self {
        Self::new(WORKER_RESTART_ERROR_INTERVAL)
    }
}

impl ErrorBucket {
    pub fn new(window: Duration) -> Self {
        Self {
            errors: VecDeque::new(),
            window,
        }
    }

    /// Records an error at `at` and returns the bucket size.
    pub fn record(&mut self, at: Instant) -> usize {
        if self
            .errors
            .back()
            .is_some_and(|last| at.saturating_duration_since(*last) > self.window)
        {
            self.errors.clear();
        }
        self.errors.push_back(at);
        self.errors.len()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_resets_after_a_quiet_window() {
        let mut bucket = ErrorBucket::new(Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(bucket.record(start), 1);
        assert_eq!(bucket.record(start + Duration::from_secs(30)), 2);
        assert_eq!(bucket.record(start + Duration::from_secs(89)), 3);
        // More than a window after the last error.
        assert_eq!(bucket.record(start + Duration::from_secs(150)), 1);
        assert_eq!(bucket.len(), 1);
    }
}
