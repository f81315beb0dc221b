//! Bounded readiness wait used by the invocation path.
//!
//! The dispatcher state is polled on a fixed interval rather than awaited
//! through a notification.

use super::state::DispatcherState;
use tokio::time::{Duration, Instant, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Invocations can be dispatched.
    Ready,
    /// The dispatcher was disposed while waiting.
    Shutdown,
    /// `deadline` passed without the dispatcher becoming ready.
    TimedOut,
}

/// Polls `state` every `interval` until the dispatcher is initialized or
/// disposed, giving up after `deadline`.
///
/// `Default` counts as ready: nothing has asked for a worker yet.
pub async fn delay_until_initialized_or_shutdown<F>(
    state: F,
    interval: Duration,
    deadline: Duration,
) -> WaitOutcome
where
    F: Fn() -> DispatcherState,
{
    let started = Instant::now();
    loop {
        match state() {
            DispatcherState::Initialized | DispatcherState::Default => return WaitOutcome::Ready,
            DispatcherState::Disposed => return WaitOutcome::Shutdown,
            DispatcherState::Initializing | DispatcherState::WorkerProcessRestarting => {}
        }
        let elapsed = started.elapsed();
        if elapsed >= deadline {
            return WaitOutcome::TimedOut;
        }
        sleep(interval.min(deadline - elapsed)).await;
    }
}

/// How long an invocation may wait for the dispatcher:
/// `(threshold + 1) × process_start_timeout`.
pub fn readiness_deadline(error_events_threshold: usize, process_start_timeout: Duration) -> Duration {
    let attempts = u32::try_from(error_events_threshold.saturating_add(1)).unwrap_or(u32::MAX);
    process_start_timeout.saturating_mul(attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn ready_states_return_immediately() {
        for state in [DispatcherState::Default, DispatcherState::Initialized] {
            let outcome = delay_until_initialized_or_shutdown(
                || state,
                Duration::from_secs(10),
                Duration::from_secs(10),
            )
            .await;
            assert_eq!(outcome, WaitOutcome::Ready);
        }
    }

    #[tokio::test]
    async fn stuck_initialization_times_out() {
        let started = Instant::now();
        let outcome = delay_until_initialized_or_shutdown(
            || DispatcherState::Initializing,
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn observes_transitions_while_polling() {
        let state = Arc::new(Mutex::new(DispatcherState::WorkerProcessRestarting));
        let flip = state.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            *flip.lock() = DispatcherState::Disposed;
        });

        let outcome = delay_until_initialized_or_shutdown(
            || *state.lock(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await;
        assert_eq!(outcome, WaitOutcome::Shutdown);
    }

    #[test]
    fn deadline_scales_with_threshold() {
        assert_eq!(readiness_deadline(0, Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(readiness_deadline(2, Duration::from_secs(60)), Duration::from_secs(180));
    }
}
