//! Time source for polling loops.
//!
//! The poller only ever asks for "now" and "wait this long unless cancelled",
//! so tests can swap in a virtual clock and run hour-long polls instantly.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How a cancellable wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }

    /// Wait for `duration`, returning early with `Cancelled` as soon as the
    /// token fires.
    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome;
}

/// Wall-clock implementation backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn wait(&self, duration: Duration, cancel: &CancellationToken) -> WaitOutcome {
        if cancel.is_cancelled() {
            return WaitOutcome::Cancelled;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(duration) => WaitOutcome::Elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_elapses() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        let start = clock.now();
        let outcome = clock.wait(Duration::from_millis(20), &token).await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(clock.elapsed_since(start) >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_cancelled() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        let outcome = clock.wait(Duration::from_secs(60), &token).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancel_during_wait_unblocks_promptly() {
        let clock = SystemClock;
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let outcome = clock.wait(Duration::from_secs(60), &token).await;
        assert_eq!(outcome, WaitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
