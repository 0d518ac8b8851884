// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Level-triggered stop signal shared by a tunnel and its helpers.

use std::future::Future;
use tokio::sync::watch;

/// Cloneable stop flag.
///
/// Unlike a `Notify`, a waiter that subscribes after [`StopSignal::stop`]
/// still observes the stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Raise the signal. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the signal has been raised.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which cannot happen while `self` lives.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Run `fut` unless the signal is raised first.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.stopped() => None,
            out = fut => Some(out),
        }
    }

    /// Sleep for `duration`; returns `false` if stopped while sleeping.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        self.guard(tokio::time::sleep(duration)).await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_late_waiter_sees_stop() {
        let signal = StopSignal::new();
        signal.stop();
        signal.stop();
        tokio::time::timeout(Duration::from_secs(1), signal.stopped())
            .await
            .unwrap();
        assert!(signal.is_stopped());
    }

    #[tokio::test]
    async fn test_sleep_interrupted() {
        let signal = StopSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.sleep(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.stop();
        let completed = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!completed);
    }

    #[tokio::test]
    async fn test_guard_runs_future() {
        let signal = StopSignal::new();
        assert_eq!(signal.guard(async { 7 }).await, Some(7));
        signal.stop();
        assert_eq!(signal.guard(async { 7 }).await, None);
    }
}
