//! Run Cancellation
//!
//! A cloneable run-level cancellation signal. Every clone observes the same
//! flag; awaiting [`CancelSignal::cancelled`] resolves once any holder calls
//! [`CancelSignal::cancel`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation signal shared across a run
#[derive(Clone, Debug)]
pub struct CancelSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Request cancellation of the run
    pub fn cancel(&self) {
        if !*self.sender.borrow() {
            tracing::warn!("Run cancellation requested");
        }
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the run is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of self, so an error here
        // cannot happen while we hold &self.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancel the run automatically once `timeout` has elapsed
    pub fn cancel_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!("Run timeout of {:?} reached", timeout);
            signal.cancel();
        })
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_observe_cancellation() {
        let signal = CancelSignal::new();
        let other = signal.clone();
        assert!(!other.is_cancelled());

        let waiter = tokio::spawn(async move { other.cancelled().await });
        signal.cancel();
        waiter.await.unwrap();
        assert!(signal.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_timeout() {
        let signal = CancelSignal::new();
        signal.cancel_after(Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(2), signal.cancelled())
            .await
            .expect("signal should fire");
    }
}
