//! Open connection accounting for graceful shutdown.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts handed-off connections that are still alive.
///
/// Cloning shares the counter. A backend waits for the count to reach
/// zero before exiting so in-flight requests can finish.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    open: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            open: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Register a connection. It counts as open until the guard is dropped.
    pub fn track(&self) -> ConnectionGuard {
        self.open.send_modify(|n| *n += 1);
        ConnectionGuard {
            open: Arc::clone(&self.open),
        }
    }

    pub fn open_connections(&self) -> usize {
        *self.open.borrow()
    }

    /// Resolve once no tracked connection is open.
    pub async fn wait_idle(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one open connection in a [`ConnectionTracker`].
#[derive(Debug)]
pub struct ConnectionGuard {
    open: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.open.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_empty() {
        let tracker = ConnectionTracker::new();
        tokio::time::timeout(Duration::from_secs(1), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_idle_waits_for_last_guard() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track();
        let second = tracker.clone().track();
        assert_eq!(tracker.open_connections(), 2);

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.open_connections(), 0);
    }
}
