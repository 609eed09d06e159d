//! Workflow-level cancellation signal.

use tokio::sync::watch;

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A token observing this source.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation to every token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cheap, cloneable observer of a [`CancelSource`].
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is signalled; pends forever if the source
    /// is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let source = CancelSource::new();
        let token = source.token();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });

        source.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_resolves_immediately() {
        let source = CancelSource::new();
        source.cancel();
        let token = source.token();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_never_token_pends() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let res = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(res.is_err());
    }
}
