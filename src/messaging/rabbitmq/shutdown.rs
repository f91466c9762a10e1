use std::sync::Arc;

use tokio::sync::watch;

/// 協作式停止信號
///
/// 可複製，所有副本共享同一個標誌。觸發後不可重置。
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 要求所有持有者停止
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待信號觸發
    pub async fn triggered(&self) {
        let mut receiver = self.sender.subscribe();
        // 發送端由 self 持有，不會提前關閉
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clones_share_the_flag() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_triggered());

        signal.trigger();
        assert!(clone.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), clone.triggered())
            .await
            .unwrap();
    }

    #[test]
    fn test_triggered_is_pending_until_trigger() {
        let signal = ShutdownSignal::new();
        let mut waiting = tokio_test::task::spawn(signal.triggered());

        tokio_test::assert_pending!(waiting.poll());
        signal.trigger();

        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[tokio::test]
    async fn test_waiters_wake_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };

        tokio::task::yield_now().await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
