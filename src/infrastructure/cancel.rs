//! 运行级取消信号
//!
//! 所有挂起点（等队列、等限流、等网络）都和它一起 `select!`，取消后立刻返回。

use std::sync::Arc;
use tokio::sync::watch;

/// 可克隆的取消令牌，克隆体共享同一个信号
#[derive(Debug, Clone)]
pub struct CancelToken {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// 触发取消，重复调用无副作用
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    /// 等待取消信号
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // sender 由 self 持有，wait_for 不会因通道关闭而返回
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_cancel_wakes_waiters() {
        let token = CancelToken::new();
        let clone = token.clone();
        let mut waiter = task::spawn(async move { clone.cancelled().await });

        assert_pending!(waiter.poll());
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        token.cancelled().await;
        assert!(token.clone().is_cancelled());
    }
}
