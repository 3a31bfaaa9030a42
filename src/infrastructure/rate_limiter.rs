//! 评分调用限流器
//!
//! 令牌桶限制调用速率，信号量限制同时在途的调用数。
//! 两者都按 FIFO 排队（tokio 的 `Mutex` 与 `Semaphore` 都是公平的），
//! 等待中的调用者可以随取消信号放弃，放弃时不消耗令牌。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::error::StageError;
use crate::infrastructure::CancelToken;

/// 单次等待的上限，极低速率下到点后重新计算
const MAX_WAIT: Duration = Duration::from_secs(3600);

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// 距离攒够一个令牌还要多久
    fn wait_time(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        Duration::try_from_secs_f64(missing / self.refill_per_sec)
            .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
    }
}

/// 共享限流器，通过 `Arc` 注入各个 worker
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    slots: Arc<Semaphore>,
    max_in_flight: usize,
    granted: AtomicU64,
}

/// 一次获准的调用；drop 时归还并发槽位
#[derive(Debug)]
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RatePermit {
    /// 显式归还并发槽位
    pub fn release(self) {}
}

impl RateLimiter {
    /// `rate_per_second` 次/秒，桶容量 `burst`，最多 `max_in_flight` 个调用同时在途
    pub fn new(rate_per_second: f64, burst: u32, max_in_flight: usize) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(burst.max(1), rate_per_second)),
            slots: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            granted: AtomicU64::new(0),
        }
    }

    /// 等待令牌与并发槽位
    ///
    /// 取消时返回 [`StageError::Cancelled`]，已占的槽位随之归还，令牌不扣除。
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<RatePermit, StageError> {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            slot = self.slots.clone().acquire_owned() => {
                slot.map_err(|_| StageError::Cancelled)?
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            _ = self.take_token() => {}
        }

        let total = self.granted.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("限流器放行第 {} 次调用，在途 {}", total, self.in_flight());

        Ok(RatePermit { _slot: slot })
    }

    /// 归还并发槽位
    pub fn release(&self, permit: RatePermit) {
        permit.release();
    }

    /// 持锁等待，保证排队顺序；被取消时 future 被丢弃，锁随之释放
    async fn take_token(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            bucket.refill(Instant::now());
            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                return;
            }
            let wait = bucket.wait_time();
            sleep(wait).await;
        }
    }

    /// 当前在途调用数
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.slots.available_permits()
    }

    /// 累计放行次数
    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }
}
