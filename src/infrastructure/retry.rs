//! 指数退避重试
//!
//! 只重试 `Transient` 错误；`Permanent` 与 `Cancelled` 原样返回。
//! 策略本身无状态，可以被任意多个 worker 同时使用。

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::StageError;
use crate::infrastructure::CancelToken;

/// 一次带重试的执行结果
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StageError>,
    /// 实际调用底层操作的次数
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter,
        )
    }

    /// 第 `attempt` 次失败（从 0 开始）之后的退避上限：base × 2^attempt，不超过 max_delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// 加上随机抖动后的实际等待时间，同样不超过 max_delay
    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = backoff.mul_f64(rand::thread_rng().gen_range(0.0..=self.jitter));
        (backoff + extra).min(self.max_delay)
    }

    /// 执行 `operation`，临时错误按退避重试，最多 `max_retries` 次
    ///
    /// `operation` 收到当前尝试序号（从 1 开始）。
    pub async fn execute<T, F, Fut>(&self, cancel: &CancelToken, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return RetryOutcome {
                    result: Err(StageError::Cancelled),
                    attempts,
                };
            }

            attempts += 1;
            let err = match operation(attempts).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            if attempts > self.max_retries {
                return RetryOutcome {
                    result: Err(StageError::RetryExhausted {
                        attempts,
                        last: Box::new(err),
                    }),
                    attempts,
                };
            }

            let delay = self.delay_with_jitter(attempts - 1);
            warn!(
                "第 {}/{} 次尝试失败: {}，{:?} 后重试",
                attempts,
                self.max_retries + 1,
                err,
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(StageError::Cancelled),
                        attempts,
                    };
                }
                _ = sleep(delay) => {}
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
            0.0,
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1_000));
        assert_eq!(p.backoff(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(250), 0.5);
        for _ in 0..200 {
            let d = p.delay_with_jitter(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
            let capped = p.delay_with_jitter(2);
            assert_eq!(capped, Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome: RetryOutcome<()> = policy(5)
            .execute(&CancelToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StageError::permanent("invalid url"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap_err(), StageError::permanent("invalid url"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();
        let outcome: RetryOutcome<()> = policy(3)
            .execute(&CancelToken::new(), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StageError::transient("connection reset"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        match outcome.result {
            Err(StageError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(*last, StageError::transient("connection reset"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let outcome = policy(3)
            .execute(&CancelToken::new(), |attempt| async move {
                if attempt < 3 {
                    Err(StageError::transient("429"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), 3);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancelToken::new();
        let p = RetryPolicy::new(10, Duration::from_secs(60), Duration::from_secs(60), 0.0);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome: RetryOutcome<()> = p
            .execute(&cancel, |_| async { Err(StageError::transient("timeout")) })
            .await;
        assert_eq!(outcome.result.unwrap_err(), StageError::Cancelled);
        assert_eq!(outcome.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
