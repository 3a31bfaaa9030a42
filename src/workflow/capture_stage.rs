//! 截图阶段 - 流程层
//!
//! 从截图队列取 (页面, viewport)，在有限的 worker 池里截图，
//! 成功的结果送进分析队列。worker 持有并发许可直到结果交出去，
//! 分析队列满了截图就停下来。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::error::StageError;
use crate::infrastructure::{CancelToken, RetryPolicy};
use crate::models::CaptureResult;
use crate::services::PageCapturer;
use crate::workflow::events::{CaptureJob, CaptureOutcome, StageEvent};

pub struct CaptureStage {
    capturer: Arc<dyn PageCapturer>,
    retry: RetryPolicy,
    concurrency: usize,
    timeout: Duration,
    screenshot_dir: Option<PathBuf>,
}

/// 只接受 http/https 的绝对 URL
pub fn check_url(raw: &str) -> Result<(), StageError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| StageError::permanent(format!("非法 URL '{}': {}", raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(()),
        scheme => Err(StageError::permanent(format!(
            "不支持的 URL '{}' (scheme: {})",
            raw, scheme
        ))),
    }
}

impl CaptureStage {
    pub fn new(capturer: Arc<dyn PageCapturer>, retry: RetryPolicy, config: &CaptureConfig) -> Self {
        Self {
            capturer,
            retry,
            concurrency: config.concurrency.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            screenshot_dir: config
                .screenshot_dir
                .as_ref()
                .filter(|d| !d.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /// 运行到截图队列关闭或收到 `stop`
    ///
    /// `stop` 只停止领取新任务；`cancel` 让在途截图立即返回 `Cancelled`。
    pub async fn run(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<CaptureJob>,
        output: mpsc::Sender<CaptureResult>,
        events: mpsc::UnboundedSender<StageEvent>,
        stop: CancelToken,
        cancel: CancelToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let stage = self.clone();
            let output = output.clone();
            let events = events.clone();
            let stop = stop.clone();
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = permit;
                let _ = events.send(StageEvent::CaptureStarted(job.key()));

                let result = stage.capture_one(job, &cancel).await;
                let _ = events.send(StageEvent::Captured(CaptureOutcome::from(&result)));

                if !result.is_success() {
                    return;
                }
                if stop.is_cancelled() {
                    debug!("{} 运行已停止，不再送去评分", result.key());
                    return;
                }
                // 分析队列满时在这里等待，许可一直被占用
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {}
                    sent = output.send(result) => {
                        if sent.is_err() {
                            debug!("分析队列已关闭");
                        }
                    }
                }
            });
        }

        // 不再领取任务，让上游发送方尽快退出
        drop(jobs);
        drop(output);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("截图 worker 异常退出: {}", e);
            }
        }

        let _ = events.send(StageEvent::CaptureFinished);
        debug!("截图阶段结束");
    }

    /// 截图单个 viewport，带超时与重试
    pub async fn capture_one(&self, job: CaptureJob, cancel: &CancelToken) -> CaptureResult {
        let key = job.key();
        let CaptureJob { task, viewport } = job;
        let limit = self.timeout;

        debug!("{} 📷 开始截图 {}", key, task.url);

        let outcome = self
            .retry
            .execute(cancel, |attempt| {
                let capturer = self.capturer.clone();
                let url = task.url.clone();
                let viewport = viewport.clone();
                let cancel = cancel.clone();
                let key = key.clone();
                async move {
                    check_url(&url)?;
                    if attempt > 1 {
                        info!("{} 🔄 第 {} 次尝试截图", key, attempt);
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(StageError::Cancelled),
                        captured = timeout(limit, capturer.capture(&url, &viewport, limit)) => {
                            match captured {
                                Ok(result) => result,
                                Err(_) => Err(StageError::timeout(limit.as_millis() as u64)),
                            }
                        }
                    }
                }
            })
            .await;

        match outcome.result {
            Ok(shot) => {
                let mut result = CaptureResult::success(
                    task,
                    viewport,
                    shot.image,
                    shot.load_time_ms,
                    outcome.attempts,
                );
                result.artifact_path = self.save_artifact(&result).await;
                info!(
                    "{} 📸 截图完成 ({} ms, {} KB)",
                    key,
                    result.load_time_ms,
                    result.image.as_ref().map(|i| i.len() / 1024).unwrap_or(0)
                );
                result
            }
            Err(err) => {
                if err.is_cancelled() {
                    debug!("{} 截图已取消", key);
                } else {
                    warn!("{} ❌ 截图失败 (尝试 {} 次): {}", key, outcome.attempts, err);
                }
                CaptureResult::failed(task, viewport, err, outcome.attempts)
            }
        }
    }

    /// 以指纹命名保存截图，失败只记日志
    async fn save_artifact(&self, result: &CaptureResult) -> Option<PathBuf> {
        let dir = self.screenshot_dir.as_ref()?;
        let fingerprint = result.fingerprint.as_ref()?;
        let image = result.image.as_ref()?;

        let path = dir.join(format!("{}.png", fingerprint));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!("创建截图目录 {} 失败: {}", dir.display(), e);
            return None;
        }
        match tokio::fs::write(&path, image.as_slice()).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("保存截图 {} 失败: {}", path.display(), e);
                None
            }
        }
    }
}
