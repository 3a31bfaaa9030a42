//! 流水线协调器 - 编排层
//!
//! ## 职责
//!
//! 1. **收集**：从 URL 来源读取候选，去重、按优先级排序、截断
//! 2. **启动阶段**：投递任务 → 截图阶段 → 分析阶段，阶段之间用有界队列连接
//! 3. **进度记账**：消费阶段事件，维护每个页面的进度
//! 4. **熔断与取消**：截图失败页面比例超阈值、或外部取消时中止运行
//! 5. **汇总**：所有阶段退出后交给聚合器生成 [`RunSummary`]
//!
//! 截图阶段投递和分析阶段消费互相独立，分析慢时截图会在有界队列上停下来。

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::infrastructure::{CancelToken, RateLimiter, ResultCache, RetryPolicy};
use crate::models::{AbortReason, CaptureResult, PageTask, RunOutcome, RunSummary, Viewport};
use crate::orchestrator::progress::RunProgress;
use crate::orchestrator::run_state::{RunState, RunStateMachine};
use crate::services::{PageCapturer, PromptProfile, UrlCandidate, UrlSource, VisionScorer};
use crate::workflow::{Aggregator, AnalysisStage, CaptureJob, CaptureStage, RunMeta, StageEvent};

pub struct Pipeline {
    config: Config,
    capture: Arc<CaptureStage>,
    analysis: Arc<AnalysisStage>,
    aggregator: Aggregator,
}

/// 去重（保留首次出现）、按优先级降序稳定排序、截断，编号从 1 开始
pub fn build_tasks(
    candidates: Vec<UrlCandidate>,
    viewports: &[Viewport],
    max_pages: Option<usize>,
) -> Vec<PageTask> {
    let mut seen = HashSet::new();
    let mut unique: Vec<UrlCandidate> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.url.clone()))
        .collect();
    unique.sort_by(|a, b| b.priority.cmp(&a.priority));

    if let Some(max) = max_pages {
        if unique.len() > max {
            info!("📋 共 {} 个 URL，只处理优先级最高的 {} 个", unique.len(), max);
            unique.truncate(max);
        }
    }

    unique
        .into_iter()
        .enumerate()
        .map(|(i, c)| PageTask::new(i + 1, c.url, c.priority, viewports.to_vec()))
        .collect()
}

fn new_run_id(started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        started_at.format("%Y%m%d%H%M%S"),
        hex::encode(rand::random::<[u8; 3]>())
    )
}

/// 把每个 (页面, viewport) 投进截图队列，队列满时在这里等待
async fn feed_jobs(tasks: Vec<Arc<PageTask>>, jobs: mpsc::Sender<CaptureJob>, stop: CancelToken) {
    for task in tasks {
        for viewport in task.viewports.clone() {
            let job = CaptureJob {
                task: task.clone(),
                viewport,
            };
            tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = jobs.send(job) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Pipeline {
    pub fn new(
        config: Config,
        capturer: Arc<dyn PageCapturer>,
        scorer: Arc<dyn VisionScorer>,
        cache: Arc<ResultCache>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dimensions = config.dimensions()?;
        let retry = RetryPolicy::from_config(&config.retry);

        let capture = Arc::new(CaptureStage::new(capturer, retry.clone(), &config.capture));
        let analysis = Arc::new(AnalysisStage::new(
            scorer,
            cache,
            limiter,
            retry,
            PromptProfile::from_config(&config.analysis, dimensions.clone()),
            config.analysis.concurrency,
        ));
        let aggregator = Aggregator::new(config.grading.clone(), dimensions);

        Ok(Self {
            config,
            capture,
            analysis,
            aggregator,
        })
    }

    /// 执行一次完整运行
    ///
    /// 总是返回汇总，中止时 `outcome` 为 `Aborted` 并带上原因。
    /// `external` 被取消后所有挂起点立即返回，不等宽限期。
    pub async fn run(&self, source: &dyn UrlSource, external: CancelToken) -> RunSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let run_id = new_run_id(started_at);
        let calls_before = self.analysis.scorer_calls();
        let mut machine = RunStateMachine::new(run_id.clone());

        let meta = |outcome: RunOutcome,
                    abort_reason: Option<AbortReason>,
                    total_pages: usize,
                    skipped_urls: Vec<String>,
                    scorer_calls: u64| RunMeta {
            run_id: run_id.clone(),
            outcome,
            abort_reason,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            total_pages,
            skipped_urls,
            scorer_calls,
        };

        info!("[运行 {}] 📁 正在读取 URL 列表...", run_id);
        let candidates = match source.urls().await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("[运行 {}] ❌ 读取 URL 失败: {}", run_id, e);
                machine.advance(RunState::Aborted);
                let reason = AbortReason::SourceFailed {
                    message: e.to_string(),
                };
                return self.aggregator.summarize(
                    meta(RunOutcome::Aborted, Some(reason), 0, Vec::new(), 0),
                    &[],
                );
            }
        };

        let tasks: Vec<Arc<PageTask>> = build_tasks(
            candidates,
            &self.config.capture.viewports,
            self.config.pipeline.max_pages,
        )
        .into_iter()
        .map(Arc::new)
        .collect();

        if tasks.is_empty() {
            warn!("[运行 {}] ⚠️ 没有待处理的 URL", run_id);
            machine.advance(RunState::Done);
            return self
                .aggregator
                .summarize(meta(RunOutcome::Done, None, 0, Vec::new(), 0), &[]);
        }

        let total_pages = tasks.len();
        info!(
            "[运行 {}] ✓ 共 {} 个页面，每个 {} 个 viewport",
            run_id,
            total_pages,
            self.config.capture.viewports.len()
        );

        let capacity = self.config.pipeline.queue_capacity;
        let (job_tx, job_rx) = mpsc::channel::<CaptureJob>(capacity);
        let (result_tx, result_rx) = mpsc::channel::<CaptureResult>(capacity);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StageEvent>();
        let stop = CancelToken::new();
        let cancel = CancelToken::new();

        let mut progress = RunProgress::new(&tasks);
        machine.advance(RunState::Capturing);

        let handles = [
            tokio::spawn(feed_jobs(tasks, job_tx, stop.clone())),
            tokio::spawn(self.capture.clone().run(
                job_rx,
                result_tx,
                event_tx.clone(),
                stop.clone(),
                cancel.clone(),
            )),
            tokio::spawn(self.analysis.clone().run(
                result_rx,
                event_tx,
                stop.clone(),
                cancel.clone(),
            )),
        ];

        let max_failure_rate = self.config.pipeline.max_failure_rate;
        let grace = self.config.grace_period();
        let mut abort: Option<AbortReason> = None;
        let mut deadline: Option<Instant> = None;

        // 所有阶段退出、事件发送方全部释放后循环结束
        loop {
            tokio::select! {
                biased;
                _ = external.cancelled(), if !cancel.is_cancelled() => {
                    warn!("[运行 {}] 🛑 收到取消信号，停止所有任务", run_id);
                    abort.get_or_insert(AbortReason::Cancelled);
                    stop.cancel();
                    cancel.cancel();
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() && !cancel.is_cancelled() => {
                    warn!("[运行 {}] ⏱️ 宽限期结束，取消仍在进行的任务", run_id);
                    cancel.cancel();
                }
                event = event_rx.recv() => match event {
                    Some(StageEvent::CaptureStarted(key)) => progress.on_capture_started(&key),
                    Some(StageEvent::Captured(outcome)) => {
                        if !progress.on_captured(outcome) || abort.is_some() {
                            continue;
                        }
                        let failed_pages = progress.failed_capture_pages();
                        if failed_pages as f64 / total_pages as f64 > max_failure_rate {
                            let reason = AbortReason::FailureRate {
                                failed_pages,
                                total_pages,
                                threshold: max_failure_rate,
                            };
                            error!("[运行 {}] 🛑 {}，停止领取新任务", run_id, reason);
                            abort = Some(reason);
                            stop.cancel();
                            if grace.is_zero() {
                                cancel.cancel();
                            } else {
                                deadline = Some(Instant::now() + grace);
                            }
                        }
                    }
                    Some(StageEvent::Analyzed(result)) => progress.on_analyzed(result),
                    Some(StageEvent::CaptureFinished) => {
                        if abort.is_none() {
                            machine.advance(RunState::Analyzing);
                        }
                    }
                    None => break,
                },
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("[运行 {}] 阶段任务异常退出: {}", run_id, e);
            }
        }

        let (records, skipped_urls) = progress.finish();
        let scorer_calls = self.analysis.scorer_calls() - calls_before;

        let outcome = if abort.is_some() {
            machine.advance(RunState::Aborted);
            RunOutcome::Aborted
        } else {
            machine.advance(RunState::Aggregating);
            RunOutcome::Done
        };

        let summary = self.aggregator.summarize(
            meta(outcome, abort, total_pages, skipped_urls, scorer_calls),
            &records,
        );
        if outcome == RunOutcome::Done {
            machine.advance(RunState::Done);
        }
        summary
    }
}
