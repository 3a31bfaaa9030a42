//! 分析阶段 - 流程层
//!
//! 对每张成功的截图：先查缓存，未命中再经限流器和重试调用评分服务，
//! 成功的评分写回缓存。并发数与截图阶段分开配置。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::error::StageError;
use crate::infrastructure::{CancelToken, RateLimiter, ResultCache, RetryPolicy};
use crate::models::{AnalysisResult, CaptureResult, Dimension, DimensionScores, ScoreCard};
use crate::services::{PromptProfile, VisionScorer};
use crate::utils::logging::truncate_text;
use crate::workflow::events::StageEvent;

pub struct AnalysisStage {
    scorer: Arc<dyn VisionScorer>,
    cache: Arc<ResultCache>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    profile: PromptProfile,
    concurrency: usize,
    scorer_calls: AtomicU64,
}

/// 校验评分：只保留配置的维度，超出 [0,100] 的分数截断并在 findings 中注明
///
/// 一个配置的维度都没有时视为响应格式错误。
pub fn validate_card(mut card: ScoreCard, dimensions: &[Dimension]) -> Result<ScoreCard, StageError> {
    let mut notes = Vec::new();
    let mut scores = DimensionScores::new();

    for dim in dimensions {
        match card.scores.get(dim).copied() {
            Some(score) if score.is_finite() => {
                let clamped = score.clamp(0.0, 100.0);
                if clamped != score {
                    notes.push(format!("{} 分数 {} 超出 0–100，按 {} 计", dim, score, clamped));
                }
                scores.insert(*dim, clamped);
            }
            Some(score) => notes.push(format!("{} 分数无效 ({})，已忽略", dim, score)),
            None => notes.push(format!("缺少维度 {}", dim)),
        }
    }

    if scores.is_empty() {
        return Err(StageError::permanent("评分结果不包含任何配置的维度"));
    }

    if !notes.is_empty() {
        let flagged = format!("[分数校验] {}", notes.join("; "));
        card.findings = if card.findings.is_empty() {
            flagged
        } else {
            format!("{}\n{}", card.findings, flagged)
        };
    }
    card.scores = scores;
    Ok(card)
}

fn mean_score(scores: &DimensionScores) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.values().sum::<f64>() / scores.len() as f64
}

impl AnalysisStage {
    pub fn new(
        scorer: Arc<dyn VisionScorer>,
        cache: Arc<ResultCache>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        profile: PromptProfile,
        concurrency: usize,
    ) -> Self {
        Self {
            scorer,
            cache,
            limiter,
            retry,
            profile,
            concurrency: concurrency.max(1),
            scorer_calls: AtomicU64::new(0),
        }
    }

    /// 累计调用评分服务的次数（含重试）
    pub fn scorer_calls(&self) -> u64 {
        self.scorer_calls.load(Ordering::Relaxed)
    }

    /// 运行到分析队列关闭或收到 `stop`
    ///
    /// 收到 `stop` 后队列里剩下的截图不再评分，由编排层记为取消。
    pub async fn run(
        self: Arc<Self>,
        mut input: mpsc::Receiver<CaptureResult>,
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

            let capture = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                capture = input.recv() => match capture {
                    Some(capture) => capture,
                    None => break,
                },
            };

            if !capture.is_success() {
                continue;
            }

            let stage = self.clone();
            let events = events.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let _permit = permit;
                let result = stage.analyze_one(capture, &cancel).await;
                let _ = events.send(StageEvent::Analyzed(result));
            });
        }

        drop(input);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("评分 worker 异常退出: {}", e);
            }
        }
        debug!("分析阶段结束");
    }

    /// 评分单张截图
    pub async fn analyze_one(&self, capture: CaptureResult, cancel: &CancelToken) -> AnalysisResult {
        let key = capture.key();
        let load_time_ms = capture.load_time_ms;

        let (Some(fingerprint), Some(image)) = (capture.fingerprint.clone(), capture.image.clone())
        else {
            return AnalysisResult::failed(
                key,
                capture.fingerprint,
                load_time_ms,
                StageError::permanent("截图结果缺少图片"),
                0,
            );
        };

        if let Some(card) = self.cache.get(&fingerprint) {
            info!("{} 💾 命中缓存，总分 {:.1}", key, mean_score(&card.scores));
            return AnalysisResult::cache_hit(key, fingerprint, load_time_ms, card);
        }

        debug!("{} 🤖 请求评分", key);
        let dimensions = self.profile.dimensions.clone();

        let outcome = self
            .retry
            .execute(cancel, |attempt| {
                let scorer = self.scorer.clone();
                let limiter = self.limiter.clone();
                let profile = self.profile.clone();
                let image = image.clone();
                let cancel = cancel.clone();
                let dimensions = dimensions.clone();
                let key = key.clone();
                let calls = &self.scorer_calls;
                async move {
                    // 每次尝试单独排队，退避期间不占用限流槽位
                    let permit = limiter.acquire(&cancel).await?;
                    calls.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        info!("{} 🔄 第 {} 次尝试评分", key, attempt);
                    }
                    let scored = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(StageError::Cancelled),
                        scored = scorer.score(&image, &profile) => scored,
                    };
                    limiter.release(permit);
                    validate_card(scored?, &dimensions)
                }
            })
            .await;

        match outcome.result {
            Ok(card) => {
                info!(
                    "{} ✅ 评分完成，总分 {:.1} | {}",
                    key,
                    mean_score(&card.scores),
                    truncate_text(&card.findings, 40)
                );
                self.cache.put(fingerprint.clone(), card.clone());
                AnalysisResult::scored(key, fingerprint, load_time_ms, card, outcome.attempts)
            }
            Err(err) => {
                if err.is_cancelled() {
                    debug!("{} 评分已取消", key);
                } else {
                    warn!("{} ❌ 评分失败 (尝试 {} 次): {}", key, outcome.attempts, err);
                }
                AnalysisResult::failed(key, Some(fingerprint), load_time_ms, err, outcome.attempts)
            }
        }
    }
}
