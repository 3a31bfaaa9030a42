use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use website_analyzer::config::RetryConfig;
use website_analyzer::models::{
    AbortReason, AnalysisStatus, Dimension, PageStatus, ScoreCard, Viewport,
};
use website_analyzer::services::{
    CapturedImage, FileUrlSource, PromptProfile, ReportWriter, StaticUrlSource,
};
use website_analyzer::{
    CancelToken, Config, PageCapturer, Pipeline, RateLimiter, ResultCache, RunOutcome, RunSummary,
    StageError, VisionScorer,
};

// ========== 测试替身 ==========

#[derive(Default)]
struct FakeCapturer {
    calls: AtomicU32,
    /// 这些 URL 立即返回 Permanent
    broken: HashSet<String>,
    /// 成功前等待的时间
    delay: Duration,
    hang: bool,
}

impl FakeCapturer {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageCapturer for FakeCapturer {
    async fn capture(
        &self,
        url: &str,
        viewport: &Viewport,
        _timeout: Duration,
    ) -> Result<CapturedImage, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.contains(url) {
            return Err(StageError::permanent("HTTP 404: not found"));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        Ok(CapturedImage {
            image: format!("{}|{}", url, viewport.name).into_bytes(),
            load_time_ms: 100,
        })
    }
}

struct FakeScorer {
    calls: AtomicU32,
    gate: Option<watch::Receiver<bool>>,
    error: Option<StageError>,
}

impl FakeScorer {
    fn ok() -> Self {
        Self {
            calls: AtomicU32::new(0),
            gate: None,
            error: None,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionScorer for FakeScorer {
    async fn score(&self, image: &[u8], profile: &PromptProfile) -> Result<ScoreCard, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let base = 60.0 + (image.len() % 30) as f64;
        Ok(ScoreCard {
            scores: profile
                .dimensions
                .iter()
                .enumerate()
                .map(|(i, d)| (*d, base + i as f64))
                .collect(),
            findings: "layout is clean".to_string(),
            strengths: vec!["clear hierarchy".to_string()],
            weaknesses: vec!["small fonts".to_string()],
            recommendations: vec!["increase contrast".to_string()],
            confidence: Some(0.8),
        })
    }
}

// ========== 辅助函数 ==========

fn test_config() -> Config {
    let mut config = Config::default();
    config.capture.viewports = vec![Viewport::desktop()];
    config.capture.screenshot_dir = None;
    config.capture.timeout_ms = 60_000;
    config.cache.path = None;
    config.retry = RetryConfig {
        max_retries: 2,
        base_delay_ms: 10,
        max_delay_ms: 100,
        jitter: 0.0,
    };
    config.analysis.rate_per_second = 1_000.0;
    config.analysis.burst = 100;
    config.analysis.max_in_flight = 10;
    config.pipeline.max_failure_rate = 1.0;
    config.pipeline.grace_period_ms = 0;
    config
}

fn urls(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("https://site{}.example/", i)).collect()
}

fn memory_cache() -> Arc<ResultCache> {
    Arc::new(ResultCache::new(Duration::from_secs(3600)))
}

fn limiter(config: &Config) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        config.analysis.rate_per_second,
        config.analysis.burst,
        config.analysis.max_in_flight,
    ))
}

fn pipeline(
    config: Config,
    capturer: Arc<FakeCapturer>,
    scorer: Arc<FakeScorer>,
    cache: Arc<ResultCache>,
) -> Pipeline {
    let limiter = limiter(&config);
    Pipeline::new(config, capturer, scorer, cache, limiter).unwrap()
}

async fn run(pipeline: &Pipeline, list: Vec<String>) -> RunSummary {
    pipeline
        .run(&StaticUrlSource::from_urls(list), CancelToken::new())
        .await
}

// ========== 测试 ==========

#[tokio::test(start_paused = true)]
async fn test_every_page_and_viewport_is_scored() {
    let mut config = test_config();
    config.capture.viewports = vec![Viewport::desktop(), Viewport::mobile()];
    let capturer = Arc::new(FakeCapturer::default());
    let scorer = Arc::new(FakeScorer::ok());
    let p = pipeline(config, capturer.clone(), scorer.clone(), memory_cache());

    let summary = run(&p, urls(3)).await;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert!(!summary.partial);
    assert_eq!(summary.total_pages, 3);
    assert_eq!(summary.pages.len(), 3);
    assert_eq!(summary.done_pages(), 3);
    for page in &summary.pages {
        assert_eq!(page.status, PageStatus::Complete);
        assert_eq!(page.viewports.len(), 2);
        assert!(page.grade.is_some());
    }
    assert_eq!(capturer.calls(), 6);
    assert_eq!(scorer.calls(), 6);
    assert_eq!(summary.stats.scorer_calls, 6);
    assert_eq!(summary.failure_count, 0);
    assert_eq!(summary.viewport_averages.len(), 2);
    assert_eq!(summary.dimension_averages.len(), Dimension::ALL.len());
    assert_eq!(summary.insights.top_strengths, vec!["clear hierarchy".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_run_is_served_from_cache() {
    let mut config = test_config();
    config.capture.viewports = vec![Viewport::desktop(), Viewport::mobile()];
    let scorer = Arc::new(FakeScorer::ok());
    let cache = memory_cache();
    let p = pipeline(config, Arc::new(FakeCapturer::default()), scorer.clone(), cache.clone());

    let first = run(&p, urls(3)).await;
    let second = run(&p, urls(3)).await;

    assert_eq!(scorer.calls(), 6);
    assert_eq!(first.stats.cache_hits, 0);
    assert_eq!(second.stats.cache_hits, 6);
    assert_eq!(second.stats.scorer_calls, 0);
    assert_eq!(cache.len(), 6);
    for page in &second.pages {
        assert!(page
            .viewports
            .iter()
            .all(|r| r.status == AnalysisStatus::CacheHit));
    }
    assert_eq!(first.overall_average, second.overall_average);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_capture_error_runs_once() {
    let list = urls(3);
    let capturer = Arc::new(FakeCapturer {
        broken: HashSet::from([list[1].clone()]),
        ..FakeCapturer::default()
    });
    let p = pipeline(test_config(), capturer.clone(), Arc::new(FakeScorer::ok()), memory_cache());

    let summary = run(&p, list).await;

    assert_eq!(summary.outcome, RunOutcome::Done);
    assert!(summary.partial);
    assert_eq!(capturer.calls(), 3);
    let broken = &summary.pages[1];
    assert_eq!(broken.status, PageStatus::Incomplete);
    assert_eq!(broken.overall_score, None);
    assert_eq!(broken.capture_failures.len(), 1);
    assert_eq!(broken.capture_failures[0].attempts, 1);
    assert!(matches!(broken.capture_failures[0].error, StageError::Permanent(_)));
    assert_eq!(summary.failed_pages, 1);
    assert_eq!(summary.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_scorer_error_exhausts_retries() {
    let scorer = Arc::new(FakeScorer {
        error: Some(StageError::transient("HTTP 503: overloaded")),
        ..FakeScorer::ok()
    });
    let p = pipeline(test_config(), Arc::new(FakeCapturer::default()), scorer.clone(), memory_cache());

    let summary = run(&p, urls(1)).await;

    // max_retries = 2，共调用 3 次
    assert_eq!(scorer.calls(), 3);
    let result = &summary.pages[0].viewports[0];
    match &result.status {
        AnalysisStatus::Failed(StageError::RetryExhausted { attempts, last }) => {
            assert_eq!(*attempts, 3);
            assert!(last.is_transient());
        }
        other => panic!("unexpected status: {:?}", other),
    }
    assert_eq!(summary.pages[0].status, PageStatus::Incomplete);
    assert_eq!(summary.outcome, RunOutcome::Done);
}

#[tokio::test(start_paused = true)]
async fn test_external_cancel_returns_promptly() {
    let mut config = test_config();
    config.capture.concurrency = 3;
    let capturer = Arc::new(FakeCapturer {
        hang: true,
        ..FakeCapturer::default()
    });
    let scorer = Arc::new(FakeScorer::ok());
    let p = pipeline(config, capturer.clone(), scorer.clone(), memory_cache());

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let summary = p
        .run(&StaticUrlSource::from_urls(urls(20)), cancel)
        .await;

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(summary.abort_reason, Some(AbortReason::Cancelled));
    assert!(summary.partial);
    assert_eq!(summary.done_pages(), 0);
    assert_eq!(capturer.calls(), 3);
    assert_eq!(summary.pages.len(), 3);
    assert_eq!(summary.skipped_urls.len(), 17);
    assert_eq!(scorer.calls(), 0);
    for page in &summary.pages {
        assert_eq!(page.capture_failures[0].error, StageError::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_slow_scoring_blocks_capture() {
    let mut config = test_config();
    config.capture.concurrency = 5;
    config.analysis.concurrency = 1;
    config.pipeline.queue_capacity = 1;
    let (gate_tx, gate_rx) = watch::channel(false);
    let capturer = Arc::new(FakeCapturer::default());
    let scorer = Arc::new(FakeScorer {
        gate: Some(gate_rx),
        ..FakeScorer::ok()
    });
    let p = pipeline(config, capturer.clone(), scorer.clone(), memory_cache());

    let driver = async {
        sleep(Duration::from_secs(5)).await;
        let stalled = capturer.calls();
        gate_tx.send_replace(true);
        stalled
    };
    let (summary, stalled) = tokio::join!(run(&p, urls(10)), driver);

    // 截图并发 5 + 分析队列 1 + 分析并发 1
    assert!(stalled <= 7, "captured {} while scoring was stalled", stalled);
    assert!(stalled >= 5);
    assert_eq!(summary.outcome, RunOutcome::Done);
    assert_eq!(summary.pages.len(), 10);
    assert!(summary.pages.iter().all(|p| p.status == PageStatus::Complete));
    assert_eq!(scorer.calls(), 10);
}

fn failing_majority(grace_period_ms: u64) -> (Pipeline, Arc<FakeScorer>, Vec<String>) {
    let mut config = test_config();
    config.capture.concurrency = 10;
    config.pipeline.queue_capacity = 10;
    config.pipeline.max_failure_rate = 0.5;
    config.pipeline.grace_period_ms = grace_period_ms;
    let list = urls(10);
    let capturer = Arc::new(FakeCapturer {
        broken: list[..6].iter().cloned().collect(),
        delay: Duration::from_secs(10),
        ..FakeCapturer::default()
    });
    let scorer = Arc::new(FakeScorer::ok());
    let p = pipeline(config, capturer, scorer.clone(), memory_cache());
    (p, scorer, list)
}

#[tokio::test(start_paused = true)]
async fn test_failure_rate_aborts_run() {
    let (p, scorer, list) = failing_majority(0);

    let start = Instant::now();
    let summary = run(&p, list).await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(
        summary.abort_reason,
        Some(AbortReason::FailureRate {
            failed_pages: 6,
            total_pages: 10,
            threshold: 0.5,
        })
    );
    assert_eq!(scorer.calls(), 0);
    assert_eq!(summary.done_pages(), 6);
    assert!(summary.partial);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_expiry_cancels_in_flight_captures() {
    let (p, scorer, list) = failing_majority(2_000);

    let start = Instant::now();
    let summary = run(&p, list).await;
    let elapsed = start.elapsed();

    // 阈值在 t≈0 触发，2 秒宽限期结束时仍在截图的页面被取消
    assert!(elapsed >= Duration::from_secs(2), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert!(matches!(
        summary.abort_reason,
        Some(AbortReason::FailureRate { failed_pages: 6, total_pages: 10, .. })
    ));
    assert_eq!(scorer.calls(), 0);
    assert_eq!(summary.done_pages(), 6);

    let interrupted: Vec<_> = summary.pages.iter().filter(|p| !p.is_done()).collect();
    assert!(!interrupted.is_empty());
    for page in interrupted {
        assert!(page.viewports.is_empty());
        assert_eq!(page.capture_failures[0].error, StageError::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_captures_finish_within_grace_period() {
    let (p, scorer, list) = failing_majority(20_000);

    let start = Instant::now();
    let summary = run(&p, list).await;
    let elapsed = start.elapsed();

    // 在途截图 10 秒后正常完成，所有阶段退出，不必等满宽限期
    assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(20), "elapsed {:?}", elapsed);
    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert_eq!(scorer.calls(), 0);
    assert_eq!(summary.done_pages(), 6);

    // 截图成功但已停止领取新工作，评分记为取消
    let interrupted: Vec<_> = summary.pages.iter().filter(|p| !p.is_done()).collect();
    assert!(!interrupted.is_empty());
    for page in interrupted {
        assert!(page.capture_failures.is_empty());
        assert_eq!(page.viewports[0].error(), Some(&StageError::Cancelled));
        assert_eq!(page.viewports[0].load_time_ms, 100);
    }
}

#[tokio::test(start_paused = true)]
async fn test_summary_is_reproducible() {
    let make = || {
        let mut config = test_config();
        config.capture.viewports = vec![Viewport::desktop(), Viewport::tablet()];
        pipeline(
            config,
            Arc::new(FakeCapturer::default()),
            Arc::new(FakeScorer::ok()),
            memory_cache(),
        )
    };

    let a = run(&make(), urls(4)).await;
    let b = run(&make(), urls(4)).await;

    assert_eq!(
        serde_json::to_string(&a.pages).unwrap(),
        serde_json::to_string(&b.pages).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a.dimension_averages).unwrap(),
        serde_json::to_string(&b.dimension_averages).unwrap()
    );
    assert_eq!(a.insights, b.insights);
    assert_eq!(a.best_dimension, b.best_dimension);
}

#[tokio::test(start_paused = true)]
async fn test_duplicates_and_empty_source() {
    let capturer = Arc::new(FakeCapturer::default());
    let p = pipeline(test_config(), capturer.clone(), Arc::new(FakeScorer::ok()), memory_cache());

    let mut list = urls(2);
    list.push(list[0].clone());
    let summary = run(&p, list).await;
    assert_eq!(summary.total_pages, 2);
    assert_eq!(capturer.calls(), 2);

    let empty = run(&p, Vec::new()).await;
    assert_eq!(empty.outcome, RunOutcome::Done);
    assert_eq!(empty.total_pages, 0);
    assert!(empty.pages.is_empty());
    assert!(!empty.partial);
    assert_eq!(empty.overall_average, None);
}

#[tokio::test]
async fn test_unreadable_source_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(
        test_config(),
        Arc::new(FakeCapturer::default()),
        Arc::new(FakeScorer::ok()),
        memory_cache(),
    );

    let source = FileUrlSource::new(dir.path().join("missing.txt"));
    let summary = p.run(&source, CancelToken::new()).await;

    assert_eq!(summary.outcome, RunOutcome::Aborted);
    assert!(matches!(summary.abort_reason, Some(AbortReason::SourceFailed { .. })));
    assert_eq!(summary.total_pages, 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_writer_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let list = urls(2);
    let capturer = Arc::new(FakeCapturer {
        broken: HashSet::from([list[0].clone()]),
        ..FakeCapturer::default()
    });
    let p = pipeline(test_config(), capturer, Arc::new(FakeScorer::ok()), memory_cache());
    let summary = run(&p, list).await;

    let summary_path = dir.path().join("reports").join("summary.json");
    let failure_path = dir.path().join("failures.txt");
    let writer = ReportWriter::new(&summary_path, &failure_path);

    writer.write_summary(&summary).await.unwrap();
    let back: RunSummary =
        serde_json::from_str(&std::fs::read_to_string(&summary_path).unwrap()).unwrap();
    assert_eq!(back, summary);

    assert_eq!(writer.append_failures(&summary).await.unwrap(), 1);
    assert_eq!(writer.append_failures(&summary).await.unwrap(), 1);
    let log = std::fs::read_to_string(&failure_path).unwrap();
    assert_eq!(log.matches("# 运行").count(), 2);
    assert!(log.contains("截图失败"));
    assert!(log.contains("https://site1.example/"));
}
