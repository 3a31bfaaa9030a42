use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use website_analyzer::browser::launch_browser;
use website_analyzer::services::{
    ChromiumCapturer, FileUrlSource, ImageLimits, OpenAiVisionScorer, ReportWriter,
};
use website_analyzer::utils::logging::{init_tracing, log_startup, print_final_stats};
use website_analyzer::{CancelToken, Config, Pipeline, RateLimiter, ResultCache};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::load().context("加载配置失败")?;

    // 初始化日志
    init_tracing(config.output.verbose_logging);

    config.validate().context("配置校验失败")?;
    config.validate_llm().context("LLM 配置校验失败")?;
    log_startup(&config);

    // 启动浏览器
    let session = launch_browser(&config.capture).await?;
    let capturer = Arc::new(ChromiumCapturer::new(
        session,
        Duration::from_millis(config.capture.settle_ms),
    ));
    let scorer = Arc::new(
        OpenAiVisionScorer::new(&config.llm)
            .with_image_limits(ImageLimits::from_config(&config.analysis)),
    );

    let ttl = Duration::from_secs(config.cache.ttl_secs);
    let cache = match config.cache.path.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(path) => ResultCache::open(path, ttl, config.cache.max_entries).await?,
        None => ResultCache::new(ttl).with_max_entries(config.cache.max_entries),
    };
    let cache = Arc::new(cache);
    let limiter = Arc::new(RateLimiter::new(
        config.analysis.rate_per_second,
        config.analysis.burst,
        config.analysis.max_in_flight,
    ));

    let source = FileUrlSource::new(&config.output.url_file);
    let writer = ReportWriter::new(&config.output.summary_path, &config.output.failure_log);
    let summary_path = config.output.summary_path.clone();

    // Ctrl-C 触发取消
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️ 收到 Ctrl-C，正在停止...");
            trigger.cancel();
        }
    });

    let pipeline = Pipeline::new(config, capturer.clone(), scorer, cache.clone(), limiter)?;
    let summary = pipeline.run(&source, cancel).await;
    drop(pipeline);

    writer.write_summary(&summary).await?;
    let failures = writer.append_failures(&summary).await?;
    if failures > 0 {
        info!("📝 已记录 {} 条失败", failures);
    }

    match cache.flush().await {
        Ok(n) if n > 0 => info!("💾 缓存已保存 {} 条", n),
        Ok(_) => {}
        Err(e) => error!("❌ 保存缓存失败: {}", e),
    }

    match Arc::try_unwrap(capturer) {
        Ok(capturer) => capturer.shutdown().await,
        Err(_) => warn!("⚠️ 浏览器仍被引用，跳过关闭"),
    }

    print_final_stats(&summary, &summary_path);

    if summary.is_aborted() {
        anyhow::bail!(
            "运行中止: {}",
            summary
                .abort_reason
                .map(|r| r.to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}
