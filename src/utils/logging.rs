//! 日志工具模块
//!
//! 提供日志初始化、格式化和输出的辅助函数
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::models::RunSummary;

/// 初始化 tracing 日志
///
/// `RUST_LOG` 优先；否则 verbose 为 debug，默认 info。
/// 重复调用（例如测试里）不会报错。
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("website_analyzer={},warn", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
///
/// # 参数
/// - `config`: 已校验的配置
pub fn log_startup(config: &Config) {
    let viewports: Vec<&str> = config
        .capture
        .viewports
        .iter()
        .map(|v| v.name.as_str())
        .collect();

    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 网站批量分析模式");
    info!("🤖 模型: {}", config.llm.model_name);
    info!("📱 Viewport: {}", viewports.join(", "));
    info!(
        "📊 截图并发: {} | 评分并发: {} | 限流: {}/s",
        config.capture.concurrency, config.analysis.concurrency, config.analysis.rate_per_second
    );
    info!("📋 维度: {}", config.analysis.dimensions.join(", "));
    info!("{}", "=".repeat(60));
}

/// 记录运行状态转换
pub fn log_state_transition(run_id: &str, from: impl std::fmt::Display, to: impl std::fmt::Display) {
    info!("[运行 {}] 🔀 {} → {}", run_id, from, to);
}

/// 打印最终统计信息
///
/// # 参数
/// - `summary`: 本次运行的汇总
/// - `summary_path`: 汇总文件路径
pub fn print_final_stats(summary: &RunSummary, summary_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计 (运行 {})", summary.run_id);
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));

    if let Some(reason) = &summary.abort_reason {
        warn!("🛑 运行中止: {}", reason);
    }
    info!(
        "✅ 完成页面: {}/{}",
        summary.done_pages(),
        summary.total_pages
    );
    info!("❌ 失败项: {} (无评分页面 {})", summary.failure_count, summary.failed_pages);
    if !summary.skipped_urls.is_empty() {
        info!("⏭️ 未处理: {}", summary.skipped_urls.len());
    }
    match (summary.overall_average, summary.overall_grade) {
        (Some(score), Some(grade)) => info!("🏆 总体得分: {:.1} ({})", score, grade),
        _ => info!("🏆 总体得分: 无"),
    }
    if let Some(best) = &summary.best_dimension {
        info!("👍 最佳维度: {} ({:.1})", best.dimension, best.score);
    }
    if let Some(worst) = &summary.worst_dimension {
        info!("👎 最弱维度: {} ({:.1})", worst.dimension, worst.score);
    }
    info!(
        "🔁 评分调用 {} 次，缓存命中 {} 次",
        summary.stats.scorer_calls, summary.stats.cache_hits
    );
    info!("{}", "=".repeat(60));
    info!("\n汇总已保存至: {}", summary_path);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text_counts_chars() {
        assert_eq!(truncate_text("短文本", 10), "短文本");
        assert_eq!(truncate_text("网站分析报告", 2), "网站...");
    }
}
