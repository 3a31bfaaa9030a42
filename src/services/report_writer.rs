//! 报告写入服务 - 业务能力层
//!
//! 只负责把运行汇总落盘：汇总 JSON 与失败列表，不做任何聚合

use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{AppError, AppResult};
use crate::models::{AnalysisStatus, RunSummary};

pub struct ReportWriter {
    summary_path: PathBuf,
    failure_path: PathBuf,
}

impl ReportWriter {
    pub fn new(summary_path: impl Into<PathBuf>, failure_path: impl Into<PathBuf>) -> Self {
        Self {
            summary_path: summary_path.into(),
            failure_path: failure_path.into(),
        }
    }

    /// 覆盖写入汇总 JSON
    pub async fn write_summary(&self, summary: &RunSummary) -> AppResult<&Path> {
        let json = serde_json::to_string_pretty(summary)?;
        ensure_parent(&self.summary_path).await?;
        tokio::fs::write(&self.summary_path, json)
            .await
            .map_err(|e| AppError::file(self.summary_path.display().to_string(), e))?;
        debug!("汇总已写入 {}", self.summary_path.display());
        Ok(&self.summary_path)
    }

    /// 追加失败列表，返回写入的条数
    pub async fn append_failures(&self, summary: &RunSummary) -> AppResult<usize> {
        let lines = failure_lines(summary);
        if lines.is_empty() {
            return Ok(0);
        }

        ensure_parent(&self.failure_path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failure_path)
            .await
            .map_err(|e| AppError::file(self.failure_path.display().to_string(), e))?;

        let mut text = format!(
            "# 运行 {} | {}\n",
            summary.run_id,
            summary.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        for line in &lines {
            text.push_str(line);
            text.push('\n');
        }

        file.write_all(text.as_bytes())
            .await
            .map_err(|e| AppError::file(self.failure_path.display().to_string(), e))?;
        debug!("{} 条失败记录已写入 {}", lines.len(), self.failure_path.display());
        Ok(lines.len())
    }
}

async fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::file(parent.display().to_string(), e))?;
    }
    Ok(())
}

/// 每个失败的 (页面, viewport) 一行，未开始处理的页面也各占一行
pub fn failure_lines(summary: &RunSummary) -> Vec<String> {
    let mut lines = Vec::new();

    for page in &summary.pages {
        for failure in &page.capture_failures {
            lines.push(format!(
                "页面 {} | {} | {} | 截图失败 | 尝试 {} 次 | {}",
                page.task_id, page.url, failure.viewport, failure.attempts, failure.error
            ));
        }
        for result in &page.viewports {
            if let AnalysisStatus::Failed(err) = &result.status {
                lines.push(format!(
                    "页面 {} | {} | {} | 评分失败 | 尝试 {} 次 | {}",
                    page.task_id, page.url, result.capture.viewport, result.attempts, err
                ));
            }
        }
    }
    for url in &summary.skipped_urls {
        lines.push(format!("未处理 | {}", url));
    }

    lines
}
