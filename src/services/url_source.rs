//! URL 来源 - 业务能力层
//!
//! 只负责给出候选 URL 列表，去重、排序、截断由编排层统一处理

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

/// 候选 URL 及建议优先级（越大越先处理）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCandidate {
    pub url: String,
    pub priority: i32,
}

impl UrlCandidate {
    pub fn new(url: impl Into<String>, priority: i32) -> Self {
        Self {
            url: url.into(),
            priority,
        }
    }
}

/// 每次运行读取一次，实现可以重复读取
#[async_trait]
pub trait UrlSource: Send + Sync {
    async fn urls(&self) -> AppResult<Vec<UrlCandidate>>;
}

/// 内存中的固定列表
#[derive(Debug, Clone, Default)]
pub struct StaticUrlSource {
    candidates: Vec<UrlCandidate>,
}

impl StaticUrlSource {
    pub fn new(candidates: Vec<UrlCandidate>) -> Self {
        Self { candidates }
    }

    /// 全部使用优先级 0
    pub fn from_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: urls.into_iter().map(|u| UrlCandidate::new(u, 0)).collect(),
        }
    }
}

#[async_trait]
impl UrlSource for StaticUrlSource {
    async fn urls(&self) -> AppResult<Vec<UrlCandidate>> {
        Ok(self.candidates.clone())
    }
}

/// URL 列表文件
///
/// 每行一个 URL，可在其后用空白分隔给出整数优先级；空行和 `#` 开头的行被忽略。
#[derive(Debug, Clone)]
pub struct FileUrlSource {
    path: PathBuf,
}

impl FileUrlSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl UrlSource for FileUrlSource {
    async fn urls(&self) -> AppResult<Vec<UrlCandidate>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AppError::file(self.path.display().to_string(), e))?;
        let candidates = parse_url_list(&content);
        info!(
            "📄 从 {} 读取到 {} 个 URL",
            self.path.display(),
            candidates.len()
        );
        Ok(candidates)
    }
}

pub fn parse_url_list(content: &str) -> Vec<UrlCandidate> {
    let mut candidates = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(url) = parts.next() else {
            continue;
        };
        let priority = match parts.next() {
            None => 0,
            Some(raw) => raw.parse::<i32>().unwrap_or_else(|_| {
                warn!("第 {} 行优先级无法解析: '{}'，按 0 处理", line_no + 1, raw);
                0
            }),
        };
        debug!("URL: {} (优先级 {})", url, priority);
        candidates.push(UrlCandidate::new(url, priority));
    }

    candidates
}
