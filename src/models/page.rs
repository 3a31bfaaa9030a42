//! 页面任务与截图结果

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StageError;
use crate::models::viewport::Viewport;

/// 待分析的页面任务
///
/// 由编排层从 URL 来源创建，创建后不再修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageTask {
    /// 本次运行内的页面编号（从1开始）
    pub id: usize,
    pub url: String,
    pub priority: i32,
    pub viewports: Vec<Viewport>,
}

impl PageTask {
    pub fn new(id: usize, url: impl Into<String>, priority: i32, viewports: Vec<Viewport>) -> Self {
        Self {
            id,
            url: url.into(),
            priority,
            viewports,
        }
    }
}

/// 内容指纹：URL + viewport + 截图内容哈希
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(url: &str, viewport: &str, content: &[u8]) -> Self {
        let content_hash = Sha256::digest(content);

        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        hasher.update([0u8]);
        hasher.update(viewport.as_bytes());
        hasher.update([0u8]);
        hasher.update(content_hash);
        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 指向某个 (页面, viewport) 截图的引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureKey {
    pub task_id: usize,
    pub url: String,
    pub viewport: String,
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[页面 {}/{}]", self.task_id, self.viewport)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStatus {
    Success,
    Failed(StageError),
}

/// 单个 (页面, viewport) 的截图结果
///
/// 由截图阶段产生，交给分析阶段后不再修改。
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub task: Arc<PageTask>,
    pub viewport: Viewport,
    pub image: Option<Arc<Vec<u8>>>,
    pub fingerprint: Option<Fingerprint>,
    pub load_time_ms: u64,
    pub artifact_path: Option<PathBuf>,
    pub attempts: u32,
    pub status: CaptureStatus,
}

impl CaptureResult {
    pub fn success(
        task: Arc<PageTask>,
        viewport: Viewport,
        image: Vec<u8>,
        load_time_ms: u64,
        attempts: u32,
    ) -> Self {
        let fingerprint = Fingerprint::compute(&task.url, &viewport.name, &image);
        Self {
            task,
            viewport,
            image: Some(Arc::new(image)),
            fingerprint: Some(fingerprint),
            load_time_ms,
            artifact_path: None,
            attempts,
            status: CaptureStatus::Success,
        }
    }

    pub fn failed(task: Arc<PageTask>, viewport: Viewport, error: StageError, attempts: u32) -> Self {
        Self {
            task,
            viewport,
            image: None,
            fingerprint: None,
            load_time_ms: 0,
            artifact_path: None,
            attempts,
            status: CaptureStatus::Failed(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, CaptureStatus::Success)
    }

    pub fn error(&self) -> Option<&StageError> {
        match &self.status {
            CaptureStatus::Failed(e) => Some(e),
            CaptureStatus::Success => None,
        }
    }

    pub fn key(&self) -> CaptureKey {
        CaptureKey {
            task_id: self.task.id,
            url: self.task.url.clone(),
            viewport: self.viewport.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_depends_on_all_parts() {
        let base = Fingerprint::compute("https://a.example/", "desktop", b"png");
        assert_eq!(base, Fingerprint::compute("https://a.example/", "desktop", b"png"));
        assert_ne!(base, Fingerprint::compute("https://a.example/", "mobile", b"png"));
        assert_ne!(base, Fingerprint::compute("https://b.example/", "desktop", b"png"));
        assert_ne!(base, Fingerprint::compute("https://a.example/", "desktop", b"png2"));
        assert_eq!(base.as_str().len(), 64);
    }

    #[test]
    fn test_capture_result_constructors() {
        let task = Arc::new(PageTask::new(1, "https://a.example/", 0, vec![Viewport::desktop()]));
        let ok = CaptureResult::success(task.clone(), Viewport::desktop(), vec![1, 2, 3], 120, 1);
        assert!(ok.is_success());
        assert!(ok.fingerprint.is_some());
        assert_eq!(ok.key().viewport, "desktop");

        let failed = CaptureResult::failed(task, Viewport::mobile(), StageError::Cancelled, 0);
        assert!(!failed.is_success());
        assert_eq!(failed.error(), Some(&StageError::Cancelled));
        assert!(failed.image.is_none());
    }
}
