//! 阶段之间传递的工作项与进度事件

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::StageError;
use crate::models::{AnalysisResult, CaptureKey, CaptureResult, Fingerprint, PageTask, Viewport};

/// 截图队列中的一项：某个页面的某个 viewport
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub task: Arc<PageTask>,
    pub viewport: Viewport,
}

impl CaptureJob {
    pub fn key(&self) -> CaptureKey {
        CaptureKey {
            task_id: self.task.id,
            url: self.task.url.clone(),
            viewport: self.viewport.name.clone(),
        }
    }
}

/// 截图结果的摘要（不含图片），供编排层记账
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub key: CaptureKey,
    pub fingerprint: Option<Fingerprint>,
    pub load_time_ms: u64,
    pub attempts: u32,
    pub artifact_path: Option<PathBuf>,
    pub error: Option<StageError>,
}

impl From<&CaptureResult> for CaptureOutcome {
    fn from(result: &CaptureResult) -> Self {
        Self {
            key: result.key(),
            fingerprint: result.fingerprint.clone(),
            load_time_ms: result.load_time_ms,
            attempts: result.attempts,
            artifact_path: result.artifact_path.clone(),
            error: result.error().cloned(),
        }
    }
}

/// 各阶段向编排层报告的进度
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// worker 开始处理某个 viewport
    CaptureStarted(CaptureKey),
    /// 某个 viewport 截图结束（成功或最终失败）
    Captured(CaptureOutcome),
    /// 某个截图评分结束（成功、命中缓存或失败）
    Analyzed(AnalysisResult),
    /// 截图阶段全部 worker 已退出
    CaptureFinished,
}
