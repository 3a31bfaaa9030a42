//! 页面进度账本 - 编排层
//!
//! 根据阶段事件记录每个页面走到了哪一步，运行结束时整理成 [`PageRecord`]。
//! 只有编排层的事件循环会修改它。

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::StageError;
use crate::models::{AnalysisResult, CaptureFailure, CaptureKey, PageStage, PageTask};
use crate::workflow::{CaptureOutcome, PageRecord};

#[derive(Debug)]
struct PageProgress {
    task: Arc<PageTask>,
    stage: PageStage,
    captured: BTreeMap<String, CaptureOutcome>,
    capture_failures: BTreeMap<String, CaptureFailure>,
    results: BTreeMap<String, AnalysisResult>,
}

impl PageProgress {
    fn new(task: Arc<PageTask>) -> Self {
        Self {
            task,
            stage: PageStage::Collected,
            captured: BTreeMap::new(),
            capture_failures: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    fn advance(&mut self, stage: PageStage) {
        self.stage = self.stage.max(stage);
    }

    /// 每个 viewport 都有了最终结果（截图失败或评分结果）
    fn is_settled(&self) -> bool {
        self.task.viewports.iter().all(|vp| {
            self.results.contains_key(&vp.name) || self.capture_failures.contains_key(&vp.name)
        })
    }

    /// 所有 viewport 截图都失败，且不是因为取消
    fn capture_failed(&self) -> bool {
        self.task.viewports.iter().all(|vp| {
            self.capture_failures
                .get(&vp.name)
                .map_or(false, |f| !f.error.is_cancelled())
        })
    }

    fn scored(&self) -> usize {
        self.results.values().filter(|r| r.is_scored()).count()
    }
}

/// 整个运行的页面进度
#[derive(Debug)]
pub struct RunProgress {
    pages: BTreeMap<usize, PageProgress>,
    failed_capture_pages: usize,
}

impl RunProgress {
    pub fn new(tasks: &[Arc<PageTask>]) -> Self {
        Self {
            pages: tasks
                .iter()
                .map(|task| (task.id, PageProgress::new(task.clone())))
                .collect(),
            failed_capture_pages: 0,
        }
    }

    /// 截图全部失败的页面数
    pub fn failed_capture_pages(&self) -> usize {
        self.failed_capture_pages
    }

    pub fn on_capture_started(&mut self, key: &CaptureKey) {
        if let Some(page) = self.pages.get_mut(&key.task_id) {
            page.advance(PageStage::Capturing);
        }
    }

    /// 返回这次截图是否让页面刚刚变成“截图失败”
    pub fn on_captured(&mut self, outcome: CaptureOutcome) -> bool {
        let Some(page) = self.pages.get_mut(&outcome.key.task_id) else {
            return false;
        };
        let viewport = outcome.key.viewport.clone();

        match outcome.error.clone() {
            Some(error) => {
                page.capture_failures.insert(
                    viewport,
                    CaptureFailure {
                        viewport: outcome.key.viewport.clone(),
                        attempts: outcome.attempts,
                        error,
                    },
                );
            }
            None => {
                page.captured.insert(viewport, outcome);
                page.advance(PageStage::Analyzing);
            }
        }

        if page.is_settled() {
            Self::mark_done(page);
        }

        if page.capture_failed() {
            self.failed_capture_pages += 1;
            return true;
        }
        false
    }

    pub fn on_analyzed(&mut self, result: AnalysisResult) {
        let Some(page) = self.pages.get_mut(&result.capture.task_id) else {
            return;
        };
        page.results.insert(result.capture.viewport.clone(), result);
        if page.is_settled() {
            Self::mark_done(page);
        }
    }

    fn mark_done(page: &mut PageProgress) {
        if page.stage == PageStage::Done {
            return;
        }
        page.advance(PageStage::Done);
        info!(
            "[页面 {}] ✅ 处理完成: {}/{} 个 viewport 评分成功",
            page.task.id,
            page.scored(),
            page.task.viewports.len()
        );
    }

    /// 整理成聚合器的输入，同时返回从未开始处理的 URL
    ///
    /// 截图成功但没来得及评分的 viewport 记为取消的评分结果；
    /// 从未截图的 viewport 记为取消的截图失败。
    pub fn finish(self) -> (Vec<PageRecord>, Vec<String>) {
        let mut records = Vec::new();
        let mut skipped = Vec::new();

        for (_, mut page) in self.pages {
            if page.stage == PageStage::Collected {
                skipped.push(page.task.url.clone());
                continue;
            }

            let mut results = Vec::new();
            let mut capture_failures = Vec::new();
            let mut interrupted = false;

            for vp in &page.task.viewports {
                if let Some(result) = page.results.remove(&vp.name) {
                    interrupted |= result.error().map_or(false, StageError::is_cancelled);
                    results.push(result);
                } else if let Some(captured) = page.captured.get(&vp.name) {
                    interrupted = true;
                    results.push(AnalysisResult::failed(
                        captured.key.clone(),
                        captured.fingerprint.clone(),
                        captured.load_time_ms,
                        StageError::Cancelled,
                        0,
                    ));
                } else if let Some(failure) = page.capture_failures.remove(&vp.name) {
                    interrupted |= failure.error.is_cancelled();
                    capture_failures.push(failure);
                } else {
                    interrupted = true;
                    capture_failures.push(CaptureFailure {
                        viewport: vp.name.clone(),
                        attempts: 0,
                        error: StageError::Cancelled,
                    });
                }
            }

            // 有任何一个 viewport 被中断，页面就不算走完
            let stage = if interrupted {
                page.stage.min(PageStage::Analyzing)
            } else {
                PageStage::Done
            };

            records.push(PageRecord {
                task_id: page.task.id,
                url: page.task.url.clone(),
                stage,
                results,
                capture_failures,
            });
        }

        (records, skipped)
    }
}
