//! 页面报告与运行汇总
//!
//! 全部由聚合器从评分结果重新计算得出，本身不单独修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ConfigError, StageError};
use crate::models::analysis::AnalysisResult;
use crate::models::dimension::{Dimension, DimensionScores};

/// 字母等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    F,
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        };
        f.write_str(s)
    }
}

/// 等级阈值（分数 ≥ 阈值即得该等级）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradeScale {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self {
            a: 90.0,
            b: 80.0,
            c: 70.0,
            d: 60.0,
        }
    }
}

impl GradeScale {
    pub fn grade(&self, score: f64) -> Grade {
        if score >= self.a {
            Grade::A
        } else if score >= self.b {
            Grade::B
        } else if score >= self.c {
            Grade::C
        } else if score >= self.d {
            Grade::D
        } else {
            Grade::F
        }
    }

    /// 阈值必须在 [0,100] 内且严格递减
    pub fn validate(&self) -> Result<(), ConfigError> {
        let steps = [self.a, self.b, self.c, self.d];
        if steps.iter().any(|t| !(0.0..=100.0).contains(t)) {
            return Err(ConfigError::invalid("grading", "阈值必须在 0–100 之间"));
        }
        if steps.windows(2).any(|w| w[0] <= w[1]) {
            return Err(ConfigError::invalid("grading", "阈值必须满足 A > B > C > D"));
        }
        Ok(())
    }
}

/// 页面走到的最远阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStage {
    Collected,
    Capturing,
    Analyzing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// 所有 viewport 都评分成功
    Complete,
    /// 部分 viewport 成功
    Partial,
    /// 没有任何成功的评分，不给分
    Incomplete,
}

/// 截图阶段的单个 viewport 失败
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureFailure {
    pub viewport: String,
    pub attempts: u32,
    pub error: StageError,
}

/// 单个页面的报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageReport {
    pub task_id: usize,
    pub url: String,
    pub stage: PageStage,
    pub status: PageStatus,
    pub viewports: Vec<AnalysisResult>,
    pub capture_failures: Vec<CaptureFailure>,
    pub dimension_averages: DimensionScores,
    pub overall_score: Option<f64>,
    pub grade: Option<Grade>,
    pub average_load_time_ms: Option<f64>,
}

impl PageReport {
    pub fn is_done(&self) -> bool {
        self.stage == PageStage::Done
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Done,
    Aborted,
}

/// 中止原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    /// 截图失败的页面比例超过阈值
    FailureRate {
        failed_pages: usize,
        total_pages: usize,
        threshold: f64,
    },
    /// 外部取消信号
    Cancelled,
    /// URL 来源读取失败，没有任何页面可处理
    SourceFailed { message: String },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FailureRate {
                failed_pages,
                total_pages,
                threshold,
            } => write!(
                f,
                "截图失败页面 {}/{} 超过阈值 {:.0}%",
                failed_pages,
                total_pages,
                threshold * 100.0
            ),
            AbortReason::Cancelled => f.write_str("收到外部取消信号"),
            AbortReason::SourceFailed { message } => write!(f, "读取 URL 来源失败: {}", message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub dimension: Dimension,
    pub score: f64,
}

/// 全站出现频率最高的优点/缺点/建议
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Insights {
    pub top_strengths: Vec<String>,
    pub common_weaknesses: Vec<String>,
    pub priority_recommendations: Vec<String>,
}

/// 运行统计，由编排层填写
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub captured_viewports: usize,
    pub scorer_calls: u64,
    pub cache_hits: usize,
    pub failed_items: usize,
}

/// 一次完整运行的最终产物，交给报告生成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub abort_reason: Option<AbortReason>,
    pub partial: bool,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_pages: usize,
    pub pages: Vec<PageReport>,
    pub skipped_urls: Vec<String>,
    pub overall_average: Option<f64>,
    pub overall_grade: Option<Grade>,
    pub dimension_averages: DimensionScores,
    pub best_dimension: Option<DimensionScore>,
    pub worst_dimension: Option<DimensionScore>,
    pub viewport_averages: BTreeMap<String, f64>,
    pub average_load_time_ms: Option<f64>,
    pub failure_count: usize,
    pub failed_pages: usize,
    pub insights: Insights,
    pub stats: RunStats,
}

impl RunSummary {
    pub fn is_aborted(&self) -> bool {
        self.outcome == RunOutcome::Aborted
    }

    pub fn done_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_done()).count()
    }
}
