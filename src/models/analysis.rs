//! 评分结果与缓存条目

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::models::dimension::DimensionScores;
use crate::models::page::{CaptureKey, Fingerprint};

/// 一次成功评分的内容
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub scores: DimensionScores,
    pub findings: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    CacheHit,
    Failed(StageError),
}

/// 单个截图的评分结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub capture: CaptureKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    pub load_time_ms: u64,
    pub card: ScoreCard,
    pub attempts: u32,
    pub status: AnalysisStatus,
}

impl AnalysisResult {
    pub fn scored(
        capture: CaptureKey,
        fingerprint: Fingerprint,
        load_time_ms: u64,
        card: ScoreCard,
        attempts: u32,
    ) -> Self {
        Self {
            capture,
            fingerprint: Some(fingerprint),
            load_time_ms,
            card,
            attempts,
            status: AnalysisStatus::Success,
        }
    }

    pub fn cache_hit(
        capture: CaptureKey,
        fingerprint: Fingerprint,
        load_time_ms: u64,
        card: ScoreCard,
    ) -> Self {
        Self {
            capture,
            fingerprint: Some(fingerprint),
            load_time_ms,
            card,
            attempts: 0,
            status: AnalysisStatus::CacheHit,
        }
    }

    pub fn failed(
        capture: CaptureKey,
        fingerprint: Option<Fingerprint>,
        load_time_ms: u64,
        error: StageError,
        attempts: u32,
    ) -> Self {
        Self {
            capture,
            fingerprint,
            load_time_ms,
            card: ScoreCard::default(),
            attempts,
            status: AnalysisStatus::Failed(error),
        }
    }

    /// 成功评分或命中缓存
    pub fn is_scored(&self) -> bool {
        matches!(self.status, AnalysisStatus::Success | AnalysisStatus::CacheHit)
    }

    pub fn error(&self) -> Option<&StageError> {
        match &self.status {
            AnalysisStatus::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// 缓存条目，只保存成功的评分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub card: ScoreCard,
    pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.stored_at) < ttl
    }
}
