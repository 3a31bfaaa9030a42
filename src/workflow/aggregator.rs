//! 聚合器 - 流程层
//!
//! 把评分结果按页面、按维度汇总成 PageReport 与 RunSummary。
//! 纯函数：同样的输入总是得到逐字节相同的输出。

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::models::{
    AbortReason, AnalysisResult, AnalysisStatus, CaptureFailure, Dimension, DimensionScore,
    DimensionScores, GradeScale, Insights, PageReport, PageStage, PageStatus, RunOutcome,
    RunStats, RunSummary,
};

const TOP_STRENGTHS: usize = 5;
const TOP_WEAKNESSES: usize = 5;
const TOP_RECOMMENDATIONS: usize = 10;

/// 单个页面的全部结果，由编排层整理后交给聚合器
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub task_id: usize,
    pub url: String,
    pub stage: PageStage,
    /// 按页面 viewport 顺序排列
    pub results: Vec<AnalysisResult>,
    pub capture_failures: Vec<CaptureFailure>,
}

impl PageRecord {
    /// 只有评分结果时按页面分组，页面内按 viewport 名排序
    pub fn group(results: Vec<AnalysisResult>) -> Vec<PageRecord> {
        let mut pages: BTreeMap<usize, PageRecord> = BTreeMap::new();
        for result in results {
            pages
                .entry(result.capture.task_id)
                .or_insert_with(|| PageRecord {
                    task_id: result.capture.task_id,
                    url: result.capture.url.clone(),
                    stage: PageStage::Done,
                    results: Vec::new(),
                    capture_failures: Vec::new(),
                })
                .results
                .push(result);
        }
        pages
            .into_values()
            .map(|mut page| {
                page.results
                    .sort_by(|a, b| a.capture.viewport.cmp(&b.capture.viewport));
                page
            })
            .collect()
    }
}

/// 聚合时需要的运行元信息
#[derive(Debug, Clone, PartialEq)]
pub struct RunMeta {
    pub run_id: String,
    pub outcome: RunOutcome,
    pub abort_reason: Option<AbortReason>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_pages: usize,
    pub skipped_urls: Vec<String>,
    pub scorer_calls: u64,
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    grades: GradeScale,
    dimensions: Vec<Dimension>,
}

fn mean<I: IntoIterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

/// 按 (出现次数降序, 文本升序) 取前 `limit` 条
fn top_items<'a, I: IntoIterator<Item = &'a String>>(items: I, limit: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        let text = item.trim();
        if !text.is_empty() {
            *counts.entry(text).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(text, _)| text.to_string())
        .collect()
}

impl Aggregator {
    pub fn new(grades: GradeScale, dimensions: Vec<Dimension>) -> Self {
        Self { grades, dimensions }
    }

    /// 每个维度在所有成功结果上的平均分
    pub fn dimension_means(&self, results: &[AnalysisResult]) -> DimensionScores {
        let scored: Vec<&AnalysisResult> = results.iter().filter(|r| r.is_scored()).collect();
        self.dimensions
            .iter()
            .filter_map(|dim| {
                mean(scored.iter().filter_map(|r| r.card.scores.get(dim).copied()))
                    .map(|m| (*dim, m))
            })
            .collect()
    }

    pub fn page_report(&self, record: &PageRecord) -> PageReport {
        let dimension_averages = self.dimension_means(&record.results);
        let overall_score = mean(dimension_averages.values().copied());

        let scored = record.results.iter().filter(|r| r.is_scored()).count();
        let expected = record.results.len() + record.capture_failures.len();
        let status = if scored == 0 {
            PageStatus::Incomplete
        } else if scored == expected {
            PageStatus::Complete
        } else {
            PageStatus::Partial
        };

        PageReport {
            task_id: record.task_id,
            url: record.url.clone(),
            stage: record.stage,
            status,
            viewports: record.results.clone(),
            capture_failures: record.capture_failures.clone(),
            grade: overall_score.map(|s| self.grades.grade(s)),
            overall_score,
            dimension_averages,
            average_load_time_ms: mean(record.results.iter().map(|r| r.load_time_ms as f64)),
        }
    }

    pub fn summarize(&self, meta: RunMeta, records: &[PageRecord]) -> RunSummary {
        let mut pages: Vec<PageReport> = records.iter().map(|r| self.page_report(r)).collect();
        pages.sort_by_key(|p| p.task_id);

        let overall_average = mean(pages.iter().filter_map(|p| p.overall_score));

        let dimension_averages: DimensionScores = self
            .dimensions
            .iter()
            .filter_map(|dim| {
                mean(pages.iter().filter_map(|p| p.dimension_averages.get(dim).copied()))
                    .map(|m| (*dim, m))
            })
            .collect();

        // BTreeMap 按维度顺序遍历，严格比较保证并列时取靠前的维度
        let mut best: Option<DimensionScore> = None;
        let mut worst: Option<DimensionScore> = None;
        for (dim, score) in &dimension_averages {
            let entry = DimensionScore {
                dimension: *dim,
                score: *score,
            };
            if best.map_or(true, |b| *score > b.score) {
                best = Some(entry);
            }
            if worst.map_or(true, |w| *score < w.score) {
                worst = Some(entry);
            }
        }

        let all_results: Vec<&AnalysisResult> = pages.iter().flat_map(|p| p.viewports.iter()).collect();
        let scored: Vec<&AnalysisResult> = all_results.iter().copied().filter(|r| r.is_scored()).collect();

        let mut by_viewport: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for result in &scored {
            if let Some(m) = mean(result.card.scores.values().copied()) {
                by_viewport
                    .entry(result.capture.viewport.clone())
                    .or_default()
                    .push(m);
            }
        }
        let viewport_averages = by_viewport
            .into_iter()
            .filter_map(|(vp, scores)| mean(scores).map(|m| (vp, m)))
            .collect();

        let insights = Insights {
            top_strengths: top_items(scored.iter().copied().flat_map(|r| r.card.strengths.iter()), TOP_STRENGTHS),
            common_weaknesses: top_items(scored.iter().copied().flat_map(|r| r.card.weaknesses.iter()), TOP_WEAKNESSES),
            priority_recommendations: top_items(
                scored.iter().copied().flat_map(|r| r.card.recommendations.iter()),
                TOP_RECOMMENDATIONS,
            ),
        };

        let analysis_failures = all_results.iter().filter(|r| r.error().is_some()).count();
        let capture_failures: usize = pages.iter().map(|p| p.capture_failures.len()).sum();
        let failure_count = analysis_failures + capture_failures;
        let failed_pages = pages
            .iter()
            .filter(|p| p.status == PageStatus::Incomplete)
            .count();

        let stats = RunStats {
            captured_viewports: all_results.len(),
            scorer_calls: meta.scorer_calls,
            cache_hits: all_results
                .iter()
                .filter(|r| r.status == AnalysisStatus::CacheHit)
                .count(),
            failed_items: failure_count,
        };

        let partial = meta.outcome == RunOutcome::Aborted
            || !meta.skipped_urls.is_empty()
            || pages.iter().any(|p| p.status != PageStatus::Complete);

        RunSummary {
            run_id: meta.run_id,
            outcome: meta.outcome,
            abort_reason: meta.abort_reason,
            partial,
            started_at: meta.started_at,
            duration_ms: meta.duration_ms,
            total_pages: meta.total_pages,
            overall_grade: overall_average.map(|s| self.grades.grade(s)),
            overall_average,
            dimension_averages,
            best_dimension: best,
            worst_dimension: worst,
            viewport_averages,
            average_load_time_ms: mean(all_results.iter().map(|r| r.load_time_ms as f64)),
            failure_count,
            failed_pages,
            insights,
            stats,
            skipped_urls: meta.skipped_urls,
            pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::models::{CaptureKey, Fingerprint, Grade, ScoreCard};

    fn result(task_id: usize, viewport: &str, scores: &[(Dimension, f64)]) -> AnalysisResult {
        let key = CaptureKey {
            task_id,
            url: format!("https://a.example/{}", task_id),
            viewport: viewport.to_string(),
        };
        let card = ScoreCard {
            scores: scores.iter().copied().collect(),
            findings: String::new(),
            strengths: vec!["clear layout".to_string()],
            weaknesses: vec![format!("weakness {}", task_id % 2)],
            recommendations: vec![],
            confidence: None,
        };
        AnalysisResult::scored(key, Fingerprint::compute("u", viewport, b"x"), 100, card, 1)
    }

    fn aggregator() -> Aggregator {
        Aggregator::new(GradeScale::default(), Dimension::ALL.to_vec())
    }

    fn meta() -> RunMeta {
        RunMeta {
            run_id: "run".to_string(),
            outcome: RunOutcome::Done,
            abort_reason: None,
            started_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            duration_ms: 1,
            total_pages: 2,
            skipped_urls: vec![],
            scorer_calls: 3,
        }
    }

    #[test]
    fn test_page_means_and_grade() {
        let record = PageRecord {
            task_id: 1,
            url: "https://a.example/1".to_string(),
            stage: PageStage::Done,
            results: vec![
                result(1, "desktop", &[(Dimension::VisualDesign, 90.0), (Dimension::UserExperience, 80.0)]),
                result(1, "mobile", &[(Dimension::VisualDesign, 70.0), (Dimension::UserExperience, 60.0)]),
            ],
            capture_failures: vec![],
        };
        let report = aggregator().page_report(&record);

        assert_eq!(report.dimension_averages[&Dimension::VisualDesign], 80.0);
        assert_eq!(report.dimension_averages[&Dimension::UserExperience], 70.0);
        assert_eq!(report.overall_score, Some(75.0));
        assert_eq!(report.grade, Some(Grade::C));
        assert_eq!(report.status, PageStatus::Complete);
    }

    #[test]
    fn test_failed_results_are_excluded_and_empty_page_is_incomplete() {
        let failed = AnalysisResult::failed(
            CaptureKey {
                task_id: 2,
                url: "https://a.example/2".to_string(),
                viewport: "desktop".to_string(),
            },
            None,
            0,
            StageError::permanent("bad reply"),
            1,
        );
        let record = PageRecord {
            task_id: 2,
            url: "https://a.example/2".to_string(),
            stage: PageStage::Done,
            results: vec![failed.clone()],
            capture_failures: vec![CaptureFailure {
                viewport: "mobile".to_string(),
                attempts: 4,
                error: StageError::transient("timeout after 30000ms"),
            }],
        };
        let report = aggregator().page_report(&record);
        assert_eq!(report.status, PageStatus::Incomplete);
        assert_eq!(report.overall_score, None);
        assert_eq!(report.grade, None);
        assert!(report.dimension_averages.is_empty());

        let partial = PageRecord {
            results: vec![result(2, "desktop", &[(Dimension::VisualDesign, 88.0)]), failed],
            ..record
        };
        let report = aggregator().page_report(&partial);
        assert_eq!(report.status, PageStatus::Partial);
        assert_eq!(report.overall_score, Some(88.0));
    }

    #[test]
    fn test_run_level_best_worst_and_insights() {
        let records = PageRecord::group(vec![
            result(2, "desktop", &[(Dimension::VisualDesign, 60.0), (Dimension::ContentQuality, 90.0)]),
            result(1, "desktop", &[(Dimension::VisualDesign, 80.0), (Dimension::ContentQuality, 70.0)]),
        ]);
        assert_eq!(records[0].task_id, 1);

        let summary = aggregator().summarize(meta(), &records);
        assert_eq!(summary.pages.len(), 2);
        assert_eq!(summary.overall_average, Some(75.0));
        // 两个维度平均都是 70/80：VisualDesign 70，ContentQuality 80
        assert_eq!(summary.best_dimension.unwrap().dimension, Dimension::ContentQuality);
        assert_eq!(summary.worst_dimension.unwrap().dimension, Dimension::VisualDesign);
        assert_eq!(summary.viewport_averages["desktop"], 75.0);
        assert_eq!(summary.insights.top_strengths, vec!["clear layout".to_string()]);
        assert_eq!(
            summary.insights.common_weaknesses,
            vec!["weakness 0".to_string(), "weakness 1".to_string()]
        );
        assert_eq!(summary.stats.scorer_calls, 3);
        assert!(!summary.partial);
    }

    #[test]
    fn test_tied_dimensions_pick_first_in_order() {
        let records = PageRecord::group(vec![result(
            1,
            "desktop",
            &[(Dimension::UserExperience, 50.0), (Dimension::TechnicalQuality, 50.0)],
        )]);
        let summary = aggregator().summarize(meta(), &records);
        assert_eq!(summary.best_dimension.unwrap().dimension, Dimension::UserExperience);
        assert_eq!(summary.worst_dimension.unwrap().dimension, Dimension::UserExperience);
    }

    #[test]
    fn test_summary_is_deterministic() {
        let records = PageRecord::group(vec![
            result(1, "mobile", &[(Dimension::VisualDesign, 61.3)]),
            result(1, "desktop", &[(Dimension::VisualDesign, 77.7)]),
            result(3, "desktop", &[(Dimension::ContentQuality, 12.5)]),
        ]);
        let a = serde_json::to_string(&aggregator().summarize(meta(), &records)).unwrap();
        let b = serde_json::to_string(&aggregator().summarize(meta(), &records)).unwrap();
        assert_eq!(a, b);
    }
}
