//! 评分维度
//!
//! 维度是固定的枚举集合，配置只能从中挑选；未知名字在配置校验阶段就被拒绝。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// 单个评分维度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    VisualDesign,
    UserExperience,
    TechnicalQuality,
    ContentQuality,
}

/// 维度 → 分数（0–100）
///
/// 用 BTreeMap 保证序列化顺序固定。
pub type DimensionScores = BTreeMap<Dimension, f64>;

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::VisualDesign,
        Dimension::UserExperience,
        Dimension::TechnicalQuality,
        Dimension::ContentQuality,
    ];

    /// 配置与模型回复中使用的键名
    pub fn key(&self) -> &'static str {
        match self {
            Dimension::VisualDesign => "visual_design",
            Dimension::UserExperience => "user_experience",
            Dimension::TechnicalQuality => "technical_quality",
            Dimension::ContentQuality => "content_quality",
        }
    }

    /// 提示词里给模型看的描述
    pub fn description(&self) -> &'static str {
        match self {
            Dimension::VisualDesign => "visual design: color scheme, typography, layout balance, brand consistency",
            Dimension::UserExperience => "user experience: navigation clarity, readability, call-to-action effectiveness, responsiveness",
            Dimension::TechnicalQuality => "technical quality: page structure, accessibility, perceived performance",
            Dimension::ContentQuality => "content quality: relevance, SEO signals, use of multimedia",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Dimension {
    type Err = ConfigError;

    /// 接受 `visual_design` / `visual-design` / `Visual Design` 等写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        match normalized.as_str() {
            "visual_design" => Ok(Dimension::VisualDesign),
            "user_experience" | "ux" => Ok(Dimension::UserExperience),
            "technical_quality" => Ok(Dimension::TechnicalQuality),
            "content_quality" => Ok(Dimension::ContentQuality),
            _ => Err(ConfigError::UnknownDimension {
                name: s.to_string(),
            }),
        }
    }
}

/// 解析逗号分隔的维度列表，去重并保持首次出现的顺序
pub fn parse_dimension_list(raw: &str) -> Result<Vec<Dimension>, ConfigError> {
    let mut dims = Vec::new();
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let dim: Dimension = part.parse()?;
        if !dims.contains(&dim) {
            dims.push(dim);
        }
    }
    if dims.is_empty() {
        return Err(ConfigError::EmptyDimensions);
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_common_spellings() {
        assert_eq!("visual_design".parse::<Dimension>().unwrap(), Dimension::VisualDesign);
        assert_eq!("Visual Design".parse::<Dimension>().unwrap(), Dimension::VisualDesign);
        assert_eq!("user-experience".parse::<Dimension>().unwrap(), Dimension::UserExperience);
        assert_eq!("UX".parse::<Dimension>().unwrap(), Dimension::UserExperience);
    }

    #[test]
    fn test_unknown_dimension_is_rejected() {
        let err = "color_harmony".parse::<Dimension>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDimension { name } if name == "color_harmony"));
    }

    #[test]
    fn test_parse_dimension_list_dedupes() {
        let dims = parse_dimension_list("content_quality, visual_design,content-quality").unwrap();
        assert_eq!(dims, vec![Dimension::ContentQuality, Dimension::VisualDesign]);
        assert!(matches!(parse_dimension_list(" , "), Err(ConfigError::EmptyDimensions)));
    }

    #[test]
    fn test_scores_serialize_in_fixed_order() {
        let mut scores = DimensionScores::new();
        scores.insert(Dimension::ContentQuality, 70.0);
        scores.insert(Dimension::VisualDesign, 90.0);
        let json = serde_json::to_string(&scores).unwrap();
        assert_eq!(json, r#"{"visual_design":90.0,"content_quality":70.0}"#);
    }
}
