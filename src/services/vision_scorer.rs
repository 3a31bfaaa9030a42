//! 视觉评分服务 - 业务能力层
//!
//! 只负责"给一张截图打分"，不关心限流、重试和缓存
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 调用兼容 OpenAI 的 Vision 接口
//! - 截图先压缩为 JPEG（见 [`optimize_image`]），再以 base64 data URL 内联发送

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
        ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionRequestUserMessageContentPart, CreateChatCompletionRequestArgs, ImageDetail,
        ImageUrl,
    },
    Client,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AnalysisConfig, LlmConfig};
use crate::error::{classify_http_status, StageError};
use crate::models::{Dimension, ScoreCard};
use crate::services::image_optimizer::{optimize_image, ImageLimits, PreparedImage};

/// 一次评分请求使用的提示词配置
#[derive(Debug, Clone, PartialEq)]
pub struct PromptProfile {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    /// auto / high / low
    pub image_detail: String,
}

impl PromptProfile {
    pub fn new(name: impl Into<String>, dimensions: Vec<Dimension>) -> Self {
        Self {
            name: name.into(),
            dimensions,
            image_detail: "auto".to_string(),
        }
    }

    pub fn from_config(config: &AnalysisConfig, dimensions: Vec<Dimension>) -> Self {
        Self {
            name: config.prompt_profile.clone(),
            dimensions,
            image_detail: config.image_detail.clone(),
        }
    }

    pub fn system_message(&self) -> String {
        "You are a senior website UX/UI design and digital marketing reviewer. \
         You evaluate webpage screenshots and answer strictly in JSON."
            .to_string()
    }

    pub fn user_message(&self) -> String {
        let dims: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| format!("- \"{}\": {}", d.key(), d.description()))
            .collect();
        let example: Vec<String> = self
            .dimensions
            .iter()
            .map(|d| format!("    \"{}\": {{ \"score\": 80 }}", d.key()))
            .collect();

        format!(
            r#"Evaluate this webpage screenshot on the following dimensions, each scored from 0 to 100:
{}

Reply with a single JSON object of this shape:
```json
{{
  "scores": {{
{}
  }},
  "findings": "short overall assessment",
  "strengths": ["..."],
  "weaknesses": ["..."],
  "recommendations": ["..."],
  "confidence": 0.8
}}
```
Base every judgement on what is visible in the screenshot and give concrete, actionable recommendations."#,
            dims.join("\n"),
            example.join(",\n")
        )
    }

    fn detail(&self) -> ImageDetail {
        match self.image_detail.to_ascii_lowercase().as_str() {
            "high" => ImageDetail::High,
            "low" => ImageDetail::Low,
            _ => ImageDetail::Auto,
        }
    }
}

/// 评分能力
///
/// 返回的分数不做范围校验，由分析阶段统一处理。
#[async_trait]
pub trait VisionScorer: Send + Sync {
    async fn score(&self, image: &[u8], profile: &PromptProfile) -> Result<ScoreCard, StageError>;
}

/// 基于 OpenAI 兼容接口的评分实现
pub struct OpenAiVisionScorer {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_tokens: u32,
    temperature: f32,
    image_limits: ImageLimits,
}

impl OpenAiVisionScorer {
    pub fn new(config: &LlmConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.api_key)
            .with_api_base(&config.api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.model_name.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            image_limits: ImageLimits::default(),
        }
    }

    pub fn with_image_limits(mut self, limits: ImageLimits) -> Self {
        self.image_limits = limits;
        self
    }

    /// 解码与缩放放到阻塞线程池
    async fn prepare_image(&self, image: &[u8]) -> PreparedImage {
        let png = image.to_vec();
        let limits = self.image_limits;
        match tokio::task::spawn_blocking(move || optimize_image(&png, &limits)).await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("截图压缩任务异常: {}", e);
                PreparedImage {
                    bytes: image.to_vec(),
                    mime: "image/png",
                }
            }
        }
    }

    fn build_messages(
        &self,
        image: &PreparedImage,
        profile: &PromptProfile,
    ) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(profile.system_message())
            .build()?;

        let data_url = image.data_url(&BASE64.encode(&image.bytes));
        let parts = vec![
            ChatCompletionRequestUserMessageContentPart::Text(
                ChatCompletionRequestMessageContentPartText {
                    text: profile.user_message(),
                },
            ),
            ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImage {
                    image_url: ImageUrl {
                        url: data_url,
                        detail: Some(profile.detail()),
                    },
                },
            ),
        ];
        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Array(parts))
            .build()?;

        Ok(vec![
            ChatCompletionRequestMessage::System(system_msg),
            ChatCompletionRequestMessage::User(user_msg),
        ])
    }
}

#[async_trait]
impl VisionScorer for OpenAiVisionScorer {
    async fn score(&self, image: &[u8], profile: &PromptProfile) -> Result<ScoreCard, StageError> {
        let prepared = self.prepare_image(image).await;
        debug!(
            "调用 Vision API，模型: {}，图片 {} KB ({})",
            self.model_name,
            prepared.bytes.len() / 1024,
            prepared.mime
        );

        let messages = self
            .build_messages(&prepared, profile)
            .map_err(classify_openai_error)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build()
            .map_err(classify_openai_error)?;

        let response = self.client.chat().create(request).await.map_err(|e| {
            warn!("Vision API 调用失败: {}", e);
            classify_openai_error(e)
        })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| StageError::permanent("模型返回内容为空"))?;

        parse_score_reply(&content)
    }
}

/// 把接口错误归类为可重试或不可重试
pub fn classify_openai_error(err: OpenAIError) -> StageError {
    match err {
        OpenAIError::Reqwest(e) => match e.status() {
            Some(status) => classify_http_status(status.as_u16(), e.to_string()),
            None => StageError::transient(format!("网络错误: {}", e)),
        },
        OpenAIError::ApiError(api) => {
            let text = format!("{:?}", api).to_lowercase();
            let retryable = ["rate_limit", "rate limit", "overloaded", "server_error", "timeout"]
                .iter()
                .any(|marker| text.contains(marker));
            if retryable {
                StageError::transient(api.message)
            } else {
                StageError::permanent(api.message)
            }
        }
        OpenAIError::JSONDeserialize(..) => StageError::permanent(format!("响应格式错误: {}", err)),
        OpenAIError::InvalidArgument(msg) => StageError::permanent(msg),
        other => StageError::transient(other.to_string()),
    }
}

/// 从模型回复中取出 JSON：优先 ```json 代码块，其次最外层的大括号
fn extract_json(reply: &str) -> Option<&str> {
    if let Ok(fenced) = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```") {
        if let Some(m) = fenced.captures(reply).and_then(|c| c.get(1)) {
            return Some(m.as_str());
        }
    }
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

fn number_or_score(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.get("score").and_then(Value::as_f64))
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .or_else(|| value.get("analysis").and_then(|a| a.get(key)))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// 宽松解析模型回复
///
/// 维度既可以放在 `scores` 对象里也可以放在顶层，值可以是数字或 `{ "score": n }`。
/// 不认识的键被忽略；是否覆盖了配置的维度由分析阶段检查。
pub fn parse_score_reply(reply: &str) -> Result<ScoreCard, StageError> {
    let json = extract_json(reply)
        .ok_or_else(|| StageError::permanent("模型回复中没有 JSON 对象"))?;
    let value: Value = serde_json::from_str(json)
        .map_err(|e| StageError::permanent(format!("模型回复不是合法 JSON: {}", e)))?;

    let container = value
        .get("scores")
        .filter(|s| s.is_object())
        .unwrap_or(&value);

    let mut card = ScoreCard::default();
    if let Some(map) = container.as_object() {
        for (key, raw) in map {
            let Ok(dim) = key.parse::<Dimension>() else {
                continue;
            };
            if let Some(score) = number_or_score(raw) {
                card.scores.insert(dim, score);
            }
        }
    }

    card.findings = value
        .get("findings")
        .or_else(|| value.get("analysis").and_then(|a| a.get("summary")))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    card.strengths = string_list(&value, "strengths");
    card.weaknesses = string_list(&value, "weaknesses");
    card.recommendations = string_list(&value, "recommendations");
    card.confidence = value
        .get("confidence")
        .or_else(|| value.get("overall").and_then(|o| o.get("confidence")))
        .and_then(Value::as_f64);

    Ok(card)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_reply() {
        let reply = r#"Here is my review:
```json
{
  "scores": {
    "visual_design": 82,
    "user_experience": { "score": 74.5 },
    "technical_quality": 66
  },
  "findings": "Clean layout",
  "strengths": ["clear hierarchy", "  "],
  "weaknesses": ["dense footer"],
  "recommendations": ["add whitespace"],
  "confidence": 0.7
}
```
Thanks!"#;
        let card = parse_score_reply(reply).unwrap();
        assert_eq!(card.scores[&Dimension::VisualDesign], 82.0);
        assert_eq!(card.scores[&Dimension::UserExperience], 74.5);
        assert_eq!(card.scores.len(), 3);
        assert_eq!(card.findings, "Clean layout");
        assert_eq!(card.strengths, vec!["clear hierarchy".to_string()]);
        assert_eq!(card.confidence, Some(0.7));
    }

    #[test]
    fn test_parse_top_level_nested_shape() {
        let reply = r#"{
            "visual_design": {"score": 85, "color_scheme": 90},
            "content_quality": {"score": 60},
            "overall": {"score": 72, "confidence": 0.85},
            "analysis": {"strengths": ["good colors"], "recommendations": ["fix nav"]}
        }"#;
        let card = parse_score_reply(reply).unwrap();
        assert_eq!(card.scores.len(), 2);
        assert_eq!(card.scores[&Dimension::ContentQuality], 60.0);
        assert_eq!(card.strengths, vec!["good colors".to_string()]);
        assert_eq!(card.recommendations, vec!["fix nav".to_string()]);
        assert_eq!(card.confidence, Some(0.85));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_score_reply("I cannot evaluate this image.").unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));

        let err = parse_score_reply("{ not json }").unwrap_err();
        assert!(matches!(err, StageError::Permanent(_)));
    }

    #[test]
    fn test_user_message_lists_configured_dimensions() {
        let profile = PromptProfile::new(
            "website_review",
            vec![Dimension::VisualDesign, Dimension::ContentQuality],
        );
        let msg = profile.user_message();
        assert!(msg.contains("\"visual_design\""));
        assert!(msg.contains("\"content_quality\""));
        assert!(!msg.contains("\"technical_quality\""));
        assert!(matches!(profile.detail(), ImageDetail::Auto));
    }

    #[test]
    fn test_invalid_argument_is_permanent() {
        let err = classify_openai_error(OpenAIError::InvalidArgument("bad model".into()));
        assert_eq!(err, StageError::permanent("bad model"));
    }

    const WHITE_PIXEL_PNG: &str =
        "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mP8/5+hHgAHggJ/PchI7wAAAABJRU5ErkJggg==";

    #[tokio::test]
    async fn test_screenshot_is_sent_as_jpeg_data_url() {
        let scorer = OpenAiVisionScorer::new(&LlmConfig::default());
        let profile = PromptProfile::new("website_review", vec![Dimension::VisualDesign]);
        let png = BASE64.decode(WHITE_PIXEL_PNG).unwrap();

        let prepared = scorer.prepare_image(&png).await;
        assert_eq!(prepared.mime, "image/jpeg");

        let messages = scorer.build_messages(&prepared, &profile).unwrap();
        let json = serde_json::to_string(&messages).unwrap();
        assert!(json.contains("data:image/jpeg;base64,"));
        assert!(!json.contains("data:image/png"));
    }

    /// 需要可用的 LLM_API_KEY
    #[tokio::test]
    #[ignore]
    async fn test_vision_api_scores_png() {
        let _ = tracing_subscriber::fmt::try_init();
        let config = crate::config::Config::from_env().unwrap();
        let scorer = OpenAiVisionScorer::new(&config.llm);
        let profile = PromptProfile::new("website_review", Dimension::ALL.to_vec());

        // 1x1 白色 PNG
        let png = BASE64.decode(WHITE_PIXEL_PNG).unwrap();
        let card = scorer.score(&png, &profile).await.unwrap();
        println!("{:#?}", card);
        assert!(!card.scores.is_empty());
    }
}
