//! 程序配置
//!
//! 默认值 → TOML 文件（`WEBSITE_ANALYZER_CONFIG`）→ 环境变量，后者覆盖前者。
//! 所有数值在开始工作前由 [`Config::validate`] 统一校验。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::infrastructure::result_cache::DEFAULT_MAX_ENTRIES;
use crate::models::{parse_dimension_list, Dimension, GradeScale, Viewport};

/// 评分速率下限（次/秒），约每 17 分钟一次
pub const MIN_RATE_PER_SECOND: f64 = 0.001;

/// 截图阶段配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// 同时截图的 worker 数量
    pub concurrency: usize,
    /// 单次截图超时（毫秒）
    pub timeout_ms: u64,
    /// 导航完成后额外等待页面稳定的时间（毫秒）
    pub settle_ms: u64,
    pub viewports: Vec<Viewport>,
    /// 截图保存目录，为空则不落盘
    pub screenshot_dir: Option<String>,
    pub headless: bool,
    pub chrome_executable: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            timeout_ms: 30_000,
            settle_ms: 1_000,
            viewports: Viewport::defaults(),
            screenshot_dir: Some("screenshots".to_string()),
            headless: true,
            chrome_executable: None,
        }
    }
}

/// 分析阶段配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// 同时评分的 worker 数量
    pub concurrency: usize,
    /// 评分接口调用速率（次/秒）
    pub rate_per_second: f64,
    /// 令牌桶容量
    pub burst: u32,
    /// 同时在途的评分请求上限（跨所有 worker）
    pub max_in_flight: usize,
    /// 评分维度名称，校验时转换为 [`Dimension`]
    pub dimensions: Vec<String>,
    pub prompt_profile: String,
    /// 图片细节等级：auto / high / low
    pub image_detail: String,
    /// 发送前截图缩放的最大宽高（像素）
    pub max_image_width: u32,
    pub max_image_height: u32,
    /// 发送前 JPEG 编码质量 1–100
    pub jpeg_quality: u8,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            rate_per_second: 1.0,
            burst: 1,
            max_in_flight: 2,
            dimensions: Dimension::ALL.iter().map(|d| d.key().to_string()).collect(),
            prompt_profile: "website_review".to_string(),
            image_detail: "auto".to_string(),
            max_image_width: 1024,
            max_image_height: 768,
            jpeg_quality: 85,
        }
    }
}

/// 重试策略配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 首次尝试之外的最大重试次数
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 抖动比例，实际延迟在 [d, d * (1 + jitter)] 之间
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter: 0.3,
        }
    }
}

/// 评分缓存配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    /// 条目上限，写满后淘汰最早写入的条目
    pub max_entries: usize,
    /// 持久化文件路径，为空则只在内存中
    pub path: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_entries: DEFAULT_MAX_ENTRIES,
            path: Some(".cache/analysis_cache.json".to_string()),
        }
    }
}

/// 流水线配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 阶段之间队列的容量
    pub queue_capacity: usize,
    /// 截图失败页面比例超过该值即中止
    pub max_failure_rate: f64,
    /// 阈值中止后给在途工作的宽限时间（毫秒）
    pub grace_period_ms: u64,
    pub max_pages: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            max_failure_rate: 0.5,
            grace_period_ms: 5_000,
            max_pages: Some(50),
        }
    }
}

/// LLM 配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: String,
    pub api_base_url: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://api.openai.com/v1".to_string(),
            model_name: "gpt-4o".to_string(),
            max_tokens: 2000,
            temperature: 0.1,
        }
    }
}

/// 输出配置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// URL 列表文件
    pub url_file: String,
    /// 运行汇总 JSON 输出路径
    pub summary_path: String,
    /// 失败列表输出路径
    pub failure_log: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            url_file: "urls.txt".to_string(),
            summary_path: "reports/summary.json".to_string(),
            failure_log: "failures.txt".to_string(),
            verbose_logging: false,
        }
    }
}

/// 程序配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub grading: GradeScale,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub output: OutputConfig,
}

impl Config {
    /// 读取配置：有 `WEBSITE_ANALYZER_CONFIG` 时先加载该 TOML 文件，再应用环境变量
    pub fn load() -> Result<Self, ConfigError> {
        let base = match std::env::var("WEBSITE_ANALYZER_CONFIG") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    /// 默认值 + 环境变量
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::TomlParseFailed {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 用外部变量覆盖各字段，`lookup` 返回变量值
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = parse_var::<usize>(&get, "CAPTURE_CONCURRENCY", "usize")? {
            self.capture.concurrency = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "CAPTURE_TIMEOUT_MS", "u64")? {
            self.capture.timeout_ms = v;
        }
        if let Some(v) = parse_var::<bool>(&get, "BROWSER_HEADLESS", "bool")? {
            self.capture.headless = v;
        }
        if let Some(v) = get("SCREENSHOT_DIR") {
            self.capture.screenshot_dir = Some(v);
        }
        if let Some(v) = get("CHROME_EXECUTABLE") {
            self.capture.chrome_executable = Some(v);
        }
        if let Some(raw) = get("VIEWPORTS") {
            self.capture.viewports = parse_viewport_list(&raw)?;
        }

        if let Some(v) = parse_var::<usize>(&get, "ANALYSIS_CONCURRENCY", "usize")? {
            self.analysis.concurrency = v;
        }
        if let Some(v) = parse_var::<f64>(&get, "ANALYSIS_RATE_PER_SECOND", "f64")? {
            self.analysis.rate_per_second = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "ANALYSIS_MAX_IN_FLIGHT", "usize")? {
            self.analysis.max_in_flight = v;
        }
        if let Some(v) = parse_var::<u32>(&get, "MAX_IMAGE_WIDTH", "u32")? {
            self.analysis.max_image_width = v;
        }
        if let Some(v) = parse_var::<u32>(&get, "MAX_IMAGE_HEIGHT", "u32")? {
            self.analysis.max_image_height = v;
        }
        if let Some(v) = parse_var::<u8>(&get, "JPEG_QUALITY", "u8")? {
            self.analysis.jpeg_quality = v;
        }
        if let Some(raw) = get("DIMENSIONS") {
            self.analysis.dimensions = raw.split(',').map(|s| s.trim().to_string()).collect();
        }

        if let Some(v) = parse_var::<u32>(&get, "RETRY_MAX_RETRIES", "u32")? {
            self.retry.max_retries = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "RETRY_BASE_DELAY_MS", "u64")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "RETRY_MAX_DELAY_MS", "u64")? {
            self.retry.max_delay_ms = v;
        }

        if let Some(v) = parse_var::<u64>(&get, "CACHE_TTL_SECS", "u64")? {
            self.cache.ttl_secs = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "CACHE_MAX_ENTRIES", "usize")? {
            self.cache.max_entries = v;
        }
        if let Some(v) = get("CACHE_PATH") {
            self.cache.path = Some(v);
        }

        if let Some(v) = parse_var::<usize>(&get, "QUEUE_CAPACITY", "usize")? {
            self.pipeline.queue_capacity = v;
        }
        if let Some(v) = parse_var::<f64>(&get, "MAX_FAILURE_RATE", "f64")? {
            self.pipeline.max_failure_rate = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "GRACE_PERIOD_MS", "u64")? {
            self.pipeline.grace_period_ms = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "MAX_PAGES", "usize")? {
            self.pipeline.max_pages = Some(v);
        }

        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("LLM_API_BASE_URL") {
            self.llm.api_base_url = v;
        }
        if let Some(v) = get("LLM_MODEL_NAME") {
            self.llm.model_name = v;
        }

        if let Some(v) = get("URL_FILE") {
            self.output.url_file = v;
        }
        if let Some(v) = get("SUMMARY_PATH") {
            self.output.summary_path = v;
        }
        if let Some(v) = get("FAILURE_LOG") {
            self.output.failure_log = v;
        }
        if let Some(v) = parse_var::<bool>(&get, "VERBOSE_LOGGING", "bool")? {
            self.output.verbose_logging = v;
        }

        Ok(self)
    }

    /// 校验后的评分维度集合
    pub fn dimensions(&self) -> Result<Vec<Dimension>, ConfigError> {
        parse_dimension_list(&self.analysis.dimensions.join(","))
    }

    /// 开始工作前的完整校验
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dimensions()?;

        if self.capture.viewports.is_empty() {
            return Err(ConfigError::InvalidViewport {
                reason: "至少需要一个 viewport".to_string(),
            });
        }
        for (i, vp) in self.capture.viewports.iter().enumerate() {
            if vp.width == 0 || vp.height == 0 {
                return Err(ConfigError::InvalidViewport {
                    reason: format!("{} 的尺寸不能为 0", vp.name),
                });
            }
            if self.capture.viewports[..i].iter().any(|other| other.name == vp.name) {
                return Err(ConfigError::InvalidViewport {
                    reason: format!("viewport 名称重复: {}", vp.name),
                });
            }
        }

        if self.capture.concurrency == 0 {
            return Err(ConfigError::invalid("capture.concurrency", "必须大于 0"));
        }
        if self.capture.timeout_ms == 0 {
            return Err(ConfigError::invalid("capture.timeout_ms", "必须大于 0"));
        }
        if self.analysis.concurrency == 0 {
            return Err(ConfigError::invalid("analysis.concurrency", "必须大于 0"));
        }
        if self.analysis.max_in_flight == 0 {
            return Err(ConfigError::invalid("analysis.max_in_flight", "必须大于 0"));
        }
        let rate = self.analysis.rate_per_second;
        if !(rate.is_finite() && rate >= MIN_RATE_PER_SECOND) {
            return Err(ConfigError::invalid(
                "analysis.rate_per_second",
                format!("必须是不小于 {} 的有限数", MIN_RATE_PER_SECOND),
            ));
        }
        if self.analysis.burst == 0 {
            return Err(ConfigError::invalid("analysis.burst", "必须大于 0"));
        }
        if self.analysis.max_image_width == 0 || self.analysis.max_image_height == 0 {
            return Err(ConfigError::invalid("analysis.max_image_width", "截图缩放尺寸必须大于 0"));
        }
        if !(1..=100).contains(&self.analysis.jpeg_quality) {
            return Err(ConfigError::invalid("analysis.jpeg_quality", "必须在 1–100 之间"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "必须在 0–1 之间"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid("retry.base_delay_ms", "不能大于 max_delay_ms"));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "必须大于 0"));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(ConfigError::invalid("pipeline.queue_capacity", "必须大于 0"));
        }
        if !(0.0..=1.0).contains(&self.pipeline.max_failure_rate) {
            return Err(ConfigError::invalid("pipeline.max_failure_rate", "必须在 0–1 之间"));
        }
        if self.pipeline.max_pages == Some(0) {
            return Err(ConfigError::invalid("pipeline.max_pages", "必须大于 0"));
        }
        self.grading.validate()?;

        Ok(())
    }

    /// 实际调用评分服务前才需要的校验
    pub fn validate_llm(&self) -> Result<(), ConfigError> {
        if self.llm.api_key.trim().is_empty() {
            return Err(ConfigError::invalid("llm.api_key", "未设置 LLM_API_KEY"));
        }
        if self.llm.model_name.trim().is_empty() {
            return Err(ConfigError::invalid("llm.model_name", "不能为空"));
        }
        Ok(())
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.pipeline.grace_period_ms)
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var_name: &str,
    expected_type: &str,
) -> Result<Option<T>, ConfigError> {
    match get(var_name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::EnvVarParseFailed {
                var_name: var_name.to_string(),
                value,
                expected_type: expected_type.to_string(),
            }),
    }
}

fn parse_viewport_list(raw: &str) -> Result<Vec<Viewport>, ConfigError> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|name| {
            Viewport::builtin(name).ok_or_else(|| ConfigError::InvalidViewport {
                reason: format!("未知的内置 viewport: {}", name.trim()),
            })
        })
        .collect()
}
