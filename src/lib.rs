//! # Website Analyzer
//!
//! 批量截图网站并用视觉大模型打分的 Rust 应用程序
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 跨 worker 共享的资源与通用机制
//! - `RateLimiter` - 令牌桶 + 在途上限，保护评分接口
//! - `RetryPolicy` - 指数退避重试，只重试临时错误
//! - `ResultCache` - 按截图指纹缓存评分结果
//! - `CancelToken` - 运行级取消信号
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个 URL / 截图
//! - `PageCapturer` - 无头浏览器截图能力
//! - `VisionScorer` - 视觉模型评分能力
//! - `UrlSource` - 读取待分析 URL
//! - `ReportWriter` - 写汇总 JSON 与失败日志
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个截图"的完整处理流程
//! - `CaptureStage` - 校验 URL → 截图 → 重试 → 落盘
//! - `AnalysisStage` - 查缓存 → 限流 → 评分 → 校验 → 写缓存
//! - `Aggregator` - 页面级与运行级汇总
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/pipeline` - 流水线协调器，管理队列、并发、熔断与取消
//! - `orchestrator/progress` - 页面进度账本
//! - `orchestrator/run_state` - 运行状态机
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use browser::launch_browser;
pub use config::Config;
pub use error::{AppError, AppResult, ConfigError, StageError};
pub use infrastructure::{CancelToken, RateLimiter, ResultCache, RetryPolicy};
pub use models::{PageReport, RunOutcome, RunSummary};
pub use orchestrator::Pipeline;
pub use services::{PageCapturer, UrlSource, VisionScorer};
