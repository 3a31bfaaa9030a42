//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责一次运行的调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `pipeline` - 流水线协调器
//! - 读取 URL、生成页面任务
//! - 启动截图阶段与分析阶段，用有界队列连接
//! - 失败率熔断、外部取消、宽限期
//! - 运行结束后交给聚合器
//!
//! ### `progress` - 页面进度账本
//! - 消费阶段事件，记录每个页面走到哪一步
//!
//! ### `run_state` - 运行状态机
//! - Collecting → Capturing → Analyzing → Aggregating → Done / Aborted
//!
//! ## 层次关系
//!
//! ```text
//! pipeline (处理 Vec<PageTask>)
//!     ↓
//! workflow::CaptureStage / AnalysisStage (处理单个 viewport)
//!     ↓
//! services (能力层：capture / score / url source / report)
//!     ↓
//! infrastructure (基础设施：RateLimiter / RetryPolicy / ResultCache)
//! ```

pub mod pipeline;
pub mod progress;
pub mod run_state;

pub use pipeline::{build_tasks, Pipeline};
pub use progress::RunProgress;
pub use run_state::{RunState, RunStateMachine};
