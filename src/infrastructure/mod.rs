//! 基础设施层: 跨 worker 共享的稀缺资源与通用机制，不含业务逻辑

pub mod cancel;
pub mod rate_limiter;
pub mod result_cache;
pub mod retry;

pub use cancel::CancelToken;
pub use rate_limiter::{RateLimiter, RatePermit};
pub use result_cache::ResultCache;
pub use retry::{RetryOutcome, RetryPolicy};
