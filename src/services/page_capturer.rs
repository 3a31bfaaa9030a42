//! 截图服务 - 业务能力层
//!
//! 只负责"给一个 URL 和一个 viewport，拍一张图"，不关心重试和流程

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, warn};

use crate::browser::BrowserSession;
use crate::error::StageError;
use crate::models::Viewport;

/// 一次成功截图
#[derive(Debug, Clone)]
pub struct CapturedImage {
    /// PNG 字节
    pub image: Vec<u8>,
    pub load_time_ms: u64,
}

/// 截图能力
///
/// 实现方必须把失败分类为 `Transient` 或 `Permanent`。
#[async_trait]
pub trait PageCapturer: Send + Sync {
    async fn capture(
        &self,
        url: &str,
        viewport: &Viewport,
        timeout: Duration,
    ) -> Result<CapturedImage, StageError>;
}

/// 这些 Chromium 网络错误重试也不会好转
const PERMANENT_NET_ERRORS: [&str; 5] = [
    "ERR_INVALID_URL",
    "ERR_BLOCKED_BY_CLIENT",
    "ERR_BLOCKED_BY_RESPONSE",
    "ERR_UNSAFE_PORT",
    "ERR_DISALLOWED_URL_SCHEME",
];

/// 按错误信息给浏览器错误分类
pub fn classify_capture_error(message: &str) -> StageError {
    if PERMANENT_NET_ERRORS.iter().any(|code| message.contains(code)) {
        StageError::permanent(message)
    } else {
        StageError::transient(message)
    }
}

/// 基于 chromiumoxide 的截图实现
///
/// 每次截图新开一个 tab，用完关闭；多个 worker 共享同一个浏览器进程。
pub struct ChromiumCapturer {
    session: BrowserSession,
    settle: Duration,
}

impl ChromiumCapturer {
    pub fn new(session: BrowserSession, settle: Duration) -> Self {
        Self { session, settle }
    }

    pub async fn shutdown(self) {
        self.session.shutdown().await;
    }

    async fn shoot(
        &self,
        page: &Page,
        url: &str,
        viewport: &Viewport,
        limit: Duration,
    ) -> Result<CapturedImage, StageError> {
        page.execute(SetDeviceMetricsOverrideParams::new(
            viewport.width as i64,
            viewport.height as i64,
            1.0,
            viewport.mobile,
        ))
        .await
        .map_err(|e| classify_capture_error(&e.to_string()))?;

        if let Some(ua) = &viewport.user_agent {
            page.execute(SetUserAgentOverrideParams::new(ua.clone()))
                .await
                .map_err(|e| classify_capture_error(&e.to_string()))?;
        }

        let started = Instant::now();
        let navigation = async {
            page.goto(url).await?;
            page.wait_for_navigation().await?;
            Ok::<_, chromiumoxide::error::CdpError>(())
        };
        match timeout(limit, navigation).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(classify_capture_error(&e.to_string())),
            Err(_) => return Err(StageError::timeout(limit.as_millis() as u64)),
        }
        let load_time_ms = started.elapsed().as_millis() as u64;

        if !self.settle.is_zero() {
            sleep(self.settle).await;
        }

        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        let image = page
            .screenshot(params)
            .await
            .map_err(|e| classify_capture_error(&e.to_string()))?;

        Ok(CapturedImage {
            image,
            load_time_ms,
        })
    }
}

#[async_trait]
impl PageCapturer for ChromiumCapturer {
    async fn capture(
        &self,
        url: &str,
        viewport: &Viewport,
        limit: Duration,
    ) -> Result<CapturedImage, StageError> {
        debug!("打开新标签页: {} ({})", url, viewport.name);
        let page = self
            .session
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| StageError::transient(format!("创建页面失败: {}", e)))?;
        let guard = PageGuard::new(page);

        let result = self.shoot(guard.page(), url, viewport, limit).await;
        guard.close().await;
        result
    }
}

/// 保证标签页被关闭：正常路径显式关闭，future 被丢弃时在后台关闭
struct PageGuard {
    page: Page,
    closed: bool,
}

impl PageGuard {
    fn new(page: Page) -> Self {
        Self {
            page,
            closed: false,
        }
    }

    fn page(&self) -> &Page {
        &self.page
    }

    async fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.page.clone().close().await {
            warn!("关闭标签页失败: {}", e);
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let page = self.page.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = page.close().await;
            });
        }
    }
}
