use serde::{Deserialize, Serialize};

/// 设备视口配置（desktop / tablet / mobile 等）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Viewport {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub mobile: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Viewport {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            mobile: false,
            user_agent: None,
        }
    }

    pub fn desktop() -> Self {
        Self {
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            ),
            ..Self::new("desktop", 1920, 1080)
        }
    }

    pub fn tablet() -> Self {
        Self {
            mobile: true,
            user_agent: Some(
                "Mozilla/5.0 (iPad; CPU OS 14_0 like Mac OS X) AppleWebKit/605.1.15".to_string(),
            ),
            ..Self::new("tablet", 768, 1024)
        }
    }

    pub fn mobile() -> Self {
        Self {
            mobile: true,
            user_agent: Some(
                "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) AppleWebKit/605.1.15"
                    .to_string(),
            ),
            ..Self::new("mobile", 375, 667)
        }
    }

    /// 默认三种设备
    pub fn defaults() -> Vec<Self> {
        vec![Self::desktop(), Self::tablet(), Self::mobile()]
    }

    /// 按名字取内置设备
    pub fn builtin(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "desktop" => Some(Self::desktop()),
            "tablet" => Some(Self::tablet()),
            "mobile" => Some(Self::mobile()),
            _ => None,
        }
    }
}
