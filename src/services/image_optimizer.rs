//! 截图压缩
//!
//! 发给评分接口之前把截图铺到白底、缩到限定尺寸内，再编码为 JPEG。
//! 指纹仍然按原始 PNG 计算，压缩只影响发送的内容。

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageResult, Rgb, RgbImage};
use tracing::{debug, warn};

use crate::config::AnalysisConfig;

/// 发送前的尺寸与质量上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_width: u32,
    pub max_height: u32,
    /// JPEG 质量 1–100
    pub jpeg_quality: u8,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_width: 1024,
            max_height: 768,
            jpeg_quality: 85,
        }
    }
}

impl ImageLimits {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            max_width: config.max_image_width,
            max_height: config.max_image_height,
            jpeg_quality: config.jpeg_quality,
        }
    }
}

/// 准备发送的图片
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub mime: &'static str,
}

impl PreparedImage {
    pub fn data_url(&self, encoded: &str) -> String {
        format!("data:{};base64,{}", self.mime, encoded)
    }
}

/// 压缩截图；无法解码或编码时原样以 PNG 发送
pub fn optimize_image(png: &[u8], limits: &ImageLimits) -> PreparedImage {
    match encode_jpeg(png, limits) {
        Ok(jpeg) => {
            debug!("截图压缩: {} KB → {} KB", png.len() / 1024, jpeg.len() / 1024);
            PreparedImage {
                bytes: jpeg,
                mime: "image/jpeg",
            }
        }
        Err(e) => {
            warn!("截图压缩失败，发送原图: {}", e);
            PreparedImage {
                bytes: png.to_vec(),
                mime: "image/png",
            }
        }
    }
}

fn encode_jpeg(png: &[u8], limits: &ImageLimits) -> ImageResult<Vec<u8>> {
    let decoded = image::load_from_memory(png)?;
    let resized = if decoded.width() > limits.max_width || decoded.height() > limits.max_height {
        decoded.resize(limits.max_width, limits.max_height, FilterType::Lanczos3)
    } else {
        decoded
    };
    let rgb = flatten_on_white(&resized);

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, limits.jpeg_quality.clamp(1, 100));
    encoder.write_image(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?;
    Ok(out)
}

/// 带透明通道的图片按 alpha 混合到白底上
fn flatten_on_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        Rgb([blend(r), blend(g), blend(b)])
    })
}
