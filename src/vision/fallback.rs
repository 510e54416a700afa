//! Local describer used when no vision API key is available.
//!
//! It only looks at the container metadata, so the text is generic and the
//! confidence is low.

use async_trait::async_trait;

use super::{Description, DescriptionProvider, DescriptionSource, ImageInput, VisionError};

const FALLBACK_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct FallbackDescriber {
    confidence: f64,
}

impl Default for FallbackDescriber {
    fn default() -> Self {
        Self {
            confidence: FALLBACK_CONFIDENCE,
        }
    }
}

impl FallbackDescriber {
    pub fn describe_sync(&self, image: &ImageInput) -> Description {
        let format = match image.mime_type.as_str() {
            "image/jpeg" => "JPEG",
            "image/png" => "PNG",
            "image/webp" => "WebP",
            "image/gif" => "GIF",
            _ => "image",
        };

        let mut text = format!(
            "A {} image named \"{}\" ({})",
            format,
            image.filename,
            human_size(image.data.len())
        );
        if let Some((width, height)) = dimensions(&image.data) {
            text.push_str(&format!(", {}x{} pixels", width, height));
            text.push_str(orientation(width, height));
        }
        text.push_str(". No visual analysis was performed.");

        Description {
            text,
            confidence: Some(self.confidence),
            source: DescriptionSource::Fallback,
        }
    }
}

#[async_trait]
impl DescriptionProvider for FallbackDescriber {
    async fn describe(&self, image: &ImageInput) -> Result<Description, VisionError> {
        Ok(self.describe_sync(image))
    }
}

fn human_size(bytes: usize) -> String {
    const KIB: f64 = 1024.0;
    let b = bytes as f64;
    if b < KIB {
        format!("{} bytes", bytes)
    } else if b < KIB * KIB {
        format!("{:.1} KiB", b / KIB)
    } else {
        format!("{:.1} MiB", b / (KIB * KIB))
    }
}

fn orientation(width: u32, height: u32) -> &'static str {
    match width.cmp(&height) {
        std::cmp::Ordering::Greater => ", landscape",
        std::cmp::Ordering::Less => ", portrait",
        std::cmp::Ordering::Equal => ", square",
    }
}

/// Pixel size read from the PNG IHDR or the GIF logical screen descriptor
fn dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") && data.len() >= 24 && &data[12..16] == b"IHDR" {
        let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
        let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
        return Some((width, height));
    }
    if (data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a")) && data.len() >= 10 {
        let width = u16::from_le_bytes([data[6], data[7]]) as u32;
        let height = u16::from_le_bytes([data[8], data[9]]) as u32;
        return Some((width, height));
    }
    None
}
