//! Transform engine - turns an uploaded image into its processed form
//!
//! The default engine decodes the image, inverts its RGB channels and
//! re-encodes it as JPEG. Engines are synchronous and CPU-bound; the worker
//! runs them on the blocking pool through `apply_blocking`.

use crate::error::TransformError;
use bytes::Bytes;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;

/// Pure `bytes -> bytes` operation
pub trait TransformEngine: Send + Sync {
    fn apply(&self, input: &[u8]) -> Result<Bytes, TransformError>;

    /// Content type of the produced bytes
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }
}

/// Color inversion, re-encoded as JPEG
pub struct InvertTransform {
    /// JPEG quality (1-100)
    quality: u8,
}

impl InvertTransform {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for InvertTransform {
    fn default() -> Self {
        Self::new(90)
    }
}

impl TransformEngine for InvertTransform {
    fn apply(&self, input: &[u8]) -> Result<Bytes, TransformError> {
        let img = image::load_from_memory(input).map_err(|e| TransformError::Decode(e.to_string()))?;

        let (width, height) = img.dimensions();
        debug!(width, height, "Inverting image");

        // JPEG has no alpha channel
        let mut rgb = img.to_rgb8();
        image::imageops::invert(&mut rgb);

        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(rgb)
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(self.quality))
            .map_err(|e| TransformError::Encode(e.to_string()))?;

        Ok(Bytes::from(buf))
    }

    fn content_type(&self) -> &'static str {
        "image/jpeg"
    }
}

/// Run a transform on the blocking thread pool
pub async fn apply_blocking(
    engine: Arc<dyn TransformEngine>,
    input: Bytes,
) -> Result<Bytes, TransformError> {
    tokio::task::spawn_blocking(move || engine.apply(&input))
        .await
        .map_err(|e| TransformError::Task(format!("Transform task panicked: {e}")))?
}
