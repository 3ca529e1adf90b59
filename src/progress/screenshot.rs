//! Screenshot thumbnail compression.
//!
//! Full-page screenshots are resampled to at most 200x150 and re-encoded
//! as JPEG quality 70 before they enter the event stream.

use crate::error::{Error, Result};
use image::codecs::jpeg::JpegEncoder;

/// Maximum thumbnail width.
pub const THUMB_WIDTH: u32 = 200;
/// Maximum thumbnail height.
pub const THUMB_HEIGHT: u32 = 150;
/// JPEG encode quality.
pub const THUMB_QUALITY: u8 = 70;

/// A compressed screenshot thumbnail.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Resample raw image bytes into a JPEG thumbnail.
///
/// Aspect ratio is preserved; the output never exceeds 200x150.
pub fn compress(raw: &[u8]) -> Result<Thumbnail> {
    let image = image::load_from_memory(raw)
        .map_err(|e| Error::Internal(format!("screenshot decode failed: {e}")))?;

    // JPEG has no alpha channel; flatten before encoding.
    let thumb = image.thumbnail(THUMB_WIDTH, THUMB_HEIGHT).to_rgb8();
    let (width, height) = thumb.dimensions();

    let mut data = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut data, THUMB_QUALITY);
    encoder
        .encode_image(&thumb)
        .map_err(|e| Error::Internal(format!("thumbnail encode failed: {e}")))?;

    Ok(Thumbnail {
        width,
        height,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let mut bytes = Vec::new();
        image
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageFormat::Png,
            )
            .unwrap();
        bytes
    }

    #[test]
    fn test_thumbnail_bounded() {
        let thumb = compress(&png_bytes(1920, 1080)).unwrap();
        assert!(thumb.width <= THUMB_WIDTH);
        assert!(thumb.height <= THUMB_HEIGHT);
        assert!(!thumb.data.is_empty());
    }

    #[test]
    fn test_small_image_not_upscaled() {
        let thumb = compress(&png_bytes(100, 80)).unwrap();
        assert_eq!(thumb.width, 100);
        assert_eq!(thumb.height, 80);
    }

    #[test]
    fn test_output_is_jpeg() {
        let thumb = compress(&png_bytes(400, 300)).unwrap();
        // JPEG SOI marker
        assert_eq!(&thumb.data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_garbage_input_errors() {
        assert!(compress(b"not an image").is_err());
    }
}
