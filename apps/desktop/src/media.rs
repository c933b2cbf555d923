//! Turns local image files into the inline data URLs the room client relays.

use std::{fs, io::Cursor, path::Path};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, GenericImageView};
use tracing::debug;

pub const MAX_IMAGE_WIDTH: u32 = 600;
pub const MAX_IMAGE_HEIGHT: u32 = 450;
pub const JPEG_QUALITY: u8 = 50;
/// Prepared images above this size are refused before reaching the bridge.
pub const MAX_PREPARED_IMAGE_BYTES: usize = 5 * 1024 * 1024;

pub fn prepare_image_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    prepare_image_bytes(&bytes).with_context(|| format!("failed to prepare {}", path.display()))
}

/// Scales to fit 600x450 keeping the aspect ratio, then re-encodes as JPEG.
pub fn prepare_image_bytes(bytes: &[u8]) -> Result<String> {
    let decoded = image::load_from_memory(bytes).context("unsupported image data")?;
    let (width, height) = decoded.dimensions();
    let scaled = if width > MAX_IMAGE_WIDTH || height > MAX_IMAGE_HEIGHT {
        decoded.resize(MAX_IMAGE_WIDTH, MAX_IMAGE_HEIGHT, FilterType::Triangle)
    } else {
        decoded
    };

    let rgb = scaled.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&rgb)
        .context("jpeg encoding failed")?;
    let data_url = format!("data:image/jpeg;base64,{}", STANDARD.encode(out.into_inner()));

    debug!(
        original_bytes = bytes.len(),
        prepared_bytes = data_url.len(),
        width = rgb.width(),
        height = rgb.height(),
        "image prepared"
    );
    if data_url.len() > MAX_PREPARED_IMAGE_BYTES {
        bail!(
            "image is still {} bytes after compression (limit {MAX_PREPARED_IMAGE_BYTES})",
            data_url.len()
        );
    }
    Ok(data_url)
}

/// Avatars are kept as-is, wrapped in a data URL typed by file extension.
/// Blocking; call from `spawn_blocking`.
pub fn avatar_data_url(path: &Path) -> Result<String> {
    avatar_data_url_within(path, MAX_PREPARED_IMAGE_BYTES)
}

fn avatar_data_url_within(path: &Path, max_bytes: usize) -> Result<String> {
    let Some(mime) = image_mime(path) else {
        bail!("{} is not a supported image file", path.display());
    };
    let size = fs::metadata(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .len();
    if size > max_bytes as u64 {
        bail!("avatar {} is {size} bytes (limit {max_bytes})", path.display());
    }
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let data_url = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
    if data_url.len() > max_bytes {
        bail!(
            "avatar {} is {} bytes once encoded (limit {max_bytes})",
            path.display(),
            data_url.len()
        );
    }
    Ok(data_url)
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40])));
        let mut out = Cursor::new(Vec::new());
        image
            .write_to(&mut out, ImageFormat::Png)
            .expect("encode png");
        out.into_inner()
    }

    fn decoded_dimensions(data_url: &str) -> (u32, u32) {
        let encoded = data_url
            .strip_prefix("data:image/jpeg;base64,")
            .expect("jpeg data url");
        let bytes = STANDARD.decode(encoded).expect("base64");
        image::load_from_memory(&bytes)
            .expect("decode jpeg")
            .dimensions()
    }

    #[test]
    fn large_image_is_scaled_to_fit_preserving_aspect() {
        let url = prepare_image_bytes(&png_bytes(1200, 600)).expect("prepare");
        assert_eq!(decoded_dimensions(&url), (600, 300));
    }

    #[test]
    fn small_image_keeps_its_size() {
        let url = prepare_image_bytes(&png_bytes(120, 80)).expect("prepare");
        assert_eq!(decoded_dimensions(&url), (120, 80));
    }

    #[test]
    fn prepared_image_has_no_line_breaks() {
        let url = prepare_image_bytes(&png_bytes(300, 300)).expect("prepare");
        assert!(!url.contains('\n'));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(prepare_image_bytes(b"definitely not an image").is_err());
    }

    #[test]
    fn avatar_keeps_original_bytes_and_mime() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("me.PNG");
        std::fs::write(&path, b"ABC").expect("write");
        assert_eq!(
            avatar_data_url(&path).expect("avatar"),
            "data:image/png;base64,QUJD"
        );
        assert!(avatar_data_url(&dir.path().join("notes.txt")).is_err());
    }

    #[test]
    fn oversized_avatar_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("big.png");
        std::fs::write(&path, vec![0u8; 64]).expect("write");
        assert!(avatar_data_url_within(&path, 32).is_err());

        // 64 raw bytes fit, but not once base64 and the data URL prefix are added.
        assert!(avatar_data_url_within(&path, 80).is_err());
        assert!(avatar_data_url_within(&path, 200).is_ok());
    }
}
