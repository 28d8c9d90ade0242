//! Normalising and persisting swap results.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

/// Decode `bytes` (any format `image` understands), drop alpha, and write a JPEG to `path`.
pub fn save_as_jpeg(bytes: &[u8], path: &Path, quality: u8) -> Result<()> {
    let img = image::load_from_memory(bytes).context("Failed to decode result image")?;
    let rgb = image::DynamicImage::ImageRgb8(img.to_rgb8());

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    rgb.write_with_encoder(encoder)
        .with_context(|| format!("Failed to encode {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::testing::png_bytes;
    use tempfile::tempdir;

    #[test]
    fn test_save_png_as_jpeg() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Temp/Alice smile beach.jpg");

        save_as_jpeg(&png_bytes(), &path, 75).unwrap();

        let saved = image::open(&path).unwrap();
        assert_eq!(saved.width(), 4);
        assert_eq!(saved.color(), image::ColorType::Rgb8);
        assert_eq!(image::ImageFormat::from_path(&path).unwrap(), image::ImageFormat::Jpeg);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.jpg");
        assert!(save_as_jpeg(b"not an image", &path, 75).is_err());
        assert!(!path.exists());
    }
}
