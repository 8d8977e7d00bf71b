//! Thumbnail and processed-variant key derivation, and thumbnail rendering.
//!
//! Stored keys are looked up by these functions long after they were written,
//! so the mapping must not change shape: directory prefix and extension are
//! kept as-is and only the file name gains a prefix or suffix.
use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;

const THUMB_PREFIX: &str = "thumb_";
const PROCESSED_SUFFIX: &str = "_processed";

fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(i) => (&key[..=i], &key[i + 1..]),
        None => ("", key),
    }
}

/// `books/12/abc.jpg` -> `books/12/thumb_abc.jpg`.
pub fn thumbnail_key(s3_key: &str) -> String {
    let (dir, name) = split_key(s3_key);
    format!("{}{}{}", dir, THUMB_PREFIX, name)
}

pub fn is_thumbnail_key(key: &str) -> bool {
    split_key(key).1.starts_with(THUMB_PREFIX)
}

/// Inverse of [`thumbnail_key`]; `None` for keys that are not thumbnails.
pub fn source_key_for_thumbnail(key: &str) -> Option<String> {
    let (dir, name) = split_key(key);
    name.strip_prefix(THUMB_PREFIX)
        .map(|rest| format!("{}{}", dir, rest))
}

/// Deterministic key for the background-removed variant of `s3_key`.
/// `books/12/abc.jpg` -> `books/12/abc_processed.png`.
pub fn processed_key(s3_key: &str) -> String {
    let (dir, name) = split_key(s3_key);
    let stem = match name.rfind('.') {
        Some(i) if i > 0 => &name[..i],
        _ => name,
    };
    format!("{}{}{}.png", dir, stem, PROCESSED_SUFFIX)
}

/// Extension of the key's file name. Directory names are never consulted and
/// only ASCII alphanumeric extensions count.
pub fn key_extension(key: &str) -> Option<&str> {
    let (_, name) = split_key(key);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.bytes().all(|b| b.is_ascii_alphanumeric()) => {
            Some(ext)
        }
        _ => None,
    }
}

/// Encoding implied by a key's extension; JPEG when unknown.
pub fn format_for_key(key: &str) -> ImageFormat {
    let ext = key_extension(key).unwrap_or("");
    match ImageFormat::from_extension(ext) {
        Some(f @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP | ImageFormat::Gif | ImageFormat::Bmp | ImageFormat::Tiff)) => f,
        _ => ImageFormat::Jpeg,
    }
}

/// Encode `img` in `format`, dropping alpha where the format cannot hold it.
pub fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg | ImageFormat::Bmp => {
            DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut out, format)?
        }
        ImageFormat::WebP => DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut out, format)?,
        _ => img.write_to(&mut out, format)?,
    }
    Ok(out.into_inner())
}

/// Render a thumbnail of `img` no larger than `max_dim` on either side,
/// encoded for `thumb_key`.
pub fn render_thumbnail(img: &DynamicImage, max_dim: u32, thumb_key: &str) -> Result<Vec<u8>> {
    if max_dim == 0 {
        return Err(anyhow!("thumbnail dimension must be > 0"));
    }
    let thumb = if img.width() > max_dim || img.height() > max_dim {
        img.resize(max_dim, max_dim, FilterType::Lanczos3)
    } else {
        img.clone()
    };
    encode(&thumb, format_for_key(thumb_key))
}

/// Decode `bytes` and render the thumbnail stored at `thumbnail_key(source_key)`.
pub fn generate_thumbnail(bytes: &[u8], max_dim: u32, source_key: &str) -> Result<(String, Vec<u8>)> {
    let img = image::load_from_memory(bytes)?;
    let key = thumbnail_key(source_key);
    let data = render_thumbnail(&img, max_dim, &key)?;
    Ok((key, data))
}
