//! Pixel-level steps of background removal: mask validation, subject
//! brightness, background choice and compositing.
use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage, RgbaImage};
use std::fmt;
use std::io::Cursor;

/// Alpha at or above this counts as subject.
pub const ALPHA_THRESHOLD: u8 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskLimits {
    pub min_subject_area_ratio: f64,
    pub max_aspect_ratio_drift: f64,
}

/// Why a segmentation result was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskIssue {
    Empty,
    SizeMismatch { expected: (u32, u32), actual: (u32, u32) },
    SubjectTooSmall { ratio: f64 },
    AspectShifted { drift: f64 },
}

impl fmt::Display for MaskIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaskIssue::Empty => write!(f, "mask contains no subject"),
            MaskIssue::SizeMismatch { expected, actual } => write!(
                f,
                "mask is {}x{}, expected {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            MaskIssue::SubjectTooSmall { ratio } => {
                write!(f, "subject covers only {:.1}% of the frame", ratio * 100.0)
            }
            MaskIssue::AspectShifted { drift } => {
                write!(f, "subject aspect ratio shifted by {:.0}%", drift * 100.0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Background {
    White,
    Black,
}

impl Background {
    pub fn rgb(&self) -> Rgb<u8> {
        match self {
            Background::White => Rgb([255, 255, 255]),
            Background::Black => Rgb([0, 0, 0]),
        }
    }
}

/// Bounding box of pixels with alpha >= `alpha_threshold`.
pub fn subject_bounds(rgba: &RgbaImage, alpha_threshold: u8) -> Option<Bounds> {
    let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
    let (mut max_x, mut max_y) = (0u32, 0u32);
    let mut found = false;
    for (x, y, px) in rgba.enumerate_pixels() {
        if px.0[3] >= alpha_threshold {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }
    found.then(|| Bounds {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

/// Check that a segmentation mask plausibly contains the whole book.
pub fn validate_mask(
    original: (u32, u32),
    rgba: &RgbaImage,
    limits: &MaskLimits,
) -> Result<Bounds, MaskIssue> {
    if rgba.dimensions() != original {
        return Err(MaskIssue::SizeMismatch {
            expected: original,
            actual: rgba.dimensions(),
        });
    }
    let bounds = subject_bounds(rgba, ALPHA_THRESHOLD).ok_or(MaskIssue::Empty)?;

    let frame_area = original.0 as f64 * original.1 as f64;
    let ratio = bounds.area() as f64 / frame_area;
    if ratio < limits.min_subject_area_ratio {
        return Err(MaskIssue::SubjectTooSmall { ratio });
    }

    let original_aspect = original.0 as f64 / original.1 as f64;
    let drift = (bounds.aspect() / original_aspect - 1.0).abs();
    if drift > limits.max_aspect_ratio_drift {
        return Err(MaskIssue::AspectShifted { drift });
    }
    Ok(bounds)
}

/// Mean luminance (0-255) of the subject, weighted by alpha. Iterates the
/// borrowed pixel buffer once; no converted copy of the image is built.
pub fn subject_brightness(rgba: &RgbaImage) -> Option<f64> {
    let mut weighted = 0.0f64;
    let mut weight = 0.0f64;
    for px in rgba.pixels() {
        let [r, g, b, a] = px.0;
        if a == 0 {
            continue;
        }
        let alpha = a as f64 / 255.0;
        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        weighted += luma * alpha;
        weight += alpha;
    }
    (weight > 0.0).then(|| weighted / weight)
}

/// Dark subjects go on white, bright subjects on black.
pub fn choose_background(brightness: f64, threshold: f64) -> Background {
    if brightness < threshold {
        Background::White
    } else {
        Background::Black
    }
}

/// Crop to `bounds` and flatten onto a solid background.
pub fn composite(rgba: &RgbaImage, bounds: Bounds, background: Background) -> RgbImage {
    let bg = background.rgb().0;
    RgbImage::from_fn(bounds.width, bounds.height, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(bounds.x + x, bounds.y + y).0;
        let alpha = a as u32;
        let blend = |fg: u8, bg: u8| ((fg as u32 * alpha + bg as u32 * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(r, bg[0]), blend(g, bg[1]), blend(b, bg[2])])
    })
}

pub fn validate_dimensions(width: u32, height: u32, min: u32) -> Result<(), String> {
    if width < min || height < min {
        return Err(format!(
            "processed image is {}x{}, below the {}px minimum",
            width, height, min
        ));
    }
    Ok(())
}

/// Downscale so neither side exceeds `max_dim`; smaller images pass through.
pub fn fit_within(img: DynamicImage, max_dim: u32) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w <= max_dim && h <= max_dim {
        return img;
    }
    img.resize(max_dim, max_dim, FilterType::Lanczos3)
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}
