//! Screenshot decoding and whole-frame pixel helpers.

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::{GrayImage, ImageOutputFormat};

use crate::types::{Frame, Rect};

pub const FRAME_WIDTH: u32 = 900;
pub const FRAME_HEIGHT: u32 = 1600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    Portrait,
    /// Width and height swapped: the capture pipeline flipped orientation.
    Landscape,
    Unexpected(u32, u32),
}

pub fn geometry(frame: &Frame) -> Geometry {
    match frame.dimensions() {
        (FRAME_WIDTH, FRAME_HEIGHT) => Geometry::Portrait,
        (FRAME_HEIGHT, FRAME_WIDTH) => Geometry::Landscape,
        (w, h) => Geometry::Unexpected(w, h),
    }
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
    if bytes.is_empty() {
        bail!("empty screencap payload");
    }
    let img = image::load_from_memory(bytes).context("decoding screencap")?;
    Ok(img.to_rgb8())
}

pub fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    frame
        .write_to(&mut out, ImageOutputFormat::Png)
        .context("encoding png")?;
    Ok(out.into_inner())
}

pub fn save_png(frame: &Frame, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    frame.save(path).with_context(|| format!("writing {}", path.display()))
}

pub fn to_gray(frame: &Frame) -> GrayImage {
    image::imageops::grayscale(frame)
}

/// Copy of `area`, clamped to the frame. `None` when nothing is left.
pub fn crop(frame: &Frame, area: Rect) -> Option<Frame> {
    let r = area.clamp_to(frame.width(), frame.height())?;
    Some(image::imageops::crop_imm(frame, r.x as u32, r.y as u32, r.w as u32, r.h as u32).to_image())
}

/// Mean absolute grayscale difference scaled to `0.0..=1.0`.
/// Images of different size count as completely different.
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f32 {
    if a.dimensions() != b.dimensions() || a.as_raw().is_empty() {
        return 1.0;
    }
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw())
        .map(|(x, y)| x.abs_diff(*y) as u64)
        .sum();
    total as f32 / a.as_raw().len() as f32 / 255.0
}

pub fn mean_brightness(frame: &Frame) -> f32 {
    let gray = to_gray(frame);
    let raw = gray.as_raw();
    if raw.is_empty() {
        return 0.0;
    }
    raw.iter().map(|&v| v as u64).sum::<u64>() as f32 / raw.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn geometry_classification() {
        assert_eq!(geometry(&RgbImage::new(900, 1600)), Geometry::Portrait);
        assert_eq!(geometry(&RgbImage::new(1600, 900)), Geometry::Landscape);
        assert_eq!(geometry(&RgbImage::new(720, 1280)), Geometry::Unexpected(720, 1280));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(&[]).is_err());
        assert!(decode(b"not a png").is_err());
        let img = RgbImage::from_pixel(3, 3, Rgb([1, 2, 3]));
        assert_eq!(decode(&encode_png(&img).unwrap()).unwrap(), img);
    }

    #[test]
    fn diff_of_black_and_white_is_one() {
        let black = GrayImage::new(8, 8);
        let white = GrayImage::from_pixel(8, 8, image::Luma([255]));
        assert_eq!(mean_abs_diff(&black, &white), 1.0);
        assert_eq!(mean_abs_diff(&black, &black), 0.0);
    }

    #[test]
    fn crop_clamps() {
        let img = RgbImage::new(10, 10);
        assert_eq!(crop(&img, Rect::new(8, 8, 5, 5)).unwrap().dimensions(), (2, 2));
        assert!(crop(&img, Rect::new(20, 0, 5, 5)).is_none());
    }
}
