// Cut-out and halo compositing
//
// All functions here are CPU bound and are expected to run inside the
// segmenter's rayon pool.

use image::{imageops, DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use rayon::prelude::*;

/// Solid border painted behind the cut-out
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaloStyle {
    /// Dilation radius in pixels
    pub radius_px: u32,
    pub color: [u8; 4],
}

impl HaloStyle {
    /// Convert a radius in display points to pixels
    pub fn from_points(radius_points: f32, display_scale: f32, color: [u8; 4]) -> Self {
        Self {
            radius_px: (radius_points * display_scale).round().max(0.0) as u32,
            color,
        }
    }
}

/// Blend `image` against a clear background using `mask` as coverage
///
/// `mask` must have the same dimensions as `image`.
pub fn apply_mask(image: &RgbaImage, mask: &GrayImage) -> RgbaImage {
    let mut out = image.clone();
    let row_len = image.width() as usize * 4;
    let mask_rows = mask.as_raw().par_chunks(mask.width() as usize);
    out.as_mut()
        .par_chunks_mut(row_len)
        .zip(mask_rows)
        .for_each(|(row, mask_row)| {
            for (px, &m) in row.chunks_exact_mut(4).zip(mask_row) {
                px[3] = ((px[3] as u16 * m as u16 + 127) / 255) as u8;
            }
        });
    out
}

/// Square morphological dilation as two separable max passes
pub fn dilate(mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let r = radius as usize;
    let src = mask.as_raw();

    let mut horizontal = vec![0u8; w * h];
    horizontal
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, out_row)| {
            let row = &src[y * w..(y + 1) * w];
            for (x, out) in out_row.iter_mut().enumerate() {
                let lo = x.saturating_sub(r);
                let hi = (x + r).min(w - 1);
                *out = row[lo..=hi].iter().copied().max().unwrap_or(0);
            }
        });

    let mut vertical = vec![0u8; w * h];
    vertical
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, out_row)| {
            let lo = y.saturating_sub(r);
            let hi = (y + r).min(h - 1);
            for (x, out) in out_row.iter_mut().enumerate() {
                *out = (lo..=hi).map(|yy| horizontal[yy * w + x]).max().unwrap_or(0);
            }
        });

    GrayImage::from_raw(w as u32, h as u32, vertical).unwrap_or_else(|| mask.clone())
}

/// Dilated, softened, solid-colour silhouette of `mask`
pub fn render_halo(mask: &GrayImage, style: HaloStyle) -> RgbaImage {
    let dilated = dilate(mask, style.radius_px);
    let sigma = (style.radius_px as f32 * 0.25).clamp(0.5, 4.0);
    let soft: GrayImage = imageops::blur(&dilated, sigma);
    let [r, g, b, a] = style.color;
    RgbaImage::from_fn(soft.width(), soft.height(), |x, y| {
        let Luma([m]) = *soft.get_pixel(x, y);
        Rgba([r, g, b, ((m as u16 * a as u16 + 127) / 255) as u8])
    })
}

/// Transparent cut-out of `upright`, optionally over a halo
pub fn composite(upright: &DynamicImage, mask: &GrayImage, halo: Option<HaloStyle>) -> DynamicImage {
    let cutout = apply_mask(&upright.to_rgba8(), mask);
    match halo {
        Some(style) if style.radius_px > 0 => {
            let mut base = render_halo(mask, style);
            imageops::overlay(&mut base, &cutout, 0, 0);
            DynamicImage::ImageRgba8(base)
        }
        _ => DynamicImage::ImageRgba8(cutout),
    }
}

/// Crop to the bounding box of non-transparent pixels plus `padding_px`
///
/// Returns the input unchanged if every pixel is transparent.
pub fn crop_to_non_transparent(image: &DynamicImage, padding_px: u32) -> DynamicImage {
    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (x, y, px) in rgba.enumerate_pixels() {
        if px[3] == 0 {
            continue;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    let Some((x0, y0, x1, y1)) = bounds else {
        return image.clone();
    };
    let left = x0.saturating_sub(padding_px);
    let top = y0.saturating_sub(padding_px);
    let right = (x1 + padding_px).min(w - 1);
    let bottom = (y1 + padding_px).min(h - 1);
    image.crop_imm(left, top, right - left + 1, bottom - top + 1)
}

/// Fit `image` into a `size` x `size` transparent square, centred
pub fn render_to_square(image: &DynamicImage, size: u32) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(size, size, Rgba([0, 0, 0, 0]));
    if image.width() == 0 || image.height() == 0 || size == 0 {
        return canvas;
    }
    let scale = (size as f32 / image.width() as f32).min(size as f32 / image.height() as f32);
    let w = ((image.width() as f32 * scale).round() as u32).clamp(1, size);
    let h = ((image.height() as f32 * scale).round() as u32).clamp(1, size);
    let fitted = image.resize_exact(w, h, imageops::FilterType::Triangle).to_rgba8();
    imageops::overlay(
        &mut canvas,
        &fitted,
        ((size - w) / 2) as i64,
        ((size - h) / 2) as i64,
    );
    canvas
}
