// Coarse boundary extraction from a foreground mask

use image::GrayImage;
use rayon::prelude::*;

use crate::core::types::{Contour, NormalizedPoint};

/// Mask values above this are foreground
pub const FOREGROUND_LEVEL: u8 = 128;

/// Number of samples targeted along the mask's shorter side
const SAMPLES_PER_SHORT_SIDE: u32 = 200;

/// Grid step for a mask of the given size
pub fn sample_step(width: u32, height: u32) -> u32 {
    (width.min(height) / SAMPLES_PER_SHORT_SIDE).max(1)
}

pub fn has_foreground(mask: &GrayImage) -> bool {
    mask.as_raw().par_iter().any(|&v| v > FOREGROUND_LEVEL)
}

/// Extract an angularly sorted boundary polygon from `mask`
///
/// The mask is sampled on a grid. A sampled foreground point is a boundary
/// point when any of its 4 neighbours one step away is background or falls
/// outside the image. Points are normalized to 0..1 and ordered by angle
/// around their centroid, which yields a simple closed polygon for
/// roughly star-shaped subjects.
pub fn extract_contour(mask: &GrayImage) -> Contour {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 {
        return Contour::empty();
    }
    let step = sample_step(width, height);

    let is_foreground = |x: i64, y: i64| -> bool {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            return false;
        }
        mask.get_pixel(x as u32, y as u32)[0] > FOREGROUND_LEVEL
    };

    let rows: Vec<u32> = (0..height).step_by(step as usize).collect();
    let mut points: Vec<NormalizedPoint> = rows
        .par_iter()
        .flat_map_iter(|&y| {
            let s = step as i64;
            (0..width).step_by(step as usize).filter_map(move |x| {
                let (xi, yi) = (x as i64, y as i64);
                if !is_foreground(xi, yi) {
                    return None;
                }
                let on_edge = !is_foreground(xi - s, yi)
                    || !is_foreground(xi + s, yi)
                    || !is_foreground(xi, yi - s)
                    || !is_foreground(xi, yi + s);
                on_edge.then(|| NormalizedPoint {
                    x: x as f32 / width as f32,
                    y: y as f32 / height as f32,
                })
            })
        })
        .collect();

    if points.is_empty() {
        return Contour::empty();
    }

    let n = points.len() as f32;
    let cx = points.iter().map(|p| p.x).sum::<f32>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f32>() / n;

    points.sort_by(|a, b| {
        let ta = (a.y - cy).atan2(a.x - cx);
        let tb = (b.y - cy).atan2(b.x - cx);
        ta.total_cmp(&tb)
    });

    Contour { points }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn square_mask(size: u32, from: u32, to: u32) -> GrayImage {
        GrayImage::from_fn(size, size, |x, y| {
            if (from..to).contains(&x) && (from..to).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_step_targets_short_side() {
        assert_eq!(sample_step(100, 100), 1);
        assert_eq!(sample_step(4000, 3000), 15);
        assert_eq!(sample_step(400, 1000), 2);
    }

    #[test]
    fn test_empty_mask_has_no_contour() {
        let mask = GrayImage::new(50, 50);
        assert!(!has_foreground(&mask));
        assert!(extract_contour(&mask).is_empty());
    }

    #[test]
    fn test_square_boundary_only() {
        let mask = square_mask(64, 16, 48);
        let contour = extract_contour(&mask);
        assert!(!contour.is_empty());

        // Interior points are never emitted
        for p in &contour.points {
            let x = (p.x * 64.0).round() as u32;
            let y = (p.y * 64.0).round() as u32;
            let on_border = x == 16 || x == 47 || y == 16 || y == 47;
            assert!(on_border, "point ({}, {}) is not on the square's border", x, y);
        }
        // 4 sides of 32 samples, corners shared
        assert_eq!(contour.len(), 4 * 32 - 4);
    }

    #[test]
    fn test_points_angularly_sorted() {
        let contour = extract_contour(&square_mask(64, 10, 50));
        let n = contour.len() as f32;
        let cx = contour.points.iter().map(|p| p.x).sum::<f32>() / n;
        let cy = contour.points.iter().map(|p| p.y).sum::<f32>() / n;
        let angles: Vec<f32> = contour
            .points
            .iter()
            .map(|p| (p.y - cy).atan2(p.x - cx))
            .collect();
        assert!(angles.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_foreground_touching_image_edge_is_boundary() {
        // Fully foreground mask: only the outer ring counts as boundary
        let mask = GrayImage::from_pixel(10, 10, Luma([255]));
        let contour = extract_contour(&mask);
        assert_eq!(contour.len(), 36);
        for p in &contour.points {
            assert!((0.0..1.0).contains(&p.x) && (0.0..1.0).contains(&p.y));
        }
    }
}
