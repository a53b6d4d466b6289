use anyhow::{Context, Result};
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use std::io::Cursor;

use crate::core::types::Orientation;
use crate::services::segmentation::compositing::render_to_square;

/// Encode an image as PNG bytes.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

/// Asynchronously encode an image to PNG bytes using spawn_blocking.
///
/// PNG encoding is CPU-intensive and can block the async runtime if done synchronously.
pub async fn encode_png_async(img: DynamicImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_png(&img))
        .await
        .context("Failed to spawn blocking task for PNG encoding")?
}

/// Asynchronously load an image from bytes using spawn_blocking.
pub async fn load_image_from_memory_async(bytes: &[u8]) -> Result<DynamicImage> {
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to decode image")
    })
    .await
    .context("Failed to spawn blocking task for image decoding")?
}

/// Decode an encoded photo along with its stored EXIF orientation.
///
/// Pixels are returned as stored; apply the orientation to get the upright view.
pub fn decode_with_orientation(bytes: &[u8]) -> Result<(DynamicImage, Orientation)> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("Failed to detect image format")?
        .into_decoder()
        .context("Failed to create image decoder")?;
    let orientation = decoder
        .orientation()
        .map(|o| Orientation::from_exif(o.to_exif()))
        .unwrap_or(Orientation::Up);
    let image = DynamicImage::from_decoder(decoder).context("Failed to decode image")?;
    Ok((image, orientation))
}

pub async fn decode_with_orientation_async(bytes: Vec<u8>) -> Result<(DynamicImage, Orientation)> {
    tokio::task::spawn_blocking(move || decode_with_orientation(&bytes))
        .await
        .context("Failed to spawn blocking task for image decoding")?
}

/// Fit `img` into a transparent `size`×`size` square and encode it as PNG.
pub async fn thumbnail_png_async(img: DynamicImage, size: u32) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let square = DynamicImage::ImageRgba8(render_to_square(&img, size));
        encode_png(&square)
    })
    .await
    .context("Failed to spawn blocking task for thumbnail rendering")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn sample() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 3, Rgba([10, 20, 30, 255])))
    }

    #[tokio::test]
    async fn test_png_round_trip() {
        let bytes = encode_png_async(sample()).await.unwrap();
        let decoded = load_image_from_memory_async(&bytes).await.unwrap();
        assert_eq!((decoded.width(), decoded.height()), (6, 3));

        let (image, orientation) = decode_with_orientation_async(bytes).await.unwrap();
        assert_eq!(orientation, Orientation::Up);
        assert_eq!(image.width(), 6);
    }

    #[tokio::test]
    async fn test_garbage_is_an_error() {
        assert!(load_image_from_memory_async(b"not an image").await.is_err());
        assert!(decode_with_orientation(b"not an image").is_err());
    }

    #[tokio::test]
    async fn test_thumbnail_is_square() {
        let bytes = thumbnail_png_async(sample(), 16).await.unwrap();
        let thumb = image::load_from_memory(&bytes).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (16, 16));
    }
}
