use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use thiserror::Error;

const GIF_SIGNATURES: [&[u8]; 2] = [b"GIF87a", b"GIF89a"];

/// Region of the source image to keep, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error)]
pub enum PictureError {
    #[error("no image data")]
    Empty,
    #[error("crop {0:?} does not fit a {1}x{2} image")]
    CropOutOfBounds(CropRect, u32, u32),
    #[error("image could not be processed: {0}")]
    Image(#[from] image::ImageError),
}

pub fn is_gif(bytes: &[u8]) -> bool {
    GIF_SIGNATURES.iter().any(|sig| bytes.starts_with(sig))
}

/// Turns picked image bytes into the base64 payload the room accepts.
///
/// GIFs are sent as-is so animation survives. Everything else is cropped,
/// has transparency flattened onto white and is re-encoded as JPEG.
pub fn prepare_picture(bytes: &[u8], crop: Option<CropRect>) -> Result<String, PictureError> {
    if bytes.is_empty() {
        return Err(PictureError::Empty);
    }
    if is_gif(bytes) {
        return Ok(STANDARD.encode(bytes));
    }

    let mut decoded = image::load_from_memory(bytes)?;
    if let Some(rect) = crop {
        let (width, height) = (decoded.width(), decoded.height());
        let fits = rect.width > 0
            && rect.height > 0
            && rect.x.checked_add(rect.width).is_some_and(|right| right <= width)
            && rect.y.checked_add(rect.height).is_some_and(|bottom| bottom <= height);
        if !fits {
            return Err(PictureError::CropOutOfBounds(rect, width, height));
        }
        decoded = decoded.crop_imm(rect.x, rect.y, rect.width, rect.height);
    }

    let flattened = flatten_onto_white(&decoded);
    let mut jpeg = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(flattened).write_to(&mut jpeg, ImageFormat::Jpeg)?;
    Ok(STANDARD.encode(jpeg.into_inner()))
}

fn flatten_onto_white(source: &DynamicImage) -> RgbImage {
    let rgba = source.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha)) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

#[cfg(test)]
#[path = "tests/picture_tests.rs"]
mod tests;
