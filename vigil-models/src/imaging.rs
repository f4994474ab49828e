//! Pixel-level helpers: decode, re-encode, crop and annotate.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::Context as _;
use image::{Rgb, RgbImage};
use vigil_types::BBox;

/// Stroke color for face boxes on saved actions.
pub const FACE_BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Stroke color for phone boxes on saved actions.
pub const PHONE_BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Decodes JPEG/PNG bytes into a pixel matrix.
pub fn decode_image(bytes: &[u8]) -> eyre::Result<RgbImage> {
    Ok(image::load_from_memory(bytes)
        .context("cannot decode image bytes")?
        .to_rgb8())
}

/// Decodes the base64 `image` field of a client frame message.
///
/// Tolerates a `data:image/...;base64,` prefix.
pub fn decode_base64_image(encoded: &str) -> eyre::Result<RgbImage> {
    let raw = match encoded.split_once(',') {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let bytes = BASE64
        .decode(raw.trim())
        .context("image field is not valid base64")?;
    decode_image(&bytes)
}

/// Encodes a pixel matrix as JPEG bytes.
pub fn encode_jpeg(image: &RgbImage) -> eyre::Result<Vec<u8>> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Jpeg)
        .context("cannot encode image as JPEG")?;
    Ok(buf)
}

/// Crops the centered `crop_width` x `crop_height` region.
///
/// Frames smaller than the requested region are returned unchanged.
pub fn center_crop(image: &RgbImage, crop_width: u32, crop_height: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width <= crop_width || height <= crop_height {
        return image.clone();
    }
    let x = (width - crop_width) / 2;
    let y = (height - crop_height) / 2;
    image::imageops::crop_imm(image, x, y, crop_width, crop_height).to_image()
}

/// Crops a square patch around `bbox`, clamped to the frame.
///
/// The side length is the longer bbox edge, so the identity model always
/// sees the whole face with its aspect ratio intact.
pub fn square_crop_around(image: &RgbImage, bbox: BBox) -> RgbImage {
    let (width, height) = image.dimensions();
    let side = bbox.width().max(bbox.height()).clamp(1, width.min(height));
    let center_x = (bbox.x1 + bbox.x2) / 2;
    let center_y = (bbox.y1 + bbox.y2) / 2;
    let x = (center_x - side as i32 / 2)
        .clamp(0, (width - side) as i32) as u32;
    let y = (center_y - side as i32 / 2)
        .clamp(0, (height - side) as i32) as u32;
    image::imageops::crop_imm(image, x, y, side, side).to_image()
}

/// Strokes `bbox` onto the image with a 2px border.
pub fn draw_rectangle(image: &mut RgbImage, bbox: BBox, color: Rgb<u8>) {
    const THICKNESS: i32 = 2;
    let (width, height) = (image.width() as i32, image.height() as i32);
    let mut put = |x: i32, y: i32| {
        if (0..width).contains(&x) && (0..height).contains(&y) {
            image.put_pixel(x as u32, y as u32, color);
        }
    };
    for offset in 0..THICKNESS {
        for x in bbox.x1..=bbox.x2 {
            put(x, bbox.y1 + offset);
            put(x, bbox.y2 - offset);
        }
        for y in bbox.y1..=bbox.y2 {
            put(bbox.x1 + offset, y);
            put(bbox.x2 - offset, y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 0]))
    }

    #[test]
    fn jpeg_round_trip_preserves_dimensions() {
        let image = gradient(64, 48);
        let bytes = encode_jpeg(&image).unwrap();
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (64, 48));
    }

    #[test]
    fn base64_decoding_accepts_data_url_prefix() {
        let bytes = encode_jpeg(&gradient(8, 8)).unwrap();
        let plain = BASE64.encode(&bytes);
        let with_prefix = format!("data:image/jpeg;base64,{plain}");
        assert!(decode_base64_image(&plain).is_ok());
        assert!(decode_base64_image(&with_prefix).is_ok());
        assert!(decode_base64_image("not base64 at all!!").is_err());
    }

    #[test]
    fn center_crop_clamps_to_frame() {
        let image = gradient(640, 480);
        assert_eq!(center_crop(&image, 320, 240).dimensions(), (320, 240));
        assert_eq!(center_crop(&image, 800, 600).dimensions(), (640, 480));
    }

    #[test]
    fn square_crop_is_square_and_in_bounds() {
        let image = gradient(640, 480);
        let patch = square_crop_around(&image, BBox::from([600, 400, 639, 479]));
        let (w, h) = patch.dimensions();
        assert_eq!(w, h);
        assert!(w >= 39);
    }

    #[test]
    fn draw_rectangle_marks_the_border() {
        let mut image = RgbImage::new(32, 32);
        draw_rectangle(&mut image, BBox::from([4, 4, 27, 27]), FACE_BOX_COLOR);
        assert_eq!(image.get_pixel(4, 4), &FACE_BOX_COLOR);
        assert_eq!(image.get_pixel(27, 16), &FACE_BOX_COLOR);
        assert_eq!(image.get_pixel(16, 16), &Rgb([0, 0, 0]));
    }
}
