//! Image conversion and annotation.
//!
//! Incoming frames are normalised to an [`RgbImage`] regardless of their
//! wire encoding.  The detector sees the grayscale version; the RGB copy is
//! annotated with marker outlines and published back.

use image::{GrayImage, Rgb, RgbImage};
use tagframe_types::{Header, ImageMessage, TagError};

/// Encoding of every image produced by [`to_message`].
pub const OUTPUT_ENCODING: &str = "rgb8";

// Edge colours in corner order, so the orientation of a marker is visible.
const EDGE_COLOURS: [Rgb<u8>; 4] = [
    Rgb([255, 0, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
    Rgb([255, 0, 255]),
];
const CENTRE_COLOUR: Rgb<u8> = Rgb([255, 255, 0]);
const CENTRE_HALF_WIDTH: i64 = 3;
const MAX_COORDINATE: f64 = 1.0e6;

/// Decode `msg` into an owned RGB buffer.
///
/// Supported encodings: `rgb8`, `bgr8`, `rgba8`, `bgra8`, `mono8`.  Row
/// padding (`step` larger than `width × channels`) is skipped.
///
/// # Errors
///
/// [`TagError::FrameConversion`] for an unknown encoding, a `step` that is
/// too small or a data buffer shorter than `step × height`.
pub fn to_rgb(msg: &ImageMessage) -> Result<RgbImage, TagError> {
    let channels: usize = match msg.encoding.as_str() {
        "rgb8" | "bgr8" => 3,
        "rgba8" | "bgra8" => 4,
        "mono8" => 1,
        other => {
            return Err(TagError::FrameConversion(format!(
                "unsupported image encoding '{other}'"
            )));
        }
    };

    let width = msg.width as usize;
    let height = msg.height as usize;
    let step = msg.step as usize;
    let row_bytes = width
        .checked_mul(channels)
        .ok_or_else(|| TagError::FrameConversion("image width overflows".to_string()))?;
    if step < row_bytes {
        return Err(TagError::FrameConversion(format!(
            "step {step} is smaller than {row_bytes} bytes per row"
        )));
    }
    let expected = step
        .checked_mul(height)
        .ok_or_else(|| TagError::FrameConversion("image size overflows".to_string()))?;
    if msg.data.len() < expected {
        return Err(TagError::FrameConversion(format!(
            "image buffer holds {} bytes, expected {expected}",
            msg.data.len()
        )));
    }

    let bgr = msg.encoding.starts_with("bgr");
    let mut rgb = Vec::with_capacity(width * height * 3);
    for row in msg.data.chunks_exact(step.max(1)).take(height) {
        for px in row[..row_bytes].chunks_exact(channels) {
            match (channels, bgr) {
                (1, _) => rgb.extend_from_slice(&[px[0], px[0], px[0]]),
                (_, true) => rgb.extend_from_slice(&[px[2], px[1], px[0]]),
                (_, false) => rgb.extend_from_slice(&px[..3]),
            }
        }
    }

    RgbImage::from_raw(msg.width, msg.height, rgb).ok_or_else(|| {
        TagError::FrameConversion(format!(
            "cannot build {}x{} image from decoded pixels",
            msg.width, msg.height
        ))
    })
}

/// Luma conversion used as detector input.
pub fn to_gray(rgb: &RgbImage) -> GrayImage {
    image::imageops::grayscale(rgb)
}

/// Encode `rgb` as an `rgb8` [`ImageMessage`] carrying `header`.
pub fn to_message(rgb: &RgbImage, header: Header) -> ImageMessage {
    ImageMessage {
        header,
        width: rgb.width(),
        height: rgb.height(),
        encoding: OUTPUT_ENCODING.to_string(),
        step: rgb.width() * 3,
        data: rgb.as_raw().clone(),
    }
}

/// Outline a detected marker: one coloured edge per corner pair plus a small
/// cross at the centre.  Anything outside the image is clipped; segments
/// with a non-finite end point are skipped.
pub fn draw_outline(img: &mut RgbImage, corners: &[[f64; 2]; 4], center: [f64; 2]) {
    for (i, colour) in EDGE_COLOURS.iter().enumerate() {
        if let (Some(a), Some(b)) = (pixel(corners[i]), pixel(corners[(i + 1) % 4])) {
            draw_line(img, a, b, *colour);
        }
    }
    if let Some((cx, cy)) = pixel(center) {
        draw_line(
            img,
            (cx - CENTRE_HALF_WIDTH, cy),
            (cx + CENTRE_HALF_WIDTH, cy),
            CENTRE_COLOUR,
        );
        draw_line(
            img,
            (cx, cy - CENTRE_HALF_WIDTH),
            (cx, cy + CENTRE_HALF_WIDTH),
            CENTRE_COLOUR,
        );
    }
}

/// Round to the nearest pixel; `None` for coordinates that are not finite
/// or absurdly far from any image.
fn pixel([x, y]: [f64; 2]) -> Option<(i64, i64)> {
    let in_range = |v: f64| v.is_finite() && v.abs() <= MAX_COORDINATE;
    (in_range(x) && in_range(y)).then(|| (x.round() as i64, y.round() as i64))
}

/// Integer Bresenham line, clipped per pixel.
fn draw_line(img: &mut RgbImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64), colour: Rgb<u8>) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    // Segments entirely off one side of the image draw nothing.
    if (x0 < 0 && x1 < 0) || (y0 < 0 && y1 < 0) || (x0 >= w && x1 >= w) || (y0 >= h && y1 >= h) {
        return;
    }

    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);

    loop {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            img.put_pixel(x as u32, y as u32, colour);
        }
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}
