//! Pixel operations on BGR8 frames: drawing, cropping, resizing and JPEG
//! coding.
//!
//! Frames travel through the pipeline as raw BGR8 buffers; conversion to the
//! `image` crate's RGB types happens only at the resize/encode/decode
//! boundaries.

mod font;

use image::ImageEncoder;

use invigil_types::{DetectionBox, Frame};

#[derive(thiserror::Error, Debug)]
pub enum ImageError {
    #[error("image codec error: {source}")]
    Codec {
        #[from]
        source: image::ImageError,
    },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("invalid image dimensions {width}x{height}")]
    BadDimensions { width: usize, height: usize },
}

type Result<T> = std::result::Result<T, ImageError>;

fn bgr_to_rgb(frame: &Frame) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(frame.data.len());
    for px in frame.data.chunks_exact(3) {
        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    rgb
}

fn rgb_to_bgr(data: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        bgr.extend_from_slice(&[px[2], px[1], px[0]]);
    }
    bgr
}

fn to_rgb_image(frame: &Frame) -> Result<image::RgbImage> {
    image::RgbImage::from_raw(frame.width as u32, frame.height as u32, bgr_to_rgb(frame)).ok_or(
        ImageError::BadDimensions {
            width: frame.width,
            height: frame.height,
        },
    )
}

fn from_rgb_image(img: image::RgbImage) -> Frame {
    let (w, h) = (img.width() as usize, img.height() as usize);
    Frame::new(w, h, rgb_to_bgr(&img.into_raw()))
}

/// Encode a frame as JPEG at the given quality (0-100).
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    let rgb = bgr_to_rgb(frame);
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    encoder.write_image(
        &rgb,
        frame.width as u32,
        frame.height as u32,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

/// Decode any supported image format into a BGR frame.
pub fn decode_image(bytes: &[u8]) -> Result<Frame> {
    let img = image::load_from_memory(bytes)?.to_rgb8();
    Ok(from_rgb_image(img))
}

/// Load and decode an image file into a BGR frame.
pub fn open_image<P: AsRef<std::path::Path>>(path: P) -> Result<Frame> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes)
}

/// Resize to exactly `width` x `height`.
pub fn resize_exact(frame: &Frame, width: usize, height: usize) -> Result<Frame> {
    let img = to_rgb_image(frame)?;
    let resized = image::imageops::resize(
        &img,
        width as u32,
        height as u32,
        image::imageops::FilterType::Triangle,
    );
    Ok(from_rgb_image(resized))
}

/// Resize to the given width, preserving the aspect ratio.
pub fn resize_to_width(frame: &Frame, width: u32) -> Result<Frame> {
    let aspect = frame.height as f64 / frame.width as f64;
    let height = (width as f64 * aspect) as usize;
    resize_exact(frame, width as usize, height.max(1))
}

/// Copy out the region covered by `b` (already clipped to the frame).
pub fn crop(frame: &Frame, b: &DetectionBox) -> Frame {
    let x1 = b.x1.max(0) as usize;
    let y1 = b.y1.max(0) as usize;
    let x2 = (b.x2.max(0) as usize).min(frame.width);
    let y2 = (b.y2.max(0) as usize).min(frame.height);
    let (w, h) = (x2.saturating_sub(x1), y2.saturating_sub(y1));
    let mut data = Vec::with_capacity(w * h * 3);
    for y in y1..y2 {
        let start = frame.offset(x1, y);
        data.extend_from_slice(&frame.data[start..start + w * 3]);
    }
    Frame::new(w, h, data)
}

#[inline]
fn put_pixel(frame: &mut Frame, x: i32, y: i32, color: [u8; 3]) {
    if x < 0 || y < 0 || x as usize >= frame.width || y as usize >= frame.height {
        return;
    }
    let o = frame.offset(x as usize, y as usize);
    frame.data[o..o + 3].copy_from_slice(&color);
}

/// Draw the outline of a detection box in the given BGR color.
pub fn draw_rect(frame: &mut Frame, b: &DetectionBox, color: [u8; 3], thickness: i32) {
    for t in 0..thickness {
        for x in (b.x1 - t)..=(b.x2 + t) {
            put_pixel(frame, x, b.y1 - t, color);
            put_pixel(frame, x, b.y2 + t, color);
        }
        for y in (b.y1 - t)..=(b.y2 + t) {
            put_pixel(frame, b.x1 - t, y, color);
            put_pixel(frame, b.x2 + t, y, color);
        }
    }
}

/// Stamp `text` with its top-left corner at `(x, y)`, scaled up by `scale`.
pub fn draw_label(frame: &mut Frame, text: &str, x: i32, y: i32, color: [u8; 3], scale: i32) {
    let scale = scale.max(1);
    let advance = (font::GLYPH_WIDTH as i32 + 1) * scale;
    let mut pen_x = x;
    for c in text.chars() {
        let glyph = font::glyph(c);
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..font::GLYPH_WIDTH {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        put_pixel(
                            frame,
                            pen_x + col as i32 * scale + dx,
                            y + row as i32 * scale + dy,
                            color,
                        );
                    }
                }
            }
        }
        pen_x += advance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(w: usize, h: usize) -> Frame {
        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[(x % 256) as u8, (y % 256) as u8, 7]);
            }
        }
        Frame::new(w, h, data)
    }

    #[test]
    fn jpeg_encode_produces_jfif_magic() {
        let frame = gradient_frame(32, 24);
        let jpeg = encode_jpeg(&frame, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let frame = gradient_frame(40, 30);
        let jpeg = encode_jpeg(&frame, 90).unwrap();
        let back = decode_image(&jpeg).unwrap();
        assert_eq!((back.width, back.height), (40, 30));
    }

    #[test]
    fn resize_to_width_preserves_aspect() {
        let frame = gradient_frame(64, 48);
        let small = resize_to_width(&frame, 32).unwrap();
        assert_eq!((small.width, small.height), (32, 24));
    }

    #[test]
    fn crop_extracts_region() {
        let frame = gradient_frame(16, 16);
        let b = DetectionBox::new(2, 3, 10, 9, 1.0);
        let c = crop(&frame, &b);
        assert_eq!((c.width, c.height), (8, 6));
        // First pixel of the crop is the source pixel at (2, 3).
        assert_eq!(&c.data[..3], &frame.data[frame.offset(2, 3)..frame.offset(2, 3) + 3]);
    }

    #[test]
    fn crop_clips_out_of_bounds_box() {
        let frame = gradient_frame(8, 8);
        let b = DetectionBox::new(-4, -4, 20, 20, 1.0);
        let c = crop(&frame, &b);
        assert_eq!((c.width, c.height), (8, 8));
    }

    #[test]
    fn draw_rect_paints_border_only() {
        let mut frame = Frame::black(16, 16);
        let b = DetectionBox::new(4, 4, 11, 11, 1.0);
        draw_rect(&mut frame, &b, [0, 0, 255], 1);
        let red = [0u8, 0, 255];
        let at = |x: usize, y: usize| &frame.data[frame.offset(x, y)..frame.offset(x, y) + 3];
        assert_eq!(at(4, 4), &red);
        assert_eq!(at(11, 4), &red);
        assert_eq!(at(4, 11), &red);
        // Interior stays black.
        assert_eq!(at(7, 7), &[0, 0, 0]);
    }

    #[test]
    fn draw_label_marks_pixels() {
        let mut frame = Frame::black(64, 16);
        draw_label(&mut frame, "Seat 1", 1, 1, [0, 0, 255], 1);
        assert!(frame.data.iter().any(|&b| b == 255));
    }

    #[test]
    fn drawing_off_frame_is_ignored() {
        let mut frame = Frame::black(8, 8);
        let b = DetectionBox::new(-10, -10, 30, 30, 1.0);
        draw_rect(&mut frame, &b, [255, 255, 255], 2);
        draw_label(&mut frame, "X", 100, 100, [255, 255, 255], 2);
        // No panic is the point; the frame dimensions are unchanged.
        assert_eq!(frame.data.len(), 8 * 8 * 3);
    }
}
