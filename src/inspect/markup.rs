//! Bounding-box overlay renderer
//!
//! Draws red corner brackets plus a `label - confidence` caption for each
//! prediction onto a cached JPEG. Captions use a small embedded 5x7
//! bitmap font (lowercased; characters outside the glyph set are
//! skipped), the same approach the bitmap-font overlay of the camera
//! tooling ecosystem takes.

use crate::detector::Prediction;
use crate::error::Result;
use image::{DynamicImage, Rgb, RgbImage};
use std::io::Cursor;

const RED: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_WIDTH: i32 = 5;
const LINE_LENGTH: i32 = 60;

/// Glyph cell scale factor: 5x7 glyphs render as 10x14 pixels.
const GLYPH_SCALE: i32 = 2;
const GLYPH_COLS: i32 = 5;
const GLYPH_ROWS: i32 = 7;

/// Decode a JPEG, draw overlays for every prediction, re-encode.
pub fn render(jpeg: &[u8], predictions: &[Prediction]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(jpeg)?;
    let mut canvas = decoded.to_rgb8();

    for p in predictions {
        draw_corner_brackets(&mut canvas, p.x_min, p.y_min, p.x_max, p.y_max);
        let caption = format!("{} - {:.3}", p.label.to_lowercase(), p.confidence);
        draw_text(
            &mut canvas,
            p.x_min,
            p.y_min - 3 - GLYPH_ROWS * GLYPH_SCALE,
            &caption,
        );
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas).write_to(&mut out, image::ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

/// Four L-shaped brackets marking the box corners.
fn draw_corner_brackets(canvas: &mut RgbImage, x_min: i32, y_min: i32, x_max: i32, y_max: i32) {
    // top left
    fill_rect(canvas, x_min, y_min, x_min + LINE_LENGTH, y_min + LINE_WIDTH);
    fill_rect(canvas, x_min, y_min, x_min + LINE_WIDTH, y_min + LINE_LENGTH);
    // top right
    fill_rect(canvas, x_max - LINE_LENGTH, y_min, x_max, y_min + LINE_WIDTH);
    fill_rect(canvas, x_max - LINE_WIDTH, y_min, x_max, y_min + LINE_LENGTH);
    // bottom left
    fill_rect(canvas, x_min, y_max - LINE_WIDTH, x_min + LINE_LENGTH, y_max);
    fill_rect(canvas, x_min, y_max - LINE_LENGTH, x_min + LINE_WIDTH, y_max);
    // bottom right
    fill_rect(canvas, x_max - LINE_LENGTH, y_max - LINE_WIDTH, x_max, y_max);
    fill_rect(canvas, x_max - LINE_WIDTH, y_max - LINE_LENGTH, x_max, y_max);
}

/// Fill [x0, x1) x [y0, y1) clamped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x0: i32, y0: i32, x1: i32, y1: i32) {
    let (width, height) = (canvas.width() as i32, canvas.height() as i32);
    let x0 = x0.clamp(0, width);
    let x1 = x1.clamp(0, width);
    let y0 = y0.clamp(0, height);
    let y1 = y1.clamp(0, height);
    for x in x0..x1 {
        for y in y0..y1 {
            canvas.put_pixel(x as u32, y as u32, RED);
        }
    }
}

fn draw_text(canvas: &mut RgbImage, x: i32, y: i32, text: &str) {
    let mut cursor = x;
    for c in text.chars() {
        if let Some(glyph) = glyph_rows(c) {
            draw_glyph(canvas, cursor, y, glyph);
        }
        cursor += (GLYPH_COLS + 1) * GLYPH_SCALE;
    }
}

fn draw_glyph(canvas: &mut RgbImage, x: i32, y: i32, rows: [u8; 7]) {
    for (row, bits) in rows.iter().enumerate() {
        for col in 0..GLYPH_COLS {
            if bits & (0b10000 >> col) != 0 {
                let gx = x + col * GLYPH_SCALE;
                let gy = y + row as i32 * GLYPH_SCALE;
                fill_rect(canvas, gx, gy, gx + GLYPH_SCALE, gy + GLYPH_SCALE);
            }
        }
    }
}

/// 5x7 glyphs, one u8 per row, high bit = leftmost column. Covers what
/// captions actually contain: lowercase letters, digits, and punctuation.
fn glyph_rows(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        'a' => [0b00000, 0b00000, 0b01110, 0b00001, 0b01111, 0b10001, 0b01111],
        'b' => [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b11110],
        'c' => [0b00000, 0b00000, 0b01110, 0b10000, 0b10000, 0b10001, 0b01110],
        'd' => [0b00001, 0b00001, 0b01111, 0b10001, 0b10001, 0b10001, 0b01111],
        'e' => [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'f' => [0b00110, 0b01000, 0b11110, 0b01000, 0b01000, 0b01000, 0b01000],
        'g' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'h' => [0b10000, 0b10000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001],
        'i' => [0b00100, 0b00000, 0b01100, 0b00100, 0b00100, 0b00100, 0b01110],
        'j' => [0b00010, 0b00000, 0b00110, 0b00010, 0b00010, 0b10010, 0b01100],
        'k' => [0b10000, 0b10000, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010],
        'l' => [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'm' => [0b00000, 0b00000, 0b11010, 0b10101, 0b10101, 0b10101, 0b10101],
        'n' => [0b00000, 0b00000, 0b11110, 0b10001, 0b10001, 0b10001, 0b10001],
        'o' => [0b00000, 0b00000, 0b01110, 0b10001, 0b10001, 0b10001, 0b01110],
        'p' => [0b00000, 0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000],
        'q' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b00001],
        'r' => [0b00000, 0b00000, 0b10110, 0b11001, 0b10000, 0b10000, 0b10000],
        's' => [0b00000, 0b00000, 0b01111, 0b10000, 0b01110, 0b00001, 0b11110],
        't' => [0b01000, 0b01000, 0b11110, 0b01000, 0b01000, 0b01001, 0b00110],
        'u' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b10011, 0b01101],
        'v' => [0b00000, 0b00000, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'w' => [0b00000, 0b00000, 0b10101, 0b10101, 0b10101, 0b10101, 0b01010],
        'x' => [0b00000, 0b00000, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001],
        'y' => [0b00000, 0b10001, 0b10001, 0b01111, 0b00001, 0b10001, 0b01110],
        'z' => [0b00000, 0b00000, 0b11111, 0b00010, 0b00100, 0b01000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        ' ' => [0b00000; 7],
        _ => return None,
    };
    Some(rows)
}
