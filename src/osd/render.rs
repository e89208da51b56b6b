//! Renders OSD region content into an ARGB1555 bitmap.
//!
//! Text is rasterized with `rusttype`, generalizing the single hard-coded
//! tone-generator pattern nowhere else in this codebase touches fonts.
//! Image regions decode BMP (24/32-bit, `BI_RGB`/`BI_BITFIELDS`) by hand,
//! matching `region_prepare_bitmap()`, or PNG via the `png` crate, matching
//! `region_prepare_image()`'s RGBA8-to-ARGB1555 conversion.

use std::io::Cursor;

use rusttype::{point, Font, Scale};

use crate::config::OsdRegionConfig;
use crate::hal::OsdBitmap;

pub struct RenderedBitmap {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl From<RenderedBitmap> for OsdBitmap {
    fn from(r: RenderedBitmap) -> Self {
        OsdBitmap { width: r.width, height: r.height, pixels: r.pixels }
    }
}

fn rgb555_to_components(c: u16) -> (u8, u8, u8) {
    let r = ((c >> 10) & 0x1f) as u8;
    let g = ((c >> 5) & 0x1f) as u8;
    let b = (c & 0x1f) as u8;
    (r << 3, g << 3, b << 3)
}

fn argb1555(alpha_set: bool, r5: u8, g5: u8, b5: u8) -> u16 {
    ((alpha_set as u16) << 15) | ((r5 as u16) << 10) | ((g5 as u16) << 5) | (b5 as u16)
}

/// Renders `region.text` (already macro-expanded) using the given font data.
/// Draws an outline pass first when `outline_thickness > 0`, then the glyph
/// fill, then an optional padded background box behind everything.
pub fn render_text(region: &OsdRegionConfig, text: &str, font_data: &[u8]) -> Result<RenderedBitmap, String> {
    let font = Font::try_from_bytes(font_data).ok_or_else(|| "invalid font data".to_string())?;
    let scale = Scale::uniform(region.size);
    let v_metrics = font.v_metrics(scale);
    let glyphs: Vec<_> = font.layout(text, scale, point(0.0, v_metrics.ascent)).collect();

    let text_width = glyphs
        .iter()
        .rev()
        .find_map(|g| g.pixel_bounding_box().map(|bb| bb.max.x as u32))
        .unwrap_or(0)
        .max(1);
    let text_height = (v_metrics.ascent - v_metrics.descent).ceil() as u32 + 2;

    let outline = region.outline_thickness as u32;
    let pad_for_bg = if region.opacity_bg > 0 { region.padding as u32 } else { 0 };
    let margin = outline + pad_for_bg;
    let width = text_width + margin * 2;
    let height = text_height + margin * 2;

    let mut pixels = vec![0u16; (width * height) as usize];

    if region.opacity_bg > 0 {
        let (br, bg, bb) = rgb555_to_components(region.bg_color_rgb555);
        fill_rounded_rect(&mut pixels, width, height, br, bg, bb);
    }

    let (fr, fg, fb) = rgb555_to_components(region.color_rgb555);
    let (or_, og, ob) = rgb555_to_components(region.outline_color_rgb555);

    for glyph in &glyphs {
        let Some(bb) = glyph.pixel_bounding_box() else { continue };
        glyph.draw(|gx, gy, v| {
            if v <= 0.01 {
                return;
            }
            let px = bb.min.x as i64 + gx as i64 + margin as i64;
            let py = bb.min.y as i64 + gy as i64 + margin as i64;
            if px < 0 || py < 0 || px as u32 >= width || py as u32 >= height {
                return;
            }
            let idx = (py as u32 * width + px as u32) as usize;
            if outline > 0 {
                blend_outline(&mut pixels, width, height, px as u32, py as u32, outline, or_, og, ob);
            }
            pixels[idx] = argb1555(true, fr, fg, fb);
        });
    }

    Ok(RenderedBitmap { width, height, pixels })
}

fn blend_outline(pixels: &mut [u16], width: u32, height: u32, cx: u32, cy: u32, thickness: u32, r: u8, g: u8, b: u8) {
    let t = thickness as i64;
    for dy in -t..=t {
        for dx in -t..=t {
            let x = cx as i64 + dx;
            let y = cy as i64 + dy;
            if x < 0 || y < 0 || x as u32 >= width || y as u32 >= height {
                continue;
            }
            let idx = (y as u32 * width + x as u32) as usize;
            if pixels[idx] & 0x8000 == 0 {
                pixels[idx] = argb1555(true, r, g, b);
            }
        }
    }
}

fn fill_rounded_rect(pixels: &mut [u16], width: u32, height: u32, r: u8, g: u8, b: u8) {
    let color = argb1555(true, r, g, b);
    let radius = (width.min(height) / 8).min(6);
    for y in 0..height {
        for x in 0..width {
            if in_rounded_rect(x, y, width, height, radius) {
                pixels[(y * width + x) as usize] = color;
            }
        }
    }
}

fn in_rounded_rect(x: u32, y: u32, width: u32, height: u32, radius: u32) -> bool {
    if radius == 0 {
        return true;
    }
    let corners = [(radius, radius), (width - radius - 1, radius), (radius, height - radius - 1), (width - radius - 1, height - radius - 1)];
    for (cx, cy) in corners {
        let in_corner_box = (x < radius && (y < radius || y >= height - radius)) || (x >= width - radius && (y < radius || y >= height - radius));
        if in_corner_box {
            let dx = x as i64 - cx as i64;
            let dy = y as i64 - cy as i64;
            if dx * dx + dy * dy > (radius as i64) * (radius as i64) {
                return false;
            }
        }
    }
    true
}

/// Pads (or crops) a rendered bitmap to `target_w`×`target_h`, filling new
/// area with fully transparent pixels. Mirrors `region_pad_bitmap()`.
pub fn pad_bitmap(src: &RenderedBitmap, target_w: u32, target_h: u32) -> RenderedBitmap {
    if src.width == target_w && src.height == target_h {
        return RenderedBitmap { width: src.width, height: src.height, pixels: src.pixels.clone() };
    }
    let mut out = vec![0u16; (target_w * target_h) as usize];
    let copy_w = src.width.min(target_w);
    let copy_h = src.height.min(target_h);
    for y in 0..copy_h {
        let src_row = &src.pixels[(y * src.width) as usize..(y * src.width + copy_w) as usize];
        let dst_start = (y * target_w) as usize;
        out[dst_start..dst_start + copy_w as usize].copy_from_slice(src_row);
    }
    RenderedBitmap { width: target_w, height: target_h, pixels: out }
}

/// Decodes a PNG file into ARGB1555, matching `region_prepare_image()`'s
/// RGBA8 -> ARGB1555 bit-packing.
pub fn decode_png(data: &[u8]) -> Result<RenderedBitmap, String> {
    let decoder = png::Decoder::new(Cursor::new(data));
    let mut reader = decoder.read_info().map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).map_err(|e| e.to_string())?;
    let rgba = to_rgba8(&buf[..info.buffer_size()], info.color_type, info.bit_depth);

    let mut pixels = Vec::with_capacity((info.width * info.height) as usize);
    for chunk in rgba.chunks_exact(4) {
        let (r, g, b, a) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        pixels.push(argb1555(a & 0x80 != 0, r & 0xf8, g & 0xf8, b & 0xf8));
    }
    Ok(RenderedBitmap { width: info.width, height: info.height, pixels })
}

fn to_rgba8(buf: &[u8], color: png::ColorType, depth: png::BitDepth) -> Vec<u8> {
    if color == png::ColorType::Rgba && depth == png::BitDepth::Eight {
        return buf.to_vec();
    }
    if color == png::ColorType::Rgb && depth == png::BitDepth::Eight {
        let mut out = Vec::with_capacity(buf.len() / 3 * 4);
        for chunk in buf.chunks_exact(3) {
            out.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 0xff]);
        }
        return out;
    }
    if color == png::ColorType::GrayscaleAlpha && depth == png::BitDepth::Eight {
        let mut out = Vec::with_capacity(buf.len() * 2);
        for chunk in buf.chunks_exact(2) {
            out.extend_from_slice(&[chunk[0], chunk[0], chunk[0], chunk[1]]);
        }
        return out;
    }
    let mut out = Vec::with_capacity(buf.len() * 4);
    for &v in buf {
        out.extend_from_slice(&[v, v, v, 0xff]);
    }
    out
}

/// Decodes a 24/32-bit uncompressed or bitfields BMP into ARGB1555, matching
/// `region_prepare_bitmap()`.
pub fn decode_bmp(data: &[u8]) -> Result<RenderedBitmap, String> {
    if data.len() < 54 || &data[0..2] != b"BM" {
        return Err("not a bitmap file".to_string());
    }
    let off_bits = u32::from_le_bytes(data[10..14].try_into().unwrap()) as usize;
    let width = i32::from_le_bytes(data[18..22].try_into().unwrap());
    let height = i32::from_le_bytes(data[22..26].try_into().unwrap());
    let bit_count = u16::from_le_bytes(data[28..30].try_into().unwrap());
    let compression = u32::from_le_bytes(data[30..34].try_into().unwrap());

    if bit_count < 24 {
        return Err("indexed or <3bpp bitmaps are not supported".to_string());
    }
    if compression != 0 && !(compression == 3 && (bit_count == 16 || bit_count == 32)) {
        return Err("compressed modes are not supported".to_string());
    }

    let (red_mask, green_mask, blue_mask, alpha_mask) = if compression == 3 {
        (
            u32::from_le_bytes(data[54..58].try_into().unwrap()),
            u32::from_le_bytes(data[58..62].try_into().unwrap()),
            u32::from_le_bytes(data[62..66].try_into().unwrap()),
            u32::from_le_bytes(data[66..70].try_into().unwrap()),
        )
    } else {
        (0, 0, 0, 0)
    };

    let w = width as u32;
    let h = height.unsigned_abs();
    let bpp = (bit_count / 8) as usize;
    let stride = (w as usize) * bpp;
    let bottom_up = height >= 0;

    let mut pixels = vec![0u16; (w * h) as usize];
    for row in 0..h {
        let src_row = if bottom_up { h - 1 - row } else { row };
        let row_start = off_bits + src_row as usize * stride;
        if row_start + stride > data.len() {
            return Err("bitmap data truncated".to_string());
        }
        let row_data = &data[row_start..row_start + stride];
        for col in 0..w {
            let px = &row_data[col as usize * bpp..col as usize * bpp + bpp];
            let (a, r, g, b) = if compression == 3 {
                let v = u32::from_le_bytes([px[0], px[1], px.get(2).copied().unwrap_or(0), px.get(3).copied().unwrap_or(0)]);
                (
                    mask_component(v, alpha_mask),
                    mask_component(v, red_mask),
                    mask_component(v, green_mask),
                    mask_component(v, blue_mask),
                )
            } else if bpp == 3 {
                (0xff, px[2], px[1], px[0])
            } else {
                (px[3], px[2], px[1], px[0])
            };
            pixels[(row * w + col) as usize] = argb1555(a & 0x80 != 0, r & 0xf8, g & 0xf8, b & 0xf8);
        }
    }

    Ok(RenderedBitmap { width: w, height: h, pixels })
}

fn mask_component(v: u32, mask: u32) -> u8 {
    if mask == 0 {
        return 0;
    }
    let shift = mask.trailing_zeros();
    ((v & mask) >> shift) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_bitmap_preserves_top_left_and_fills_transparent() {
        let src = RenderedBitmap { width: 2, height: 2, pixels: vec![0xffff, 0xffff, 0xffff, 0xffff] };
        let padded = pad_bitmap(&src, 4, 3);
        assert_eq!(padded.width, 4);
        assert_eq!(padded.height, 3);
        assert_eq!(padded.pixels[0], 0xffff);
        assert_eq!(padded.pixels[2], 0); // transparent fill
    }

    #[test]
    fn pad_bitmap_no_op_when_size_matches() {
        let src = RenderedBitmap { width: 3, height: 3, pixels: vec![1; 9] };
        let padded = pad_bitmap(&src, 3, 3);
        assert_eq!(padded.pixels, src.pixels);
    }

    #[test]
    fn rejects_indexed_bitmap() {
        let mut header = vec![0u8; 54];
        header[0] = b'B';
        header[1] = b'M';
        header[28] = 8; // bitCount = 8
        assert!(decode_bmp(&header).is_err());
    }
}
