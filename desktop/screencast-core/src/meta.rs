//! Writers for the SPA metadata blocks attached to each buffer.
//!
//! Layouts follow `spa/buffer/meta.h` in native byte order:
//!
//! * `spa_meta_header`: flags u32, offset u32, pts i64, dts_offset i64, seq u64
//! * `spa_meta_region`: x i32, y i32, width u32, height u32
//! * `spa_meta_cursor`: id u32, flags u32, position i32x2, hotspot i32x2,
//!   bitmap_offset u32
//! * `spa_meta_bitmap`: format u32, size u32x2, stride i32, offset u32

use libspa::param::video::VideoFormat;
use smithay::utils::{Physical, Point, Rectangle, Size};

pub const HEADER_META_SIZE: usize = 32;
pub const REGION_SIZE: usize = 16;
pub const CURSOR_SIZE: usize = 28;
pub const BITMAP_SIZE: usize = 20;

/// Bytes of a cursor meta holding a `width` x `height` RGBA bitmap.
pub const fn cursor_meta_size(width: u32, height: u32) -> usize {
    CURSOR_SIZE + BITMAP_SIZE + width as usize * height as usize * 4
}

fn put_u32(area: &mut [u8], offset: usize, value: u32) {
    area[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_i32(area: &mut [u8], offset: usize, value: i32) {
    area[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
}

fn put_u64(area: &mut [u8], offset: usize, value: u64) {
    area[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
}

fn put_region(area: &mut [u8], offset: usize, rect: Rectangle<i32, Physical>) {
    put_i32(area, offset, rect.loc.x);
    put_i32(area, offset + 4, rect.loc.y);
    put_u32(area, offset + 8, rect.size.w.max(0) as u32);
    put_u32(area, offset + 12, rect.size.h.max(0) as u32);
}

/// Writes `rects` into a `spa_meta_region` array of `area.len() / 16` slots.
///
/// The last slot is reserved for the zero-sized terminator; if the damage
/// does not fit, a single bounding rectangle is written instead. Returns the
/// number of rectangles written, terminator excluded.
pub fn write_damage(area: &mut [u8], rects: &[Rectangle<i32, Physical>]) -> usize {
    let capacity = area.len() / REGION_SIZE;
    if capacity == 0 {
        return 0;
    }

    let rects = rects
        .iter()
        .copied()
        .filter(|r| !r.is_empty())
        .collect::<Vec<_>>();

    let mut written = 0;
    if rects.len() > capacity - 1 {
        if capacity > 1 {
            let bounding = rects
                .iter()
                .skip(1)
                .fold(rects[0], |acc, r| acc.merge(*r));
            put_region(area, 0, bounding);
            written = 1;
        }
    } else {
        for rect in &rects {
            put_region(area, written * REGION_SIZE, *rect);
            written += 1;
        }
    }

    put_region(area, written * REGION_SIZE, Rectangle::default());
    written
}

/// Cursor fields of a `spa_meta_cursor`, already in stream coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRecord {
    pub id: u32,
    pub position: Point<i32, Physical>,
    pub hotspot: Point<i32, Physical>,
}

impl CursorRecord {
    /// The record sent when the pointer left the stream.
    pub fn invisible() -> Self {
        CursorRecord {
            id: 0,
            position: (-1, -1).into(),
            hotspot: (-1, -1).into(),
        }
    }
}

/// Premultiplied RGBA bitmap attached to a cursor meta.
#[derive(Debug, Clone, Copy)]
pub struct CursorBitmap<'a> {
    pub size: Size<i32, Physical>,
    pub stride: usize,
    pub pixels: &'a [u8],
}

/// Writes a cursor record and, when `bitmap` is given and fits, the bitmap
/// right behind it. Returns whether the bitmap was written.
pub fn write_cursor(area: &mut [u8], record: CursorRecord, bitmap: Option<CursorBitmap<'_>>) -> bool {
    if area.len() < CURSOR_SIZE {
        return false;
    }

    put_u32(area, 0, record.id);
    put_u32(area, 4, 0);
    put_i32(area, 8, record.position.x);
    put_i32(area, 12, record.position.y);
    put_i32(area, 16, record.hotspot.x);
    put_i32(area, 20, record.hotspot.y);
    put_u32(area, 24, 0);

    let Some(bitmap) = bitmap else {
        return false;
    };

    let rows = bitmap.size.h.max(0) as usize;
    let bytes = bitmap.stride * rows;
    let end = CURSOR_SIZE + BITMAP_SIZE + bytes;
    if end > area.len() || bitmap.pixels.len() < bytes {
        return false;
    }

    put_u32(area, 24, CURSOR_SIZE as u32);
    let base = CURSOR_SIZE;
    put_u32(area, base, VideoFormat::RGBA.as_raw());
    put_u32(area, base + 4, bitmap.size.w.max(0) as u32);
    put_u32(area, base + 8, bitmap.size.h.max(0) as u32);
    put_i32(area, base + 12, bitmap.stride as i32);
    put_u32(area, base + 16, BITMAP_SIZE as u32);
    area[base + BITMAP_SIZE..end].copy_from_slice(&bitmap.pixels[..bytes]);
    true
}

pub fn write_header(area: &mut [u8], seq: u64, pts_ns: i64) {
    if area.len() < HEADER_META_SIZE {
        return;
    }
    put_u32(area, 0, 0);
    put_u32(area, 4, 0);
    area[8..16].copy_from_slice(&pts_ns.to_ne_bytes());
    area[16..24].copy_from_slice(&0i64.to_ne_bytes());
    put_u64(area, 24, seq);
}
