use crate::backend::CaptureBackend;
use crate::config::{CursorMode, CursorSettings};
use crate::format::PixelFormat;
use crate::meta::{self, CursorBitmap, CursorRecord};
use smithay::utils::{Logical, Physical, Point, Rectangle, Size};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A decoded cursor image. Every image gets its own serial, so two images
/// compare equal for caching purposes only if they are clones of each other.
#[derive(Debug, Clone)]
pub struct CursorImage {
    serial: u64,
    size: Size<i32, Logical>,
    hotspot: Point<i32, Logical>,
    pixels: Arc<Vec<u8>>,
}

impl CursorImage {
    /// `pixels` is premultiplied RGBA, tightly packed. Returns `None` if the
    /// buffer does not match `size`.
    pub fn new(
        size: impl Into<Size<i32, Logical>>,
        hotspot: impl Into<Point<i32, Logical>>,
        pixels: Vec<u8>,
    ) -> Option<Self> {
        let size = size.into();
        if size.w <= 0 || size.h <= 0 || pixels.len() != size.w as usize * size.h as usize * 4 {
            return None;
        }
        Some(CursorImage {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            size,
            hotspot: hotspot.into(),
            pixels: Arc::new(pixels),
        })
    }

    /// Same as [`CursorImage::new`] for straight (non-premultiplied) RGBA.
    pub fn from_straight_rgba(
        size: impl Into<Size<i32, Logical>>,
        hotspot: impl Into<Point<i32, Logical>>,
        mut pixels: Vec<u8>,
    ) -> Option<Self> {
        for px in pixels.chunks_exact_mut(4) {
            let a = px[3] as u32;
            for c in &mut px[..3] {
                *c = ((*c as u32 * a + 127) / 255) as u8;
            }
        }
        Self::new(size, hotspot, pixels)
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn size(&self) -> Size<i32, Logical> {
        self.size
    }

    pub fn hotspot(&self) -> Point<i32, Logical> {
        self.hotspot
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn pixel(&self, x: i32, y: i32) -> [u8; 4] {
        let off = (y as usize * self.size.w as usize + x as usize) * 4;
        [
            self.pixels[off],
            self.pixels[off + 1],
            self.pixels[off + 2],
            self.pixels[off + 3],
        ]
    }

    /// Top-left `crop` of the image, rows tightly packed.
    fn cropped(&self, crop: Size<i32, Physical>) -> Vec<u8> {
        let (w, h) = (crop.w.min(self.size.w).max(0), crop.h.min(self.size.h).max(0));
        let row = self.size.w as usize * 4;
        let mut out = Vec::with_capacity(w as usize * h as usize * 4);
        for y in 0..h as usize {
            out.extend_from_slice(&self.pixels[y * row..y * row + w as usize * 4]);
        }
        out
    }
}

/// Pointer as seen by the compositor, in source coordinates.
#[derive(Debug, Clone, Default)]
pub struct PointerState {
    pub position: Point<f64, Logical>,
    pub image: Option<CursorImage>,
}

/// Where the cursor lands in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPlacement {
    /// Cursor image rectangle in stream coordinates, hotspot applied.
    pub rect: Rectangle<i32, Physical>,
}

pub fn viewport_contains(viewport: Rectangle<i32, Logical>, point: Point<f64, Logical>) -> bool {
    let loc = viewport.loc.to_f64();
    let size = viewport.size.to_f64();
    point.x >= loc.x && point.y >= loc.y && point.x < loc.x + size.w && point.y < loc.y + size.h
}

/// GPU copy of the cursor image, reused until the image changes.
#[derive(Debug, Clone)]
pub struct CursorSnapshot<T> {
    pub serial: u64,
    pub texture: T,
}

/// Per-stream cursor state: the cached cursor texture, where the cursor was
/// last drawn, and which image was last sent as metadata.
#[derive(Debug)]
pub struct CursorCompositor<T> {
    settings: CursorSettings,
    bitmap_edge: u32,
    snapshot: Option<CursorSnapshot<T>>,
    last_rect: Option<Rectangle<i32, Physical>>,
    last_sent_serial: Option<u64>,
    visible: bool,
}

impl<T: Clone> CursorCompositor<T> {
    pub fn new(settings: CursorSettings, bitmap_edge: u32) -> Self {
        CursorCompositor {
            settings,
            bitmap_edge,
            snapshot: None,
            last_rect: None,
            last_sent_serial: None,
            visible: false,
        }
    }

    pub fn settings(&self) -> CursorSettings {
        self.settings
    }

    pub fn mode(&self) -> CursorMode {
        self.settings.mode
    }

    pub fn set_settings(&mut self, settings: CursorSettings, bitmap_edge: u32) {
        if settings.mode != self.settings.mode {
            self.last_rect = None;
            self.last_sent_serial = None;
            self.visible = false;
        }
        self.settings = settings;
        self.bitmap_edge = bitmap_edge;
    }

    /// `None` when there is no image or the pointer is outside the viewport.
    pub fn placement(&self, pointer: &PointerState) -> Option<CursorPlacement> {
        let image = pointer.image.as_ref()?;
        if !viewport_contains(self.settings.viewport, pointer.position) {
            return None;
        }

        let scale = self.settings.scale;
        let loc = (pointer.position
            - self.settings.viewport.loc.to_f64()
            - image.hotspot().to_f64())
        .to_physical(scale)
        .to_i32_round();
        let size = image.size().to_f64().to_physical(scale).to_i32_round();
        Some(CursorPlacement {
            rect: Rectangle::new(loc, size),
        })
    }

    pub fn cached_texture(&self) -> Option<&CursorSnapshot<T>> {
        self.snapshot.as_ref()
    }

    /// Cursor texture for `image`, importing it when the serial changed.
    pub fn cursor_texture<B>(&mut self, backend: &mut B, image: &CursorImage) -> Result<T, B::Error>
    where
        B: CaptureBackend<Texture = T>,
    {
        if let Some(snapshot) = &self.snapshot {
            if snapshot.serial == image.serial() {
                return Ok(snapshot.texture.clone());
            }
        }
        let texture = backend.import_cursor(image)?;
        self.snapshot = Some(CursorSnapshot {
            serial: image.serial(),
            texture: texture.clone(),
        });
        Ok(texture)
    }

    /// Records where the cursor is now and returns the stream area touched by
    /// the move: the previous rect and the current one.
    pub fn track_damage(&mut self, placement: Option<CursorPlacement>) -> Vec<Rectangle<i32, Physical>> {
        let damage = self.damage_for(placement);
        self.last_rect = placement.map(|p| p.rect);
        damage
    }

    /// Same area as [`CursorCompositor::track_damage`] without recording
    /// the new position.
    pub fn damage_for(&self, placement: Option<CursorPlacement>) -> Vec<Rectangle<i32, Physical>> {
        self.last_rect
            .into_iter()
            .chain(placement.map(|p| p.rect))
            .collect()
    }

    pub fn last_rect(&self) -> Option<Rectangle<i32, Physical>> {
        self.last_rect
    }

    /// Whether the last cursor metadata reported a visible cursor.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Fills a `spa_meta_cursor` area. The bitmap is attached only when the
    /// image changed since it was last sent on this stream.
    pub fn write_metadata(&mut self, area: &mut [u8], pointer: &PointerState) {
        let image = match &pointer.image {
            Some(image) if viewport_contains(self.settings.viewport, pointer.position) => image,
            _ => {
                meta::write_cursor(area, CursorRecord::invisible(), None);
                self.visible = false;
                return;
            }
        };

        let scale = self.settings.scale;
        let record = CursorRecord {
            id: 1,
            position: (pointer.position - self.settings.viewport.loc.to_f64())
                .to_physical(scale)
                .to_i32_round(),
            hotspot: image.hotspot().to_f64().to_physical(scale).to_i32_round(),
        };
        self.visible = true;

        if self.last_sent_serial == Some(image.serial()) {
            meta::write_cursor(area, record, None);
            return;
        }

        // bitmap edge is the theme size at stream scale, the image is sent unscaled
        let edge = self.bitmap_edge as i32;
        let size: Size<i32, Physical> = (image.size().w.min(edge), image.size().h.min(edge)).into();
        let pixels = image.cropped(size);
        let bitmap = CursorBitmap {
            size,
            stride: size.w as usize * 4,
            pixels: &pixels,
        };
        if meta::write_cursor(area, record, Some(bitmap)) {
            self.last_sent_serial = Some(image.serial());
        }
    }

    /// Source-over blend of the cursor into a CPU frame of `frame_size`.
    pub fn blend_into(
        &self,
        dst: &mut [u8],
        stride: usize,
        format: PixelFormat,
        frame_size: Size<i32, Physical>,
        image: &CursorImage,
        placement: CursorPlacement,
    ) {
        let rect = placement.rect;
        if rect.is_empty() {
            return;
        }
        let Some(clip) = rect.intersection(Rectangle::from_size(frame_size)) else {
            return;
        };

        let bpp = format.bytes_per_pixel();
        let img = image.size();
        for y in clip.loc.y..clip.loc.y + clip.size.h {
            let sy = ((y - rect.loc.y) as i64 * img.h as i64 / rect.size.h as i64) as i32;
            let row = y as usize * stride;
            for x in clip.loc.x..clip.loc.x + clip.size.w {
                let sx = ((x - rect.loc.x) as i64 * img.w as i64 / rect.size.w as i64) as i32;
                let [r, g, b, a] = image.pixel(sx, sy);
                if a == 0 && r == 0 && g == 0 && b == 0 {
                    continue;
                }
                let off = row + x as usize * bpp;
                let Some(px) = dst.get_mut(off..off + bpp) else {
                    return;
                };
                let inv = 255 - a as u32;
                let over = |s: u8, d: u8| (s as u32 + (d as u32 * inv + 127) / 255).min(255) as u8;
                px[0] = over(b, px[0]);
                px[1] = over(g, px[1]);
                px[2] = over(r, px[2]);
                match format {
                    PixelFormat::Bgra => px[3] = over(a, px[3]),
                    PixelFormat::Bgrx => px[3] = 0xff,
                    PixelFormat::Bgr => {}
                }
            }
        }
    }
}
