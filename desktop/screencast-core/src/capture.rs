use crate::backend::{CaptureBackend, CursorQuad};
use crate::config::{CursorMode, CursorSettings};
use crate::cursor::{CursorCompositor, CursorPlacement, PointerState};
use crate::error::CaptureDrop;
use crate::format::{PixelFormat, stride_for};
use crate::meta::{write_damage, write_header};
use crate::pool::{BufferKind, MemfdBuffer, SharedPool, StreamBuffer};
use crate::transport::{ChunkInfo, MetaKind, TransportBuffer};
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::utils::{Physical, Rectangle, Size};
use std::os::fd::OwnedFd;
use std::time::Duration;
use tracing::{trace, warn};

/// What the pixels of a capture are drawn from.
#[derive(Debug, Clone, Copy)]
pub enum FrameBase<'a, T> {
    /// A freshly composited frame.
    Frame(&'a T),
    /// Only the pointer moved. The copy of the last frame taken before the
    /// cursor was drawn is used, so the old cursor position comes out clean.
    CursorOnly,
}

#[derive(Debug)]
pub struct CaptureRequest<'a, T> {
    pub base: FrameBase<'a, T>,
    /// In stream coordinates.
    pub damage: Vec<Rectangle<i32, Physical>>,
    pub sequence: u64,
    pub pts: Duration,
}

/// Negotiated layout of the frames of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub format: PixelFormat,
    pub resolution: Size<i32, Physical>,
}

fn render_error<E: std::error::Error>(err: E) -> CaptureDrop {
    CaptureDrop::Render(err.to_string())
}

/// Adds `extra` clipped to `bounds`, skipping rects already covered.
pub fn merge_damage(
    damage: &mut Vec<Rectangle<i32, Physical>>,
    extra: impl IntoIterator<Item = Rectangle<i32, Physical>>,
    bounds: Rectangle<i32, Physical>,
) {
    for rect in extra {
        let Some(rect) = rect.intersection(bounds).filter(|r| !r.is_empty()) else {
            continue;
        };
        if !damage.iter().any(|d| d.contains_rect(rect)) {
            damage.push(rect);
        }
    }
}

/// Fills dequeued buffers of one stream.
#[derive(Debug)]
pub struct FrameCapturer<T> {
    cursor: CursorCompositor<T>,
    last_frame: Option<T>,
    last_drawn_serial: Option<u64>,
    blocking_sync_warned: bool,
}

impl<T: Clone> FrameCapturer<T> {
    pub fn new(settings: CursorSettings, bitmap_edge: u32) -> Self {
        FrameCapturer {
            cursor: CursorCompositor::new(settings, bitmap_edge),
            last_frame: None,
            last_drawn_serial: None,
            blocking_sync_warned: false,
        }
    }

    pub fn cursor(&self) -> &CursorCompositor<T> {
        &self.cursor
    }

    pub fn set_cursor_settings(&mut self, settings: CursorSettings, bitmap_edge: u32) {
        if settings.mode != CursorMode::Embedded {
            self.last_frame = None;
        }
        self.last_drawn_serial = None;
        self.cursor.set_settings(settings, bitmap_edge);
    }

    pub fn has_base_frame(&self) -> bool {
        self.last_frame.is_some()
    }

    /// Forgets the pre-cursor frame, e.g. after a resize.
    pub fn reset_base_frame(&mut self) {
        self.last_frame = None;
    }

    /// Whether an embedded cursor would be drawn differently than last time.
    pub fn cursor_changed(&self, pointer: &PointerState) -> bool {
        let rect = self.cursor.placement(pointer).map(|p| p.rect);
        let serial = pointer.image.as_ref().map(|image| image.serial());
        rect != self.cursor.last_rect() || (rect.is_some() && serial != self.last_drawn_serial)
    }

    /// Fills `buffer` with one frame and its metadata.
    ///
    /// Returns the render fence to wait on before the buffer may be queued.
    /// On error the buffer has not been filled and must be handed back.
    pub fn capture<B, Buf>(
        &mut self,
        backend: &mut B,
        pool: &SharedPool,
        buffer: &mut Buf,
        stream: StreamFormat,
        pointer: &PointerState,
        request: CaptureRequest<'_, T>,
    ) -> Result<Option<OwnedFd>, CaptureDrop>
    where
        B: CaptureBackend<Texture = T>,
        Buf: TransportBuffer,
    {
        let slot = buffer.slot();
        let mut pool = pool.borrow_mut();
        let stored = pool
            .get_mut(slot)
            .ok_or(CaptureDrop::InvalidBufferData("unknown buffer slot"))?;
        match (stored.kind(), buffer.data_kind()) {
            (None, _) => return Err(CaptureDrop::InvalidBufferData("slot has no storage")),
            (Some(BufferKind::MemFd), Some(BufferKind::MemFd)) if !buffer.has_data() => {
                return Err(CaptureDrop::InvalidBufferData("memfd buffer is not mapped"));
            }
            (Some(ours), Some(theirs)) if ours == theirs => {}
            _ => return Err(CaptureDrop::InvalidBufferData("buffer type mismatch")),
        }

        let embedded = self.cursor.mode() == CursorMode::Embedded;
        let placement = if embedded {
            self.cursor.placement(pointer)
        } else {
            None
        };
        let base = match request.base {
            FrameBase::Frame(texture) => {
                if placement.is_some() {
                    self.keep_base_frame(backend, texture);
                } else {
                    self.last_frame = None;
                }
                texture.clone()
            }
            FrameBase::CursorOnly => self.last_frame.clone().ok_or(CaptureDrop::NoBaseFrame)?,
        };

        let mut damage = request.damage;
        if embedded {
            merge_damage(
                &mut damage,
                self.cursor.damage_for(placement),
                Rectangle::from_size(stream.resolution),
            );
        }

        let fence = match stored {
            StreamBuffer::MemFd(memfd) => {
                self.fill_memfd(backend, buffer, memfd, &base, stream, pointer, placement)?;
                None
            }
            StreamBuffer::DmaBuf { dmabuf, max_size } => {
                self.fill_dmabuf(backend, buffer, dmabuf, *max_size, &base, pointer, placement)?
            }
            StreamBuffer::Degraded(_) => {
                return Err(CaptureDrop::InvalidBufferData("slot has no storage"));
            }
        };
        if embedded {
            self.cursor.track_damage(placement);
        }
        self.last_drawn_serial = placement
            .and(pointer.image.as_ref())
            .map(|image| image.serial());

        if self.cursor.mode() == CursorMode::Metadata {
            if let Some(area) = buffer.meta_mut(MetaKind::Cursor) {
                self.cursor.write_metadata(area, pointer);
            }
        }
        if let Some(area) = buffer.meta_mut(MetaKind::Damage) {
            let written = write_damage(area, &damage);
            trace!(slot, written, input = damage.len(), "Wrote damage metadata");
        }
        if let Some(area) = buffer.meta_mut(MetaKind::Header) {
            write_header(area, request.sequence, request.pts.as_nanos() as i64);
        }

        Ok(fence)
    }

    /// Turns `buffer` into a cursor update without pixels: every chunk is
    /// flagged corrupted and only cursor, damage and header metadata is set.
    pub fn fill_cursor_metadata<Buf: TransportBuffer>(
        &mut self,
        buffer: &mut Buf,
        pointer: &PointerState,
        sequence: u64,
        pts: Duration,
    ) {
        for plane in 0..buffer.plane_count().max(1) {
            buffer.set_chunk(plane, ChunkInfo::corrupted());
        }
        if let Some(area) = buffer.meta_mut(MetaKind::Cursor) {
            self.cursor.write_metadata(area, pointer);
        }
        if let Some(area) = buffer.meta_mut(MetaKind::Damage) {
            write_damage(area, &[]);
        }
        if let Some(area) = buffer.meta_mut(MetaKind::Header) {
            write_header(area, sequence, pts.as_nanos() as i64);
        }
    }

    fn keep_base_frame<B: CaptureBackend<Texture = T>>(&mut self, backend: &mut B, texture: &T) {
        let copy = backend
            .make_current()
            .and_then(|()| backend.snapshot(texture));
        match copy {
            Ok(copy) => self.last_frame = Some(copy),
            Err(err) => {
                warn!(?err, "Failed to copy frame for cursor-only repaints");
                self.last_frame = None;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_memfd<B, Buf>(
        &self,
        backend: &mut B,
        buffer: &mut Buf,
        memfd: &mut MemfdBuffer,
        base: &T,
        stream: StreamFormat,
        pointer: &PointerState,
        placement: Option<CursorPlacement>,
    ) -> Result<(), CaptureDrop>
    where
        B: CaptureBackend<Texture = T>,
        Buf: TransportBuffer,
    {
        let stride = stride_for(
            stream.resolution.w.max(0) as u32,
            stream.format.bytes_per_pixel(),
        );
        let required = stride * stream.resolution.h.max(0) as usize;
        let max_size = memfd.len();
        if required > max_size {
            return Err(CaptureDrop::OversizedFrame { required, max_size });
        }

        buffer.set_chunk(
            0,
            ChunkInfo {
                offset: 0,
                size: required as u32,
                stride: stride as i32,
                corrupted: false,
            },
        );

        backend.make_current().map_err(render_error)?;
        let pixels = memfd.as_mut_slice();
        backend
            .download(base, stream.format, pixels, stride)
            .map_err(render_error)?;

        if let (Some(image), Some(placement)) = (pointer.image.as_ref(), placement) {
            self.cursor.blend_into(
                pixels,
                stride,
                stream.format,
                stream.resolution,
                image,
                placement,
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn fill_dmabuf<B, Buf>(
        &mut self,
        backend: &mut B,
        buffer: &mut Buf,
        dmabuf: &mut Dmabuf,
        max_size: usize,
        base: &T,
        pointer: &PointerState,
        placement: Option<CursorPlacement>,
    ) -> Result<Option<OwnedFd>, CaptureDrop>
    where
        B: CaptureBackend<Texture = T>,
        Buf: TransportBuffer,
    {
        let planes = buffer.plane_count().max(1);
        let layout = dmabuf
            .offsets()
            .zip(dmabuf.strides())
            .take(planes)
            .collect::<Vec<_>>();
        for (plane, (offset, stride)) in layout.into_iter().enumerate() {
            buffer.set_chunk(
                plane,
                ChunkInfo {
                    offset,
                    size: max_size as u32,
                    stride: stride as i32,
                    corrupted: false,
                },
            );
        }

        backend.make_current().map_err(render_error)?;
        let cursor = match (pointer.image.as_ref(), placement) {
            (Some(image), Some(placement)) => Some((
                self.cursor
                    .cursor_texture(backend, image)
                    .map_err(render_error)?,
                placement.rect,
            )),
            _ => None,
        };
        let quad = cursor
            .as_ref()
            .map(|(texture, rect)| CursorQuad { texture, rect: *rect });

        let fence = backend
            .render_to_dmabuf(base, dmabuf, quad)
            .map_err(render_error)?;

        if fence.is_none() {
            if !self.blocking_sync_warned {
                warn!("Renderer cannot export a native fence, waiting for the GPU before queueing");
                self.blocking_sync_warned = true;
            }
            backend.finish().map_err(render_error)?;
        }
        Ok(fence)
    }
}
