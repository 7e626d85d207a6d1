pub mod gles;

use crate::cursor::CursorImage;
use crate::format::PixelFormat;
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::utils::{Physical, Rectangle, Size};
use std::os::fd::OwnedFd;

pub use gles::GlesCaptureBackend;

/// Cursor texture and where to draw it, in buffer coordinates.
#[derive(Debug)]
pub struct CursorQuad<'a, T> {
    pub texture: &'a T,
    pub rect: Rectangle<i32, Physical>,
}

/// GPU operations the capture path needs from the compositor's renderer.
///
/// Every GPU path calls [`CaptureBackend::make_current`] first and runs to
/// completion without returning to the event loop.
pub trait CaptureBackend {
    type Texture: Clone + 'static;
    type Error: std::error::Error + 'static;

    fn make_current(&mut self) -> Result<(), Self::Error>;

    fn texture_size(&self, texture: &Self::Texture) -> Size<i32, Physical>;

    /// Reads `texture` back into `dst`, rows `stride` bytes apart, top row
    /// first, in `format` byte order.
    fn download(
        &mut self,
        texture: &Self::Texture,
        format: PixelFormat,
        dst: &mut [u8],
        stride: usize,
    ) -> Result<(), Self::Error>;

    /// Draws `texture` into `dmabuf`, then the cursor on top. Returns a
    /// native fence fd that signals when rendering is done, if the driver can
    /// export one.
    fn render_to_dmabuf(
        &mut self,
        texture: &Self::Texture,
        dmabuf: &mut Dmabuf,
        cursor: Option<CursorQuad<'_, Self::Texture>>,
    ) -> Result<Option<OwnedFd>, Self::Error>;

    /// GPU copy of `texture` that stays valid after the compositor renders
    /// its next frame.
    fn snapshot(&mut self, texture: &Self::Texture) -> Result<Self::Texture, Self::Error>;

    fn import_cursor(&mut self, image: &CursorImage) -> Result<Self::Texture, Self::Error>;

    /// Blocks until all submitted GPU work is done.
    fn finish(&mut self) -> Result<(), Self::Error>;
}
