use super::{CaptureBackend, CursorQuad};
use crate::cursor::CursorImage;
use crate::format::PixelFormat;
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::{Buffer, Fourcc};
use smithay::backend::renderer::gles::{GlesError, GlesRenderer, GlesTexture};
use smithay::backend::renderer::{
    Bind, ExportMem, Frame, ImportMem, Offscreen, Renderer, Texture, TextureMapping,
};
use smithay::utils::{Buffer as BufferCoords, Physical, Rectangle, Size, Transform};
use std::os::fd::OwnedFd;
use tracing::trace;

/// Capture backend over smithay's GLES renderer.
pub struct GlesCaptureBackend {
    renderer: GlesRenderer,
}

impl GlesCaptureBackend {
    pub fn new(renderer: GlesRenderer) -> Self {
        GlesCaptureBackend { renderer }
    }

    pub fn renderer(&mut self) -> &mut GlesRenderer {
        &mut self.renderer
    }
}

fn physical(size: Size<i32, BufferCoords>) -> Size<i32, Physical> {
    (size.w, size.h).into()
}

/// Copies one row of RGBA texels into `format` order.
fn swizzle_row(src: &[u8], dst: &mut [u8], format: PixelFormat) {
    let bpp = format.bytes_per_pixel();
    for (texel, px) in src.chunks_exact(4).zip(dst.chunks_exact_mut(bpp)) {
        px[0] = texel[2];
        px[1] = texel[1];
        px[2] = texel[0];
        match format {
            PixelFormat::Bgra => px[3] = texel[3],
            PixelFormat::Bgrx => px[3] = 0xff,
            PixelFormat::Bgr => {}
        }
    }
}

impl CaptureBackend for GlesCaptureBackend {
    type Texture = GlesTexture;
    type Error = GlesError;

    fn make_current(&mut self) -> Result<(), GlesError> {
        self.renderer.with_context(|_| ())
    }

    fn texture_size(&self, texture: &GlesTexture) -> Size<i32, Physical> {
        physical(texture.size())
    }

    fn download(
        &mut self,
        texture: &GlesTexture,
        format: PixelFormat,
        dst: &mut [u8],
        stride: usize,
    ) -> Result<(), GlesError> {
        let size = texture.size();
        let mapping =
            self.renderer
                .copy_texture(texture, Rectangle::from_size(size), Fourcc::Abgr8888)?;
        let flipped = mapping.flipped();
        let texels = self.renderer.map_texture(&mapping)?;

        let row_len = size.w as usize * 4;
        let rows = size.h as usize;
        let width = size.w as usize * format.bytes_per_pixel();
        for y in 0..rows {
            let src_row = if flipped { rows - 1 - y } else { y };
            let Some(src) = texels.get(src_row * row_len..(src_row + 1) * row_len) else {
                return Err(GlesError::MappingError);
            };
            let Some(out) = dst.get_mut(y * stride..y * stride + width) else {
                return Err(GlesError::MappingError);
            };
            swizzle_row(src, out, format);
        }
        Ok(())
    }

    fn render_to_dmabuf(
        &mut self,
        texture: &GlesTexture,
        dmabuf: &mut Dmabuf,
        cursor: Option<CursorQuad<'_, GlesTexture>>,
    ) -> Result<Option<OwnedFd>, GlesError> {
        let size = physical(dmabuf.size());
        let full = Rectangle::from_size(size);
        let src = Rectangle::from_size(texture.size()).to_f64();

        let mut target = self.renderer.bind(dmabuf)?;
        let mut frame = self.renderer.render(&mut target, size, Transform::Normal)?;
        frame.clear([0.0, 0.0, 0.0, 0.0].into(), &[full])?;
        frame.render_texture_from_to(texture, src, full, &[full], &[], Transform::Normal, 1.0)?;

        if let Some(cursor) = cursor {
            let cursor_src = Rectangle::from_size(cursor.texture.size()).to_f64();
            frame.render_texture_from_to(
                cursor.texture,
                cursor_src,
                cursor.rect,
                &[cursor.rect],
                &[],
                Transform::Normal,
                1.0,
            )?;
        }

        let sync = frame.finish()?;
        let fence = sync.export();
        trace!(native_fence = fence.is_some(), "Rendered frame into dma-buf");
        Ok(fence)
    }

    fn snapshot(&mut self, texture: &GlesTexture) -> Result<GlesTexture, GlesError> {
        let buffer_size = texture.size();
        let size = physical(buffer_size);
        let full = Rectangle::from_size(size);

        let mut copy: GlesTexture =
            Offscreen::<GlesTexture>::create_buffer(&mut self.renderer, Fourcc::Abgr8888, buffer_size)?;
        {
            let mut target = self.renderer.bind(&mut copy)?;
            let mut frame = self.renderer.render(&mut target, size, Transform::Normal)?;
            frame.clear([0.0, 0.0, 0.0, 0.0].into(), &[full])?;
            frame.render_texture_from_to(
                texture,
                Rectangle::from_size(buffer_size).to_f64(),
                full,
                &[full],
                &[full],
                Transform::Normal,
                1.0,
            )?;
            frame.finish()?;
        }
        Ok(copy)
    }

    fn import_cursor(&mut self, image: &CursorImage) -> Result<GlesTexture, GlesError> {
        let size = image.size();
        self.renderer.import_memory(
            image.pixels(),
            Fourcc::Abgr8888,
            (size.w, size.h).into(),
            false,
        )
    }

    fn finish(&mut self) -> Result<(), GlesError> {
        self.renderer.with_context(|gl| unsafe { gl.Finish() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swizzle_to_each_format() {
        let rgba = [10u8, 20, 30, 40, 50, 60, 70, 80];

        let mut bgra = [0u8; 8];
        swizzle_row(&rgba, &mut bgra, PixelFormat::Bgra);
        assert_eq!(bgra, [30, 20, 10, 40, 70, 60, 50, 80]);

        let mut bgrx = [0u8; 8];
        swizzle_row(&rgba, &mut bgrx, PixelFormat::Bgrx);
        assert_eq!(bgrx, [30, 20, 10, 255, 70, 60, 50, 255]);

        let mut bgr = [0u8; 6];
        swizzle_row(&rgba, &mut bgr, PixelFormat::Bgr);
        assert_eq!(bgr, [30, 20, 10, 70, 60, 50]);
    }
}
