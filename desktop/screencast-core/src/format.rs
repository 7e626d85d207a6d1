use smithay::backend::allocator::Fourcc;

/// Pixel layouts a stream can carry, named in memory byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// B, G, R, A with premultiplied alpha.
    Bgra,
    /// B, G, R and one padding byte.
    Bgrx,
    /// Packed 24 bit B, G, R.
    Bgr,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra | PixelFormat::Bgrx => 4,
            PixelFormat::Bgr => 3,
        }
    }

    pub fn has_alpha(self) -> bool {
        self == PixelFormat::Bgra
    }

    /// DRM fourcc of the format. DRM names little-endian words, so memory
    /// order B, G, R, A is `ARGB8888`. There is no dma-buf path for 24 bit.
    pub fn fourcc(self) -> Option<Fourcc> {
        match self {
            PixelFormat::Bgra => Some(Fourcc::Argb8888),
            PixelFormat::Bgrx => Some(Fourcc::Xrgb8888),
            PixelFormat::Bgr => None,
        }
    }

    /// Format proposed first. BGRA wins whenever the source has alpha or a
    /// dma-buf of the stream's size can be allocated.
    pub fn preferred(has_alpha: bool, dmabuf_capable: bool) -> PixelFormat {
        if has_alpha || dmabuf_capable {
            PixelFormat::Bgra
        } else {
            PixelFormat::Bgr
        }
    }

    /// Formats offered to the consumer, in preference order.
    pub fn offered(has_alpha: bool, dmabuf_capable: bool) -> Vec<PixelFormat> {
        match Self::preferred(has_alpha, dmabuf_capable) {
            PixelFormat::Bgr => vec![PixelFormat::Bgr],
            _ => vec![PixelFormat::Bgra, PixelFormat::Bgrx],
        }
    }
}

/// Row pitch of a tightly packed buffer, rounded up to four bytes.
pub fn stride_for(width: u32, bytes_per_pixel: usize) -> usize {
    (width as usize * bytes_per_pixel).next_multiple_of(4)
}
