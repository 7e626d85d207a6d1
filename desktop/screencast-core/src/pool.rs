use crate::error::{AllocatorError, BufferError};
use crate::format::{PixelFormat, stride_for};
use smithay::backend::allocator::dmabuf::Dmabuf;
use smithay::backend::allocator::{Buffer, Fourcc, Modifier};
use smithay::reexports::rustix::fs::{MemfdFlags, SealFlags, fcntl_add_seals, ftruncate, memfd_create};
use smithay::reexports::rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use smithay::utils::{Physical, Size};
use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::rc::Rc;
use tracing::{debug, error, warn};

/// Transport-assigned identity of a buffer slot.
pub type SlotId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    DmaBuf,
    MemFd,
}

/// Storage types a consumer accepts for a slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataTypes {
    pub dmabuf: bool,
    pub memfd: bool,
}

impl DataTypes {
    pub fn memfd_only() -> Self {
        DataTypes {
            dmabuf: false,
            memfd: true,
        }
    }

    pub fn dmabuf_only() -> Self {
        DataTypes {
            dmabuf: true,
            memfd: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmabufShape {
    pub fourcc: Fourcc,
    pub modifier: Modifier,
    pub plane_count: usize,
}

/// What every buffer of the current negotiation looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferShape {
    pub size: Size<i32, Physical>,
    pub format: PixelFormat,
    /// Set once a dma-buf modifier was fixated with the consumer.
    pub dmabuf: Option<DmabufShape>,
}

impl BufferShape {
    pub fn stride(&self) -> usize {
        stride_for(self.size.w.max(0) as u32, self.format.bytes_per_pixel())
    }

    pub fn max_size(&self) -> usize {
        self.stride() * self.size.h.max(0) as usize
    }
}

/// Something that can hand out dma-bufs for stream buffers, usually the GBM
/// device behind the compositor's renderer.
pub trait DmabufSource {
    /// Modifiers the renderer can render into for `fourcc`.
    fn modifiers(&self, fourcc: Fourcc) -> Vec<Modifier>;

    /// Allocates and drops a buffer to find out which of `modifiers` the
    /// allocator picks. Returns the modifier and its plane count.
    fn test_allocation(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<(Modifier, usize), AllocatorError>;

    fn allocate(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifier: Modifier,
    ) -> Result<Dmabuf, AllocatorError>;
}

/// A sealed memfd mapped read/write into our address space.
#[derive(Debug)]
pub struct MemfdBuffer {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    stride: usize,
}

impl MemfdBuffer {
    pub fn allocate(len: usize, stride: usize) -> Result<Self, BufferError> {
        let fd = memfd_create(
            "screencast-memfd",
            MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
        )
        .map_err(BufferError::Memfd)?;

        ftruncate(&fd, len as u64).map_err(|source| BufferError::Truncate { size: len, source })?;

        if let Err(err) = fcntl_add_seals(&fd, SealFlags::SEAL | SealFlags::SHRINK | SealFlags::GROW) {
            warn!(err = ?BufferError::Seal(err), "Failed to seal memfd, continuing unsealed");
        }

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|source| BufferError::Mmap { size: len, source })?;

        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(BufferError::Mmap {
            size: len,
            source: smithay::reexports::rustix::io::Errno::NOMEM,
        })?;

        Ok(MemfdBuffer {
            fd,
            ptr,
            len,
            stride,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MemfdBuffer {
    fn drop(&mut self) {
        // the fd closes after this, when the field drops
        if let Err(err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.len) } {
            warn!(?err, "Failed to unmap memfd buffer");
        }
    }
}

/// Backing storage of one slot.
#[derive(Debug)]
pub enum StreamBuffer {
    DmaBuf { dmabuf: Dmabuf, max_size: usize },
    MemFd(MemfdBuffer),
    /// Allocation failed. Captures into this slot are skipped.
    Degraded(BufferError),
}

impl StreamBuffer {
    pub fn kind(&self) -> Option<BufferKind> {
        match self {
            StreamBuffer::DmaBuf { .. } => Some(BufferKind::DmaBuf),
            StreamBuffer::MemFd(_) => Some(BufferKind::MemFd),
            StreamBuffer::Degraded(_) => None,
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            StreamBuffer::DmaBuf { max_size, .. } => *max_size,
            StreamBuffer::MemFd(memfd) => memfd.len(),
            StreamBuffer::Degraded(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneDescriptor {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// What the transport needs to describe a freshly added slot to the consumer.
/// File descriptors stay owned by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferDescriptor {
    DmaBuf {
        planes: Vec<PlaneDescriptor>,
        max_size: usize,
    },
    MemFd {
        fd: RawFd,
        data: *mut u8,
        max_size: usize,
        stride: usize,
    },
    Degraded,
}

pub type SharedPool = Rc<RefCell<BufferPool>>;

/// Owns the storage of every slot the consumer added.
pub struct BufferPool {
    shape: Option<BufferShape>,
    source: Option<Rc<dyn DmabufSource>>,
    buffers: HashMap<SlotId, StreamBuffer>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("shape", &self.shape)
            .field("has_dmabuf_source", &self.source.is_some())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl BufferPool {
    pub fn new(source: Option<Rc<dyn DmabufSource>>) -> Self {
        BufferPool {
            shape: None,
            source,
            buffers: HashMap::new(),
        }
    }

    pub fn shared(source: Option<Rc<dyn DmabufSource>>) -> SharedPool {
        Rc::new(RefCell::new(Self::new(source)))
    }

    pub fn dmabuf_source(&self) -> Option<&Rc<dyn DmabufSource>> {
        self.source.as_ref()
    }

    /// Shape used for slots added from now on. Existing slots are kept until
    /// the consumer removes them.
    pub fn set_shape(&mut self, shape: BufferShape) {
        self.shape = Some(shape);
    }

    pub fn shape(&self) -> Option<BufferShape> {
        self.shape
    }

    pub fn add_buffer(&mut self, slot: SlotId, allowed: DataTypes) -> BufferDescriptor {
        let buffer = match self.shape {
            Some(shape) => self.allocate(shape, allowed),
            None => StreamBuffer::Degraded(BufferError::UnsupportedDataType),
        };

        if let StreamBuffer::Degraded(err) = &buffer {
            error!(slot, ?err, "Failed to allocate stream buffer, slot is unusable");
        }

        let descriptor = describe(&buffer);
        if let Some(old) = self.buffers.insert(slot, buffer) {
            debug!(slot, kind = ?old.kind(), "Replacing buffer in reused slot");
        }
        descriptor
    }

    fn allocate(&self, shape: BufferShape, allowed: DataTypes) -> StreamBuffer {
        let mut failure = None;

        if allowed.dmabuf {
            if let (Some(dmabuf_shape), Some(source)) = (shape.dmabuf, self.source.as_ref()) {
                match source.allocate(shape.size, dmabuf_shape.fourcc, dmabuf_shape.modifier) {
                    Ok(dmabuf) => {
                        let stride = dmabuf.strides().next().unwrap_or(0) as usize;
                        let max_size = stride * dmabuf.size().h.max(0) as usize;
                        return StreamBuffer::DmaBuf { dmabuf, max_size };
                    }
                    Err(err) => {
                        error!(?err, "Failed to allocate dma-buf for stream");
                        failure = Some(BufferError::Dmabuf(err));
                    }
                }
            }
        }

        if allowed.memfd {
            return match MemfdBuffer::allocate(shape.max_size(), shape.stride()) {
                Ok(memfd) => StreamBuffer::MemFd(memfd),
                Err(err) => StreamBuffer::Degraded(err),
            };
        }

        StreamBuffer::Degraded(failure.unwrap_or(BufferError::UnsupportedDataType))
    }

    /// Releases the slot. Returns whether it existed.
    pub fn remove_buffer(&mut self, slot: SlotId) -> bool {
        self.buffers.remove(&slot).is_some()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut StreamBuffer> {
        self.buffers.get_mut(&slot)
    }

    pub fn get(&self, slot: SlotId) -> Option<&StreamBuffer> {
        self.buffers.get(&slot)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

fn describe(buffer: &StreamBuffer) -> BufferDescriptor {
    match buffer {
        StreamBuffer::DmaBuf { dmabuf, max_size } => BufferDescriptor::DmaBuf {
            planes: dmabuf
                .handles()
                .zip(dmabuf.offsets())
                .zip(dmabuf.strides())
                .map(|((fd, offset), stride)| PlaneDescriptor {
                    fd: fd.as_raw_fd(),
                    offset,
                    stride,
                })
                .collect(),
            max_size: *max_size,
        },
        StreamBuffer::MemFd(memfd) => BufferDescriptor::MemFd {
            fd: memfd.fd().as_raw_fd(),
            data: memfd.ptr.as_ptr(),
            max_size: memfd.len(),
            stride: memfd.stride(),
        },
        StreamBuffer::Degraded(_) => BufferDescriptor::Degraded,
    }
}
