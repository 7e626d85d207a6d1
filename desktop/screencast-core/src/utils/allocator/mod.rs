use crate::error::AllocatorError;
use crate::pool::DmabufSource;
use smithay::backend::allocator::dmabuf::{Dmabuf, DmabufAllocator};
use smithay::backend::allocator::format::FormatSet;
use smithay::backend::allocator::gbm::{GbmAllocator, GbmBufferFlags, GbmDevice};
use smithay::backend::allocator::{Allocator, Buffer, Fourcc, Modifier};
use smithay::backend::drm::DrmNode;
use smithay::utils::{DeviceFd, Physical, Size};
use std::cell::RefCell;
use std::fs::File;
use std::os::fd::OwnedFd;
use tracing::{debug, trace};

pub fn new_gbm_device(render_node: DrmNode) -> Result<GbmDevice<DeviceFd>, AllocatorError> {
    let path = render_node
        .dev_path()
        .ok_or_else(|| AllocatorError::Device(format!("{render_node:?} has no device path")))?;
    let file = File::options()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|err| AllocatorError::Device(format!("{}: {err}", path.display())))?;
    let fd = DeviceFd::from(OwnedFd::from(file));
    GbmDevice::new(fd).map_err(|err| AllocatorError::Device(err.to_string()))
}

/// Allocates stream dma-bufs on the renderer's GBM device.
pub struct GbmDmabufSource {
    allocator: RefCell<DmabufAllocator<GbmAllocator<DeviceFd>>>,
    /// What the renderer can render into.
    formats: FormatSet,
}

impl GbmDmabufSource {
    pub fn new(render_node: DrmNode, formats: FormatSet) -> Result<Self, AllocatorError> {
        let gbm = new_gbm_device(render_node)?;
        let allocator = GbmAllocator::new(gbm, GbmBufferFlags::RENDERING);
        Ok(GbmDmabufSource {
            allocator: RefCell::new(DmabufAllocator(allocator)),
            formats,
        })
    }

    fn create(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<Dmabuf, AllocatorError> {
        if size.w <= 0 || size.h <= 0 {
            return Err(AllocatorError::Failed(format!("invalid size {size:?}")));
        }
        self.allocator
            .borrow_mut()
            .create_buffer(size.w as u32, size.h as u32, fourcc, modifiers)
            .map_err(|err| AllocatorError::Failed(err.to_string()))
    }
}

impl DmabufSource for GbmDmabufSource {
    fn modifiers(&self, fourcc: Fourcc) -> Vec<Modifier> {
        self.formats
            .iter()
            .filter(|format| format.code == fourcc)
            .map(|format| format.modifier)
            .collect()
    }

    fn test_allocation(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<(Modifier, usize), AllocatorError> {
        if modifiers.is_empty() {
            return Err(AllocatorError::NoModifier(fourcc));
        }
        let dmabuf = match self.create(size, fourcc, modifiers) {
            Ok(dmabuf) => dmabuf,
            Err(err) if !modifiers.contains(&Modifier::Invalid) => return Err(err),
            Err(err) => {
                debug!(?err, ?fourcc, "Explicit modifiers failed, trying the implicit one");
                self.create(size, fourcc, &[Modifier::Invalid])?
            }
        };
        let modifier = dmabuf.format().modifier;
        let planes = dmabuf.num_planes();
        trace!(?fourcc, ?modifier, planes, "Test allocation succeeded");
        Ok((modifier, planes))
    }

    fn allocate(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifier: Modifier,
    ) -> Result<Dmabuf, AllocatorError> {
        self.create(size, fourcc, &[modifier])
    }
}
