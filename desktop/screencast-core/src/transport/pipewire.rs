//! PipeWire producer streams.

use super::params::{self, as_pods, buffer_objects, format_object, serialize_all};
use super::{
    BufferOffer, ChunkInfo, EventQueue, FormatOffer, MetaKind, ModifierProposal, NegotiatedFormat,
    StreamTransport, TransportBuffer, TransportEvent, TransportFactory, TransportState,
};
use crate::error::TransportError;
use crate::meta::{BITMAP_SIZE, CURSOR_SIZE, HEADER_META_SIZE, REGION_SIZE};
use crate::pool::{BufferDescriptor, BufferKind, DataTypes, SharedPool, SlotId};
use ::pipewire::context::Context;
use ::pipewire::core::{Core, Listener as CoreListener, PW_ID_CORE};
use ::pipewire::main_loop::MainLoop;
use ::pipewire::properties::properties;
use ::pipewire::spa::param::ParamType;
use ::pipewire::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use ::pipewire::spa::param::format_utils::parse_format;
use ::pipewire::spa::param::video::VideoInfoRaw;
use ::pipewire::spa::pod::deserialize::PodDeserializer;
use ::pipewire::spa::pod::{Pod, PodPropFlags};
use ::pipewire::spa::sys::{
    SPA_CHUNK_FLAG_CORRUPTED, SPA_CHUNK_FLAG_NONE, SPA_DATA_DmaBuf, SPA_DATA_FLAG_READWRITE,
    SPA_DATA_Invalid, SPA_DATA_MemFd, SPA_META_Cursor, SPA_META_Header, SPA_META_VideoDamage,
    spa_buffer, spa_data, spa_meta_bitmap, spa_meta_cursor, spa_meta_header, spa_meta_region,
};
use ::pipewire::spa::utils::{Choice, ChoiceEnum, Direction, Id};
use ::pipewire::stream::{Stream, StreamFlags, StreamListener, StreamState};
use ::pipewire::sys::pw_buffer;
use smithay::backend::allocator::Modifier;
use smithay::reexports::calloop::generic::Generic;
use smithay::reexports::calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use std::cell::Cell;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr::NonNull;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const _: () = assert!(std::mem::size_of::<spa_meta_header>() == HEADER_META_SIZE);
const _: () = assert!(std::mem::size_of::<spa_meta_region>() == REGION_SIZE);
const _: () = assert!(std::mem::size_of::<spa_meta_cursor>() == CURSOR_SIZE);
const _: () = assert!(std::mem::size_of::<spa_meta_bitmap>() == BITMAP_SIZE);

/// Connection errors on the core object.
const EPIPE: i32 = -32;

struct CoreInner {
    core: Core,
    _listener: CoreListener,
    _context: Context,
}

/// Connection to the PipeWire daemon, driven from the compositor's event loop.
pub struct PipeWireCore<D: 'static> {
    inner: Option<CoreInner>,
    failed: Rc<Cell<bool>>,
    handle: LoopHandle<'static, D>,
    token: RegistrationToken,
}

impl<D: 'static> PipeWireCore<D> {
    /// Connects to PipeWire and hooks its loop into `handle`. `after_iterate`
    /// runs after each PipeWire loop iteration, which is where stream events
    /// should be dispatched.
    pub fn new(
        handle: &LoopHandle<'static, D>,
        mut after_iterate: impl FnMut(&mut D) + 'static,
    ) -> Result<Self, TransportError> {
        ::pipewire::init();

        let main_loop = MainLoop::new(None)
            .map_err(|err| TransportError::Bootstrap(format!("error creating MainLoop: {err}")))?;
        let context = Context::new(&main_loop)
            .map_err(|err| TransportError::Bootstrap(format!("error creating Context: {err}")))?;
        let core = context
            .connect(None)
            .map_err(|err| TransportError::Bootstrap(format!("error connecting Core: {err}")))?;

        let failed = Rc::new(Cell::new(false));
        let listener = core
            .add_listener_local()
            .error({
                let failed = failed.clone();
                move |id, seq, res, message| {
                    warn!(id, seq, res, message, "PipeWire error");
                    if id == PW_ID_CORE && res == EPIPE {
                        failed.set(true);
                    }
                }
            })
            .register();

        struct AsFdWrapper(MainLoop);
        impl AsFd for AsFdWrapper {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.0.loop_().fd()
            }
        }

        let token = handle
            .insert_source(
                Generic::new(AsFdWrapper(main_loop), Interest::READ, Mode::Level),
                move |_, wrapper, state| {
                    wrapper.0.loop_().iterate(Duration::ZERO);
                    after_iterate(state);
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| TransportError::Bootstrap(err.error.to_string()))?;

        Ok(PipeWireCore {
            inner: Some(CoreInner {
                core,
                _listener: listener,
                _context: context,
            }),
            failed,
            handle: handle.clone(),
            token,
        })
    }
}

impl<D: 'static> Drop for PipeWireCore<D> {
    fn drop(&mut self) {
        self.inner.take();
        self.handle.remove(self.token);
    }
}

impl<D: 'static> TransportFactory for PipeWireCore<D> {
    type Transport = PipeWireTransport;

    fn create(
        &self,
        name: &str,
        pool: SharedPool,
        events: EventQueue,
    ) -> Result<PipeWireTransport, TransportError> {
        if let Some(err) = self.failure() {
            return Err(err);
        }
        match &self.inner {
            Some(inner) => PipeWireTransport::new(&inner.core, name, pool, events),
            None => Err(TransportError::Bootstrap("PipeWire core is gone".into())),
        }
    }

    fn failure(&self) -> Option<TransportError> {
        self.failed
            .get()
            .then(|| TransportError::Bootstrap("PipeWire connection lost".into()))
    }
}

fn transport_state(state: &StreamState) -> TransportState {
    match state {
        StreamState::Unconnected => TransportState::Unconnected,
        StreamState::Connecting => TransportState::Connecting,
        StreamState::Paused => TransportState::Paused,
        StreamState::Streaming => TransportState::Streaming,
        StreamState::Error(msg) => TransportState::Error(msg.clone()),
    }
}

fn parse_negotiated(pod: &Pod) -> Result<NegotiatedFormat, String> {
    let (media_type, media_subtype) = parse_format(pod).map_err(|err| format!("{err:?}"))?;
    if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
        return Err("not raw video".into());
    }

    let mut info = VideoInfoRaw::new();
    info.parse(pod).map_err(|err| format!("{err:?}"))?;

    let format = params::pixel_format(info.format())
        .ok_or_else(|| format!("unsupported video format {:?}", info.format()))?;
    let max_framerate = info.max_framerate();

    let modifier_prop = pod
        .as_object()
        .ok()
        .and_then(|object| object.find_prop(Id(FormatProperties::VideoModifier.as_raw())));
    let modifier = match modifier_prop {
        Some(prop) if prop.flags().contains(PodPropFlags::DONT_FIXATE) => {
            let (_, choice) = PodDeserializer::deserialize_from::<Choice<i64>>(prop.value().as_bytes())
                .map_err(|_| "wrong modifier property type".to_string())?;
            let ChoiceEnum::Enum { alternatives, .. } = choice.1 else {
                return Err("wrong modifier choice type".into());
            };
            Some(ModifierProposal {
                modifiers: alternatives
                    .into_iter()
                    .map(|m| Modifier::from(m as u64))
                    .collect(),
                dont_fixate: true,
            })
        }
        Some(_) => Some(ModifierProposal {
            modifiers: vec![Modifier::from(info.modifier())],
            dont_fixate: false,
        }),
        None => None,
    };

    Ok(NegotiatedFormat {
        format,
        size: (info.size().width as i32, info.size().height as i32).into(),
        modifier,
        max_framerate: (max_framerate.num, max_framerate.denom),
    })
}

unsafe fn spa_datas<'a>(buffer: *mut pw_buffer) -> Option<&'a mut [spa_data]> {
    unsafe {
        let spa_buffer = (*buffer).buffer;
        if spa_buffer.is_null() || (*spa_buffer).n_datas == 0 || (*spa_buffer).datas.is_null() {
            return None;
        }
        Some(std::slice::from_raw_parts_mut(
            (*spa_buffer).datas,
            (*spa_buffer).n_datas as usize,
        ))
    }
}

unsafe fn add_buffer(pool: &SharedPool, events: &EventQueue, buffer: *mut pw_buffer) {
    let slot = buffer as usize as SlotId;
    let Some(datas) = (unsafe { spa_datas(buffer) }) else {
        warn!(slot, "PipeWire buffer without data blocks");
        return;
    };

    let allowed = DataTypes {
        dmabuf: datas[0].type_ & (1 << SPA_DATA_DmaBuf) != 0,
        memfd: datas[0].type_ & (1 << SPA_DATA_MemFd) != 0,
    };
    let descriptor = pool.borrow_mut().add_buffer(slot, allowed);

    match descriptor {
        BufferDescriptor::DmaBuf { planes, max_size } => {
            if planes.len() != datas.len() {
                warn!(slot, planes = planes.len(), blocks = datas.len(), "Plane count mismatch");
            }
            for (data, plane) in datas.iter_mut().zip(planes) {
                data.type_ = SPA_DATA_DmaBuf;
                data.flags = SPA_DATA_FLAG_READWRITE;
                data.fd = plane.fd as i64;
                data.mapoffset = 0;
                data.maxsize = max_size as u32;
                data.data = std::ptr::null_mut();
            }
            trace!(slot, "Added dma-buf buffer");
        }
        BufferDescriptor::MemFd { fd, data, max_size, .. } => {
            let block = &mut datas[0];
            block.type_ = SPA_DATA_MemFd;
            block.flags = SPA_DATA_FLAG_READWRITE;
            block.fd = fd as i64;
            block.mapoffset = 0;
            block.maxsize = max_size as u32;
            block.data = data.cast();
            trace!(slot, max_size, "Added memfd buffer");
        }
        BufferDescriptor::Degraded => {
            let block = &mut datas[0];
            block.type_ = SPA_DATA_Invalid;
            block.fd = -1;
            block.maxsize = 0;
            block.data = std::ptr::null_mut();
        }
    }

    events.borrow_mut().push_back(TransportEvent::BufferAdded(slot));
}

/// A `pw_stream` in output direction that drives its own graph.
pub struct PipeWireTransport {
    stream: Stream,
    _listener: StreamListener<()>,
}

impl PipeWireTransport {
    pub fn new(
        core: &Core,
        name: &str,
        pool: SharedPool,
        events: EventQueue,
    ) -> Result<Self, TransportError> {
        let props = properties! {
            *::pipewire::keys::MEDIA_CLASS => "Video/Source",
            *::pipewire::keys::MEDIA_ROLE => "Screen",
        };
        let stream = Stream::new(core, name, props)
            .map_err(|err| TransportError::Connect(format!("error creating Stream: {err}")))?;

        let listener = stream
            .add_local_listener_with_user_data(())
            .state_changed({
                let events = events.clone();
                move |_, (), old, new| {
                    debug!(?old, ?new, "PipeWire stream state changed");
                    events
                        .borrow_mut()
                        .push_back(TransportEvent::StateChanged(transport_state(&new)));
                }
            })
            .param_changed({
                let events = events.clone();
                move |_, (), id, pod| {
                    if ParamType::from_raw(id) != ParamType::Format {
                        return;
                    }
                    let Some(pod) = pod else { return };
                    match parse_negotiated(pod) {
                        Ok(format) => {
                            debug!(?format, "PipeWire stream format negotiated");
                            events
                                .borrow_mut()
                                .push_back(TransportEvent::FormatChanged(format));
                        }
                        Err(err) => warn!(err, "Ignoring PipeWire format"),
                    }
                }
            })
            .add_buffer({
                let pool = pool.clone();
                let events = events.clone();
                move |_, (), buffer| unsafe { add_buffer(&pool, &events, buffer) }
            })
            .remove_buffer({
                let pool = pool.clone();
                let events = events.clone();
                move |_, (), buffer| {
                    let slot = buffer as usize as SlotId;
                    pool.borrow_mut().remove_buffer(slot);
                    trace!(slot, "Removed buffer");
                    events
                        .borrow_mut()
                        .push_back(TransportEvent::BufferRemoved(slot));
                }
            })
            .register()
            .map_err(|err| TransportError::Connect(format!("error registering listener: {err}")))?;

        Ok(PipeWireTransport {
            stream,
            _listener: listener,
        })
    }
}

impl StreamTransport for PipeWireTransport {
    type Buffer = PipeWireBuffer;

    fn connect(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError> {
        let bytes = serialize_all(formats.iter().map(format_object).collect())?;
        let mut pods = as_pods(&bytes)?;
        self.stream
            .connect(
                Direction::Output,
                None,
                StreamFlags::DRIVER | StreamFlags::ALLOC_BUFFERS,
                &mut pods,
            )
            .map_err(|err| TransportError::Connect(err.to_string()))
    }

    fn update_formats(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError> {
        let bytes = serialize_all(formats.iter().map(format_object).collect())?;
        let mut pods = as_pods(&bytes)?;
        self.stream
            .update_params(&mut pods)
            .map_err(|err| TransportError::Params(err.to_string()))
    }

    fn update_buffers(&mut self, offer: &BufferOffer) -> Result<(), TransportError> {
        let bytes = serialize_all(buffer_objects(offer))?;
        let mut pods = as_pods(&bytes)?;
        self.stream
            .update_params(&mut pods)
            .map_err(|err| TransportError::Params(err.to_string()))
    }

    fn state(&self) -> TransportState {
        transport_state(&self.stream.state())
    }

    fn node_id(&self) -> u32 {
        self.stream.node_id()
    }

    fn dequeue(&mut self) -> Option<PipeWireBuffer> {
        let raw = unsafe { self.stream.dequeue_raw_buffer() };
        NonNull::new(raw).map(|raw| PipeWireBuffer { raw })
    }

    fn queue(&mut self, buffer: PipeWireBuffer) {
        unsafe {
            self.stream.queue_raw_buffer(buffer.raw.as_ptr());
        }
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.stream.disconnect() {
            warn!(?err, "Failed to disconnect PipeWire stream");
        }
    }
}

/// A dequeued `pw_buffer`. Must go back through [`StreamTransport::queue`].
#[derive(Debug)]
pub struct PipeWireBuffer {
    raw: NonNull<pw_buffer>,
}

impl PipeWireBuffer {
    fn spa(&self) -> Option<&mut spa_buffer> {
        unsafe { (*self.raw.as_ptr()).buffer.as_mut() }
    }

    fn datas(&mut self) -> &mut [spa_data] {
        unsafe { spa_datas(self.raw.as_ptr()) }.unwrap_or_default()
    }
}

impl TransportBuffer for PipeWireBuffer {
    fn slot(&self) -> SlotId {
        self.raw.as_ptr() as usize as SlotId
    }

    fn data_kind(&self) -> Option<BufferKind> {
        let datas = unsafe { spa_datas(self.raw.as_ptr()) }?;
        match datas[0].type_ {
            SPA_DATA_DmaBuf => Some(BufferKind::DmaBuf),
            SPA_DATA_MemFd => Some(BufferKind::MemFd),
            _ => None,
        }
    }

    fn has_data(&self) -> bool {
        unsafe { spa_datas(self.raw.as_ptr()) }.is_some_and(|datas| !datas[0].data.is_null())
    }

    fn plane_count(&self) -> usize {
        self.spa().map_or(0, |spa| spa.n_datas as usize)
    }

    fn set_chunk(&mut self, plane: usize, chunk: ChunkInfo) {
        let Some(data) = self.datas().get_mut(plane) else {
            return;
        };
        let Some(spa_chunk) = (unsafe { data.chunk.as_mut() }) else {
            return;
        };
        spa_chunk.offset = chunk.offset;
        spa_chunk.size = chunk.size;
        spa_chunk.stride = chunk.stride;
        spa_chunk.flags = if chunk.corrupted {
            SPA_CHUNK_FLAG_CORRUPTED as i32
        } else {
            SPA_CHUNK_FLAG_NONE as i32
        };
    }

    fn meta_mut(&mut self, kind: MetaKind) -> Option<&mut [u8]> {
        let wanted = match kind {
            MetaKind::Header => SPA_META_Header,
            MetaKind::Cursor => SPA_META_Cursor,
            MetaKind::Damage => SPA_META_VideoDamage,
        };
        let spa = self.spa()?;
        if spa.metas.is_null() {
            return None;
        }
        let metas = unsafe { std::slice::from_raw_parts(spa.metas, spa.n_metas as usize) };
        metas
            .iter()
            .find(|meta| meta.type_ == wanted && !meta.data.is_null())
            .map(|meta| unsafe {
                std::slice::from_raw_parts_mut(meta.data.cast::<u8>(), meta.size as usize)
            })
    }
}
