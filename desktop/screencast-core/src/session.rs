//! Lifecycle of one stream: negotiation with the consumer, buffer
//! parameters, and dispatching source frames into buffers.

use crate::backend::CaptureBackend;
use crate::capture::{CaptureRequest, FrameBase, FrameCapturer, StreamFormat};
use crate::config::{CursorMode, CursorSettings, StreamConfig};
use crate::cursor::{PointerState, viewport_contains};
use crate::error::{CaptureDrop, CaptureOutcome, ScreencastError};
use crate::fence::{FenceGate, Reactor};
use crate::format::PixelFormat;
use crate::meta::cursor_meta_size;
use crate::pool::{BufferPool, BufferShape, DataTypes, DmabufShape, DmabufSource, SharedPool};
use crate::source::{CastTarget, ScreenCastSource};
use crate::transport::{
    BufferOffer, ChunkInfo, EventQueue, FormatOffer, NegotiatedFormat, StreamTransport,
    TransportBuffer, TransportError, TransportEvent, TransportFactory, TransportState,
};
use smithay::backend::allocator::Modifier;
use smithay::reexports::calloop::RegistrationToken;
use smithay::utils::{Clock, Logical, Monotonic, Physical, Rectangle, Size};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Damage rects kept while frames are held back, before collapsing them
/// into a full-frame repaint.
const MAX_PENDING_DAMAGE: usize = 64;

/// Notifications for whoever requested the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The consumer can connect to this node. Sent once.
    Ready(u32),
    Started,
    Paused,
    /// The stream ended for any reason other than [`StreamSession::stop`].
    Stopped,
}

fn revoke_buffer<T: StreamTransport>(transport: &RefCell<T>, mut buffer: T::Buffer) {
    for plane in 0..buffer.plane_count().max(1) {
        buffer.set_chunk(plane, ChunkInfo::corrupted());
    }
    transport.borrow_mut().queue(buffer);
}

pub struct StreamSession<Tex: Clone + 'static, T: StreamTransport + 'static> {
    name: String,
    config: StreamConfig,
    source: Rc<dyn ScreenCastSource<Tex>>,
    reactor: Rc<dyn Reactor>,
    has_alpha: bool,
    resolution: Size<i32, Physical>,
    dmabuf_capable: bool,
    negotiated: Option<NegotiatedFormat>,
    /// Result of the last modifier test allocation.
    dmabuf_shape: Option<DmabufShape>,
    last_buffer_offer: Option<BufferOffer>,
    state: TransportState,
    node_id: Option<u32>,
    transport: Option<Rc<RefCell<T>>>,
    /// Buffer waiting for its render fence.
    held: Rc<RefCell<Option<T::Buffer>>>,
    pool: SharedPool,
    transport_events: EventQueue,
    events: VecDeque<SessionEvent>,
    capturer: FrameCapturer<Tex>,
    fence: FenceGate,
    throttle: Rc<Cell<Option<RegistrationToken>>>,
    pending_damage: Vec<Rectangle<i32, Physical>>,
    wait_for_new_buffers: bool,
    sequence: u64,
    clock: Clock<Monotonic>,
    last_frame_at: Option<Duration>,
    stopped: bool,
    terminated: bool,
    error: Option<String>,
}

impl<Tex: Clone + 'static, T: StreamTransport + 'static> StreamSession<Tex, T> {
    pub fn new(
        name: impl Into<String>,
        source: Rc<dyn ScreenCastSource<Tex>>,
        reactor: Rc<dyn Reactor>,
        dmabuf: Option<Rc<dyn DmabufSource>>,
        config: StreamConfig,
        cursor: CursorSettings,
    ) -> Self {
        let bitmap_edge = config.cursor_bitmap_edge(cursor.scale);
        StreamSession {
            name: name.into(),
            has_alpha: source.has_alpha(),
            resolution: source.size(),
            source,
            fence: FenceGate::new(reactor.clone()),
            reactor,
            dmabuf_capable: false,
            negotiated: None,
            dmabuf_shape: None,
            last_buffer_offer: None,
            state: TransportState::Unconnected,
            node_id: None,
            transport: None,
            held: Rc::new(RefCell::new(None)),
            pool: BufferPool::shared(dmabuf),
            transport_events: Rc::new(RefCell::new(VecDeque::new())),
            events: VecDeque::new(),
            capturer: FrameCapturer::new(cursor, bitmap_edge),
            throttle: Rc::new(Cell::new(None)),
            pending_damage: Vec::new(),
            wait_for_new_buffers: false,
            sequence: 0,
            clock: Clock::new(),
            last_frame_at: None,
            stopped: false,
            terminated: false,
            error: None,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> CastTarget {
        self.source.target()
    }

    /// The latest frame of the streamed source.
    pub fn source_texture(&self) -> Option<Tex> {
        self.source.frame_texture()
    }

    pub fn state(&self) -> &TransportState {
        &self.state
    }

    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    pub fn resolution(&self) -> Size<i32, Physical> {
        self.resolution
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    pub fn negotiated_format(&self) -> Option<&NegotiatedFormat> {
        self.negotiated.as_ref()
    }

    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }

    /// Last error that ended or prevented the stream.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_fence_pending(&self) -> bool {
        self.held.borrow().is_some()
    }

    pub fn cursor_settings(&self) -> CursorSettings {
        self.capturer.cursor().settings()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Creates the transport and offers formats to the consumer.
    pub fn start<F>(&mut self, factory: &F) -> Result<(), ScreencastError>
    where
        F: TransportFactory<Transport = T>,
    {
        let result = self.connect(factory);
        if let Err(err) = &result {
            error!(name = self.name, ?err, "Failed to start stream");
            self.error = Some(err.to_string());
        }
        result
    }

    fn connect<F>(&mut self, factory: &F) -> Result<(), ScreencastError>
    where
        F: TransportFactory<Transport = T>,
    {
        if self.stopped || self.transport.is_some() {
            return Err(ScreencastError::StreamCreation(
                "stream was already started".into(),
            ));
        }

        self.resolution = self.source.size();
        if self.resolution.w <= 0 || self.resolution.h <= 0 {
            return Err(ScreencastError::StreamCreation(format!(
                "{} has no size",
                self.source.target()
            )));
        }
        self.dmabuf_capable = self.probe_dmabuf();

        let mut transport = factory.create(
            &self.name,
            self.pool.clone(),
            self.transport_events.clone(),
        )?;
        transport.connect(&self.format_offers(None))?;

        self.transport = Some(Rc::new(RefCell::new(transport)));
        self.state = TransportState::Connecting;
        info!(
            name = self.name,
            size = ?self.resolution,
            has_alpha = self.has_alpha,
            dmabuf = self.dmabuf_capable,
            "Stream connecting"
        );
        Ok(())
    }

    /// Local teardown. Does not report [`SessionEvent::Stopped`].
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        debug!(name = self.name, "Stopping stream");

        self.cancel_throttle();
        self.revoke_pending();
        if let Some(transport) = self.transport.take() {
            transport.borrow_mut().disconnect();
        }
        self.pool.borrow_mut().clear();
        self.transport_events.borrow_mut().clear();
        self.state = TransportState::Unconnected;
    }

    /// The window or output behind the stream is gone.
    pub fn source_closed(&mut self) {
        warn!(name = self.name, target = %self.source.target(), "Streamed source disappeared");
        self.error = Some(ScreencastError::SourceDisappeared.to_string());
        self.terminate();
    }

    /// The connection carrying the stream broke.
    pub fn transport_failed(&mut self, err: TransportError) {
        if self.stopped || self.terminated {
            return;
        }
        error!(name = self.name, %err, "Screencast transport failed");
        self.error = Some(ScreencastError::from(err).to_string());
        self.terminate();
    }

    /// Handles everything the consumer did since the last call.
    pub fn dispatch_transport(&mut self) {
        loop {
            let event = self.transport_events.borrow_mut().pop_front();
            let Some(event) = event else {
                break;
            };
            if self.stopped {
                continue;
            }

            match event {
                TransportEvent::StateChanged(state) => self.on_state_changed(state),
                TransportEvent::FormatChanged(format) => {
                    if let Err(err) = self.on_format_changed(format) {
                        error!(name = self.name, ?err, "Format negotiation failed");
                        self.error = Some(err.to_string());
                        self.terminate();
                    }
                }
                TransportEvent::BufferAdded(slot) => {
                    trace!(name = self.name, slot, "Consumer added buffer");
                    if self.wait_for_new_buffers {
                        self.wait_for_new_buffers = false;
                        self.source.request_repaint();
                    }
                }
                TransportEvent::BufferRemoved(slot) => {
                    trace!(name = self.name, slot, "Consumer removed buffer");
                }
            }
        }
    }

    fn on_state_changed(&mut self, state: TransportState) {
        let old = std::mem::replace(&mut self.state, state.clone());
        if old == state {
            return;
        }
        debug!(name = self.name, ?old, new = ?state, "Stream state changed");

        if self.is_fence_pending() {
            self.revoke_pending();
        }

        match state {
            TransportState::Paused => {
                if self.node_id.is_none() {
                    if let Some(transport) = &self.transport {
                        let node_id = transport.borrow().node_id();
                        self.node_id = Some(node_id);
                        info!(name = self.name, node_id, "Stream ready");
                        self.events.push_back(SessionEvent::Ready(node_id));
                    }
                }
                if old == TransportState::Streaming {
                    self.cancel_throttle();
                    self.events.push_back(SessionEvent::Paused);
                }
            }
            TransportState::Streaming => {
                self.events.push_back(SessionEvent::Started);
                self.source.request_repaint();
            }
            TransportState::Error(msg) => {
                error!(name = self.name, msg, "Stream error");
                self.error = Some(msg);
                self.terminate();
            }
            TransportState::Unconnected => self.terminate(),
            TransportState::Connecting => {}
        }
    }

    fn on_format_changed(&mut self, format: NegotiatedFormat) -> Result<(), ScreencastError> {
        debug!(name = self.name, ?format, "Consumer picked a format");
        self.negotiated = Some(format.clone());

        let fourcc = format.format.fourcc();
        let source = self.pool.borrow().dmabuf_source().cloned();
        let dmabuf = match (format.modifier.as_ref(), fourcc, source) {
            (Some(proposal), Some(fourcc), Some(source)) if proposal.dont_fixate => {
                let offers = match source.test_allocation(format.size, fourcc, &proposal.modifiers) {
                    Ok((modifier, plane_count)) => {
                        debug!(name = self.name, ?modifier, plane_count, "Fixating modifier");
                        self.dmabuf_shape = Some(DmabufShape {
                            fourcc,
                            modifier,
                            plane_count,
                        });
                        self.format_offers(Some((format.format, modifier)))
                    }
                    Err(err) => {
                        warn!(
                            name = self.name,
                            ?err,
                            "No proposed modifier can be allocated, falling back to shared memory"
                        );
                        self.dmabuf_capable = false;
                        self.dmabuf_shape = None;
                        self.format_offers(None)
                    }
                };
                return self.update_formats(&offers);
            }
            (Some(proposal), Some(fourcc), Some(_)) => {
                let modifier = proposal
                    .modifiers
                    .first()
                    .copied()
                    .unwrap_or(Modifier::Invalid);
                let plane_count = self
                    .dmabuf_shape
                    .filter(|shape| shape.fourcc == fourcc && shape.modifier == modifier)
                    .map_or(1, |shape| shape.plane_count);
                Some(DmabufShape {
                    fourcc,
                    modifier,
                    plane_count,
                })
            }
            _ => None,
        };

        self.pool.borrow_mut().set_shape(BufferShape {
            size: format.size,
            format: format.format,
            dmabuf,
        });
        self.announce_buffers()
    }

    fn probe_dmabuf(&self) -> bool {
        if !self.config.allow_dmabuf {
            return false;
        }
        let Some(source) = self.pool.borrow().dmabuf_source().cloned() else {
            return false;
        };
        let Some(fourcc) = PixelFormat::Bgra.fourcc() else {
            return false;
        };
        let modifiers = source.modifiers(fourcc);
        if modifiers.is_empty() {
            return false;
        }
        match source.test_allocation(self.resolution, fourcc, &modifiers) {
            Ok(_) => true,
            Err(err) => {
                debug!(name = self.name, ?err, "Test dma-buf allocation failed");
                false
            }
        }
    }

    fn format_offers(&self, fixated: Option<(PixelFormat, Modifier)>) -> Vec<FormatOffer> {
        let offer = |formats: Vec<PixelFormat>, modifiers: Vec<Modifier>, fixate: bool| FormatOffer {
            formats,
            size: self.resolution,
            modifiers,
            fixate,
            min_framerate: self.config.min_framerate,
            max_framerate: self.config.max_framerate,
        };

        let formats = PixelFormat::offered(self.has_alpha, self.dmabuf_capable);
        let mut offers = Vec::new();
        if let Some((format, modifier)) = fixated {
            offers.push(offer(vec![format], vec![modifier], true));
        }
        if self.dmabuf_capable {
            if let Some(source) = self.pool.borrow().dmabuf_source() {
                for format in &formats {
                    let Some(fourcc) = format.fourcc() else {
                        continue;
                    };
                    let modifiers = source.modifiers(fourcc);
                    if !modifiers.is_empty() {
                        offers.push(offer(vec![*format], modifiers, false));
                    }
                }
            }
        }
        offers.push(offer(formats, Vec::new(), false));
        offers
    }

    fn buffer_offer(&self, shape: &BufferShape) -> BufferOffer {
        let (data_types, blocks) = match shape.dmabuf {
            Some(dmabuf) => (DataTypes::dmabuf_only(), dmabuf.plane_count.max(1) as u32),
            None => (DataTypes::memfd_only(), 1),
        };
        let edge = self
            .config
            .cursor_bitmap_edge(self.capturer.cursor().settings().scale);
        BufferOffer {
            buffers: self.config.buffers,
            blocks,
            size: shape.max_size(),
            stride: shape.stride(),
            align: self.config.align,
            data_types,
            cursor_meta_size: cursor_meta_size(edge, edge),
            damage_regions: self.config.damage_regions,
        }
    }

    fn update_formats(&self, offers: &[FormatOffer]) -> Result<(), ScreencastError> {
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        transport
            .borrow_mut()
            .update_formats(offers)
            .map_err(|err| ScreencastError::Negotiation(err.to_string()))
    }

    /// Sends buffer parameters for the current pool shape, unless the
    /// consumer already has exactly these.
    fn announce_buffers(&mut self) -> Result<(), ScreencastError> {
        let Some(shape) = self.pool.borrow().shape() else {
            return Ok(());
        };
        let offer = self.buffer_offer(&shape);
        if self.last_buffer_offer.as_ref() == Some(&offer) {
            trace!(name = self.name, "Buffer parameters unchanged");
            return Ok(());
        }
        let Some(transport) = &self.transport else {
            return Ok(());
        };
        transport
            .borrow_mut()
            .update_buffers(&offer)
            .map_err(|err| ScreencastError::Negotiation(err.to_string()))?;
        debug!(
            name = self.name,
            size = offer.size,
            stride = offer.stride,
            data_types = ?offer.data_types,
            "Announced buffer parameters"
        );
        self.last_buffer_offer = Some(offer);
        Ok(())
    }

    fn resize(&mut self, size: Size<i32, Physical>) {
        info!(name = self.name, old = ?self.resolution, new = ?size, "Source resized, renegotiating");
        self.resolution = size;
        self.wait_for_new_buffers = true;
        self.capturer.reset_base_frame();
        self.pending_damage = vec![Rectangle::from_size(size)];

        let shape = self.pool.borrow().shape();
        if let Some(shape) = shape {
            self.pool.borrow_mut().set_shape(BufferShape { size, ..shape });
            if let Err(err) = self.announce_buffers() {
                warn!(name = self.name, ?err, "Failed to announce buffers after resize");
            }
        }
        if let Err(err) = self.update_formats(&self.format_offers(None)) {
            warn!(name = self.name, ?err, "Failed to renegotiate size");
        }
    }

    /// Applies on the next capture.
    pub fn set_cursor_mode(&mut self, mode: CursorMode, scale: f64, viewport: Rectangle<i32, Logical>) {
        let settings = CursorSettings {
            mode,
            scale,
            viewport,
        };
        self.capturer
            .set_cursor_settings(settings, self.config.cursor_bitmap_edge(scale));
        if let Err(err) = self.announce_buffers() {
            warn!(name = self.name, ?err, "Failed to announce buffers for new cursor size");
        }
    }

    /// Frame-rendered hook of the compositor.
    pub fn push_frame<B>(
        &mut self,
        backend: &mut B,
        texture: &Tex,
        damage: &[Rectangle<i32, Physical>],
        pointer: &PointerState,
    ) -> CaptureOutcome
    where
        B: CaptureBackend<Texture = Tex>,
    {
        if self.stopped || self.transport.is_none() {
            return CaptureOutcome::Dropped(CaptureDrop::StreamNotActive);
        }
        if self.is_fence_pending() {
            warn!(name = self.name, "Compositor is too slow, dropping frame");
            self.add_pending_damage(damage);
            return CaptureOutcome::Dropped(CaptureDrop::CompositorTooSlow);
        }

        let size = backend.texture_size(texture);
        if size != self.resolution {
            self.resize(size);
            return CaptureOutcome::Dropped(CaptureDrop::Resized);
        }

        self.add_pending_damage(damage);
        if let Err(drop) = self.ensure_streaming() {
            return CaptureOutcome::Dropped(drop);
        }
        if let Some(delay) = self.throttle_delay() {
            self.arm_throttle(delay);
            return CaptureOutcome::Dropped(CaptureDrop::Throttled);
        }

        let damage = std::mem::take(&mut self.pending_damage);
        self.capture(backend, FrameBase::Frame(texture), damage, pointer)
    }

    /// Pointer moved or changed its image. Returns `None` when the cursor
    /// is not part of the stream.
    pub fn push_cursor<B>(&mut self, backend: &mut B, pointer: &PointerState) -> Option<CaptureOutcome>
    where
        B: CaptureBackend<Texture = Tex>,
    {
        match self.capturer.cursor().mode() {
            CursorMode::Hidden => None,
            CursorMode::Metadata => Some(self.push_cursor_metadata(pointer)),
            CursorMode::Embedded => Some(self.push_cursor_repaint(backend, pointer)),
        }
    }

    fn push_cursor_repaint<B>(&mut self, backend: &mut B, pointer: &PointerState) -> CaptureOutcome
    where
        B: CaptureBackend<Texture = Tex>,
    {
        if !self.capturer.cursor_changed(pointer) {
            return CaptureOutcome::Dropped(CaptureDrop::CursorUnchanged);
        }
        if let Err(drop) = self.ensure_ready().and_then(|()| self.ensure_streaming()) {
            trace!(name = self.name, %drop, "Skipping cursor repaint");
            return CaptureOutcome::Dropped(drop);
        }
        // real damage wins: the cached frame would miss it
        if !self.pending_damage.is_empty() || !self.capturer.has_base_frame() {
            self.source.request_repaint();
            return CaptureOutcome::Dropped(CaptureDrop::NoBaseFrame);
        }
        if let Some(delay) = self.throttle_delay() {
            self.arm_throttle(delay);
            return CaptureOutcome::Dropped(CaptureDrop::Throttled);
        }

        self.capture(backend, FrameBase::CursorOnly, Vec::new(), pointer)
    }

    /// Queues a buffer carrying only cursor metadata.
    pub fn push_cursor_metadata(&mut self, pointer: &PointerState) -> CaptureOutcome {
        let settings = self.capturer.cursor().settings();
        if settings.mode != CursorMode::Metadata {
            return CaptureOutcome::Dropped(CaptureDrop::StreamNotActive);
        }
        if let Err(drop) = self.ensure_ready().and_then(|()| self.ensure_streaming()) {
            trace!(name = self.name, %drop, "Skipping cursor metadata");
            return CaptureOutcome::Dropped(drop);
        }
        let visible = pointer.image.is_some() && viewport_contains(settings.viewport, pointer.position);
        if !visible && !self.capturer.cursor().is_visible() {
            return CaptureOutcome::Dropped(CaptureDrop::CursorUnchanged);
        }

        let Some(transport) = self.transport.clone() else {
            return CaptureOutcome::Dropped(CaptureDrop::StreamNotActive);
        };
        let buffer = transport.borrow_mut().dequeue();
        let Some(mut buffer) = buffer else {
            trace!(name = self.name, "No buffer for cursor metadata");
            return CaptureOutcome::Dropped(CaptureDrop::NoBuffer);
        };

        self.sequence += 1;
        let pts = self.now();
        self.capturer
            .fill_cursor_metadata(&mut buffer, pointer, self.sequence, pts);
        transport.borrow_mut().queue(buffer);
        CaptureOutcome::Queued
    }

    fn ensure_ready(&self) -> Result<(), CaptureDrop> {
        if self.stopped || self.transport.is_none() {
            return Err(CaptureDrop::StreamNotActive);
        }
        if self.is_fence_pending() {
            return Err(CaptureDrop::CompositorTooSlow);
        }
        Ok(())
    }

    fn ensure_streaming(&self) -> Result<(), CaptureDrop> {
        if self.state != TransportState::Streaming {
            return Err(CaptureDrop::StreamNotActive);
        }
        if self.wait_for_new_buffers {
            return Err(CaptureDrop::WaitingForBuffers);
        }
        Ok(())
    }

    fn capture<B>(
        &mut self,
        backend: &mut B,
        base: FrameBase<'_, Tex>,
        damage: Vec<Rectangle<i32, Physical>>,
        pointer: &PointerState,
    ) -> CaptureOutcome
    where
        B: CaptureBackend<Texture = Tex>,
    {
        let format = self.negotiated.as_ref().map(|negotiated| negotiated.format);
        let (Some(transport), Some(format)) = (self.transport.clone(), format) else {
            self.add_pending_damage(&damage);
            return CaptureOutcome::Dropped(CaptureDrop::StreamNotActive);
        };
        let stream = StreamFormat {
            format,
            resolution: self.resolution,
        };

        let transport_state = transport.borrow().state();
        if transport_state != TransportState::Streaming {
            self.add_pending_damage(&damage);
            return CaptureOutcome::Dropped(CaptureDrop::StreamNotActive);
        }

        let buffer = transport.borrow_mut().dequeue();
        let Some(mut buffer) = buffer else {
            trace!(name = self.name, "No free buffer, consumer is saturated");
            self.add_pending_damage(&damage);
            return CaptureOutcome::Dropped(CaptureDrop::NoBuffer);
        };

        let pts = self.now();
        self.sequence += 1;
        let retained = damage.clone();
        let request = CaptureRequest {
            base,
            damage,
            sequence: self.sequence,
            pts,
        };

        match self
            .capturer
            .capture(backend, &self.pool, &mut buffer, stream, pointer, request)
        {
            Ok(fence) => {
                self.last_frame_at = Some(pts);
                self.submit(backend, &transport, buffer, fence)
            }
            Err(drop) => {
                match &drop {
                    CaptureDrop::InvalidBufferData(_) | CaptureDrop::Render(_) => {
                        warn!(name = self.name, slot = buffer.slot(), %drop, "Dropping frame")
                    }
                    _ => debug!(name = self.name, slot = buffer.slot(), %drop, "Dropping frame"),
                }
                revoke_buffer(&transport, buffer);
                self.add_pending_damage(&retained);
                CaptureOutcome::Dropped(drop)
            }
        }
    }

    fn submit<B>(
        &mut self,
        backend: &mut B,
        transport: &Rc<RefCell<T>>,
        buffer: T::Buffer,
        fence: Option<OwnedFd>,
    ) -> CaptureOutcome
    where
        B: CaptureBackend<Texture = Tex>,
    {
        let Some(fence) = fence else {
            transport.borrow_mut().queue(buffer);
            return CaptureOutcome::Queued;
        };

        *self.held.borrow_mut() = Some(buffer);
        let held = self.held.clone();
        let queue_to = transport.clone();
        let watched = self.fence.wait(fence, move || {
            let buffer = held.borrow_mut().take();
            if let Some(buffer) = buffer {
                queue_to.borrow_mut().queue(buffer);
            }
        });

        match watched {
            Ok(()) => CaptureOutcome::FencePending,
            Err(err) => {
                warn!(name = self.name, ?err, "Cannot watch render fence, waiting for the GPU instead");
                if let Err(err) = backend.make_current().and_then(|()| backend.finish()) {
                    warn!(name = self.name, ?err, "Failed to wait for the GPU");
                }
                let buffer = self.held.borrow_mut().take();
                if let Some(buffer) = buffer {
                    transport.borrow_mut().queue(buffer);
                }
                CaptureOutcome::Queued
            }
        }
    }

    /// Hands a buffer still waiting on its fence back to the consumer,
    /// flagged as carrying no frame.
    fn revoke_pending(&mut self) {
        self.fence.cancel();
        let buffer = self.held.borrow_mut().take();
        if let (Some(buffer), Some(transport)) = (buffer, self.transport.as_ref()) {
            debug!(name = self.name, slot = buffer.slot(), "Revoking buffer waiting on its fence");
            revoke_buffer(transport, buffer);
        }
    }

    fn terminate(&mut self) {
        if self.stopped || self.terminated {
            return;
        }
        self.terminated = true;
        self.cancel_throttle();
        self.revoke_pending();
        self.events.push_back(SessionEvent::Stopped);
    }

    fn add_pending_damage(&mut self, damage: &[Rectangle<i32, Physical>]) {
        self.pending_damage.extend_from_slice(damage);
        if self.pending_damage.len() > MAX_PENDING_DAMAGE {
            self.pending_damage = vec![Rectangle::from_size(self.resolution)];
        }
    }

    fn now(&self) -> Duration {
        self.clock.now().into()
    }

    fn throttle_delay(&self) -> Option<Duration> {
        let (num, denom) = self.negotiated.as_ref()?.max_framerate;
        let interval = StreamConfig::frame_interval(num, denom)?;
        let elapsed = self.now().saturating_sub(self.last_frame_at?);
        (elapsed < interval).then(|| interval - elapsed)
    }

    fn arm_throttle(&mut self, delay: Duration) {
        if self.throttle.get().is_some() {
            return;
        }
        trace!(name = self.name, ?delay, "Frame rate limit reached, delaying frame");
        let slot = self.throttle.clone();
        let source = self.source.clone();
        match self.reactor.schedule(
            delay,
            Box::new(move || {
                slot.set(None);
                source.request_repaint();
            }),
        ) {
            Ok(token) => self.throttle.set(Some(token)),
            Err(err) => warn!(name = self.name, ?err, "Failed to arm frame timer"),
        }
    }

    fn cancel_throttle(&mut self) {
        if let Some(token) = self.throttle.take() {
            self.reactor.cancel(token);
        }
    }
}

impl<Tex: Clone + 'static, T: StreamTransport + 'static> Drop for StreamSession<Tex, T> {
    fn drop(&mut self) {
        self.stop();
    }
}
