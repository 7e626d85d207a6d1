use crate::backend::{CaptureBackend, CursorQuad};
use crate::config::{CursorMode, CursorSettings, StreamConfig};
use crate::cursor::{CursorImage, PointerState};
use crate::error::{AllocatorError, TransportError};
use crate::fence::Reactor;
use crate::format::PixelFormat;
use crate::manager::{CastRegistry, ScreencastRequest};
use crate::meta::{self, CursorRecord, read};
use crate::pool::{BufferKind, DataTypes, DmabufSource, SharedPool, SlotId, StreamBuffer};
use crate::session::StreamSession;
use crate::source::{CastOutput, CastWindow, OutputSource, WindowSource};
use crate::transport::{
    BufferOffer, ChunkInfo, EventQueue, FormatOffer, MetaKind, ModifierProposal,
    NegotiatedFormat, StreamTransport, TransportBuffer, TransportEvent, TransportFactory,
    TransportState,
};
use crate::utils::tests::test_init;
use calloop::EventLoop;
use smithay::backend::allocator::dmabuf::{Dmabuf, DmabufFlags};
use smithay::backend::allocator::{Fourcc, Modifier};
use smithay::reexports::rustix::fs::{MemfdFlags, ftruncate, memfd_create};
use smithay::utils::{Logical, Physical, Point, Rectangle, Size};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type Rect = Rectangle<i32, Physical>;

pub fn rect(x: i32, y: i32, w: i32, h: i32) -> Rect {
    Rectangle::new((x, y).into(), (w, h).into())
}

static NEXT_TEXTURE: AtomicU64 = AtomicU64::new(1);

/// CPU texture: tightly packed straight RGBA.
#[derive(Debug, Clone)]
pub struct TestTexture {
    pub id: u64,
    pub size: Size<i32, Physical>,
    pub pixels: Rc<Vec<u8>>,
}

impl TestTexture {
    pub fn new(size: impl Into<Size<i32, Physical>>, texel: impl Fn(i32, i32) -> [u8; 4]) -> Self {
        let size = size.into();
        let mut pixels = Vec::with_capacity(size.w as usize * size.h as usize * 4);
        for y in 0..size.h {
            for x in 0..size.w {
                pixels.extend_from_slice(&texel(x, y));
            }
        }
        TestTexture {
            id: NEXT_TEXTURE.fetch_add(1, Ordering::Relaxed),
            size,
            pixels: Rc::new(pixels),
        }
    }

    pub fn solid(size: impl Into<Size<i32, Physical>>, rgba: [u8; 4]) -> Self {
        Self::new(size, |_, _| rgba)
    }

    fn texel(&self, x: i32, y: i32) -> [u8; 4] {
        let off = (y as usize * self.size.w as usize + x as usize) * 4;
        [
            self.pixels[off],
            self.pixels[off + 1],
            self.pixels[off + 2],
            self.pixels[off + 3],
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    MakeCurrent,
    Download { texture: u64 },
    RenderToDmabuf { texture: u64, cursor: Option<Rect> },
    Snapshot { from: u64, to: u64 },
    ImportCursor { serial: u64 },
    Finish,
}

#[derive(Debug, thiserror::Error)]
#[error("test backend failure: {0}")]
pub struct TestError(&'static str);

/// Renderer stand-in working on [`TestTexture`]s.
#[derive(Debug, Default)]
pub struct TestBackend {
    pub ops: Vec<Op>,
    /// Handed out by the next dma-buf renders, one each.
    pub fences: VecDeque<OwnedFd>,
    /// Number of upcoming downloads and dma-buf renders that fail.
    pub failing_draws: usize,
}

impl TestBackend {
    fn draw_fails(&mut self) -> bool {
        let fails = self.failing_draws > 0;
        self.failing_draws = self.failing_draws.saturating_sub(1);
        fails
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }

    pub fn last_render(&self) -> Option<&Op> {
        self.ops
            .iter()
            .rev()
            .find(|op| matches!(op, Op::RenderToDmabuf { .. }))
    }

    pub fn last_download(&self) -> Option<u64> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::Download { texture } => Some(*texture),
            _ => None,
        })
    }

    pub fn last_snapshot(&self) -> Option<u64> {
        self.ops.iter().rev().find_map(|op| match op {
            Op::Snapshot { to, .. } => Some(*to),
            _ => None,
        })
    }
}

impl CaptureBackend for TestBackend {
    type Texture = TestTexture;
    type Error = TestError;

    fn make_current(&mut self) -> Result<(), TestError> {
        self.ops.push(Op::MakeCurrent);
        Ok(())
    }

    fn texture_size(&self, texture: &TestTexture) -> Size<i32, Physical> {
        texture.size
    }

    fn download(
        &mut self,
        texture: &TestTexture,
        format: PixelFormat,
        dst: &mut [u8],
        stride: usize,
    ) -> Result<(), TestError> {
        if self.draw_fails() {
            return Err(TestError("download failed"));
        }
        let bpp = format.bytes_per_pixel();
        if dst.len() < stride * texture.size.h as usize {
            return Err(TestError("destination too small"));
        }
        for y in 0..texture.size.h {
            let row = &mut dst[y as usize * stride..];
            for x in 0..texture.size.w {
                let [r, g, b, a] = texture.texel(x, y);
                let px = &mut row[x as usize * bpp..x as usize * bpp + bpp];
                px[0] = b;
                px[1] = g;
                px[2] = r;
                match format {
                    PixelFormat::Bgra => px[3] = a,
                    PixelFormat::Bgrx => px[3] = 0xff,
                    PixelFormat::Bgr => {}
                }
            }
        }
        self.ops.push(Op::Download {
            texture: texture.id,
        });
        Ok(())
    }

    fn render_to_dmabuf(
        &mut self,
        texture: &TestTexture,
        _dmabuf: &mut Dmabuf,
        cursor: Option<CursorQuad<'_, TestTexture>>,
    ) -> Result<Option<OwnedFd>, TestError> {
        if self.draw_fails() {
            return Err(TestError("render failed"));
        }
        self.ops.push(Op::RenderToDmabuf {
            texture: texture.id,
            cursor: cursor.map(|quad| quad.rect),
        });
        Ok(self.fences.pop_front())
    }

    fn snapshot(&mut self, texture: &TestTexture) -> Result<TestTexture, TestError> {
        let copy = TestTexture {
            id: NEXT_TEXTURE.fetch_add(1, Ordering::Relaxed),
            size: texture.size,
            pixels: Rc::new(texture.pixels.as_ref().clone()),
        };
        self.ops.push(Op::Snapshot {
            from: texture.id,
            to: copy.id,
        });
        Ok(copy)
    }

    fn import_cursor(&mut self, image: &CursorImage) -> Result<TestTexture, TestError> {
        self.ops.push(Op::ImportCursor {
            serial: image.serial(),
        });
        let size = image.size();
        Ok(TestTexture {
            id: NEXT_TEXTURE.fetch_add(1, Ordering::Relaxed),
            size: (size.w, size.h).into(),
            pixels: Rc::new(image.pixels().to_vec()),
        })
    }

    fn finish(&mut self) -> Result<(), TestError> {
        self.ops.push(Op::Finish);
        Ok(())
    }
}

/// A fence fd and the end that signals it.
pub fn fence_pair() -> (UnixStream, OwnedFd) {
    let (signal, fence) = UnixStream::pair().unwrap();
    (signal, OwnedFd::from(fence))
}

/// Dma-buf source backed by memfds, with a linear layout.
pub struct MemfdDmabufSource {
    pub modifiers: Vec<Modifier>,
    /// Modifiers a test allocation accepts. Everything else fails.
    pub allocatable: Vec<Modifier>,
    pub allocations: Cell<usize>,
}

impl MemfdDmabufSource {
    pub fn linear() -> Self {
        MemfdDmabufSource {
            modifiers: vec![Modifier::Linear],
            allocatable: vec![Modifier::Linear],
            allocations: Cell::new(0),
        }
    }
}

impl DmabufSource for MemfdDmabufSource {
    fn modifiers(&self, _fourcc: Fourcc) -> Vec<Modifier> {
        self.modifiers.clone()
    }

    fn test_allocation(
        &self,
        _size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<(Modifier, usize), AllocatorError> {
        modifiers
            .iter()
            .find(|modifier| self.allocatable.contains(modifier))
            .map(|modifier| (*modifier, 1))
            .ok_or(AllocatorError::NoModifier(fourcc))
    }

    fn allocate(
        &self,
        size: Size<i32, Physical>,
        fourcc: Fourcc,
        modifier: Modifier,
    ) -> Result<Dmabuf, AllocatorError> {
        let stride = size.w as u32 * 4;
        let fd = memfd_create("test-dmabuf", MemfdFlags::CLOEXEC)
            .map_err(|err| AllocatorError::Failed(err.to_string()))?;
        ftruncate(&fd, u64::from(stride) * size.h as u64)
            .map_err(|err| AllocatorError::Failed(err.to_string()))?;

        let mut builder = Dmabuf::builder((size.w, size.h), fourcc, modifier, DmabufFlags::empty());
        builder.add_plane(fd, 0, 0, stride);
        self.allocations.set(self.allocations.get() + 1);
        builder
            .build()
            .ok_or(AllocatorError::Failed("dma-buf builder rejected plane".into()))
    }
}

/// A buffer as the consumer received it.
#[derive(Debug, Clone)]
pub struct QueuedBuffer {
    pub slot: SlotId,
    pub chunks: Vec<ChunkInfo>,
    pub header: Vec<u8>,
    pub cursor: Vec<u8>,
    pub damage: Vec<u8>,
}

impl QueuedBuffer {
    pub fn damage(&self) -> Vec<Rect> {
        let (rects, terminated) = read::damage(&self.damage);
        assert!(terminated, "damage list without terminator");
        rects
    }

    pub fn cursor(&self) -> (CursorRecord, Option<read::ReadBitmap>) {
        read::cursor(&self.cursor)
    }

    /// `(seq, pts)`
    pub fn header(&self) -> (u64, i64) {
        read::header(&self.header)
    }

    pub fn is_corrupted(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.corrupted)
    }
}

pub struct MockBuffer {
    slot: SlotId,
    kind: Option<BufferKind>,
    has_data: bool,
    chunks: Vec<ChunkInfo>,
    header: Vec<u8>,
    cursor: Vec<u8>,
    damage: Vec<u8>,
}

impl TransportBuffer for MockBuffer {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn data_kind(&self) -> Option<BufferKind> {
        self.kind
    }

    fn has_data(&self) -> bool {
        self.has_data
    }

    fn plane_count(&self) -> usize {
        self.chunks.len()
    }

    fn set_chunk(&mut self, plane: usize, chunk: ChunkInfo) {
        if let Some(slot) = self.chunks.get_mut(plane) {
            *slot = chunk;
        }
    }

    fn meta_mut(&mut self, kind: MetaKind) -> Option<&mut [u8]> {
        let area = match kind {
            MetaKind::Header => &mut self.header,
            MetaKind::Cursor => &mut self.cursor,
            MetaKind::Damage => &mut self.damage,
        };
        (!area.is_empty()).then_some(area.as_mut_slice())
    }
}

#[derive(Default)]
struct ConsumerState {
    state: Option<TransportState>,
    node_id: u32,
    connected: Option<Vec<FormatOffer>>,
    format_updates: Vec<Vec<FormatOffer>>,
    buffer_offers: Vec<BufferOffer>,
    queued: Vec<QueuedBuffer>,
    dequeues: usize,
    disconnects: usize,
    free: VecDeque<SlotId>,
    unmapped: HashSet<SlotId>,
    pool: Option<SharedPool>,
    events: Option<EventQueue>,
    next_slot: SlotId,
}

/// The consumer end of a [`MockTransport`], driven by the test.
#[derive(Clone, Default)]
pub struct MockConsumer {
    inner: Rc<RefCell<ConsumerState>>,
}

impl MockConsumer {
    fn push(&self, event: TransportEvent) {
        let events = self.inner.borrow().events.clone();
        if let Some(events) = events {
            events.borrow_mut().push_back(event);
        }
    }

    fn pool(&self) -> SharedPool {
        self.inner
            .borrow()
            .pool
            .clone()
            .expect("transport was never created")
    }

    pub fn node_id(&self) -> u32 {
        self.inner.borrow().node_id
    }

    pub fn set_state(&self, state: TransportState) {
        self.inner.borrow_mut().state = Some(state.clone());
        self.push(TransportEvent::StateChanged(state));
    }

    pub fn pick_format(
        &self,
        format: PixelFormat,
        size: impl Into<Size<i32, Physical>>,
        modifier: Option<ModifierProposal>,
        max_framerate: (u32, u32),
    ) {
        self.push(TransportEvent::FormatChanged(NegotiatedFormat {
            format,
            size: size.into(),
            modifier,
            max_framerate,
        }));
    }

    pub fn add_buffers(&self, count: usize, allowed: DataTypes) -> Vec<SlotId> {
        let pool = self.pool();
        let mut slots = Vec::new();
        for _ in 0..count {
            let slot = {
                let mut inner = self.inner.borrow_mut();
                inner.next_slot += 1;
                inner.next_slot
            };
            pool.borrow_mut().add_buffer(slot, allowed);
            self.inner.borrow_mut().free.push_back(slot);
            self.push(TransportEvent::BufferAdded(slot));
            slots.push(slot);
        }
        slots
    }

    pub fn remove_buffer(&self, slot: SlotId) {
        self.pool().borrow_mut().remove_buffer(slot);
        self.inner.borrow_mut().free.retain(|free| *free != slot);
        self.push(TransportEvent::BufferRemoved(slot));
    }

    pub fn remove_all_buffers(&self) {
        let slots = self.inner.borrow().free.iter().copied().collect::<Vec<_>>();
        for slot in slots {
            self.remove_buffer(slot);
        }
    }

    /// Hands every queued buffer back for reuse.
    pub fn release_all(&self) {
        let pool = self.pool();
        let mut inner = self.inner.borrow_mut();
        let slots = inner.queued.iter().map(|b| b.slot).collect::<Vec<_>>();
        for slot in slots {
            if pool.borrow().get(slot).is_some() && !inner.free.contains(&slot) {
                inner.free.push_back(slot);
            }
        }
    }

    pub fn set_unmapped(&self, slot: SlotId) {
        self.inner.borrow_mut().unmapped.insert(slot);
    }

    pub fn connected(&self) -> Option<Vec<FormatOffer>> {
        self.inner.borrow().connected.clone()
    }

    pub fn format_updates(&self) -> Vec<Vec<FormatOffer>> {
        self.inner.borrow().format_updates.clone()
    }

    pub fn buffer_offers(&self) -> Vec<BufferOffer> {
        self.inner.borrow().buffer_offers.clone()
    }

    pub fn queued(&self) -> Vec<QueuedBuffer> {
        self.inner.borrow().queued.clone()
    }

    pub fn last_queued(&self) -> QueuedBuffer {
        self.inner
            .borrow()
            .queued
            .last()
            .cloned()
            .expect("nothing was queued")
    }

    pub fn dequeues(&self) -> usize {
        self.inner.borrow().dequeues
    }

    pub fn disconnects(&self) -> usize {
        self.inner.borrow().disconnects
    }

    pub fn free_slots(&self) -> Vec<SlotId> {
        self.inner.borrow().free.iter().copied().collect()
    }
}

pub struct MockTransport {
    consumer: MockConsumer,
}

impl StreamTransport for MockTransport {
    type Buffer = MockBuffer;

    fn connect(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError> {
        let mut inner = self.consumer.inner.borrow_mut();
        inner.connected = Some(formats.to_vec());
        inner.state = Some(TransportState::Connecting);
        Ok(())
    }

    fn update_formats(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError> {
        self.consumer
            .inner
            .borrow_mut()
            .format_updates
            .push(formats.to_vec());
        Ok(())
    }

    fn update_buffers(&mut self, offer: &BufferOffer) -> Result<(), TransportError> {
        self.consumer
            .inner
            .borrow_mut()
            .buffer_offers
            .push(offer.clone());
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.consumer
            .inner
            .borrow()
            .state
            .clone()
            .unwrap_or(TransportState::Unconnected)
    }

    fn node_id(&self) -> u32 {
        self.consumer.node_id()
    }

    fn dequeue(&mut self) -> Option<MockBuffer> {
        let pool = self.consumer.pool();
        let mut inner = self.consumer.inner.borrow_mut();
        inner.dequeues += 1;
        let slot = inner.free.pop_front()?;

        let pool = pool.borrow();
        let stored = pool.get(slot);
        let planes = match stored {
            Some(StreamBuffer::DmaBuf { dmabuf, .. }) => dmabuf.num_planes(),
            _ => 1,
        };
        let offer = inner.buffer_offers.last();
        Some(MockBuffer {
            slot,
            kind: stored.and_then(StreamBuffer::kind),
            has_data: !inner.unmapped.contains(&slot),
            chunks: vec![ChunkInfo::default(); planes],
            header: vec![0; meta::HEADER_META_SIZE],
            cursor: vec![0; offer.map_or(0, |offer| offer.cursor_meta_size)],
            damage: vec![0; offer.map_or(0, |offer| offer.damage_regions as usize * meta::REGION_SIZE)],
        })
    }

    fn queue(&mut self, buffer: MockBuffer) {
        self.consumer.inner.borrow_mut().queued.push(QueuedBuffer {
            slot: buffer.slot,
            chunks: buffer.chunks,
            header: buffer.header,
            cursor: buffer.cursor,
            damage: buffer.damage,
        });
    }

    fn disconnect(&mut self) {
        let mut inner = self.consumer.inner.borrow_mut();
        inner.disconnects += 1;
        inner.state = Some(TransportState::Unconnected);
    }
}

/// Creates one [`MockConsumer`] per stream, with node ids from 40 up.
#[derive(Clone, Default)]
pub struct MockFactory {
    consumers: Rc<RefCell<Vec<MockConsumer>>>,
    pub fail: Rc<Cell<bool>>,
}

impl MockFactory {
    pub fn consumer(&self, index: usize) -> MockConsumer {
        self.consumers.borrow()[index].clone()
    }

    pub fn last_consumer(&self) -> MockConsumer {
        self.consumers
            .borrow()
            .last()
            .cloned()
            .expect("no transport was created")
    }
}

impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    fn create(
        &self,
        _name: &str,
        pool: SharedPool,
        events: EventQueue,
    ) -> Result<MockTransport, TransportError> {
        if self.fail.get() {
            return Err(TransportError::Bootstrap("PipeWire connection lost".into()));
        }
        let consumer = MockConsumer::default();
        {
            let mut inner = consumer.inner.borrow_mut();
            inner.node_id = 40 + self.consumers.borrow().len() as u32;
            inner.pool = Some(pool);
            inner.events = Some(events);
        }
        self.consumers.borrow_mut().push(consumer.clone());
        Ok(MockTransport { consumer })
    }

    fn failure(&self) -> Option<TransportError> {
        self.fail
            .get()
            .then(|| TransportError::Bootstrap("PipeWire connection lost".into()))
    }
}

pub struct TestOutput {
    pub name: String,
    pub size: Cell<Size<i32, Physical>>,
    pub scale: f64,
    pub geometry: Rectangle<i32, Logical>,
    pub texture: RefCell<Option<TestTexture>>,
    pub repaints: Cell<u32>,
}

impl TestOutput {
    pub fn new(name: &str, size: (i32, i32)) -> Rc<Self> {
        Rc::new(TestOutput {
            name: name.into(),
            size: Cell::new(size.into()),
            scale: 1.0,
            geometry: Rectangle::from_size(size.into()),
            texture: RefCell::new(None),
            repaints: Cell::new(0),
        })
    }
}

impl CastOutput<TestTexture> for TestOutput {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn pixel_size(&self) -> Size<i32, Physical> {
        self.size.get()
    }

    fn scale(&self) -> f64 {
        self.scale
    }

    fn geometry(&self) -> Rectangle<i32, Logical> {
        self.geometry
    }

    fn texture(&self) -> Option<TestTexture> {
        self.texture.borrow().clone()
    }

    fn schedule_repaint(&self) {
        self.repaints.set(self.repaints.get() + 1);
    }
}

pub struct TestWindow {
    pub id: String,
    pub client_size: Cell<Size<i32, Logical>>,
    pub buffer_scale: i32,
    pub has_alpha: bool,
    pub texture: RefCell<Option<TestTexture>>,
    pub repaints: Cell<u32>,
}

impl TestWindow {
    pub fn new(id: &str, size: (i32, i32), has_alpha: bool) -> Rc<Self> {
        Rc::new(TestWindow {
            id: id.into(),
            client_size: Cell::new(size.into()),
            buffer_scale: 1,
            has_alpha,
            texture: RefCell::new(None),
            repaints: Cell::new(0),
        })
    }
}

impl CastWindow<TestTexture> for TestWindow {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn client_size(&self) -> Size<i32, Logical> {
        self.client_size.get()
    }

    fn buffer_scale(&self) -> i32 {
        self.buffer_scale
    }

    fn geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::from_size(self.client_size.get())
    }

    fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    fn texture(&self) -> Option<TestTexture> {
        self.texture.borrow().clone()
    }

    fn schedule_repaint(&self) {
        self.repaints.set(self.repaints.get() + 1);
    }
}

#[derive(Default)]
pub struct TestRegistry {
    pub windows: HashMap<String, Rc<TestWindow>>,
    pub outputs: HashMap<String, Rc<TestOutput>>,
}

impl CastRegistry<TestTexture> for TestRegistry {
    fn find_window(&self, id: &str) -> Option<Rc<dyn CastWindow<TestTexture>>> {
        self.windows
            .get(id)
            .map(|window| window.clone() as Rc<dyn CastWindow<TestTexture>>)
    }

    fn find_output(&self, name: &str) -> Option<Rc<dyn CastOutput<TestTexture>>> {
        self.outputs
            .get(name)
            .map(|output| output.clone() as Rc<dyn CastOutput<TestTexture>>)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Created(u32),
    Failed(String),
    Closed,
}

#[derive(Clone, Default)]
pub struct RecordingRequest {
    pub events: Rc<RefCell<Vec<RequestEvent>>>,
}

impl RecordingRequest {
    pub fn events(&self) -> Vec<RequestEvent> {
        self.events.borrow().clone()
    }
}

impl ScreencastRequest for RecordingRequest {
    fn send_created(&self, node_id: u32) {
        self.events.borrow_mut().push(RequestEvent::Created(node_id));
    }

    fn send_failed(&self, message: &str) {
        self.events
            .borrow_mut()
            .push(RequestEvent::Failed(message.to_owned()));
    }

    fn send_closed(&self) {
        self.events.borrow_mut().push(RequestEvent::Closed);
    }
}

pub type TestSession = StreamSession<TestTexture, MockTransport>;

pub fn cursor_settings(mode: CursorMode, viewport: (i32, i32)) -> CursorSettings {
    CursorSettings {
        mode,
        scale: 1.0,
        viewport: Rectangle::from_size(viewport.into()),
    }
}

pub fn pointer_at(x: f64, y: f64, image: Option<CursorImage>) -> PointerState {
    PointerState {
        position: Point::from((x, y)),
        image,
    }
}

pub fn cursor_image(size: (i32, i32), hotspot: (i32, i32)) -> CursorImage {
    let pixels = [255u8, 255, 255, 255].repeat((size.0 * size.1) as usize);
    CursorImage::new(size, hotspot, pixels).unwrap()
}

/// Event loop, backend and transport factory shared by one test.
pub struct Fixture {
    pub event_loop: EventLoop<'static, ()>,
    pub factory: MockFactory,
    pub backend: TestBackend,
}

impl Fixture {
    pub fn new() -> Self {
        test_init();
        Fixture {
            event_loop: EventLoop::try_new().expect("Unable to create event_loop"),
            factory: MockFactory::default(),
            backend: TestBackend::default(),
        }
    }

    pub fn reactor(&self) -> Rc<dyn Reactor> {
        Rc::new(self.event_loop.handle())
    }

    pub fn dispatch(&mut self, timeout: Duration) {
        self.event_loop.dispatch(Some(timeout), &mut ()).unwrap();
    }

    pub fn output_session(
        &self,
        output: &Rc<TestOutput>,
        dmabuf: Option<Rc<dyn DmabufSource>>,
        config: StreamConfig,
        cursor: CursorSettings,
    ) -> (TestSession, MockConsumer) {
        let source = Rc::new(OutputSource::new(output.clone() as Rc<dyn CastOutput<TestTexture>>));
        let mut session =
            StreamSession::new("test-output", source, self.reactor(), dmabuf, config, cursor);
        session.start(&self.factory).unwrap();
        (session, self.factory.last_consumer())
    }

    pub fn window_session(
        &self,
        window: &Rc<TestWindow>,
        dmabuf: Option<Rc<dyn DmabufSource>>,
        config: StreamConfig,
        cursor: CursorSettings,
    ) -> (TestSession, MockConsumer) {
        let source = Rc::new(WindowSource::new(window.clone() as Rc<dyn CastWindow<TestTexture>>));
        let mut session =
            StreamSession::new("test-window", source, self.reactor(), dmabuf, config, cursor);
        session.start(&self.factory).unwrap();
        (session, self.factory.last_consumer())
    }
}

/// Walks a started session to Streaming with `buffers` slots of `allowed`
/// storage and no frame rate limit.
pub fn negotiate(
    session: &mut TestSession,
    consumer: &MockConsumer,
    format: PixelFormat,
    size: (i32, i32),
    modifier: Option<ModifierProposal>,
    buffers: usize,
    allowed: DataTypes,
) -> Vec<SlotId> {
    consumer.set_state(TransportState::Paused);
    consumer.pick_format(format, size, modifier, (0, 1));
    session.dispatch_transport();
    let slots = consumer.add_buffers(buffers, allowed);
    consumer.set_state(TransportState::Streaming);
    session.dispatch_transport();
    assert_eq!(session.state(), &TransportState::Streaming);
    slots
}

pub fn proposal(modifiers: Vec<Modifier>, dont_fixate: bool) -> Option<ModifierProposal> {
    Some(ModifierProposal {
        modifiers,
        dont_fixate,
    })
}

/// Negotiates BGRA with a linear dma-buf modifier: the consumer leaves the
/// modifier open first, then confirms the fixated one.
pub fn negotiate_dmabuf(
    session: &mut TestSession,
    consumer: &MockConsumer,
    size: (i32, i32),
    buffers: usize,
) -> Vec<SlotId> {
    consumer.set_state(TransportState::Paused);
    consumer.pick_format(PixelFormat::Bgra, size, proposal(vec![Modifier::Linear], true), (0, 1));
    session.dispatch_transport();
    consumer.pick_format(PixelFormat::Bgra, size, proposal(vec![Modifier::Linear], false), (0, 1));
    session.dispatch_transport();
    let slots = consumer.add_buffers(
        buffers,
        DataTypes {
            dmabuf: true,
            memfd: true,
        },
    );
    consumer.set_state(TransportState::Streaming);
    session.dispatch_transport();
    slots
}
