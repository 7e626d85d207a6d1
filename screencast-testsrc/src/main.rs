//! Screencast test source
//!
//! Streams an animated test pattern with a moving cursor through the
//! screencast pipeline into PipeWire. Connect any PipeWire consumer to the
//! printed node id, e.g. `gst-launch-1.0 pipewiresrc path=<node> ! videoconvert ! autovideosink`.

use anyhow::{Context, Result};
use clap::Parser;
use screencastcore::pool::DmabufSource;
use screencastcore::utils::RenderTarget;
use screencastcore::utils::allocator::GbmDmabufSource;
use screencastcore::utils::renderer::setup_renderer;
use screencastcore::{
    CastOutput, CastRegistry, CastWindow, CursorImage, CursorMode, GlesCaptureBackend,
    PipeWireCore, ScreenCastManager, ScreencastRequest, StreamConfig,
};
use smithay::backend::allocator::Fourcc;
use smithay::backend::renderer::ImportMem;
use smithay::backend::renderer::gles::GlesTexture;
use smithay::reexports::calloop::EventLoop;
use smithay::reexports::calloop::timer::{TimeoutAction, Timer};
use smithay::utils::{Logical, Physical, Point, Rectangle, Size};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SOURCE_NAME: &str = "testsrc";
const CURSOR_EDGE: i32 = 24;

#[derive(Parser, Debug)]
#[command(name = "screencast-testsrc")]
#[command(about = "Stream a synthetic test pattern to PipeWire")]
struct Args {
    /// Frame width
    #[arg(short = 'W', long, default_value = "1280")]
    width: i32,

    /// Frame height
    #[arg(short = 'H', long, default_value = "720")]
    height: i32,

    /// Frames rendered per second
    #[arg(short, long, default_value = "30")]
    framerate: u32,

    /// Stream as a window with an alpha channel instead of an output
    #[arg(long)]
    alpha: bool,

    /// Cursor mode: hidden, embedded or metadata
    #[arg(short, long, default_value = "embedded")]
    cursor: CursorMode,

    /// Render node to render on, or "software"
    #[arg(short, long, default_value = "software")]
    render_node: RenderTarget,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// The synthetic frame source, exposed as an output or a window.
struct Pattern {
    size: Size<i32, Physical>,
    has_alpha: bool,
    texture: RefCell<Option<GlesTexture>>,
    repaint: Cell<bool>,
}

impl CastOutput<GlesTexture> for Pattern {
    fn name(&self) -> String {
        SOURCE_NAME.into()
    }

    fn pixel_size(&self) -> Size<i32, Physical> {
        self.size
    }

    fn scale(&self) -> f64 {
        1.0
    }

    fn geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::from_size((self.size.w, self.size.h).into())
    }

    fn texture(&self) -> Option<GlesTexture> {
        self.texture.borrow().clone()
    }

    fn schedule_repaint(&self) {
        self.repaint.set(true);
    }
}

impl CastWindow<GlesTexture> for Pattern {
    fn id(&self) -> String {
        SOURCE_NAME.into()
    }

    fn client_size(&self) -> Size<i32, Logical> {
        (self.size.w, self.size.h).into()
    }

    fn buffer_scale(&self) -> i32 {
        1
    }

    fn geometry(&self) -> Rectangle<i32, Logical> {
        Rectangle::from_size(self.client_size())
    }

    fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    fn texture(&self) -> Option<GlesTexture> {
        self.texture.borrow().clone()
    }

    fn schedule_repaint(&self) {
        self.repaint.set(true);
    }
}

struct Registry(Rc<Pattern>);

impl CastRegistry<GlesTexture> for Registry {
    fn find_window(&self, id: &str) -> Option<Rc<dyn CastWindow<GlesTexture>>> {
        (id == SOURCE_NAME).then(|| self.0.clone() as Rc<dyn CastWindow<GlesTexture>>)
    }

    fn find_output(&self, name: &str) -> Option<Rc<dyn CastOutput<GlesTexture>>> {
        (name == SOURCE_NAME).then(|| self.0.clone() as Rc<dyn CastOutput<GlesTexture>>)
    }
}

/// Logs what the consumer side would be told and ends the program once the
/// stream is gone.
struct LoggingRequest {
    done: Rc<Cell<bool>>,
}

impl ScreencastRequest for LoggingRequest {
    fn send_created(&self, node_id: u32) {
        info!(node_id, "Stream ready, connect a consumer to this node");
    }

    fn send_failed(&self, message: &str) {
        error!(message, "Stream failed");
        self.done.set(true);
    }

    fn send_closed(&self) {
        info!("Stream closed");
        self.done.set(true);
    }
}

struct State {
    manager: ScreenCastManager<GlesTexture, PipeWireCore<State>>,
    backend: GlesCaptureBackend,
    pattern: Rc<Pattern>,
    frame: u64,
}

impl State {
    fn render_frame(&mut self) {
        let size = self.pattern.size;
        let pixels = pattern_pixels(size, self.frame, self.pattern.has_alpha);
        let texture = self.backend.renderer().import_memory(
            &pixels,
            Fourcc::Abgr8888,
            (size.w, size.h).into(),
            false,
        );
        match texture {
            Ok(texture) => *self.pattern.texture.borrow_mut() = Some(texture),
            Err(err) => {
                warn!(?err, "Failed to upload test pattern");
                return;
            }
        }
        self.pattern.repaint.set(false);

        let damage = [Rectangle::from_size(size)];
        if self.pattern.has_alpha {
            self.manager
                .window_damaged(&mut self.backend, SOURCE_NAME, &damage);
        } else {
            self.manager
                .output_frame(&mut self.backend, SOURCE_NAME, &damage);
        }

        let position = cursor_position(size, self.frame);
        self.manager.pointer_moved(&mut self.backend, position);
        self.frame += 1;
    }
}

/// Vertical color bars scrolling sideways, fading towards the bottom when
/// the frame has alpha.
fn pattern_pixels(size: Size<i32, Physical>, frame: u64, alpha: bool) -> Vec<u8> {
    const BARS: [[u8; 3]; 7] = [
        [192, 192, 192],
        [192, 192, 0],
        [0, 192, 192],
        [0, 192, 0],
        [192, 0, 192],
        [192, 0, 0],
        [0, 0, 192],
    ];
    let (w, h) = (size.w.max(1) as usize, size.h.max(1) as usize);
    let shift = (frame as usize * 4) % w;
    let mut pixels = Vec::with_capacity(w * h * 4);
    for y in 0..h {
        let a = if alpha { (255 - y * 255 / h) as u8 } else { 255 };
        for x in 0..w {
            let bar = ((x + shift) % w) * BARS.len() / w;
            let [r, g, b] = BARS[bar];
            pixels.extend_from_slice(&[r, g, b, a]);
        }
    }
    pixels
}

fn cursor_position(size: Size<i32, Physical>, frame: u64) -> Point<f64, Logical> {
    let t = frame as f64 / 60.0;
    let (cx, cy) = (size.w as f64 / 2.0, size.h as f64 / 2.0);
    let radius = cx.min(cy) * 0.6;
    (cx + radius * t.cos(), cy + radius * t.sin()).into()
}

/// A white disc with a black rim, hotspot in the middle.
fn cursor_image() -> Option<CursorImage> {
    let edge = CURSOR_EDGE;
    let center = edge as f64 / 2.0;
    let mut pixels = Vec::with_capacity((edge * edge * 4) as usize);
    for y in 0..edge {
        for x in 0..edge {
            let d = ((x as f64 + 0.5 - center).powi(2) + (y as f64 + 0.5 - center).powi(2)).sqrt();
            let px = if d < center - 3.0 {
                [255, 255, 255, 255]
            } else if d < center - 1.0 {
                [0, 0, 0, 255]
            } else {
                [0, 0, 0, 0]
            };
            pixels.extend_from_slice(&px);
        }
    }
    CursorImage::from_straight_rgba((edge, edge), (edge / 2, edge / 2), pixels)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        "Test source {}x{} at {} fps, cursor {}, rendering on {:?}",
        args.width, args.height, args.framerate, args.cursor, args.render_node
    );
    anyhow::ensure!(
        args.width > 0 && args.height > 0,
        "frame size must not be empty"
    );

    let renderer = setup_renderer(args.render_node.node()).context("Failed to set up renderer")?;
    let dmabuf: Option<Rc<dyn DmabufSource>> = match args.render_node.node() {
        Some(node) => {
            let formats = renderer.egl_context().dmabuf_render_formats().clone();
            match GbmDmabufSource::new(node, formats) {
                Ok(source) => Some(Rc::new(source)),
                Err(err) => {
                    warn!(?err, "No dma-buf allocator, streaming through shared memory");
                    None
                }
            }
        }
        None => None,
    };

    let mut event_loop: EventLoop<'static, State> =
        EventLoop::try_new().context("Failed to create event loop")?;
    let handle = event_loop.handle();

    let core = PipeWireCore::new(&handle, |state: &mut State| state.manager.dispatch())
        .context("Failed to connect to PipeWire")?;
    let config = StreamConfig::default().with_max_framerate(args.framerate);
    let mut manager = ScreenCastManager::new(core, Rc::new(handle.clone()), dmabuf, config);

    let pattern = Rc::new(Pattern {
        size: (args.width, args.height).into(),
        has_alpha: args.alpha,
        texture: RefCell::new(None),
        repaint: Cell::new(false),
    });
    let registry = Registry(pattern.clone());
    let done = Rc::new(Cell::new(false));
    let request = Box::new(LoggingRequest { done: done.clone() });
    let started = if args.alpha {
        manager.stream_window(&registry, request, SOURCE_NAME, args.cursor)
    } else {
        manager.stream_output(&registry, request, SOURCE_NAME, args.cursor)
    };
    anyhow::ensure!(started.is_some(), "Failed to start stream");

    let mut state = State {
        manager,
        backend: GlesCaptureBackend::new(renderer),
        pattern,
        frame: 0,
    };
    let cursor = cursor_image().context("Invalid cursor image")?;
    state.manager.set_cursor_image(&mut state.backend, Some(cursor));

    let interval = Duration::from_secs(1) / args.framerate.max(1);
    handle
        .insert_source(Timer::from_duration(interval), move |_, _, state| {
            state.render_frame();
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|err| anyhow::anyhow!("Failed to insert frame timer: {}", err.error))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Entering main loop...");
    while running.load(Ordering::SeqCst) && !done.get() {
        event_loop
            .dispatch(Some(Duration::from_millis(100)), &mut state)
            .context("Event loop failed")?;
    }

    info!("Shutting down...");
    state.manager.stop_all();
    Ok(())
}
