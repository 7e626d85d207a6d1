//! Entry point for the compositor: turns stream requests into sessions and
//! routes compositor events to them.

use crate::backend::CaptureBackend;
use crate::config::{CursorMode, CursorSettings, StreamConfig};
use crate::cursor::{CursorImage, PointerState};
use crate::error::{CaptureOutcome, ScreencastError};
use crate::fence::Reactor;
use crate::pool::DmabufSource;
use crate::session::{SessionEvent, StreamSession};
use crate::source::{CastOutput, CastTarget, CastWindow, OutputSource, ScreenCastSource, WindowSource};
use crate::transport::{StreamTransport, TransportFactory};
use smithay::utils::{Logical, Physical, Point, Rectangle};
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// The request object of whoever asked for a stream.
pub trait ScreencastRequest {
    fn send_created(&self, node_id: u32);
    fn send_failed(&self, message: &str);
    fn send_closed(&self);
}

/// Wraps a request so it sees at most one terminal event.
///
/// `created` comes at most once and may be followed by `closed`. A failure
/// after `created` is reported as `closed`.
pub struct RequestGuard {
    request: Box<dyn ScreencastRequest>,
    created: bool,
    finished: bool,
}

impl RequestGuard {
    pub fn new(request: Box<dyn ScreencastRequest>) -> Self {
        RequestGuard {
            request,
            created: false,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn created(&mut self, node_id: u32) {
        if self.created || self.finished {
            return;
        }
        self.created = true;
        self.request.send_created(node_id);
    }

    pub fn failed(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.created {
            self.request.send_closed();
        } else {
            self.request.send_failed(message);
        }
    }

    pub fn closed(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.request.send_closed();
    }
}

/// Looks up what can be streamed.
pub trait CastRegistry<Tex> {
    fn find_window(&self, id: &str) -> Option<Rc<dyn CastWindow<Tex>>>;
    fn find_output(&self, name: &str) -> Option<Rc<dyn CastOutput<Tex>>>;
}

/// Identifies a stream for [`ScreenCastManager::request_finished`].
pub type CastId = u64;

struct Cast<Tex: Clone + 'static, T: StreamTransport + 'static> {
    id: CastId,
    target: CastTarget,
    session: StreamSession<Tex, T>,
    request: RequestGuard,
}

pub struct ScreenCastManager<Tex: Clone + 'static, F: TransportFactory> {
    factory: F,
    reactor: Rc<dyn Reactor>,
    dmabuf: Option<Rc<dyn DmabufSource>>,
    config: StreamConfig,
    casts: Vec<Cast<Tex, F::Transport>>,
    pointer: PointerState,
    next_id: CastId,
}

impl<Tex: Clone + 'static, F: TransportFactory> ScreenCastManager<Tex, F> {
    pub fn new(
        factory: F,
        reactor: Rc<dyn Reactor>,
        dmabuf: Option<Rc<dyn DmabufSource>>,
        config: StreamConfig,
    ) -> Self {
        ScreenCastManager {
            factory,
            reactor,
            dmabuf,
            config,
            casts: Vec::new(),
            pointer: PointerState::default(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.casts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.casts.is_empty()
    }

    pub fn pointer(&self) -> &PointerState {
        &self.pointer
    }

    pub fn session(&self, id: CastId) -> Option<&StreamSession<Tex, F::Transport>> {
        self.casts
            .iter()
            .find(|cast| cast.id == id)
            .map(|cast| &cast.session)
    }

    pub fn session_mut(&mut self, id: CastId) -> Option<&mut StreamSession<Tex, F::Transport>> {
        self.casts
            .iter_mut()
            .find(|cast| cast.id == id)
            .map(|cast| &mut cast.session)
    }

    pub fn stream_window(
        &mut self,
        registry: &dyn CastRegistry<Tex>,
        request: Box<dyn ScreencastRequest>,
        window_id: &str,
        cursor_mode: CursorMode,
    ) -> Option<CastId> {
        let mut request = RequestGuard::new(request);
        let Some(window) = registry.find_window(window_id) else {
            let err = ScreencastError::WindowNotFound(window_id.to_owned());
            warn!(window_id, "Screencast requested for unknown window");
            request.failed(&err.to_string());
            return None;
        };

        let cursor = CursorSettings {
            mode: cursor_mode,
            scale: f64::from(window.buffer_scale().max(1)),
            viewport: window.geometry(),
        };
        let source = Rc::new(WindowSource::new(window));
        self.start_cast(source, request, cursor)
    }

    pub fn stream_output(
        &mut self,
        registry: &dyn CastRegistry<Tex>,
        request: Box<dyn ScreencastRequest>,
        output_name: &str,
        cursor_mode: CursorMode,
    ) -> Option<CastId> {
        let mut request = RequestGuard::new(request);
        let Some(output) = registry.find_output(output_name) else {
            let err = ScreencastError::OutputNotFound(output_name.to_owned());
            warn!(output_name, "Screencast requested for unknown output");
            request.failed(&err.to_string());
            return None;
        };

        let cursor = CursorSettings {
            mode: cursor_mode,
            scale: output.scale(),
            viewport: output.geometry(),
        };
        let source = Rc::new(OutputSource::new(output));
        let id = self.start_cast(source.clone(), request, cursor)?;
        // first frame without waiting for damage
        source.output().schedule_repaint();
        Some(id)
    }

    fn start_cast(
        &mut self,
        source: Rc<dyn ScreenCastSource<Tex>>,
        mut request: RequestGuard,
        cursor: CursorSettings,
    ) -> Option<CastId> {
        let target = source.target();
        let id = self.next_id;
        self.next_id += 1;

        let mut session = StreamSession::new(
            format!("screencast-{id}"),
            source,
            self.reactor.clone(),
            self.dmabuf.clone(),
            self.config.clone(),
            cursor,
        );
        if let Err(err) = session.start(&self.factory) {
            request.failed(&err.to_string());
            return None;
        }

        info!(id, %target, mode = %cursor.mode, "Screencast started");
        self.casts.push(Cast {
            id,
            target,
            session,
            request,
        });
        Some(id)
    }

    /// Processes transport events of all sessions and reports the results
    /// to their requests. Finished casts are dropped.
    pub fn dispatch(&mut self) {
        let failure = self.factory.failure();
        for cast in &mut self.casts {
            if let Some(err) = &failure {
                cast.session.transport_failed(err.clone());
            }
            cast.session.dispatch_transport();
            for event in cast.session.take_events() {
                match event {
                    SessionEvent::Ready(node_id) => cast.request.created(node_id),
                    SessionEvent::Stopped => {
                        debug!(id = cast.id, error = ?cast.session.error(), "Screencast stopped");
                        match cast.session.error() {
                            Some(err) if !cast.request.is_finished() => {
                                let err = err.to_owned();
                                cast.request.failed(&err);
                            }
                            _ => cast.request.closed(),
                        }
                    }
                    SessionEvent::Started | SessionEvent::Paused => {
                        trace!(id = cast.id, ?event, "Screencast state");
                    }
                }
            }
        }
        self.casts.retain(|cast| !cast.request.is_finished());
    }

    /// Damage of a window that was just rendered.
    pub fn window_damaged<B>(
        &mut self,
        backend: &mut B,
        window_id: &str,
        damage: &[Rectangle<i32, Physical>],
    ) where
        B: CaptureBackend<Texture = Tex>,
    {
        let target = CastTarget::Window(window_id.to_owned());
        self.push_frames(backend, &target, damage);
    }

    /// An output finished rendering a frame.
    pub fn output_frame<B>(
        &mut self,
        backend: &mut B,
        output_name: &str,
        damage: &[Rectangle<i32, Physical>],
    ) where
        B: CaptureBackend<Texture = Tex>,
    {
        let target = CastTarget::Output(output_name.to_owned());
        self.push_frames(backend, &target, damage);
    }

    fn push_frames<B>(&mut self, backend: &mut B, target: &CastTarget, damage: &[Rectangle<i32, Physical>])
    where
        B: CaptureBackend<Texture = Tex>,
    {
        let pointer = self.pointer.clone();
        for cast in self.casts.iter_mut().filter(|cast| &cast.target == target) {
            let Some(texture) = cast.session.source_texture() else {
                trace!(id = cast.id, %target, "Source has no frame yet");
                continue;
            };
            let outcome = cast.session.push_frame(backend, &texture, damage, &pointer);
            if let CaptureOutcome::Dropped(drop) = outcome {
                trace!(id = cast.id, %drop, "Frame not streamed");
            }
        }
    }

    pub fn window_closed(&mut self, window_id: &str) {
        self.source_gone(&CastTarget::Window(window_id.to_owned()));
    }

    pub fn output_removed(&mut self, output_name: &str) {
        self.source_gone(&CastTarget::Output(output_name.to_owned()));
    }

    fn source_gone(&mut self, target: &CastTarget) {
        // detach first so no frame is routed to a closing session
        let (gone, kept) = std::mem::take(&mut self.casts)
            .into_iter()
            .partition::<Vec<_>, _>(|cast| &cast.target == target);
        self.casts = kept;

        for mut cast in gone {
            cast.session.source_closed();
            cast.session.stop();
            cast.request.closed();
        }
    }

    pub fn pointer_moved<B>(&mut self, backend: &mut B, position: Point<f64, Logical>)
    where
        B: CaptureBackend<Texture = Tex>,
    {
        self.pointer.position = position;
        self.push_cursor(backend);
    }

    pub fn set_cursor_image<B>(&mut self, backend: &mut B, image: Option<CursorImage>)
    where
        B: CaptureBackend<Texture = Tex>,
    {
        self.pointer.image = image;
        self.push_cursor(backend);
    }

    fn push_cursor<B>(&mut self, backend: &mut B)
    where
        B: CaptureBackend<Texture = Tex>,
    {
        for cast in &mut self.casts {
            if let Some(CaptureOutcome::Dropped(drop)) = cast.session.push_cursor(backend, &self.pointer) {
                trace!(id = cast.id, %drop, "Cursor update not streamed");
            }
        }
    }

    /// The requester is done with the stream. No event is sent back.
    pub fn request_finished(&mut self, id: CastId) {
        if let Some(index) = self.casts.iter().position(|cast| cast.id == id) {
            let mut cast = self.casts.remove(index);
            debug!(id, "Screencast request finished");
            cast.session.stop();
        }
    }

    pub fn stop_all(&mut self) {
        for mut cast in self.casts.drain(..) {
            cast.session.stop();
            cast.request.closed();
        }
    }
}
