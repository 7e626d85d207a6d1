//! What a stream shows: one window or one whole output.

use smithay::utils::{Logical, Physical, Rectangle, Size};
use std::fmt;
use std::rc::Rc;

/// Identity of a streamed source, used to route compositor events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CastTarget {
    Window(String),
    Output(String),
}

impl fmt::Display for CastTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CastTarget::Window(id) => write!(f, "window {id}"),
            CastTarget::Output(name) => write!(f, "output {name}"),
        }
    }
}

/// The capabilities a stream needs from its source.
///
/// Damage and closing are routed by target through
/// [`ScreenCastManager`](crate::manager::ScreenCastManager).
pub trait ScreenCastSource<T> {
    fn target(&self) -> CastTarget;

    /// Current size of the frames in pixels.
    fn size(&self) -> Size<i32, Physical>;

    fn has_alpha(&self) -> bool;

    /// The latest composited frame, if one was rendered yet.
    fn frame_texture(&self) -> Option<T>;

    /// Asks the compositor to push a frame for this source on its next
    /// render, even without new damage.
    fn request_repaint(&self);
}

/// A toplevel window as the compositor exposes it to screen casting.
pub trait CastWindow<T> {
    fn id(&self) -> String;
    fn client_size(&self) -> Size<i32, Logical>;
    fn buffer_scale(&self) -> i32;
    /// Window geometry in global compositor space.
    fn geometry(&self) -> Rectangle<i32, Logical>;
    fn has_alpha(&self) -> bool;
    fn texture(&self) -> Option<T>;
    fn schedule_repaint(&self);
}

/// An output as the compositor exposes it to screen casting.
pub trait CastOutput<T> {
    fn name(&self) -> String;
    fn pixel_size(&self) -> Size<i32, Physical>;
    fn scale(&self) -> f64;
    /// Output geometry in global compositor space.
    fn geometry(&self) -> Rectangle<i32, Logical>;
    fn texture(&self) -> Option<T>;
    fn schedule_repaint(&self);
}

pub struct WindowSource<T> {
    window: Rc<dyn CastWindow<T>>,
}

impl<T> WindowSource<T> {
    pub fn new(window: Rc<dyn CastWindow<T>>) -> Self {
        WindowSource { window }
    }

    pub fn window(&self) -> &Rc<dyn CastWindow<T>> {
        &self.window
    }
}

impl<T> ScreenCastSource<T> for WindowSource<T> {
    fn target(&self) -> CastTarget {
        CastTarget::Window(self.window.id())
    }

    fn size(&self) -> Size<i32, Physical> {
        self.window
            .client_size()
            .to_physical(self.window.buffer_scale().max(1))
    }

    fn has_alpha(&self) -> bool {
        self.window.has_alpha()
    }

    fn frame_texture(&self) -> Option<T> {
        self.window.texture()
    }

    fn request_repaint(&self) {
        self.window.schedule_repaint();
    }
}

pub struct OutputSource<T> {
    output: Rc<dyn CastOutput<T>>,
}

impl<T> OutputSource<T> {
    pub fn new(output: Rc<dyn CastOutput<T>>) -> Self {
        OutputSource { output }
    }

    pub fn output(&self) -> &Rc<dyn CastOutput<T>> {
        &self.output
    }
}

impl<T> ScreenCastSource<T> for OutputSource<T> {
    fn target(&self) -> CastTarget {
        CastTarget::Output(self.output.name())
    }

    fn size(&self) -> Size<i32, Physical> {
        self.output.pixel_size()
    }

    // scanout textures carry no meaningful alpha
    fn has_alpha(&self) -> bool {
        false
    }

    fn frame_texture(&self) -> Option<T> {
        self.output.texture()
    }

    fn request_repaint(&self) {
        self.output.schedule_repaint();
    }
}
