use once_cell::sync::Lazy;
use smithay::backend::drm::{DrmNode, NodeType};
use smithay::backend::egl::{EGLContext, EGLDevice, EGLDisplay, Error as EglError};
use smithay::backend::renderer::gles::{GlesError, GlesRenderer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::debug;

static EGL_DISPLAYS: Lazy<Mutex<HashMap<Option<DrmNode>, Weak<EGLDisplay>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("failed to enumerate EGL devices: {0}")]
    Enumerate(#[source] EglError),
    #[error("no EGL device for {0:?}")]
    NoDevice(Option<DrmNode>),
    #[error("failed to create EGL display: {0}")]
    Display(#[source] EglError),
    #[error("failed to create EGL context: {0}")]
    Context(#[source] EglError),
    #[error("failed to create GLES renderer: {0}")]
    Renderer(#[source] GlesError),
}

pub fn get_egl_device_for_node(drm_node: &DrmNode) -> Result<EGLDevice, RendererError> {
    let drm_node = drm_node
        .node_with_type(NodeType::Render)
        .and_then(Result::ok)
        .unwrap_or(*drm_node);
    EGLDevice::enumerate()
        .map_err(RendererError::Enumerate)?
        .find(|d| d.try_get_render_node().unwrap_or_default() == Some(drm_node))
        .ok_or(RendererError::NoDevice(Some(drm_node)))
}

/// Creates a renderer on `render_node`, or on the software device for
/// `None`. Renderers on the same node share one EGL display.
pub fn setup_renderer(render_node: Option<DrmNode>) -> Result<GlesRenderer, RendererError> {
    let mut displays = EGL_DISPLAYS.lock().unwrap_or_else(PoisonError::into_inner);
    let maybe_display = displays
        .get(&render_node)
        .and_then(|weak_display| weak_display.upgrade());

    let egl = match maybe_display {
        Some(display) => display,
        None => {
            let device = match render_node.as_ref() {
                Some(render_node) => get_egl_device_for_node(render_node)?,
                None => EGLDevice::enumerate()
                    .map_err(RendererError::Enumerate)?
                    .find(|device| {
                        device
                            .extensions()
                            .iter()
                            .any(|e| e == "EGL_MESA_device_software")
                    })
                    .ok_or(RendererError::NoDevice(None))?,
            };
            debug!(?render_node, "Creating EGL display");
            let egl = unsafe { EGLDisplay::new(device) }.map_err(RendererError::Display)?;
            let display = Arc::new(egl);
            displays.insert(render_node, Arc::downgrade(&display));
            display
        }
    };
    let context = EGLContext::new(&egl).map_err(RendererError::Context)?;
    unsafe { GlesRenderer::new(context) }.map_err(RendererError::Renderer)
}
