use smithay::reexports::rustix::io::Errno;
use thiserror::Error;

/// Session-level failures. Any of these ends the stream.
#[derive(Debug, Error)]
pub enum ScreencastError {
    #[error("failed to connect to the screencast transport: {0}")]
    TransportBootstrap(String),
    #[error("failed to create stream: {0}")]
    StreamCreation(String),
    #[error("the streamed source disappeared")]
    SourceDisappeared,
    #[error("could not find window id {0}")]
    WindowNotFound(String),
    #[error("could not find output {0}")]
    OutputNotFound(String),
    #[error("format negotiation failed: {0}")]
    Negotiation(String),
}

impl From<TransportError> for ScreencastError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Bootstrap(msg) => ScreencastError::TransportBootstrap(msg),
            other => ScreencastError::StreamCreation(other.to_string()),
        }
    }
}

/// Failure to back a single buffer slot. The slot stays unusable until the
/// consumer removes it.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("memfd_create failed: {0}")]
    Memfd(#[source] Errno),
    #[error("ftruncate to {size} bytes failed: {source}")]
    Truncate {
        size: usize,
        #[source]
        source: Errno,
    },
    #[error("sealing memfd failed: {0}")]
    Seal(#[source] Errno),
    #[error("mmap of {size} bytes failed: {source}")]
    Mmap {
        size: usize,
        #[source]
        source: Errno,
    },
    #[error("dma-buf allocation failed: {0}")]
    Dmabuf(#[from] AllocatorError),
    #[error("consumer allows none of the buffer types we can provide")]
    UnsupportedDataType,
}

/// Why a frame did not make it into a buffer. None of these end the stream.
#[derive(Debug, Error)]
pub enum CaptureDrop {
    #[error("stream is not streaming")]
    StreamNotActive,
    #[error("compositor is too slow, previous frame still pending")]
    CompositorTooSlow,
    #[error("no buffer available")]
    NoBuffer,
    #[error("buffer has invalid data: {0}")]
    InvalidBufferData(&'static str),
    #[error("frame needs {required} bytes but buffer holds {max_size}")]
    OversizedFrame { required: usize, max_size: usize },
    #[error("frame rate limit reached")]
    Throttled,
    #[error("waiting for buffers of the new size")]
    WaitingForBuffers,
    #[error("source was resized, renegotiating")]
    Resized,
    #[error("no frame to draw the cursor onto")]
    NoBaseFrame,
    #[error("cursor did not change")]
    CursorUnchanged,
    #[error("rendering failed: {0}")]
    Render(String),
}

/// Result of pushing one frame or cursor update into a session.
#[derive(Debug)]
pub enum CaptureOutcome {
    /// The buffer went back to the consumer.
    Queued,
    /// The buffer is held until the GPU fence signals.
    FencePending,
    Dropped(CaptureDrop),
}

impl CaptureOutcome {
    pub fn is_dropped(&self) -> bool {
        matches!(self, CaptureOutcome::Dropped(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("failed to connect stream: {0}")]
    Connect(String),
    #[error("failed to update stream params: {0}")]
    Params(String),
    #[error("failed to serialize param pod: {0}")]
    Pod(String),
}

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("no dma-buf allocator available")]
    Unavailable,
    #[error("cannot open render node: {0}")]
    Device(String),
    #[error("format {0:?} is not supported for dma-buf allocation")]
    UnsupportedFormat(smithay::backend::allocator::Fourcc),
    #[error("no usable modifier for {0:?}")]
    NoModifier(smithay::backend::allocator::Fourcc),
    #[error("allocation failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum FenceError {
    #[error("failed to watch fence fd: {0}")]
    Watch(String),
    #[error("failed to arm timer: {0}")]
    Timer(String),
}
