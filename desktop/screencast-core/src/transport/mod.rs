//! The consumer-facing side of a stream.
//!
//! A transport announces formats and buffer parameters, reports what the
//! consumer decided through [`TransportEvent`]s and lends out buffers for
//! capture. Slot storage lives in the shared [`BufferPool`](crate::pool::BufferPool),
//! which the transport fills synchronously when the consumer adds a slot.

pub mod params;
pub mod pipewire;

use crate::config::BufferCount;
use crate::error::TransportError;
use crate::format::PixelFormat;
use crate::pool::{BufferKind, DataTypes, SharedPool, SlotId};
use smithay::backend::allocator::Modifier;
use smithay::utils::{Physical, Size};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub use self::pipewire::{PipeWireCore, PipeWireTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Unconnected,
    Connecting,
    Paused,
    Streaming,
    Error(String),
}

/// One EnumFormat proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOffer {
    /// In preference order.
    pub formats: Vec<PixelFormat>,
    pub size: Size<i32, Physical>,
    /// Empty for shared-memory only offers.
    pub modifiers: Vec<Modifier>,
    /// The modifier list is final and must not be renegotiated.
    pub fixate: bool,
    pub min_framerate: u32,
    pub max_framerate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferOffer {
    pub buffers: BufferCount,
    pub blocks: u32,
    pub size: usize,
    pub stride: usize,
    pub align: u32,
    pub data_types: DataTypes,
    pub cursor_meta_size: usize,
    pub damage_regions: u32,
}

/// Modifier property of a format the consumer picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierProposal {
    pub modifiers: Vec<Modifier>,
    /// The consumer left the choice to us.
    pub dont_fixate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub format: PixelFormat,
    pub size: Size<i32, Physical>,
    pub modifier: Option<ModifierProposal>,
    /// `(num, denom)`, `num == 0` means unlimited.
    pub max_framerate: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(TransportState),
    FormatChanged(NegotiatedFormat),
    BufferAdded(SlotId),
    BufferRemoved(SlotId),
}

pub type EventQueue = Rc<RefCell<VecDeque<TransportEvent>>>;

/// Per-frame chunk descriptor of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkInfo {
    pub offset: u32,
    pub size: u32,
    pub stride: i32,
    pub corrupted: bool,
}

impl ChunkInfo {
    /// Chunk of a buffer that carries no valid pixels.
    pub fn corrupted() -> Self {
        ChunkInfo {
            corrupted: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    Header,
    Cursor,
    Damage,
}

/// A buffer dequeued from the consumer.
pub trait TransportBuffer {
    fn slot(&self) -> SlotId;

    /// Storage type the slot was set up with.
    fn data_kind(&self) -> Option<BufferKind>;

    /// Whether the first plane has a CPU mapping.
    fn has_data(&self) -> bool;

    fn plane_count(&self) -> usize;

    fn set_chunk(&mut self, plane: usize, chunk: ChunkInfo);

    /// The metadata area of `kind`, if the consumer accepted it.
    fn meta_mut(&mut self, kind: MetaKind) -> Option<&mut [u8]>;
}

pub trait StreamTransport {
    type Buffer: TransportBuffer + 'static;

    fn connect(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError>;

    fn update_formats(&mut self, formats: &[FormatOffer]) -> Result<(), TransportError>;

    fn update_buffers(&mut self, offer: &BufferOffer) -> Result<(), TransportError>;

    fn state(&self) -> TransportState;

    fn node_id(&self) -> u32;

    fn dequeue(&mut self) -> Option<Self::Buffer>;

    fn queue(&mut self, buffer: Self::Buffer);

    fn disconnect(&mut self);
}

/// Creates one transport per stream.
pub trait TransportFactory {
    type Transport: StreamTransport + 'static;

    fn create(
        &self,
        name: &str,
        pool: SharedPool,
        events: EventQueue,
    ) -> Result<Self::Transport, TransportError>;

    /// Set once the connection shared by all transports broke. Streams
    /// created earlier are dead as well.
    fn failure(&self) -> Option<TransportError> {
        None
    }
}
