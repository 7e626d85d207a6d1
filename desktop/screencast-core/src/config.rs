use smithay::utils::{Logical, Rectangle};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the pointer shows up in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum CursorMode {
    #[default]
    Hidden,
    /// Composited into the pixels of every frame.
    Embedded,
    /// Sent as `spa_meta_cursor` next to the frame.
    Metadata,
}

impl FromStr for CursorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hidden" => Ok(CursorMode::Hidden),
            "embedded" => Ok(CursorMode::Embedded),
            "metadata" => Ok(CursorMode::Metadata),
            other => Err(format!("unknown cursor mode: {other}")),
        }
    }
}

impl fmt::Display for CursorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorMode::Hidden => write!(f, "hidden"),
            CursorMode::Embedded => write!(f, "embedded"),
            CursorMode::Metadata => write!(f, "metadata"),
        }
    }
}

/// Cursor configuration of a single stream.
///
/// `viewport` is the region of the source, in source coordinates, that the
/// stream mirrors. Pointer positions are translated by its origin and then
/// multiplied by `scale`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorSettings {
    pub mode: CursorMode,
    pub scale: f64,
    pub viewport: Rectangle<i32, Logical>,
}

impl Default for CursorSettings {
    fn default() -> Self {
        CursorSettings {
            mode: CursorMode::Hidden,
            scale: 1.0,
            viewport: Rectangle::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCount {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl Default for BufferCount {
    fn default() -> Self {
        BufferCount {
            default: 16,
            min: 2,
            max: 16,
        }
    }
}

/// Knobs of the pipeline that are not negotiated with the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Lower bound of the advertised max-framerate range, in Hz.
    pub min_framerate: u32,
    /// Upper bound (and default) of the advertised max-framerate range, in Hz.
    pub max_framerate: u32,
    pub buffers: BufferCount,
    /// Number of `spa_meta_region` slots offered for damage, terminator included.
    pub damage_regions: u32,
    /// Edge of the cursor bitmap sent as metadata, before cursor scaling.
    pub cursor_theme_size: u32,
    pub align: u32,
    /// Offer dma-buf buffers when the renderer can allocate them.
    pub allow_dmabuf: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            min_framerate: 1,
            max_framerate: 25,
            buffers: BufferCount::default(),
            damage_regions: 16,
            cursor_theme_size: 24,
            align: 16,
            allow_dmabuf: true,
        }
    }
}

impl StreamConfig {
    pub fn with_max_framerate(mut self, max_framerate: u32) -> Self {
        self.max_framerate = max_framerate.max(self.min_framerate);
        self
    }

    pub fn with_dmabuf(mut self, allow_dmabuf: bool) -> Self {
        self.allow_dmabuf = allow_dmabuf;
        self
    }

    /// Bitmap edge in pixels for a cursor drawn at `scale`.
    pub fn cursor_bitmap_edge(&self, scale: f64) -> u32 {
        (self.cursor_theme_size as f64 * scale.max(0.0)).ceil() as u32
    }

    /// Shortest interval between two frames for a negotiated max framerate
    /// of `num/denom`. `None` disables throttling.
    pub fn frame_interval(num: u32, denom: u32) -> Option<Duration> {
        if num == 0 {
            return None;
        }
        Some(Duration::from_micros(
            1_000_000 * u64::from(denom) / u64::from(num),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_mode_parses_case_insensitive() {
        assert_eq!("Embedded".parse::<CursorMode>(), Ok(CursorMode::Embedded));
        assert_eq!("metadata".parse::<CursorMode>(), Ok(CursorMode::Metadata));
        assert_eq!("HIDDEN".parse::<CursorMode>(), Ok(CursorMode::Hidden));
        assert!("blink".parse::<CursorMode>().is_err());
        assert_eq!(CursorMode::Metadata.to_string(), "metadata");
    }

    #[test]
    fn defaults_match_nominal_limits() {
        let config = StreamConfig::default();
        assert_eq!(config.min_framerate, 1);
        assert_eq!(config.max_framerate, 25);
        assert_eq!(
            config.buffers,
            BufferCount {
                default: 16,
                min: 2,
                max: 16
            }
        );
        assert_eq!(config.damage_regions, 16);
    }

    #[test]
    fn frame_interval_from_fraction() {
        assert_eq!(
            StreamConfig::frame_interval(25, 1),
            Some(Duration::from_millis(40))
        );
        assert_eq!(StreamConfig::frame_interval(0, 1), None);
    }

    #[test]
    fn max_framerate_never_below_min() {
        let config = StreamConfig::default().with_max_framerate(0);
        assert_eq!(config.max_framerate, 1);
    }

    #[test]
    fn bitmap_edge_scales() {
        let config = StreamConfig::default();
        assert_eq!(config.cursor_bitmap_edge(1.0), 24);
        assert_eq!(config.cursor_bitmap_edge(1.5), 36);
    }
}
