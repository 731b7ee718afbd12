//! Stream configuration and control metadata.
//!
//! These types describe what the pipeline handler hands to an algorithm at
//! `configure` time: the active stream geometry and, per media entity, the
//! controls the entity exposes. Both mappings preserve insertion order
//! because that order must survive flattening across the ABI boundary.

use indexmap::IndexMap;

/// A pixel format identified by its fourcc code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    /// Build a pixel format from a fourcc character code.
    pub const fn fourcc(code: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(code))
    }

    /// The raw fourcc value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_le_bytes();
        for b in bytes {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

/// Configuration of one stream, fixed for the lifetime of a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream identifier, unique within the session.
    pub stream_id: u32,
    /// Pixel format of frames on this stream.
    pub pixel_format: PixelFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

/// Value range and default of a single control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlInfo {
    /// Minimum accepted value.
    pub min: i32,
    /// Maximum accepted value.
    pub max: i32,
    /// Default value.
    pub default: i32,
}

/// Controls exposed by one entity, keyed by control name.
///
/// Read-only from the algorithm's perspective.
pub type ControlInfoMap = IndexMap<String, ControlInfo>;

/// Active stream configurations, keyed by stream id.
pub type StreamConfigMap = IndexMap<u32, StreamConfig>;

/// Controls per media entity, keyed by entity id.
pub type EntityControlMap = IndexMap<u32, ControlInfoMap>;
