//! # Gridlet
//!
//! A tile pyramid cache and chunk-loading engine for chunked, multi-resolution
//! raster datasets (Zarr pyramids) drawn onto an interactive map viewport.
//!
//! The engine maps camera state to the pyramid tiles covering the viewport,
//! fetches and caches the array chunks backing each tile with request
//! de-duplication, substitutes ancestor or descendant tiles while the exact
//! tile is still loading, and answers region aggregation queries over the
//! loaded data. Rendering, input handling and styling are left to the caller.

pub mod core;
pub mod prelude;
pub mod runtime;
pub mod store;
pub mod tiles;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{
    builder::PyramidBuilder,
    camera::CameraUpdate,
    config::{CacheConfig, CacheProfile, PyramidOptions, ZarrVersion},
    geo::{LngLat, Region, Units},
};

pub use store::{
    metadata::{DatasetDescription, PyramidMetadata},
    registry::MetadataRegistry,
    transport::{ByteRange, MemoryTransport, Transport},
    PyramidStore, StoreConfig,
};

pub use tiles::{
    key::{ChunkKey, TileKey, TileOffset},
    pyramid::{LoadingSnapshot, LoadingState, PyramidEvent, RenderItem, TilePyramid},
    region::{RegionResult, RegionValues},
    selector::{Band, CoordValue, Selector, SelectorValue},
    tile::{ChunkLoader, Tile, TileStatus},
};

#[cfg(feature = "http")]
pub use store::transport::HttpTransport;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for pyramid construction, chunk loading and buffer population.
///
/// Errors are `Clone` so a single failed in-flight fetch can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PyramidError {
    /// Malformed or missing pyramid metadata. Fatal for pyramid construction.
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Transport failure for a single chunk. Not cached; request again to retry.
    #[error("Chunk fetch error for {url}: {reason}")]
    ChunkFetch { url: String, reason: String },

    /// A selector addresses values spread over more than one chunk for a band.
    #[error("Expected 1 chunk for band '{band}', found {count}")]
    ChunkSpan { band: String, count: usize },

    /// Buffer population or a point read happened before the chunk loaded.
    #[error("Missing data for chunk: {chunk}")]
    MissingChunk { chunk: String },

    /// Invalid constructor parameters.
    #[error("Config error: {0}")]
    Config(String),

    /// A selector names a dimension or coordinate value the dataset lacks.
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    /// Chunk bytes could not be decoded into the declared dtype and shape.
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Error type alias for convenience
pub type Error = PyramidError;

impl From<serde_json::Error> for PyramidError {
    fn from(err: serde_json::Error) -> Self {
        PyramidError::Metadata(err.to_string())
    }
}
