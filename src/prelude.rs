//! Prelude module for common gridlet types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use gridlet::prelude::*;`

pub use crate::core::{
    builder::PyramidBuilder,
    camera::{CameraUpdate, ViewportSize},
    config::{CacheConfig, CacheProfile, PyramidOptions, ZarrVersion},
    geo::{LngLat, Region, Units},
};

pub use crate::store::{
    metadata::{DatasetDescription, PyramidMetadata},
    registry::MetadataRegistry,
    transport::{ByteRange, MemoryTransport, Transport},
    Chunk, PyramidStore, StoreConfig,
};

pub use crate::tiles::{
    key::{ChunkKey, TileKey, TileOffset},
    math,
    pyramid::{LoadingSnapshot, LoadingState, PyramidEvent, RenderItem, TilePyramid},
    region::{RegionResult, RegionValues},
    selector::{Band, CoordValue, Selector, SelectorValue},
    tile::{ChunkLoader, Tile, TileStatus},
};

pub use crate::runtime::{AsyncHandle, AsyncSpawner, TokioSpawner};

pub use crate::{Error as PyramidError, Result};

pub use std::sync::{Arc, Mutex};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet, FxHasher};

pub use futures::future::{BoxFuture, Future};
pub use std::pin::Pin;
