//! Tile addressing, per-tile state and the pyramid orchestrator.

pub mod flight;
pub mod key;
pub mod loading;
pub mod math;
pub mod pyramid;
pub mod region;
pub mod selector;
pub mod tile;

pub use key::{ChunkKey, TileKey, TileOffset};
pub use pyramid::{PyramidEvent, RenderItem, TilePyramid};
pub use tile::{ChunkLoader, Tile, TileStatus};
