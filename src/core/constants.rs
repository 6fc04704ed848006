//! Core constants shared by the projection math, metadata parsing and caches.
//! Keeping them in a single place makes it easier to tweak engine-wide magic numbers.

/// Kilometers per statute mile.
pub const KM_PER_MILE: f64 = 1.609344;

/// Latitude limit of the spherical Web-Mercator projection.
pub const MAX_LATITUDE: f64 = 85.0511287798;

/// Coordinate reference system assumed when a pyramid does not declare one.
pub const DEFAULT_CRS: &str = "EPSG:3857";

/// Consolidated metadata document of a v2 pyramid.
pub const V2_METADATA_FILE: &str = ".zmetadata";

/// Metadata document of every v3 group or array.
pub const V3_METADATA_FILE: &str = "zarr.json";

/// Vertices used when approximating a circular region with a polygon.
pub const DEFAULT_CIRCLE_STEPS: usize = 64;

/// Chunk cache capacity of the balanced profile.
pub const BALANCED_CHUNK_CAPACITY: usize = 4096;

/// Chunk cache capacity of the low-memory profile.
pub const LOW_MEMORY_CHUNK_CAPACITY: usize = 256;
