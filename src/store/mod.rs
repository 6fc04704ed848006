//! Access to a Zarr pyramid: metadata discovery, coordinate loading and
//! de-duplicated, cached chunk fetches.

pub mod cache;
pub mod codec;
pub mod metadata;
pub mod registry;
pub mod transport;

pub use cache::{Chunk, ChunkCache};

use crate::constants::{DEFAULT_CRS, V2_METADATA_FILE, V3_METADATA_FILE};
use crate::core::config::{CacheConfig, ZarrVersion};
use crate::prelude::{Arc, HashMap, Mutex};
use crate::tiles::flight::SingleFlight;
use crate::tiles::key::{ChunkKey, TileKey};
use crate::tiles::loading::{LoadKind, LoadingState};
use crate::tiles::selector::{CoordValue, Selector};
use crate::{Error, Result};
use codec::ShardEntry;
use metadata::{ArrayMetadata, DatasetDescription, PyramidMetadata};
use registry::{Coordinates, MetadataRegistry};
use serde_json::Value;
use std::sync::PoisonError;
use tokio::sync::Semaphore;
use transport::{join_url, ByteRange, Transport};

type ShardIndex = Arc<Vec<Option<ShardEntry>>>;

/// Handle to an opened pyramid. Cheap to clone.
#[derive(Clone)]
pub struct PyramidStore {
    inner: Arc<StoreInner>,
    dataset: Arc<DatasetDescription>,
}

impl std::fmt::Debug for PyramidStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PyramidStore")
            .field("source", &self.inner.source)
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    source: String,
    version: ZarrVersion,
    transport: Arc<dyn Transport>,
    registry: Arc<MetadataRegistry>,
    metadata: PyramidMetadata,
    /// Consolidated v2 metadata; v3 arrays are fetched per level
    consolidated: Option<Arc<Value>>,
    arrays: Mutex<HashMap<String, Arc<ArrayMetadata>>>,
    shard_indexes: Mutex<HashMap<(String, ChunkKey), ShardIndex>>,
    chunks: ChunkCache,
    chunk_flight: SingleFlight<(String, ChunkKey), Chunk>,
    fetch_limit: Option<Semaphore>,
    loading: Arc<LoadingState>,
}

/// Inputs needed to open a store
pub struct StoreConfig {
    pub source: String,
    pub variable: String,
    pub version: ZarrVersion,
    pub cache: CacheConfig,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<MetadataRegistry>,
    pub loading: Arc<LoadingState>,
}

impl PyramidStore {
    /// Reads the pyramid metadata, the drawn variable's array metadata and the
    /// coordinates of its non-spatial dimensions.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let StoreConfig {
            source,
            variable,
            version,
            cache,
            transport,
            registry,
            loading,
        } = config;
        cache.validate()?;
        let source = source.trim_end_matches('/').to_string();

        let progress = Arc::clone(&loading);
        let _guard = progress.begin(LoadKind::Metadata);

        let root_url = match version {
            ZarrVersion::V2 => join_url(&source, V2_METADATA_FILE),
            ZarrVersion::V3 => join_url(&source, V3_METADATA_FILE),
        };
        let root = registry
            .document(Arc::clone(&transport), version, &root_url)
            .await?;

        let (multiscales, consolidated) = match version {
            ZarrVersion::V2 => {
                let multiscales = root.pointer("/metadata/.zattrs/multiscales").cloned();
                (multiscales, Some(Arc::clone(&root)))
            }
            ZarrVersion::V3 => (root.pointer("/attributes/multiscales").cloned(), None),
        };
        let metadata = PyramidMetadata::from_multiscales(multiscales.as_ref())?;

        if metadata.crs != DEFAULT_CRS {
            log::warn!(
                "pyramid {} declares crs {}; tiles are addressed as {}",
                source,
                metadata.crs,
                DEFAULT_CRS
            );
        }

        let chunk_limit = cache.max_concurrent_fetches.map(Semaphore::new);
        let store = StoreInner {
            source,
            version,
            transport,
            registry,
            metadata,
            consolidated,
            arrays: Mutex::new(HashMap::default()),
            shard_indexes: Mutex::new(HashMap::default()),
            chunks: ChunkCache::new(cache.chunk_cache_capacity),
            chunk_flight: SingleFlight::new(),
            fetch_limit: chunk_limit,
            loading,
        };

        let base_level = store.metadata.levels.iter().copied().min().unwrap_or(0);
        let base = store.array(&variable_path(base_level, &variable)).await?;
        let mut dataset =
            DatasetDescription::new(&variable, version, &base, store.metadata.tile_size)?;

        if base.chunk_shape[dataset.x_axis()] != store.metadata.tile_size as u64
            || base.chunk_shape[dataset.y_axis()] != store.metadata.tile_size as u64
        {
            return Err(Error::Metadata(format!(
                "spatial chunks of '{}' must match pixels_per_tile ({})",
                variable, store.metadata.tile_size
            )));
        }

        let extra: Vec<(usize, String)> = dataset
            .dimensions
            .iter()
            .enumerate()
            .filter(|(axis, _)| !dataset.is_spatial(*axis))
            .map(|(axis, name)| (axis, name.clone()))
            .collect();
        for (axis, dimension) in extra {
            let values = store
                .coordinates(base_level, &dimension, dataset.shape[axis])
                .await?;
            dataset.coordinates.insert(dimension, values.as_ref().clone());
        }

        log::info!(
            "opened {} pyramid {} ({} levels, variable '{}')",
            store.version,
            store.source,
            store.metadata.levels.len(),
            variable
        );

        Ok(Self {
            inner: Arc::new(store),
            dataset: Arc::new(dataset),
        })
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn version(&self) -> ZarrVersion {
        self.inner.version
    }

    pub fn metadata(&self) -> &PyramidMetadata {
        &self.inner.metadata
    }

    pub fn dataset(&self) -> Arc<DatasetDescription> {
        Arc::clone(&self.dataset)
    }

    pub fn loading_state(&self) -> Arc<LoadingState> {
        Arc::clone(&self.inner.loading)
    }

    /// Chunks of the drawn variable needed to show `selector` on `tile`
    pub fn chunk_keys(&self, selector: &Selector, tile: TileKey) -> Result<Vec<ChunkKey>> {
        self.dataset.chunk_keys(selector, tile)
    }

    /// Coordinate values along `dimension`, from the registry when cached
    pub async fn load_coordinates(&self, dimension: &str) -> Result<Coordinates> {
        let dataset = &self.dataset;
        let axis = dataset
            .dimensions
            .iter()
            .position(|d| d == dimension)
            .ok_or_else(|| {
                Error::InvalidSelector(format!(
                    "'{}' is not a dimension of '{}'",
                    dimension, dataset.variable
                ))
            })?;
        let base_level = self.inner.metadata.levels.iter().copied().min().unwrap_or(0);
        let _guard = self.inner.loading.begin(LoadKind::Metadata);
        self.inner
            .coordinates(base_level, dimension, dataset.shape[axis])
            .await
    }

    /// Chunk `chunk` of the drawn variable at pyramid level `level`.
    ///
    /// Concurrent requests for the same chunk share one fetch; a chunk absent
    /// from the store decodes to an array of the fill value.
    pub async fn get_chunk(&self, level: u8, chunk: &ChunkKey) -> Result<Chunk> {
        let path = variable_path(level, &self.dataset.variable);
        self.get_array_chunk(&path, chunk).await
    }

    /// Chunk `chunk` of the array stored at `path` relative to the source
    pub async fn get_array_chunk(&self, path: &str, chunk: &ChunkKey) -> Result<Chunk> {
        let cache_key = (path.to_string(), chunk.clone());
        if let Some(cached) = self.inner.chunks.get(&cache_key) {
            return Ok(cached);
        }

        let inner = Arc::clone(&self.inner);
        self.inner
            .chunk_flight
            .get_or_create(cache_key.clone(), move || inner.load_chunk(cache_key))
            .await
    }

    /// Whether a chunk is already decoded in the store cache
    pub fn is_cached(&self, level: u8, chunk: &ChunkKey) -> bool {
        let path = variable_path(level, &self.dataset.variable);
        self.inner.chunks.contains(&(path, chunk.clone()))
    }

    pub fn cached_chunk_count(&self) -> usize {
        self.inner.chunks.len()
    }

    /// Number of chunk fetches currently in flight
    pub fn pending_chunk_count(&self) -> usize {
        self.inner.chunk_flight.len()
    }
}

fn variable_path(level: u8, variable: &str) -> String {
    format!("{}/{}", level, variable)
}

fn positional(length: u64) -> Coordinates {
    Arc::new((0..length).map(|i| CoordValue::Number(i as f64)).collect())
}

impl StoreInner {
    /// Array metadata of `path`, parsed once per store
    async fn array(&self, path: &str) -> Result<Arc<ArrayMetadata>> {
        let cached = self.arrays.lock().ok().and_then(|a| a.get(path).cloned());
        if let Some(array) = cached {
            return Ok(array);
        }

        let array = match &self.consolidated {
            Some(consolidated) => {
                let entry = |suffix: &str| {
                    consolidated
                        .get("metadata")
                        .and_then(|m| m.get(format!("{}/{}", path, suffix)))
                };
                let zarray = entry(".zarray").ok_or_else(|| {
                    Error::Metadata(format!("array '{}' not found in consolidated metadata", path))
                })?;
                ArrayMetadata::from_v2(zarray, entry(".zattrs"))?
            }
            None => {
                let url = join_url(&self.source, &format!("{}/{}", path, V3_METADATA_FILE));
                let doc = self
                    .registry
                    .document(Arc::clone(&self.transport), self.version, &url)
                    .await?;
                ArrayMetadata::from_v3(&doc)?
            }
        };

        let array = Arc::new(array);
        if let Ok(mut arrays) = self.arrays.lock() {
            arrays.insert(path.to_string(), Arc::clone(&array));
        }
        Ok(array)
    }

    /// Body of a chunk flight. A flight that finished between the caller's
    /// cache miss and this flight starting has already filled the cache.
    async fn load_chunk(self: Arc<Self>, key: (String, ChunkKey)) -> Result<Chunk> {
        if let Some(cached) = self.chunks.get(&key) {
            return Ok(cached);
        }
        let _guard = self.loading.begin(LoadKind::Fetches);
        let (path, chunk) = &key;
        let array = self.array(path).await?;
        let decoded = Arc::new(self.fetch_chunk(path, &array, chunk).await?);
        self.chunks.put(key, Arc::clone(&decoded));
        Ok(decoded)
    }

    fn has_array(&self, path: &str) -> Option<bool> {
        self.consolidated.as_ref().map(|consolidated| {
            consolidated
                .get("metadata")
                .and_then(|m| m.get(format!("{}/.zarray", path)))
                .is_some()
        })
    }

    async fn coordinates(&self, level: u8, dimension: &str, length: u64) -> Result<Coordinates> {
        let path = format!("{}/{}", level, dimension);

        if self.has_array(&path) == Some(false) {
            log::debug!("no coordinate array for '{}'; using positional indices", dimension);
            return Ok(positional(length));
        }

        let array = match self.array(&path).await {
            Ok(array) => array,
            Err(Error::Metadata(reason)) if self.consolidated.is_none() => {
                log::debug!(
                    "no coordinate array for '{}' ({}); using positional indices",
                    dimension,
                    reason
                );
                return Ok(positional(length));
            }
            Err(e) => return Err(e),
        };
        let key = join_url(&self.source, &path);
        let transport = Arc::clone(&self.transport);
        let source = self.source.clone();

        self.registry
            .coordinates(key, move || async move {
                log::debug!("loading coordinates {}/{}", source, path);
                let grid = array.chunk_grid();
                let chunk_count = grid.first().copied().unwrap_or(0);
                let mut values = Vec::with_capacity(length as usize);
                for index in 0..chunk_count {
                    let chunk = ChunkKey::new(vec![index]);
                    let url = join_url(&source, &format!("{}/{}", path, array.key_encoding.encode(&chunk)));
                    match transport.fetch_bytes(&url, None).await? {
                        Some(bytes) => {
                            let mut decoded = codec::decode_coordinates(&bytes, &array.codec)?;
                            decoded.truncate(array.chunk_shape[0] as usize);
                            values.extend(decoded);
                        }
                        None => values.extend(
                            (0..array.chunk_shape[0]).map(|_| CoordValue::Number(f64::NAN)),
                        ),
                    }
                }
                values.truncate(length as usize);
                Ok(Arc::new(values))
            })
            .await
    }

    async fn fetch_chunk(
        &self,
        path: &str,
        array: &ArrayMetadata,
        chunk: &ChunkKey,
    ) -> Result<ndarray::ArrayD<f32>> {
        let _permit = match &self.fetch_limit {
            Some(limit) => Some(limit.acquire().await.map_err(|e| Error::ChunkFetch {
                url: path.to_string(),
                reason: e.to_string(),
            })?),
            None => None,
        };

        let bytes = match &array.sharding {
            None => {
                let url = join_url(
                    &self.source,
                    &format!("{}/{}", path, array.key_encoding.encode(chunk)),
                );
                self.loading.record_fetch();
                log::trace!("fetching chunk {}", url);
                self.transport.fetch_bytes(&url, None).await
            }
            Some(_) => self.fetch_sharded(path, array, chunk).await,
        }
        .map_err(|e| {
            log::warn!("failed to fetch chunk {} of {}: {}", chunk, path, e);
            e
        })?;

        match bytes {
            Some(bytes) => codec::decode_chunk(&bytes, &array.codec, &array.chunk_shape),
            None => Ok(codec::fill_chunk(&array.chunk_shape, array.fill_value)),
        }
    }

    async fn fetch_sharded(
        &self,
        path: &str,
        array: &ArrayMetadata,
        chunk: &ChunkKey,
    ) -> Result<Option<Vec<u8>>> {
        let sharding = match &array.sharding {
            Some(sharding) => sharding,
            None => return Ok(None),
        };
        let per_shard = sharding.chunks_per_shard(&array.chunk_shape);
        let shard = ChunkKey::new(
            chunk
                .indices()
                .iter()
                .zip(&per_shard)
                .map(|(index, per)| index / per)
                .collect(),
        );
        let url = join_url(
            &self.source,
            &format!("{}/{}", path, array.key_encoding.encode(&shard)),
        );

        let index = match self.shard_index(path, array, &shard, &url).await? {
            Some(index) => index,
            None => return Ok(None),
        };

        let position = codec::shard_position(chunk.indices(), &per_shard);
        let entry = match index.get(position).copied().flatten() {
            Some(entry) => entry,
            None => return Ok(None),
        };

        self.loading.record_fetch();
        log::trace!("fetching chunk {} from shard {}", chunk, url);
        self.transport
            .fetch_bytes(
                &url,
                Some(ByteRange::Span {
                    offset: entry.offset,
                    length: entry.nbytes,
                }),
            )
            .await
    }

    async fn shard_index(
        &self,
        path: &str,
        array: &ArrayMetadata,
        shard: &ChunkKey,
        url: &str,
    ) -> Result<Option<ShardIndex>> {
        let key = (path.to_string(), shard.clone());
        let cached = self.shard_indexes.lock().ok().and_then(|s| s.get(&key).cloned());
        if let Some(index) = cached {
            return Ok(Some(index));
        }
        let sharding = match &array.sharding {
            Some(sharding) => sharding,
            None => return Ok(None),
        };

        let size = sharding.index_size(&array.chunk_shape);
        let range = if sharding.index_at_start {
            ByteRange::Span {
                offset: 0,
                length: size,
            }
        } else {
            ByteRange::Suffix(size)
        };

        self.loading.record_fetch();
        let bytes = match self.transport.fetch_bytes(url, Some(range)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let count = sharding.chunks_per_shard(&array.chunk_shape).iter().product::<u64>();
        let index = Arc::new(codec::parse_shard_index(
            &bytes,
            count as usize,
            sharding.index_checksum,
        )?);

        self.shard_indexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&index));
        Ok(Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};
    use serde_json::json;
    use transport::MemoryTransport;

    const SOURCE: &str = "mem://single";

    async fn single_chunk_store(transport: &Arc<MemoryTransport>) -> PyramidStore {
        transport.insert_json(
            format!("{}/.zmetadata", SOURCE),
            &json!({ "metadata": {
                ".zattrs": { "multiscales": [{ "datasets": [{ "path": "0", "pixels_per_tile": 2 }] }] },
                "0/tavg/.zarray": {
                    "shape": [2, 2], "chunks": [2, 2], "dtype": "<f4",
                    "compressor": null, "filters": null, "fill_value": null, "order": "C"
                },
                "0/tavg/.zattrs": { "_ARRAY_DIMENSIONS": ["y", "x"] },
            } }),
        );
        transport.insert(format!("{}/0/tavg/0.0", SOURCE), vec![0u8; 16]);

        PyramidStore::open(StoreConfig {
            source: SOURCE.to_string(),
            variable: "tavg".to_string(),
            version: ZarrVersion::V2,
            cache: CacheConfig::default(),
            transport: Arc::clone(transport) as Arc<dyn Transport>,
            registry: Arc::new(MetadataRegistry::new()),
            loading: Arc::new(LoadingState::new()),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_flight_reuses_chunk_cached_after_caller_missed() {
        let transport = Arc::new(MemoryTransport::new());
        let store = single_chunk_store(&transport).await;
        let url = format!("{}/0/tavg/0.0", SOURCE);

        // A flight that completed after this caller checked the cache
        let key = ("0/tavg".to_string(), ChunkKey::new(vec![0, 0]));
        let cached: Chunk = Arc::new(ArrayD::from_elem(IxDyn(&[2, 2]), 7.0));
        store.inner.chunks.put(key.clone(), Arc::clone(&cached));

        let loaded = Arc::clone(&store.inner).load_chunk(key).await.unwrap();
        assert!(Arc::ptr_eq(&loaded, &cached));
        assert_eq!(transport.request_count(&url), 0);
        assert_eq!(store.loading_state().snapshot().fetched, 0);
    }

    #[tokio::test]
    async fn test_flight_fetches_uncached_chunk_once() {
        let transport = Arc::new(MemoryTransport::new());
        let store = single_chunk_store(&transport).await;
        let key = ("0/tavg".to_string(), ChunkKey::new(vec![0, 0]));

        let loaded = Arc::clone(&store.inner).load_chunk(key.clone()).await.unwrap();
        assert_eq!(loaded.shape(), &[2, 2]);
        assert_eq!(transport.request_count(&format!("{}/0/tavg/0.0", SOURCE)), 1);
        assert!(store.inner.chunks.contains(&key));
        assert!(!store.loading_state().is_fetching());
    }
}
