//! Per-tile chunk and buffer state.

use crate::prelude::{Arc, HashMap, Mutex};
use crate::store::metadata::DatasetDescription;
use crate::store::{Chunk, PyramidStore};
use crate::tiles::flight::SharedResult;
use crate::tiles::key::{ChunkKey, TileKey};
use crate::tiles::selector::{band_information, CoordValue, Selector};
use crate::{Error, Result};
use futures::future::{self, BoxFuture, FutureExt};
use ndarray::IxDyn;
use std::sync::{MutexGuard, PoisonError};

/// Source of chunk data for tiles
pub trait ChunkLoader: Send + Sync {
    fn load(&self, level: u8, chunk: ChunkKey) -> BoxFuture<'static, Result<Chunk>>;
}

impl ChunkLoader for PyramidStore {
    fn load(&self, level: u8, chunk: ChunkKey) -> BoxFuture<'static, Result<Chunk>> {
        let store = self.clone();
        async move { store.get_chunk(level, &chunk).await }.boxed()
    }
}

/// Lifecycle of a tile's buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    /// Nothing requested yet
    Empty,
    /// At least one chunk request is outstanding
    Loading,
    /// Buffers hold the selector with this hash
    Ready(u64),
}

/// One value of a pixel together with the non-spatial coordinates it sits at
#[derive(Debug, Clone, PartialEq)]
pub struct PointValue {
    /// Coordinate values of the non-spatial dimensions, in axis order
    pub keys: Vec<CoordValue>,
    pub value: f32,
}

/// Band name to populated 2-D buffer, rows of `tile_size` values north to south
pub type Buffers = HashMap<String, Arc<Vec<f32>>>;

#[derive(Default)]
struct TileState {
    chunks: HashMap<ChunkKey, Chunk>,
    pending: HashMap<ChunkKey, SharedResult<Chunk>>,
    buffers: Buffers,
    buffer_cache: Option<u64>,
}

pub struct Tile {
    key: TileKey,
    dataset: Arc<DatasetDescription>,
    bands: Vec<String>,
    loader: Arc<dyn ChunkLoader>,
    state: Arc<Mutex<TileState>>,
}

impl Tile {
    pub fn new(
        key: TileKey,
        dataset: Arc<DatasetDescription>,
        bands: Vec<String>,
        loader: Arc<dyn ChunkLoader>,
    ) -> Self {
        Self {
            key,
            dataset,
            bands,
            loader,
            state: Arc::new(Mutex::new(TileState::default())),
        }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn bands(&self) -> &[String] {
        &self.bands
    }

    fn lock(&self) -> MutexGuard<'_, TileState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers requests for every chunk of `keys` that is neither loaded nor
    /// already pending, without awaiting anything.
    ///
    /// Returns a future resolving once all of `keys` are loaded, and whether
    /// any of them was missing at call time.
    pub fn request_chunks(&self, keys: &[ChunkKey]) -> (BoxFuture<'static, Result<()>>, bool) {
        let mut state = self.lock();
        let mut waits = Vec::new();

        for chunk in keys {
            if state.chunks.contains_key(chunk) {
                continue;
            }
            let shared = match state.pending.get(chunk) {
                Some(pending) => pending.clone(),
                None => {
                    let shared = self.chunk_request(chunk.clone());
                    state.pending.insert(chunk.clone(), shared.clone());
                    shared
                }
            };
            waits.push(shared);
        }

        let newly = !waits.is_empty();
        let all = async move {
            future::try_join_all(waits).await?;
            Ok(())
        }
        .boxed();
        (all, newly)
    }

    fn chunk_request(&self, chunk: ChunkKey) -> SharedResult<Chunk> {
        let request = self.loader.load(self.key.z, chunk.clone());
        let state = Arc::clone(&self.state);
        let key = self.key;
        async move {
            let result = request.await;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.pending.remove(&chunk);
            match &result {
                Ok(data) => {
                    state.chunks.insert(chunk, Arc::clone(data));
                }
                Err(e) => log::debug!("tile {} failed to load chunk {}: {}", key, chunk, e),
            }
            result
        }
        .boxed()
        .shared()
    }

    /// Loads every chunk of `keys`; `true` iff at least one was not loaded at
    /// call time.
    pub async fn load_chunks(&self, keys: &[ChunkKey]) -> Result<bool> {
        let (all, newly) = self.request_chunks(keys);
        all.await?;
        Ok(newly)
    }

    /// Whether every chunk of `keys` is loaded
    pub fn has_chunks(&self, keys: &[ChunkKey]) -> bool {
        let state = self.lock();
        keys.iter().all(|k| state.chunks.contains_key(k))
    }

    /// Whether every chunk of `keys` is either loaded or being loaded
    pub fn is_requested(&self, keys: &[ChunkKey]) -> bool {
        let state = self.lock();
        keys.iter()
            .all(|k| state.chunks.contains_key(k) || state.pending.contains_key(k))
    }

    /// Fills every band buffer for `selector` from loaded chunks.
    ///
    /// Each band must be served by exactly one chunk. Nothing is modified when
    /// population fails.
    pub fn populate_buffers_sync(&self, selector: &Selector) -> Result<()> {
        let bands = band_information(selector);
        let mut state = self.lock();
        let mut buffers = Buffers::default();

        for name in &self.bands {
            let band_selector = bands
                .iter()
                .find(|b| &b.name == name)
                .map(|b| &b.selector)
                .unwrap_or(selector);

            let chunks = self.dataset.chunk_keys(band_selector, self.key)?;
            if chunks.len() != 1 {
                return Err(Error::ChunkSpan {
                    band: name.clone(),
                    count: chunks.len(),
                });
            }
            let chunk = &chunks[0];
            let data = state.chunks.get(chunk).ok_or_else(|| Error::MissingChunk {
                chunk: chunk.to_string(),
            })?;

            buffers.insert(name.clone(), Arc::new(self.slice(data, band_selector)?));
        }

        state.buffers = buffers;
        state.buffer_cache = Some(selector.hash_key());
        Ok(())
    }

    /// [`Tile::load_chunks`] then [`Tile::populate_buffers_sync`]
    pub async fn populate_buffers(&self, keys: &[ChunkKey], selector: &Selector) -> Result<bool> {
        let newly = self.load_chunks(keys).await?;
        self.populate_buffers_sync(selector)?;
        Ok(newly)
    }

    /// Planes addressed by `selector` within `data`, concatenated in selector
    /// order, each `tile_size` rows from north to south.
    fn slice(&self, data: &Chunk, selector: &Selector) -> Result<Vec<f32>> {
        let planes = self.plane_indices(selector, None)?;
        let (x_axis, y_axis) = (self.dataset.x_axis(), self.dataset.y_axis());
        let (width, height) = (data.shape()[x_axis], data.shape()[y_axis]);
        let fill = self.dataset.fill_value;

        let mut out = Vec::with_capacity(planes.len() * width * height);
        for (mut index, _) in planes {
            for y in 0..height {
                index[y_axis] = y;
                for x in 0..width {
                    index[x_axis] = x;
                    out.push(data.get(IxDyn(&index)).copied().unwrap_or(fill));
                }
            }
        }
        Ok(out)
    }

    /// In-chunk index vectors of every non-spatial position `selector`
    /// addresses, with their coordinate keys. Spatial entries are left at 0.
    ///
    /// With `within` set, only positions stored in that chunk are returned and
    /// unselected dimensions contribute every position in the chunk;
    /// otherwise unselected dimensions use their first position.
    fn plane_indices(
        &self,
        selector: &Selector,
        within: Option<&ChunkKey>,
    ) -> Result<Vec<(Vec<usize>, Vec<CoordValue>)>> {
        let dataset = &self.dataset;
        let mut combos: Vec<(Vec<usize>, Vec<CoordValue>)> =
            vec![(vec![0; dataset.dimensions.len()], Vec::new())];

        for (axis, dimension) in dataset.dimensions.iter().enumerate() {
            if dataset.is_spatial(axis) {
                continue;
            }
            let chunk_len = dataset.chunk_shape[axis] as usize;
            let coords = dataset.coordinates.get(dimension);

            let positions: Vec<(usize, CoordValue)> = match selector.get(dimension) {
                Some(value) => value
                    .values()
                    .iter()
                    .map(|v| Ok((dataset.coordinate_index(dimension, v)?, v.clone())))
                    .collect::<Result<_>>()?,
                None => {
                    let range = match within {
                        Some(chunk) => {
                            let start = chunk.indices()[axis] as usize * chunk_len;
                            let end = (start + chunk_len).min(dataset.shape[axis] as usize);
                            start..end
                        }
                        None => 0..1,
                    };
                    range
                        .map(|i| {
                            let key = coords
                                .and_then(|c| c.get(i).cloned())
                                .unwrap_or(CoordValue::Number(i as f64));
                            (i, key)
                        })
                        .collect()
                }
            };

            let positions = positions.into_iter().filter(|(global, _)| {
                within.map_or(true, |chunk| {
                    (global / chunk_len) as u64 == chunk.indices()[axis]
                })
            });
            let positions: Vec<(usize, CoordValue)> = positions.collect();

            combos = combos
                .into_iter()
                .flat_map(|(index, keys)| {
                    positions.iter().map(move |(global, key)| {
                        let mut index = index.clone();
                        let mut keys = keys.clone();
                        index[axis] = global % chunk_len;
                        keys.push(key.clone());
                        (index, keys)
                    })
                })
                .collect();
        }

        Ok(combos)
    }

    /// Whether any buffer has been populated
    pub fn is_buffer_populated(&self) -> bool {
        self.lock().buffer_cache.is_some()
    }

    /// Whether the buffers hold `selector`
    pub fn has_populated_buffer(&self, selector: &Selector) -> bool {
        self.lock().buffer_cache == Some(selector.hash_key())
    }

    /// Every value `selector` addresses at pixel `(x, y)` of this tile.
    pub fn get_point_values(&self, selector: &Selector, point: (u32, u32)) -> Result<Vec<PointValue>> {
        let (x, y) = (point.0 as usize, point.1 as usize);
        let (x_axis, y_axis) = (self.dataset.x_axis(), self.dataset.y_axis());
        let chunks = self.dataset.chunk_keys(selector, self.key)?;
        let state = self.lock();

        let mut values = Vec::new();
        for chunk in &chunks {
            let data = state.chunks.get(chunk).ok_or_else(|| Error::MissingChunk {
                chunk: chunk.to_string(),
            })?;
            for (mut index, keys) in self.plane_indices(selector, Some(chunk))? {
                index[x_axis] = x;
                index[y_axis] = y;
                let value = data
                    .get(IxDyn(&index))
                    .copied()
                    .unwrap_or(self.dataset.fill_value);
                values.push(PointValue { keys, value });
            }
        }
        Ok(values)
    }

    pub fn status(&self) -> TileStatus {
        let state = self.lock();
        if !state.pending.is_empty() {
            TileStatus::Loading
        } else if let Some(hash) = state.buffer_cache {
            TileStatus::Ready(hash)
        } else {
            TileStatus::Empty
        }
    }

    /// Snapshot of the band buffers
    pub fn buffers(&self) -> Buffers {
        self.lock().buffers.clone()
    }

    pub fn loaded_chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    /// Releases buffers, chunk data and pending requests
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.chunks.clear();
        state.pending.clear();
        state.buffers.clear();
        state.buffer_cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ZarrVersion;
    use crate::store::metadata::ArrayMetadata;
    use ndarray::ArrayD;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves `value = month * 100 + y * 10 + x` for a `[month, y, x]` array
    /// with two months per chunk.
    struct FakeLoader {
        calls: AtomicUsize,
    }

    impl ChunkLoader for FakeLoader {
        fn load(&self, _level: u8, chunk: ChunkKey) -> BoxFuture<'static, Result<Chunk>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                let month0 = chunk.indices()[0] as usize * 2;
                let data = ArrayD::from_shape_fn(IxDyn(&[2, 4, 4]), |ix| {
                    ((month0 + ix[0]) * 100 + ix[1] * 10 + ix[2]) as f32
                });
                Ok(Arc::new(data))
            }
            .boxed()
        }
    }

    fn tile(bands: Vec<String>) -> (Tile, Arc<FakeLoader>) {
        let zarray = json!({
            "shape": [4, 8, 8], "chunks": [2, 4, 4], "dtype": "<f4", "compressor": null
        });
        let zattrs = json!({ "_ARRAY_DIMENSIONS": ["month", "y", "x"] });
        let array = ArrayMetadata::from_v2(&zarray, Some(&zattrs)).unwrap();
        let mut dataset = DatasetDescription::new("tavg", ZarrVersion::V2, &array, 4).unwrap();
        dataset.coordinates.insert(
            "month".into(),
            (0..4).map(|m| CoordValue::Number(m as f64)).collect(),
        );
        let loader = Arc::new(FakeLoader {
            calls: AtomicUsize::new(0),
        });
        let tile = Tile::new(
            TileKey::new(1, 0, 1),
            Arc::new(dataset),
            bands,
            loader.clone(),
        );
        (tile, loader)
    }

    #[tokio::test]
    async fn test_load_chunks_reports_new_loads_once() {
        let (tile, loader) = tile(vec!["tavg".into()]);
        let keys = vec![ChunkKey::new(vec![0, 0, 1])];

        let (a, b) = futures::join!(tile.load_chunks(&keys), tile.load_chunks(&keys));
        assert_eq!(a, Ok(true));
        assert_eq!(b, Ok(true));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        assert_eq!(tile.load_chunks(&keys).await, Ok(false));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_populate_requires_loaded_chunk() {
        let (tile, _) = tile(vec!["tavg".into()]);
        let selector = Selector::new().with("month", 1);

        assert!(matches!(
            tile.populate_buffers_sync(&selector),
            Err(Error::MissingChunk { .. })
        ));
        assert_eq!(tile.status(), TileStatus::Empty);

        let keys = tile.dataset.chunk_keys(&selector, tile.key()).unwrap();
        tile.populate_buffers(&keys, &selector).await.unwrap();

        let buffer = &tile.buffers()["tavg"];
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer[0], 100.0);
        assert_eq!(buffer[5], 111.0);
        assert_eq!(tile.status(), TileStatus::Ready(selector.hash_key()));
    }

    #[tokio::test]
    async fn test_band_spanning_chunks_is_rejected() {
        let (tile, _) = tile(vec!["tavg".into()]);
        let selector = Selector::new().with("month", vec![1, 2]);
        let keys = tile.dataset.chunk_keys(&selector, tile.key()).unwrap();
        tile.load_chunks(&keys).await.unwrap();

        assert_eq!(
            tile.populate_buffers_sync(&selector),
            Err(Error::ChunkSpan {
                band: "tavg".into(),
                count: 2
            })
        );
    }

    #[tokio::test]
    async fn test_buffer_currency_follows_selector() {
        let (tile, loader) = tile(vec!["month_0".into(), "month_1".into()]);
        let both = Selector::new().with("month", vec![0, 1]);
        let keys = tile.dataset.chunk_keys(&both, tile.key()).unwrap();

        assert!(!tile.has_populated_buffer(&both));
        tile.populate_buffers(&keys, &both).await.unwrap();
        assert!(tile.has_populated_buffer(&both));
        assert_eq!(tile.buffers()["month_1"][0], 100.0);

        let other = Selector::new().with("month", vec![1, 0]);
        assert!(!tile.has_populated_buffer(&other));
        tile.populate_buffers_sync(&other).unwrap();
        assert!(tile.has_populated_buffer(&other));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_point_values_cover_unselected_dimensions() {
        let (tile, _) = tile(vec!["tavg".into()]);
        let selector = Selector::new();
        assert!(matches!(
            tile.get_point_values(&selector, (2, 3)),
            Err(Error::MissingChunk { .. })
        ));

        let keys = tile.dataset.chunk_keys(&selector, tile.key()).unwrap();
        tile.load_chunks(&keys).await.unwrap();
        let values = tile.get_point_values(&selector, (2, 3)).unwrap();

        let flat: Vec<f32> = values.iter().map(|v| v.value).collect();
        assert_eq!(flat, vec![32.0, 132.0, 232.0, 332.0]);
        assert_eq!(values[3].keys, vec![CoordValue::Number(3.0)]);

        tile.cleanup();
        assert_eq!(tile.loaded_chunk_count(), 0);
        assert!(!tile.is_buffer_populated());
    }
}
