//! The tile pyramid orchestrator.
//!
//! A [`TilePyramid`] owns one [`Tile`] per pyramid cell, tracks the tiles the
//! viewport needs, issues chunk loads through an [`AsyncSpawner`] and assembles
//! the render list, substituting ancestor or descendant tiles while the exact
//! ones are loading.

use crate::core::camera::CameraUpdate;
use crate::prelude::{Arc, HashMap, Mutex};
use crate::runtime::{AsyncHandle, AsyncSpawner};
use crate::store::metadata::{DatasetDescription, PyramidMetadata};
use crate::store::PyramidStore;
use crate::tiles::key::{TileKey, TileOffset};
use crate::tiles::loading::LoadKind;
use crate::tiles::math;
use crate::tiles::selector::{bands_for, Selector};
use crate::tiles::tile::{Buffers, ChunkLoader, Tile};
use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{MutexGuard, PoisonError};

pub use crate::tiles::loading::{LoadingSnapshot, LoadingState};

/// Notifications for the host's render loop
#[derive(Debug, Clone, PartialEq)]
pub enum PyramidEvent {
    /// New buffers are ready; call [`TilePyramid::render_list`] again
    Redraw,
    /// A chunk load for `tile` failed; requesting the tile again retries
    ChunkFailed { tile: TileKey, error: Error },
}

/// One tile to draw
#[derive(Debug, Clone)]
pub struct RenderItem {
    pub key: TileKey,
    /// On-screen positions to draw the tile at
    pub offsets: Vec<TileOffset>,
    /// Level the viewport is drawn at; differs from `key.z` for substitutes
    pub level: u8,
    pub buffers: Buffers,
}

#[derive(Debug, Default)]
pub(crate) struct ViewState {
    pub(crate) selector: Selector,
    pub(crate) level: u8,
    pub(crate) zoom: f64,
    pub(crate) active: HashMap<TileKey, Vec<TileOffset>>,
}

/// Everything a background load needs after the call that spawned it returns
#[derive(Clone)]
struct LoadContext {
    view: Arc<Mutex<ViewState>>,
    dataset: Arc<DatasetDescription>,
    events: Sender<PyramidEvent>,
}

pub struct TilePyramid {
    pub(crate) store: PyramidStore,
    pub(crate) metadata: PyramidMetadata,
    pub(crate) dataset: Arc<DatasetDescription>,
    pub(crate) tiles: HashMap<TileKey, Arc<Tile>>,
    pub(crate) view: Arc<Mutex<ViewState>>,
    pub(crate) region_ticket: AtomicU64,
    spawner: Arc<dyn AsyncSpawner>,
    loading: Arc<LoadingState>,
    events: (Sender<PyramidEvent>, Receiver<PyramidEvent>),
    tasks: Mutex<Vec<Box<dyn AsyncHandle>>>,
}

impl TilePyramid {
    /// Creates every tile of every level up to the pyramid's maximum zoom.
    ///
    /// Band names are fixed by `selector`: one band per combination of its
    /// array-valued entries, or a single band named after the variable.
    pub fn new(store: PyramidStore, selector: Selector, spawner: Arc<dyn AsyncSpawner>) -> Self {
        let metadata = store.metadata().clone();
        let dataset = store.dataset();
        let loading = store.loading_state();
        let bands: Vec<String> = bands_for(&dataset.variable, &selector)
            .into_iter()
            .map(|b| b.name)
            .collect();

        let loader: Arc<dyn ChunkLoader> = Arc::new(store.clone());
        let mut tiles = HashMap::default();
        for z in 0..=metadata.max_zoom {
            let dim = TileKey::dim(z);
            for y in 0..dim {
                for x in 0..dim {
                    let key = TileKey::new(x, y, z);
                    let tile = Tile::new(key, Arc::clone(&dataset), bands.clone(), Arc::clone(&loader));
                    tiles.insert(key, Arc::new(tile));
                }
            }
        }
        log::debug!(
            "created {} tiles for levels 0..={} with bands {:?}",
            tiles.len(),
            metadata.max_zoom,
            bands
        );

        Self {
            store,
            metadata,
            dataset,
            tiles,
            view: Arc::new(Mutex::new(ViewState {
                selector,
                ..ViewState::default()
            })),
            region_ticket: AtomicU64::new(0),
            spawner,
            loading,
            events: unbounded(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn metadata(&self) -> &PyramidMetadata {
        &self.metadata
    }

    pub fn dataset(&self) -> Arc<DatasetDescription> {
        Arc::clone(&self.dataset)
    }

    pub fn store(&self) -> &PyramidStore {
        &self.store
    }

    pub fn tile(&self, key: &TileKey) -> Option<Arc<Tile>> {
        self.tiles.get(key).cloned()
    }

    pub fn loading_state(&self) -> Arc<LoadingState> {
        Arc::clone(&self.loading)
    }

    /// Receiver of redraw and failure notifications
    pub fn events(&self) -> Receiver<PyramidEvent> {
        self.events.1.clone()
    }

    pub fn selector(&self) -> Selector {
        self.lock_view().selector.clone()
    }

    /// Pyramid level currently drawn
    pub fn level(&self) -> u8 {
        self.lock_view().level
    }

    /// Active tiles and the on-screen offsets each is drawn at
    pub fn active_tiles(&self) -> HashMap<TileKey, Vec<TileOffset>> {
        self.lock_view().active.clone()
    }

    fn lock_view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recomputes the active tile set for a camera move and loads or
    /// resynchronizes every active tile.
    pub fn update_camera(&self, camera: CameraUpdate) -> Result<()> {
        let level = math::zoom_to_level(camera.zoom, self.metadata.max_zoom);
        let center = camera.center;
        let (cx, cy) = math::point_to_camera(center.lng, center.lat, level);
        let tile = math::point_to_tile(center.lng, center.lat, level);
        let active = math::get_siblings(
            tile,
            camera.viewport,
            camera.zoom,
            (cx, cy),
            self.metadata.tile_size,
        );

        let selector = {
            let mut view = self.lock_view();
            if let Some(selector) = camera.selector {
                view.selector = selector;
            }
            view.level = level;
            view.zoom = camera.zoom;
            view.active = active;
            view.selector.clone()
        };

        log::trace!("camera at level {} centered on tile {}", level, tile);
        self.sync_active(&selector)
    }

    /// Replaces the selector and resynchronizes the active tiles, fetching
    /// only chunks the new selector needs and no tile holds yet.
    pub fn set_selector(&self, selector: Selector) -> Result<()> {
        self.lock_view().selector = selector.clone();
        self.sync_active(&selector)
    }

    fn sync_active(&self, selector: &Selector) -> Result<()> {
        let keys: Vec<TileKey> = self.lock_view().active.keys().copied().collect();
        let mut first_error = None;
        let mut redraw = false;

        for key in keys {
            let tile = match self.tiles.get(&key) {
                Some(tile) => Arc::clone(tile),
                None => continue,
            };
            match self.sync_tile(&tile, selector) {
                Ok(changed) => redraw |= changed,
                Err(e) => {
                    log::warn!("could not update tile {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if redraw {
            let _ = self.events.0.send(PyramidEvent::Redraw);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Returns whether the tile's buffers changed synchronously.
    fn sync_tile(&self, tile: &Arc<Tile>, selector: &Selector) -> Result<bool> {
        let chunks = self.dataset.chunk_keys(selector, tile.key())?;

        if tile.has_chunks(&chunks) {
            if tile.has_populated_buffer(selector) {
                return Ok(false);
            }
            tile.populate_buffers_sync(selector)?;
            return Ok(true);
        }

        if tile.is_requested(&chunks) {
            // The load in flight repopulates with the selector current at completion.
            return Ok(false);
        }

        let (loaded, _) = tile.request_chunks(&chunks);
        let guard = self.loading.begin(LoadKind::Tiles);
        let context = LoadContext {
            view: Arc::clone(&self.view),
            dataset: Arc::clone(&self.dataset),
            events: self.events.0.clone(),
        };
        let tile = Arc::clone(tile);
        let handle = crate::runtime::spawn(self.spawner.as_ref(), async move {
            let _guard = guard;
            let key = tile.key();
            match loaded.await {
                Ok(()) => context.populate_current(&tile),
                Err(error) => {
                    log::warn!("chunk load for tile {} failed: {}", key, error);
                    let _ = context
                        .events
                        .send(PyramidEvent::ChunkFailed { tile: key, error });
                }
            }
        });
        self.track(handle);
        Ok(false)
    }

    fn track(&self, handle: Box<dyn AsyncHandle>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }
    }

    /// Keys to draw for `target` under the current selector
    pub fn keys_to_render(&self, target: TileKey) -> Vec<TileKey> {
        let selector = self.selector();
        math::keys_to_render(target, self.metadata.max_zoom, |key| {
            self.tiles
                .get(key)
                .map_or(false, |tile| tile.has_populated_buffer(&selector))
        })
    }

    /// Tiles to draw for the active viewport, with substitutes in place of
    /// tiles whose buffers are not current, sorted by key.
    pub fn render_list(&self) -> Vec<RenderItem> {
        let (selector, level, active) = {
            let view = self.lock_view();
            (view.selector.clone(), view.level, view.active.clone())
        };
        let is_populated = |key: &TileKey| {
            self.tiles
                .get(key)
                .map_or(false, |tile| tile.has_populated_buffer(&selector))
        };

        let mut placed: BTreeMap<TileKey, Vec<TileOffset>> = BTreeMap::new();
        for (target, offsets) in &active {
            for rendered in math::keys_to_render(*target, self.metadata.max_zoom, is_populated) {
                let entry = placed.entry(rendered).or_default();
                for offset in offsets {
                    let adjusted = if rendered == *target {
                        *offset
                    } else {
                        math::adjusted_offset(*offset, rendered)
                    };
                    if !entry.contains(&adjusted) {
                        entry.push(adjusted);
                    }
                }
            }
        }

        let rendered: Vec<TileKey> = placed.keys().copied().collect();
        placed
            .into_iter()
            .filter(|(key, _)| math::overlapping_ancestor(key, &rendered).is_none())
            .map(|(key, offsets)| RenderItem {
                key,
                offsets,
                level,
                buffers: self
                    .tiles
                    .get(&key)
                    .map(|tile| tile.buffers())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

impl LoadContext {
    /// Populates `tile` for the selector current now, if its chunks are loaded.
    fn populate_current(&self, tile: &Tile) {
        let selector = self
            .view
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .selector
            .clone();

        let chunks = match self.dataset.chunk_keys(&selector, tile.key()) {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("selector no longer valid for tile {}: {}", tile.key(), e);
                return;
            }
        };
        if !tile.has_chunks(&chunks) || tile.has_populated_buffer(&selector) {
            return;
        }

        match tile.populate_buffers_sync(&selector) {
            Ok(()) => {
                let _ = self.events.send(PyramidEvent::Redraw);
            }
            Err(e) => log::error!("failed to populate tile {}: {}", tile.key(), e),
        }
    }
}

impl Drop for TilePyramid {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.lock() {
            for task in tasks.iter() {
                task.cancel();
            }
        }
        for tile in self.tiles.values() {
            tile.cleanup();
        }
    }
}
