//! Region queries: every loaded value inside a circle around a point.

use crate::core::geo::Region;
use crate::tiles::math;
use crate::tiles::pyramid::TilePyramid;
use crate::tiles::selector::{CoordValue, Selector};
use crate::Result;
use futures::future;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

/// Values of a region query.
///
/// Flat when the dataset has only spatial dimensions; otherwise nested by the
/// coordinate value of each non-spatial dimension in axis order, one level per
/// dimension. Every leaf runs parallel to the `lat`/`lon` coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RegionValues {
    Flat(Vec<f32>),
    Nested(BTreeMap<String, RegionValues>),
}

impl RegionValues {
    fn push(&mut self, keys: &[CoordValue], value: f32) {
        match (self, keys.split_first()) {
            (RegionValues::Flat(values), None) => values.push(value),
            (RegionValues::Nested(children), Some((key, rest))) => {
                let empty = if rest.is_empty() {
                    RegionValues::Flat(Vec::new())
                } else {
                    RegionValues::Nested(BTreeMap::new())
                };
                children
                    .entry(key.to_string())
                    .or_insert(empty)
                    .push(rest, value);
            }
            // The key depth is fixed per dataset, so shapes always agree.
            _ => {}
        }
    }

    /// Leaf reached by following `keys`
    pub fn get(&self, keys: &[&str]) -> Option<&RegionValues> {
        match keys.split_first() {
            None => Some(self),
            Some((key, rest)) => match self {
                RegionValues::Nested(children) => children.get(*key)?.get(rest),
                RegionValues::Flat(_) => None,
            },
        }
    }

    /// Values of a flat result or leaf
    pub fn as_flat(&self) -> Option<&[f32]> {
        match self {
            RegionValues::Flat(values) => Some(values),
            RegionValues::Nested(_) => None,
        }
    }
}

/// Result of [`TilePyramid::query_region`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionResult {
    /// Name of the queried variable
    pub variable: String,
    pub values: RegionValues,
    /// Non-spatial dimensions in nesting order, then `lat` and `lon`
    pub dimensions: Vec<String>,
    /// `lat` and `lon` of every sampled pixel, plus the selected values of
    /// each non-spatial dimension
    pub coordinates: BTreeMap<String, Vec<CoordValue>>,
}

impl RegionResult {
    /// Number of sampled pixels
    pub fn len(&self) -> usize {
        self.coordinates.get("lat").map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TilePyramid {
    /// Every value of the current selector at pixels within `region`'s radius,
    /// at the level currently drawn.
    ///
    /// Waits for the chunks of every covering tile. Resolves to `None` when a
    /// newer query started while this one was waiting.
    pub async fn query_region(&self, region: &Region) -> Result<Option<RegionResult>> {
        let ticket = self.region_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        let (selector, level) = {
            let view = self.view.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            (view.selector.clone(), view.level)
        };

        let keys = math::tiles_of_region(region, level);
        let tiles: Vec<_> = keys.iter().filter_map(|key| self.tile(key)).collect();

        let loads = tiles
            .iter()
            .map(|tile| {
                let selector = &selector;
                async move {
                    let chunks = self.dataset.chunk_keys(selector, tile.key())?;
                    tile.load_chunks(&chunks).await
                }
            })
            .collect::<Vec<_>>();
        future::try_join_all(loads).await?;

        if self.region_ticket.load(Ordering::SeqCst) != ticket {
            log::debug!("region query {} superseded", ticket);
            return Ok(None);
        }

        let nested = self.dataset.dimensions.len() > 2;
        let mut values = if nested {
            RegionValues::Nested(BTreeMap::new())
        } else {
            RegionValues::Flat(Vec::new())
        };
        let mut lat = Vec::new();
        let mut lon = Vec::new();
        let size = self.metadata.tile_size;

        for tile in &tiles {
            let key = tile.key();
            for j in 0..size {
                for i in 0..size {
                    let point = math::tile_pixel_to_point(key, i, j, size);
                    if point.distance_to(&region.center, region.units) > region.radius {
                        continue;
                    }
                    for value in tile.get_point_values(&selector, (i, j))? {
                        let keys: &[CoordValue] = if nested { &value.keys } else { &[] };
                        values.push(keys, value.value);
                    }
                    lat.push(CoordValue::Number(point.lat));
                    lon.push(CoordValue::Number(point.lng));
                }
            }
        }

        let extra: Vec<String> = self.dataset.extra_dimensions().map(str::to_string).collect();
        let mut coordinates = BTreeMap::new();
        for dimension in &extra {
            coordinates.insert(dimension.clone(), self.selected_coordinates(&selector, dimension));
        }
        coordinates.insert("lat".to_string(), lat);
        coordinates.insert("lon".to_string(), lon);

        let mut dimensions = extra;
        dimensions.push("lat".to_string());
        dimensions.push("lon".to_string());

        log::debug!(
            "region query {} sampled {} pixels over {} tiles",
            ticket,
            coordinates["lat"].len(),
            tiles.len()
        );

        Ok(Some(RegionResult {
            variable: self.dataset.variable.clone(),
            values,
            dimensions,
            coordinates,
        }))
    }

    fn selected_coordinates(&self, selector: &Selector, dimension: &str) -> Vec<CoordValue> {
        match selector.get(dimension) {
            Some(value) => value.values().to_vec(),
            None => self
                .dataset
                .coordinates
                .get(dimension)
                .cloned()
                .unwrap_or_default(),
        }
    }
}
