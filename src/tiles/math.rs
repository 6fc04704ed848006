//! Coordinate and addressing math over geographic, camera and tile space.
//!
//! Everything here is pure and uses the spherical Web-Mercator projection
//! (EPSG:3857) without ellipsoidal correction. "Camera" coordinates are
//! continuous tile-space positions at a given level: the integer part names the
//! tile, the fractional part the position inside it.

use crate::core::camera::ViewportSize;
use crate::core::geo::{LngLat, Region};
use crate::prelude::HashMap;
use crate::tiles::key::{TileKey, TileOffset};
use std::collections::BTreeSet;
use std::f64::consts::PI;

/// Continuous tile-space position of a geographic point at level `z`.
///
/// `x` is wrapped into `[0, 2^z)`; `y` is clamped to `[0, 2^z]`.
pub fn point_to_camera(lng: f64, lat: f64, z: u8) -> (f64, f64) {
    let n = TileKey::dim(z) as f64;
    let lat_rad = LngLat::clamp_lat(lat).to_radians();

    let x = ((lng + 180.0) / 360.0 * n).rem_euclid(n);
    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;

    (x, y.clamp(0.0, n))
}

/// Tile containing a geographic point at level `z`
pub fn point_to_tile(lng: f64, lat: f64, z: u8) -> TileKey {
    let max = TileKey::dim(z) - 1;
    let (x, y) = point_to_camera(lng, lat, z);
    TileKey::new((x.floor() as u32).min(max), (y.floor() as u32).min(max), z)
}

/// Inverse of [`point_to_camera`]: geographic position of a camera position.
pub fn camera_to_point(x: f64, y: f64, z: u8) -> LngLat {
    let n = TileKey::dim(z) as f64;
    let lng = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    LngLat::new(lng, lat)
}

/// Geographic position of the north-west corner of pixel `(i, j)` in a tile
/// of `size` pixels per side.
pub fn tile_pixel_to_point(key: TileKey, i: u32, j: u32, size: u32) -> LngLat {
    let size = size as f64;
    camera_to_point(
        key.x as f64 + i as f64 / size,
        key.y as f64 + j as f64 / size,
        key.z,
    )
}

/// Pyramid level used to draw a continuous map zoom
pub fn zoom_to_level(zoom: f64, max_zoom: u8) -> u8 {
    if !zoom.is_finite() || zoom <= 0.0 {
        return 0;
    }
    zoom.floor().min(max_zoom as f64) as u8
}

/// Clips an on-screen offset to the cache tile it draws.
///
/// Columns wrap around the antimeridian; rows outside the world return `None`.
pub fn wrap_offset(offset: TileOffset) -> Option<TileKey> {
    let n = TileKey::dim(offset.z) as i64;
    if offset.y < 0 || offset.y >= n {
        return None;
    }
    Some(TileKey::new(
        offset.x.rem_euclid(n) as u32,
        offset.y as u32,
        offset.z,
    ))
}

/// Every on-screen tile position around `camera`, grouped by the cache tile
/// drawn there.
///
/// `zoom` is the continuous map zoom and `tile.z` the level being drawn, so a
/// level tile spans `tile_size * 2^(zoom - z)` screen pixels. When the
/// viewport is wider than the world the same key collects several offsets,
/// one per horizontal repetition.
pub fn get_siblings(
    tile: TileKey,
    viewport: ViewportSize,
    zoom: f64,
    camera: (f64, f64),
    tile_size: u32,
) -> HashMap<TileKey, Vec<TileOffset>> {
    let mut siblings: HashMap<TileKey, Vec<TileOffset>> = HashMap::default();
    let z = tile.z;

    if viewport.is_empty() || tile_size == 0 {
        siblings.insert(tile, vec![TileOffset::from(tile)]);
        return siblings;
    }

    let magnification = 2_f64.powf(zoom - z as f64);
    let tile_px = tile_size as f64 * magnification;
    let half_w = viewport.width / 2.0 / tile_px;
    let half_h = viewport.height / 2.0 / tile_px;
    let (cx, cy) = camera;

    let n = TileKey::dim(z) as i64;

    let mut min_x = (cx - half_w).floor() as i64;
    let mut max_x = ((cx + half_w).ceil() as i64).saturating_sub(1).max(min_x);
    let first_row = (cy - half_h).floor() as i64;
    let min_y = first_row.max(0);
    let max_y = ((cy + half_h).ceil() as i64)
        .saturating_sub(1)
        .max(first_row)
        .min(n - 1);

    // No more columns than the world repetitions the viewport can show
    let worlds = (viewport.width / (tile_px * n as f64)).ceil() as i64;
    let columns = worlds.saturating_add(1).saturating_mul(n);
    if max_x.saturating_sub(min_x).saturating_add(1) > columns {
        min_x = (cx.floor() as i64).saturating_sub(columns / 2);
        max_x = min_x.saturating_add(columns - 1);
    }

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let offset = TileOffset::new(x, y, z);
            if let Some(key) = wrap_offset(offset) {
                siblings.entry(key).or_default().push(offset);
            }
        }
    }

    if siblings.is_empty() {
        siblings.insert(tile, vec![TileOffset::from(tile)]);
    }
    siblings
}

/// Keys to draw in place of `target` given which tiles hold current buffers.
///
/// 1. The target itself or the nearest populated ancestor.
/// 2. Otherwise the populated descendants of the deepest level with the best
///    coverage; full coverage at any level returns that level immediately and
///    ties go to the deeper level.
/// 3. Otherwise the target, even if empty.
pub fn keys_to_render<F>(target: TileKey, max_zoom: u8, is_populated: F) -> Vec<TileKey>
where
    F: Fn(&TileKey) -> bool,
{
    if let Some(ancestor) = ancestor_to_render(target, &is_populated) {
        return vec![ancestor];
    }

    let descendants = descendants_to_render(target, max_zoom, &is_populated);
    if !descendants.is_empty() {
        return descendants;
    }

    vec![target]
}

fn ancestor_to_render<F>(target: TileKey, is_populated: &F) -> Option<TileKey>
where
    F: Fn(&TileKey) -> bool,
{
    let mut current = Some(target);
    while let Some(key) = current {
        if is_populated(&key) {
            return Some(key);
        }
        current = key.parent();
    }
    None
}

fn descendants_to_render<F>(target: TileKey, max_zoom: u8, is_populated: &F) -> Vec<TileKey>
where
    F: Fn(&TileKey) -> bool,
{
    let mut coverage = 0.0;
    let mut best = Vec::new();

    for z in target.z.saturating_add(1)..=max_zoom {
        let keys = target.descendants_at(z);
        let populated: Vec<TileKey> = keys.iter().copied().filter(|k| is_populated(k)).collect();
        let current = populated.len() as f64 / keys.len() as f64;

        if populated.len() == keys.len() {
            return keys;
        }
        if !populated.is_empty() && current >= coverage {
            coverage = current;
            best = populated;
        }
    }

    best
}

/// First key of `rendered` that is a strict ancestor of `key`.
pub fn overlapping_ancestor(key: &TileKey, rendered: &[TileKey]) -> Option<TileKey> {
    rendered.iter().copied().find(|r| r.is_ancestor_of(key))
}

/// Remaps an on-screen offset of one level onto `rendered`, keeping the world
/// repetition the offset was drawn in.
pub fn adjusted_offset(offset: TileOffset, rendered: TileKey) -> TileOffset {
    let n = TileKey::dim(offset.z) as i64;
    let world = offset.x.div_euclid(n);
    let rendered_n = TileKey::dim(rendered.z) as i64;
    TileOffset::new(
        rendered.x as i64 + world * rendered_n,
        rendered.y as i64,
        rendered.z,
    )
}

/// Tiles at `level` touched by `region`.
///
/// This is an approximation rather than an exact geometric cover: it samples
/// the center, every boundary vertex, and points interpolated linearly between
/// the center and any vertex whose tile lies more than one tile away.
pub fn tiles_of_region(region: &Region, level: u8) -> Vec<TileKey> {
    let center = region.center;
    let central = point_to_tile(center.lng, center.lat, level);
    let mut tiles = BTreeSet::new();
    tiles.insert(central);

    for vertex in region.boundary() {
        let edge = point_to_tile(vertex.lng, vertex.lat, level);
        tiles.insert(edge);

        let max_diff = (edge.x as i64 - central.x as i64)
            .abs()
            .max((edge.y as i64 - central.y as i64).abs());
        for step in 1..max_diff {
            let t = step as f64 / max_diff as f64;
            let lng = center.lng + (vertex.lng - center.lng) * t;
            let lat = center.lat + (vertex.lat - center.lat) * t;
            tiles.insert(point_to_tile(lng, lat, level));
        }
    }

    tiles.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::Units;

    #[test]
    fn test_zoom_to_level() {
        assert_eq!(zoom_to_level(2.7, 5), 2);
        assert_eq!(zoom_to_level(7.0, 5), 5);
        assert_eq!(zoom_to_level(-1.0, 5), 0);
    }

    #[test]
    fn test_point_to_tile_and_back() {
        let key = point_to_tile(-74.0060, 40.7128, 10);
        assert_eq!(key, TileKey::new(301, 385, 10));

        let nw = camera_to_point(key.x as f64, key.y as f64, key.z);
        let se = camera_to_point(key.x as f64 + 1.0, key.y as f64 + 1.0, key.z);
        assert!(nw.lng <= -74.0060 && -74.0060 < se.lng);
        assert!(se.lat < 40.7128 && 40.7128 <= nw.lat);
    }

    #[test]
    fn test_point_to_camera_wraps_and_clamps() {
        let (x, _) = point_to_camera(190.0, 0.0, 1);
        let (x_wrapped, _) = point_to_camera(-170.0, 0.0, 1);
        assert!((x - x_wrapped).abs() < 1e-9);

        let (_, y_north) = point_to_camera(0.0, 89.9, 2);
        let (_, y_south) = point_to_camera(0.0, -89.9, 2);
        assert!(y_north >= 0.0);
        assert!(y_south <= 4.0);
        assert_eq!(point_to_tile(0.0, -89.9, 2).y, 3);
    }

    #[test]
    fn test_siblings_wrap_at_world_zoom() {
        let tile = TileKey::new(0, 0, 0);
        let siblings = get_siblings(
            tile,
            ViewportSize::new(400.0, 100.0),
            0.0,
            (0.5, 0.5),
            128,
        );

        assert_eq!(siblings.len(), 1);
        let offsets = &siblings[&tile];
        assert!(offsets.len() >= 2);
        assert!(offsets.contains(&TileOffset::new(-1, 0, 0)));
        assert!(offsets.contains(&TileOffset::new(0, 0, 0)));
        assert!(offsets.contains(&TileOffset::new(1, 0, 0)));
    }

    #[test]
    fn test_siblings_cover_viewport() {
        let camera = point_to_camera(0.0, 0.0, 3);
        let tile = point_to_tile(0.0, 0.0, 3);
        let siblings = get_siblings(tile, ViewportSize::new(256.0, 256.0), 3.0, camera, 128);

        // A 2x2 block of tiles around the camera.
        assert_eq!(siblings.len(), 4);
        assert!(siblings.values().all(|offsets| offsets.len() == 1));
        assert!(siblings.contains_key(&tile));
    }

    #[test]
    fn test_siblings_bounded_at_negative_zoom() {
        let tile = TileKey::new(0, 0, 0);
        let viewport = ViewportSize::new(1024.0, 768.0);
        let siblings = get_siblings(tile, viewport, -16.0, (0.5, 0.5), 128);

        assert_eq!(siblings.len(), 1);
        let offsets = &siblings[&tile];
        let worlds = (1024.0 / (128.0 * 2_f64.powi(-16))).ceil() as usize + 1;
        assert!(offsets.len() <= worlds);
        assert!(offsets.iter().all(|offset| offset.y == 0));
        assert!(offsets.contains(&TileOffset::new(0, 0, 0)));
    }

    #[test]
    fn test_siblings_rows_stay_inside_world() {
        // Viewport far taller than the two-row world at level 1
        let siblings = get_siblings(
            TileKey::new(0, 0, 1),
            ViewportSize::new(64.0, 4096.0),
            1.0,
            (0.5, 1.0),
            128,
        );
        let rows: Vec<i64> = siblings.values().flatten().map(|offset| offset.y).collect();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|y| (0..2).contains(y)));
        assert_eq!(siblings.len(), 2);
    }

    #[test]
    fn test_keys_to_render_prefers_populated_children() {
        let target = TileKey::new(1, 1, 1);
        let children = target.children();
        let keys = keys_to_render(target, 3, |k| children.contains(k));

        assert_eq!(keys.len(), 4);
        for child in children {
            assert!(keys.contains(&child));
        }
    }

    #[test]
    fn test_keys_to_render_grandparent() {
        let target = TileKey::new(5, 2, 3);
        let grandparent = target.ancestor_at(1).unwrap();
        let keys = keys_to_render(target, 4, |k| *k == grandparent);
        assert_eq!(keys, vec![grandparent]);
    }

    #[test]
    fn test_keys_to_render_partial_coverage_prefers_deeper_ties() {
        let target = TileKey::new(0, 0, 1);
        let child = target.children()[0];
        let grandchildren = target.descendants_at(3);
        // Level 2: 1/4 covered. Level 3: 4/16 covered, same ratio but deeper.
        let deep: Vec<TileKey> = grandchildren.iter().copied().take(4).collect();
        let keys = keys_to_render(target, 3, |k| *k == child || deep.contains(k));
        assert_eq!(keys, deep);
    }

    #[test]
    fn test_keys_to_render_falls_back_to_target() {
        let target = TileKey::new(0, 0, 2);
        assert_eq!(keys_to_render(target, 4, |_| false), vec![target]);
    }

    #[test]
    fn test_overlapping_ancestor_and_adjusted_offset() {
        let parent = TileKey::new(1, 0, 1);
        let child = TileKey::new(3, 1, 2);
        assert_eq!(overlapping_ancestor(&child, &[child, parent]), Some(parent));
        assert_eq!(overlapping_ancestor(&parent, &[child]), None);

        // Offset drawn one world to the right at level 2 keeps that repetition at level 1.
        let offset = TileOffset::new(3 + 4, 1, 2);
        assert_eq!(adjusted_offset(offset, parent), TileOffset::new(1 + 2, 0, 1));
    }

    #[test]
    fn test_tiles_of_region_includes_center_and_edges() {
        let region = Region::circle(LngLat::new(0.5, 0.5), 500.0, Units::Kilometers, 32).unwrap();
        let tiles = tiles_of_region(&region, 4);

        assert!(tiles.contains(&point_to_tile(0.5, 0.5, 4)));
        for vertex in region.boundary() {
            assert!(tiles.contains(&point_to_tile(vertex.lng, vertex.lat, 4)));
        }
    }
}
