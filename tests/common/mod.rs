//! In-memory pyramids shared by the integration tests.
#![allow(dead_code)]

use gridlet::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;

pub const MONTHS: [i32; 4] = [1, 2, 3, 4];
pub const MONTH_CHUNK: usize = 2;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Element of a decoded chunk
pub fn at(chunk: &Chunk, index: &[usize]) -> f32 {
    chunk[index]
}

pub fn f32_bytes(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
    values.into_iter().flat_map(f32::to_le_bytes).collect()
}

pub fn i32_bytes(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
    values.into_iter().flat_map(i32::to_le_bytes).collect()
}

fn multiscales(max_zoom: u8, tile_size: u32) -> Value {
    let datasets: Vec<Value> = (0..=max_zoom)
        .map(|z| json!({ "path": z.to_string(), "pixels_per_tile": tile_size }))
        .collect();
    json!([{ "datasets": datasets, "metadata": { "crs": "EPSG:3857" } }])
}

fn zarray(shape: &[usize], chunks: &[usize], dtype: &str) -> Value {
    json!({
        "zarr_format": 2,
        "shape": shape,
        "chunks": chunks,
        "dtype": dtype,
        "compressor": null,
        "filters": null,
        "fill_value": "NaN",
        "order": "C",
    })
}

/// Value stored at month index `m`, global row `gy` and column `gx` of level `z`
pub fn monthly_value(z: u8, m: usize, gy: usize, gx: usize) -> f32 {
    (z as usize * 1000 + m * 100 + gy * 10 + gx) as f32
}

/// Writes a v2 pyramid of a `tavg[month, y, x]` variable with levels
/// `0..=max_zoom`, four months chunked two at a time and one chunk per tile.
pub fn monthly_v2(transport: &MemoryTransport, source: &str, max_zoom: u8, tile_size: usize) {
    let mut metadata = serde_json::Map::new();
    metadata.insert(".zattrs".into(), json!({ "multiscales": multiscales(max_zoom, tile_size as u32) }));

    for z in 0..=max_zoom {
        let side = tile_size << z;
        metadata.insert(
            format!("{}/tavg/.zarray", z),
            zarray(&[MONTHS.len(), side, side], &[MONTH_CHUNK, tile_size, tile_size], "<f4"),
        );
        metadata.insert(
            format!("{}/tavg/.zattrs", z),
            json!({ "_ARRAY_DIMENSIONS": ["month", "y", "x"] }),
        );

        let tiles = 1usize << z;
        for cm in 0..MONTHS.len() / MONTH_CHUNK {
            for cy in 0..tiles {
                for cx in 0..tiles {
                    let mut values = Vec::new();
                    for lm in 0..MONTH_CHUNK {
                        for ly in 0..tile_size {
                            for lx in 0..tile_size {
                                values.push(monthly_value(
                                    z,
                                    cm * MONTH_CHUNK + lm,
                                    cy * tile_size + ly,
                                    cx * tile_size + lx,
                                ));
                            }
                        }
                    }
                    transport.insert(
                        format!("{}/{}/tavg/{}.{}.{}", source, z, cm, cy, cx),
                        f32_bytes(values),
                    );
                }
            }
        }
    }

    metadata.insert("0/month/.zarray".into(), zarray(&[MONTHS.len()], &[MONTHS.len()], "<i4"));
    metadata.insert("0/month/.zattrs".into(), json!({ "_ARRAY_DIMENSIONS": ["month"] }));
    transport.insert(format!("{}/0/month/0", source), i32_bytes(MONTHS));

    transport.insert_json(
        format!("{}/.zmetadata", source),
        &json!({ "metadata": metadata, "zarr_consolidated_format": 1 }),
    );
}

/// URL of a chunk of the monthly pyramid
pub fn monthly_chunk_url(source: &str, z: u8, key: &[u64]) -> String {
    format!("{}/{}/tavg/{}.{}.{}", source, z, key[0], key[1], key[2])
}

/// Writes a single-level v2 pyramid of a two-dimensional `tavg[y, x]` whose
/// pixel `(i, j)` holds `j * tile_size + i`.
pub fn flat_v2(transport: &MemoryTransport, source: &str, tile_size: usize) {
    let mut metadata = serde_json::Map::new();
    metadata.insert(".zattrs".into(), json!({ "multiscales": multiscales(0, tile_size as u32) }));
    metadata.insert(
        "0/tavg/.zarray".into(),
        zarray(&[tile_size, tile_size], &[tile_size, tile_size], "<f4"),
    );
    metadata.insert("0/tavg/.zattrs".into(), json!({ "_ARRAY_DIMENSIONS": ["y", "x"] }));
    transport.insert_json(
        format!("{}/.zmetadata", source),
        &json!({ "metadata": metadata, "zarr_consolidated_format": 1 }),
    );

    let values = (0..tile_size * tile_size).map(|v| v as f32);
    transport.insert(format!("{}/0/tavg/0.0", source), f32_bytes(values));
}

/// Writes a single-level v3 pyramid of `tavg[band, y, x]` stored as one shard
/// holding two 1x4x4 chunks, with band coordinates `[10, 20]`. Pixel `(x, y)`
/// of band index `b` holds `b * 100 + y * 4 + x`.
pub fn sharded_v3(transport: &MemoryTransport, source: &str) {
    let bytes_codec = json!({ "name": "bytes", "configuration": { "endian": "little" } });

    transport.insert_json(
        format!("{}/zarr.json", source),
        &json!({
            "zarr_format": 3,
            "node_type": "group",
            "attributes": { "multiscales": multiscales(0, 4) },
        }),
    );
    transport.insert_json(
        format!("{}/0/tavg/zarr.json", source),
        &json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": [2, 4, 4],
            "data_type": "float32",
            "chunk_grid": { "name": "regular", "configuration": { "chunk_shape": [2, 4, 4] } },
            "chunk_key_encoding": { "name": "default", "configuration": { "separator": "/" } },
            "codecs": [{
                "name": "sharding_indexed",
                "configuration": {
                    "chunk_shape": [1, 4, 4],
                    "codecs": [bytes_codec.clone()],
                    "index_codecs": [bytes_codec.clone(), { "name": "crc32c" }],
                    "index_location": "end",
                },
            }],
            "fill_value": "NaN",
            "dimension_names": ["band", "y", "x"],
        }),
    );
    transport.insert_json(
        format!("{}/0/band/zarr.json", source),
        &json!({
            "zarr_format": 3,
            "node_type": "array",
            "shape": [2],
            "data_type": "int32",
            "chunk_grid": { "name": "regular", "configuration": { "chunk_shape": [2] } },
            "chunk_key_encoding": { "name": "default" },
            "codecs": [bytes_codec],
            "fill_value": 0,
            "dimension_names": ["band"],
        }),
    );
    transport.insert(format!("{}/0/band/c/0", source), i32_bytes([10, 20]));

    let mut shard = Vec::new();
    for band in 0..2 {
        shard.extend(f32_bytes((0..16).map(|p| (band * 100 + p) as f32)));
    }
    for (offset, nbytes) in [(0u64, 64u64), (64, 64)] {
        shard.extend(offset.to_le_bytes());
        shard.extend(nbytes.to_le_bytes());
    }
    // Checksums are not verified, so zeros stand in for the crc32c.
    shard.extend([0u8; 4]);
    transport.insert(format!("{}/0/tavg/c/0/0/0", source), shard);
}

/// Transport that answers after `delay`, so concurrent requests overlap
pub fn delayed_transport(millis: u64) -> MemoryTransport {
    MemoryTransport::new().with_delay(Duration::from_millis(millis))
}

pub fn store_config(
    source: &str,
    version: ZarrVersion,
    transport: Arc<MemoryTransport>,
    registry: Arc<MetadataRegistry>,
) -> StoreConfig {
    StoreConfig {
        source: source.to_string(),
        variable: "tavg".to_string(),
        version,
        cache: CacheConfig::default(),
        transport,
        registry,
        loading: Arc::new(LoadingState::new()),
    }
}

pub async fn open_monthly(
    source: &str,
    transport: Arc<MemoryTransport>,
) -> gridlet::Result<PyramidStore> {
    PyramidStore::open(store_config(
        source,
        ZarrVersion::V2,
        transport,
        Arc::new(MetadataRegistry::new()),
    ))
    .await
}

pub async fn build_pyramid(
    source: &str,
    transport: Arc<MemoryTransport>,
    selector: Selector,
) -> gridlet::Result<Arc<TilePyramid>> {
    PyramidBuilder::new(source, "tavg")
        .with_transport(transport)
        .with_registry(Arc::new(MetadataRegistry::new()))
        .with_selector(selector)
        .build()
        .await
}
