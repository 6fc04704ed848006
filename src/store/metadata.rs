//! Parsing of pyramid, array and dataset metadata for Zarr v2 and v3 stores.

use crate::core::config::ZarrVersion;
use crate::constants::DEFAULT_CRS;
use crate::prelude::HashMap;
use crate::tiles::key::{ChunkKey, TileKey};
use crate::tiles::selector::{CoordValue, Selector};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;

/// Levels and tiling of a multiscale pyramid
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PyramidMetadata {
    pub levels: Vec<u8>,
    pub max_zoom: u8,
    pub tile_size: u32,
    pub crs: String,
}

impl PyramidMetadata {
    /// Reads the `multiscales` attribute of the pyramid root group.
    pub fn from_multiscales(multiscales: Option<&Value>) -> Result<Self> {
        let multiscales = multiscales.filter(|v| !v.is_null()).ok_or_else(|| {
            Error::Metadata(
                "Missing `multiscales` value in metadata. Please check your pyramid generation code."
                    .into(),
            )
        })?;

        let datasets = multiscales
            .get(0)
            .and_then(|m| m.get("datasets"))
            .and_then(Value::as_array)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Metadata("`multiscales` lists no datasets".into()))?;

        let levels = datasets
            .iter()
            .map(|dataset| {
                let path = dataset.get("path").ok_or_else(|| {
                    Error::Metadata("multiscale dataset is missing `path`".into())
                })?;
                match path {
                    Value::String(s) => s.parse::<u8>().ok(),
                    Value::Number(n) => n.as_u64().and_then(|n| u8::try_from(n).ok()),
                    _ => None,
                }
                .filter(|level| *level < 32)
                .ok_or_else(|| Error::Metadata(format!("invalid pyramid level path {}", path)))
            })
            .collect::<Result<Vec<u8>>>()?;

        let max_zoom = levels.iter().copied().max().unwrap_or(0);

        let tile_size = datasets[0]
            .get("pixels_per_tile")
            .and_then(Value::as_u64)
            .and_then(|size| u32::try_from(size).ok())
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                Error::Metadata(
                    "Missing required `pixels_per_tile` value in `multiscales` metadata. Please check your pyramid generation code."
                        .into(),
                )
            })?;

        let crs = datasets[0]
            .get("crs")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CRS)
            .to_string();

        Ok(Self {
            levels,
            max_zoom,
            tile_size,
            crs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// Element type of an array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// Fixed-width UTF-32 text of the given number of characters
    Unicode(usize),
    /// Fixed-width byte strings of the given length
    Bytes(usize),
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Unicode(_) | DataType::Bytes(_))
    }

    pub fn size(self) -> usize {
        match self {
            DataType::Unicode(width) => width * 4,
            DataType::Bytes(width) => width,
            DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    /// Parses a v2 typestr such as `<f4` or `|u1`
    pub fn from_v2(dtype: &str) -> Result<(Self, Endian)> {
        let unsupported = || Error::Metadata(format!("unsupported dtype '{}'", dtype));
        let mut chars = dtype.chars();
        let endian = match chars.next() {
            Some('<') | Some('|') => Endian::Little,
            Some('>') => Endian::Big,
            _ => return Err(unsupported()),
        };
        let data_type = match chars.as_str() {
            "i1" => DataType::Int8,
            "i2" => DataType::Int16,
            "i4" => DataType::Int32,
            "i8" => DataType::Int64,
            "u1" => DataType::UInt8,
            "u2" => DataType::UInt16,
            "u4" => DataType::UInt32,
            "u8" => DataType::UInt64,
            "f4" => DataType::Float32,
            "f8" => DataType::Float64,
            text => {
                let width = |digits: &str| digits.parse::<usize>().ok().filter(|w| *w > 0);
                match (text.get(..1), text.get(1..).and_then(width)) {
                    (Some("U"), Some(width)) => DataType::Unicode(width),
                    (Some("S"), Some(width)) => DataType::Bytes(width),
                    _ => return Err(unsupported()),
                }
            }
        };
        Ok((data_type, endian))
    }

    /// Parses a v3 `data_type` name
    pub fn from_v3(name: &str) -> Result<Self> {
        Ok(match name {
            "int8" => DataType::Int8,
            "int16" => DataType::Int16,
            "int32" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint8" => DataType::UInt8,
            "uint16" => DataType::UInt16,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "float32" => DataType::Float32,
            "float64" => DataType::Float64,
            other => return Err(Error::Metadata(format!("unsupported data_type '{}'", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Gzip,
}

/// How raw chunk bytes turn into elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkCodec {
    pub data_type: DataType,
    pub endian: Endian,
    pub compression: Compression,
    /// A 4-byte crc32c trailer follows the encoded bytes
    pub checksum: bool,
}

/// Layout of a v3 `sharding_indexed` array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sharding {
    /// Shape of one shard (the outer chunk grid)
    pub shard_shape: Vec<u64>,
    /// Whether the shard index carries a crc32c trailer
    pub index_checksum: bool,
    /// Index stored at the start of the shard instead of the end
    pub index_at_start: bool,
}

impl Sharding {
    /// Inner chunks per shard along each axis
    pub fn chunks_per_shard(&self, chunk_shape: &[u64]) -> Vec<u64> {
        self.shard_shape
            .iter()
            .zip(chunk_shape)
            .map(|(shard, chunk)| (shard / chunk.max(&1)).max(1))
            .collect()
    }

    /// Bytes occupied by the shard index
    pub fn index_size(&self, chunk_shape: &[u64]) -> u64 {
        let count: u64 = self.chunks_per_shard(chunk_shape).iter().product();
        count * 16 + if self.index_checksum { 4 } else { 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEncoding {
    /// `0.1.2` style keys with the given separator (v2, or v3 `v2` encoding)
    Plain(char),
    /// `c/0/1/2` style keys (v3 `default` encoding)
    Prefixed(char),
}

impl KeyEncoding {
    pub fn encode(&self, chunk: &ChunkKey) -> String {
        match self {
            KeyEncoding::Plain(separator) => {
                if chunk.indices().is_empty() {
                    "0".to_string()
                } else {
                    chunk.encode(*separator)
                }
            }
            KeyEncoding::Prefixed(separator) => {
                let mut key = String::from("c");
                for index in chunk.indices() {
                    key.push(*separator);
                    key.push_str(&index.to_string());
                }
                key
            }
        }
    }
}

/// Everything needed to locate and decode the chunks of one array
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayMetadata {
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub codec: ChunkCodec,
    pub fill_value: f32,
    pub dimensions: Vec<String>,
    pub key_encoding: KeyEncoding,
    pub sharding: Option<Sharding>,
    /// dtype as written in the metadata
    pub dtype_name: String,
}

impl ArrayMetadata {
    /// Parses a v2 `.zarray` document and its `.zattrs`
    pub fn from_v2(zarray: &Value, zattrs: Option<&Value>) -> Result<Self> {
        let shape = u64_list(zarray.get("shape"), "shape")?;
        let chunk_shape = u64_list(zarray.get("chunks"), "chunks")?;
        let dtype_name = zarray
            .get("dtype")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Metadata("array is missing `dtype`".into()))?
            .to_string();
        let (data_type, endian) = DataType::from_v2(&dtype_name)?;

        if zarray.get("order").and_then(Value::as_str).unwrap_or("C") != "C" {
            return Err(Error::Metadata("only C-ordered arrays are supported".into()));
        }
        if zarray.get("filters").map_or(false, |f| !f.is_null()) {
            return Err(Error::Metadata("array filters are not supported".into()));
        }

        let compression = match zarray.get("compressor") {
            None | Some(Value::Null) => Compression::None,
            Some(compressor) => match compressor.get("id").and_then(Value::as_str) {
                Some("zlib") => Compression::Zlib,
                Some("gzip") => Compression::Gzip,
                other => {
                    return Err(Error::Metadata(format!(
                        "unsupported compressor {:?}",
                        other.unwrap_or("<missing id>")
                    )))
                }
            },
        };

        let separator = zarray
            .get("dimension_separator")
            .and_then(Value::as_str)
            .and_then(|s| s.chars().next())
            .unwrap_or('.');

        let dimensions = zattrs
            .and_then(|attrs| attrs.get("_ARRAY_DIMENSIONS"))
            .map(|dims| string_list(dims, "_ARRAY_DIMENSIONS"))
            .transpose()?
            .unwrap_or_default();

        Self {
            shape,
            chunk_shape,
            codec: ChunkCodec {
                data_type,
                endian,
                compression,
                checksum: false,
            },
            fill_value: fill_value(zarray.get("fill_value")),
            dimensions,
            key_encoding: KeyEncoding::Plain(separator),
            sharding: None,
            dtype_name,
        }
        .validated()
    }

    /// Parses a v3 array `zarr.json` document
    pub fn from_v3(doc: &Value) -> Result<Self> {
        if let Some(node_type) = doc.get("node_type").and_then(Value::as_str) {
            if node_type != "array" {
                return Err(Error::Metadata(format!("expected an array, found a {}", node_type)));
            }
        }

        let shape = u64_list(doc.get("shape"), "shape")?;
        let grid_shape = u64_list(
            doc.pointer("/chunk_grid/configuration/chunk_shape"),
            "chunk_grid.configuration.chunk_shape",
        )?;
        let dtype_name = doc
            .get("data_type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Metadata("array is missing `data_type`".into()))?
            .to_string();
        let data_type = DataType::from_v3(&dtype_name)?;

        let key_encoding = match doc.pointer("/chunk_key_encoding/name").and_then(Value::as_str) {
            Some("v2") => KeyEncoding::Plain(separator(doc, '.')),
            _ => KeyEncoding::Prefixed(separator(doc, '/')),
        };

        let codecs = doc
            .get("codecs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let is_sharded = codecs
            .first()
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            == Some("sharding_indexed");

        let (chunk_shape, codec, sharding) = if is_sharded {
            let config = codecs[0].get("configuration").ok_or_else(|| {
                Error::Metadata("sharding_indexed codec is missing `configuration`".into())
            })?;
            let inner_shape = u64_list(config.get("chunk_shape"), "sharding chunk_shape")?;
            let inner_codecs = config
                .get("codecs")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let index_codecs = config
                .get("index_codecs")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let index_at_start =
                config.get("index_location").and_then(Value::as_str) == Some("start");
            let sharding = Sharding {
                shard_shape: grid_shape,
                index_checksum: codec_names(&index_codecs).any(|n| n == "crc32c"),
                index_at_start,
            };
            (inner_shape, v3_codec(&inner_codecs, data_type)?, Some(sharding))
        } else {
            (grid_shape, v3_codec(&codecs, data_type)?, None)
        };

        let dimensions = match doc.get("dimension_names") {
            Some(names) if !names.is_null() => string_list(names, "dimension_names")?,
            _ => doc
                .pointer("/attributes/_ARRAY_DIMENSIONS")
                .map(|dims| string_list(dims, "_ARRAY_DIMENSIONS"))
                .transpose()?
                .unwrap_or_default(),
        };

        Self {
            shape,
            chunk_shape,
            codec,
            fill_value: fill_value(doc.get("fill_value")),
            dimensions,
            key_encoding,
            sharding,
            dtype_name,
        }
        .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.shape.len() != self.chunk_shape.len() {
            return Err(Error::Metadata(format!(
                "shape {:?} and chunk shape {:?} differ in rank",
                self.shape, self.chunk_shape
            )));
        }
        if self.chunk_shape.iter().any(|c| *c == 0) {
            return Err(Error::Metadata(format!("invalid chunk shape {:?}", self.chunk_shape)));
        }
        if !self.dimensions.is_empty() && self.dimensions.len() != self.shape.len() {
            return Err(Error::Metadata(format!(
                "dimensions {:?} do not match shape {:?}",
                self.dimensions, self.shape
            )));
        }
        Ok(self)
    }

    /// Number of elements in one chunk
    pub fn chunk_len(&self) -> usize {
        self.chunk_shape.iter().product::<u64>() as usize
    }

    /// Number of chunks along each axis
    pub fn chunk_grid(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.chunk_shape)
            .map(|(size, chunk)| size.div_ceil(*chunk))
            .collect()
    }
}

fn v3_codec(codecs: &[Value], data_type: DataType) -> Result<ChunkCodec> {
    let mut codec = ChunkCodec {
        data_type,
        endian: Endian::Little,
        compression: Compression::None,
        checksum: false,
    };
    for entry in codecs {
        let name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
        match name {
            "bytes" => {
                if entry.pointer("/configuration/endian").and_then(Value::as_str) == Some("big") {
                    codec.endian = Endian::Big;
                }
            }
            "gzip" => codec.compression = Compression::Gzip,
            "crc32c" => codec.checksum = true,
            other => {
                return Err(Error::Metadata(format!("unsupported codec '{}'", other)));
            }
        }
    }
    Ok(codec)
}

fn codec_names(codecs: &[Value]) -> impl Iterator<Item = &str> {
    codecs
        .iter()
        .filter_map(|c| c.get("name").and_then(Value::as_str))
}

fn separator(doc: &Value, default: char) -> char {
    doc.pointer("/chunk_key_encoding/configuration/separator")
        .and_then(Value::as_str)
        .and_then(|s| s.chars().next())
        .unwrap_or(default)
}

fn fill_value(value: Option<&Value>) -> f32 {
    match value {
        Some(Value::Number(n)) => n.as_f64().map(|f| f as f32).unwrap_or(f32::NAN),
        Some(Value::String(s)) => match s.as_str() {
            "Infinity" => f32::INFINITY,
            "-Infinity" => f32::NEG_INFINITY,
            _ => f32::NAN,
        },
        _ => f32::NAN,
    }
}

fn u64_list(value: Option<&Value>, field: &str) -> Result<Vec<u64>> {
    value
        .and_then(Value::as_array)
        .and_then(|items| items.iter().map(Value::as_u64).collect::<Option<Vec<u64>>>())
        .ok_or_else(|| Error::Metadata(format!("missing or invalid `{}`", field)))
}

fn string_list(value: &Value, field: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
        })
        .ok_or_else(|| Error::Metadata(format!("invalid `{}`", field)))
}

const X_NAMES: [&str; 3] = ["x", "lon", "longitude"];
const Y_NAMES: [&str; 3] = ["y", "lat", "latitude"];

/// Shape, chunking and coordinates of the drawn variable.
///
/// Shapes are those of the first pyramid level; non-spatial axes are identical
/// on every level, and spatial axes are addressed by tile instead.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetDescription {
    pub variable: String,
    pub version: ZarrVersion,
    pub dimensions: Vec<String>,
    pub shape: Vec<u64>,
    pub chunk_shape: Vec<u64>,
    pub fill_value: f32,
    pub dtype: String,
    pub coordinates: HashMap<String, Vec<CoordValue>>,
    pub tile_size: u32,
    x_axis: usize,
    y_axis: usize,
}

impl DatasetDescription {
    pub fn new(
        variable: impl Into<String>,
        version: ZarrVersion,
        array: &ArrayMetadata,
        tile_size: u32,
    ) -> Result<Self> {
        let variable = variable.into();
        let find = |names: &[&str]| {
            array
                .dimensions
                .iter()
                .position(|d| names.contains(&d.to_lowercase().as_str()))
        };
        let (x_axis, y_axis) = match (find(&X_NAMES), find(&Y_NAMES)) {
            (Some(x), Some(y)) => (x, y),
            _ => {
                return Err(Error::Metadata(format!(
                    "variable '{}' needs one x/lon and one y/lat dimension, found {:?}",
                    variable, array.dimensions
                )))
            }
        };

        Ok(Self {
            variable,
            version,
            dimensions: array.dimensions.clone(),
            shape: array.shape.clone(),
            chunk_shape: array.chunk_shape.clone(),
            fill_value: array.fill_value,
            dtype: array.dtype_name.clone(),
            coordinates: HashMap::default(),
            tile_size,
            x_axis,
            y_axis,
        })
    }

    pub fn x_axis(&self) -> usize {
        self.x_axis
    }

    pub fn y_axis(&self) -> usize {
        self.y_axis
    }

    pub fn is_spatial(&self, axis: usize) -> bool {
        axis == self.x_axis || axis == self.y_axis
    }

    /// Names of the non-spatial dimensions, in axis order
    pub fn extra_dimensions(&self) -> impl Iterator<Item = &str> {
        self.dimensions
            .iter()
            .enumerate()
            .filter(|(axis, _)| !self.is_spatial(*axis))
            .map(|(_, name)| name.as_str())
    }

    /// Index of `value` along `dimension`
    pub fn coordinate_index(&self, dimension: &str, value: &CoordValue) -> Result<usize> {
        let coords = self.coordinates.get(dimension).ok_or_else(|| {
            Error::InvalidSelector(format!("no coordinates loaded for dimension '{}'", dimension))
        })?;
        coords.iter().position(|c| c == value).ok_or_else(|| {
            Error::InvalidSelector(format!(
                "value {} not found along dimension '{}'",
                value, dimension
            ))
        })
    }

    fn chunks_along(&self, axis: usize) -> u64 {
        self.shape[axis].div_ceil(self.chunk_shape[axis])
    }

    /// Chunk indices along each axis that `selector` touches for `tile`.
    ///
    /// Spatial axes pin the tile's row and column; selected axes map each
    /// value to its chunk; unselected axes take every chunk.
    pub fn chunk_indices(&self, selector: &Selector, tile: TileKey) -> Result<Vec<Vec<u64>>> {
        self.dimensions
            .iter()
            .enumerate()
            .map(|(axis, dimension)| {
                if axis == self.x_axis {
                    return Ok(vec![tile.x as u64]);
                }
                if axis == self.y_axis {
                    return Ok(vec![tile.y as u64]);
                }
                match selector.get(dimension) {
                    Some(value) => {
                        let mut indices = Vec::new();
                        for v in value.values() {
                            let chunk =
                                self.coordinate_index(dimension, v)? as u64 / self.chunk_shape[axis];
                            if !indices.contains(&chunk) {
                                indices.push(chunk);
                            }
                        }
                        Ok(indices)
                    }
                    None => Ok((0..self.chunks_along(axis)).collect()),
                }
            })
            .collect()
    }

    /// Every chunk `selector` touches for `tile`, as the cross product of
    /// [`DatasetDescription::chunk_indices`].
    pub fn chunk_keys(&self, selector: &Selector, tile: TileKey) -> Result<Vec<ChunkKey>> {
        let per_axis = self.chunk_indices(selector, tile)?;
        let mut keys: Vec<Vec<u64>> = vec![Vec::with_capacity(per_axis.len())];
        for indices in &per_axis {
            keys = keys
                .into_iter()
                .flat_map(|prefix| {
                    indices.iter().map(move |index| {
                        let mut key = prefix.clone();
                        key.push(*index);
                        key
                    })
                })
                .collect();
        }
        Ok(keys.into_iter().map(ChunkKey::new).collect())
    }
}
