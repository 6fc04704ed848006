//! Decoding of raw chunk bytes into `f32` arrays, and of shard indexes.

use crate::store::metadata::{ChunkCodec, Compression, DataType, Endian};
use crate::tiles::selector::CoordValue;
use crate::{Error, Result};
use flate2::read::{GzDecoder, ZlibDecoder};
use ndarray::{ArrayD, IxDyn};
use std::io::Read;

const CHECKSUM_LEN: usize = 4;

/// Decodes one encoded chunk into an array of `shape`.
///
/// Every element type is widened or narrowed to `f32`, which is what the
/// buffers handed to a renderer hold.
pub fn decode_chunk(bytes: &[u8], codec: &ChunkCodec, shape: &[u64]) -> Result<ArrayD<f32>> {
    let bytes = strip_checksum(bytes, codec.checksum)?;
    let raw = decompress(bytes, codec.compression)?;
    let values = to_numbers::<f32>(&raw, codec.data_type, codec.endian)?;

    let shape: Vec<usize> = shape.iter().map(|s| *s as usize).collect();
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(Error::Codec(format!(
            "chunk holds {} elements, expected {} for shape {:?}",
            values.len(),
            expected,
            shape
        )));
    }

    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| Error::Codec(e.to_string()))
}

/// Array of `shape` holding only `fill_value`, used for chunks absent from the store
pub fn fill_chunk(shape: &[u64], fill_value: f32) -> ArrayD<f32> {
    let shape: Vec<usize> = shape.iter().map(|s| *s as usize).collect();
    ArrayD::from_elem(IxDyn(&shape), fill_value)
}

fn strip_checksum(bytes: &[u8], checksum: bool) -> Result<&[u8]> {
    if !checksum {
        return Ok(bytes);
    }
    bytes
        .len()
        .checked_sub(CHECKSUM_LEN)
        .map(|end| &bytes[..end])
        .ok_or_else(|| Error::Codec("chunk shorter than its checksum".into()))
}

fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let read = match compression {
        Compression::None => return Ok(bytes.to_vec()),
        Compression::Zlib => ZlibDecoder::new(bytes).read_to_end(&mut out),
        Compression::Gzip => GzDecoder::new(bytes).read_to_end(&mut out),
    };
    read.map_err(|e| Error::Codec(format!("decompression failed: {}", e)))?;
    Ok(out)
}

/// Decodes one chunk of a 1-D coordinate array.
///
/// Numbers keep `f64` precision so coordinates such as timestamps compare
/// exactly; fixed-width text is trimmed of its NUL padding.
pub fn decode_coordinates(bytes: &[u8], codec: &ChunkCodec) -> Result<Vec<CoordValue>> {
    let bytes = strip_checksum(bytes, codec.checksum)?;
    let raw = decompress(bytes, codec.compression)?;
    check_whole(&raw, codec.data_type)?;

    Ok(match codec.data_type {
        DataType::Unicode(width) => raw
            .chunks_exact(width * 4)
            .map(|item| {
                let text: String = item
                    .chunks_exact(4)
                    .filter_map(|c| {
                        let mut buf = [0u8; 4];
                        buf.copy_from_slice(c);
                        let code = match codec.endian {
                            Endian::Little => u32::from_le_bytes(buf),
                            Endian::Big => u32::from_be_bytes(buf),
                        };
                        char::from_u32(code)
                    })
                    .take_while(|c| *c != '\0')
                    .collect();
                CoordValue::Text(text)
            })
            .collect(),
        DataType::Bytes(width) => raw
            .chunks_exact(width)
            .map(|item| {
                let end = item.iter().position(|b| *b == 0).unwrap_or(item.len());
                CoordValue::Text(String::from_utf8_lossy(&item[..end]).into_owned())
            })
            .collect(),
        numeric => to_numbers::<f64>(&raw, numeric, codec.endian)?
            .into_iter()
            .map(CoordValue::Number)
            .collect(),
    })
}

macro_rules! convert {
    ($raw:expr, $endian:expr, $ty:ty, $out:ty) => {{
        const SIZE: usize = std::mem::size_of::<$ty>();
        $raw.chunks_exact(SIZE)
            .map(|c| {
                let mut buf = [0u8; SIZE];
                buf.copy_from_slice(c);
                let v = match $endian {
                    Endian::Little => <$ty>::from_le_bytes(buf),
                    Endian::Big => <$ty>::from_be_bytes(buf),
                };
                v as $out
            })
            .collect::<Vec<$out>>()
    }};
}

fn check_whole(raw: &[u8], data_type: DataType) -> Result<()> {
    if data_type.size() == 0 || raw.len() % data_type.size() != 0 {
        return Err(Error::Codec(format!(
            "{} bytes is not a whole number of {:?} elements",
            raw.len(),
            data_type
        )));
    }
    Ok(())
}

trait FromElement {
    fn convert(raw: &[u8], data_type: DataType, endian: Endian) -> Option<Vec<Self>>
    where
        Self: Sized;
}

macro_rules! from_element {
    ($($out:ty),*) => {
        $(
            impl FromElement for $out {
                fn convert(raw: &[u8], data_type: DataType, endian: Endian) -> Option<Vec<$out>> {
                    Some(match data_type {
                        DataType::Int8 => convert!(raw, endian, i8, $out),
                        DataType::Int16 => convert!(raw, endian, i16, $out),
                        DataType::Int32 => convert!(raw, endian, i32, $out),
                        DataType::Int64 => convert!(raw, endian, i64, $out),
                        DataType::UInt8 => convert!(raw, endian, u8, $out),
                        DataType::UInt16 => convert!(raw, endian, u16, $out),
                        DataType::UInt32 => convert!(raw, endian, u32, $out),
                        DataType::UInt64 => convert!(raw, endian, u64, $out),
                        DataType::Float32 => convert!(raw, endian, f32, $out),
                        DataType::Float64 => convert!(raw, endian, f64, $out),
                        DataType::Unicode(_) | DataType::Bytes(_) => return None,
                    })
                }
            }
        )*
    };
}

from_element!(f32, f64);

fn to_numbers<T: FromElement>(raw: &[u8], data_type: DataType, endian: Endian) -> Result<Vec<T>> {
    check_whole(raw, data_type)?;
    T::convert(raw, data_type, endian)
        .ok_or_else(|| Error::Codec(format!("{:?} elements are not numeric", data_type)))
}

/// Location of one inner chunk inside a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardEntry {
    pub offset: u64,
    pub nbytes: u64,
}

/// Parses a shard index: one little-endian `(offset, nbytes)` pair of `u64`
/// per inner chunk, optionally followed by a 4-byte checksum. Pairs of
/// `u64::MAX` mark chunks that were never written.
pub fn parse_shard_index(
    bytes: &[u8],
    chunk_count: usize,
    checksum: bool,
) -> Result<Vec<Option<ShardEntry>>> {
    let bytes = strip_checksum(bytes, checksum)?;
    if bytes.len() != chunk_count * 16 {
        return Err(Error::Codec(format!(
            "shard index of {} bytes, expected {} entries",
            bytes.len(),
            chunk_count
        )));
    }

    Ok(bytes
        .chunks_exact(16)
        .map(|entry| {
            let mut offset = [0u8; 8];
            let mut nbytes = [0u8; 8];
            offset.copy_from_slice(&entry[..8]);
            nbytes.copy_from_slice(&entry[8..]);
            let offset = u64::from_le_bytes(offset);
            let nbytes = u64::from_le_bytes(nbytes);
            (offset != u64::MAX || nbytes != u64::MAX).then_some(ShardEntry { offset, nbytes })
        })
        .collect())
}

/// Row-major position of an inner chunk within its shard
pub fn shard_position(chunk: &[u64], chunks_per_shard: &[u64]) -> usize {
    chunk
        .iter()
        .zip(chunks_per_shard)
        .fold(0u64, |acc, (index, per)| acc * per + index % per) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn codec(data_type: DataType, compression: Compression) -> ChunkCodec {
        ChunkCodec {
            data_type,
            endian: Endian::Little,
            compression,
            checksum: false,
        }
    }

    #[test]
    fn test_decode_compressed_float_chunk() {
        let values: Vec<f32> = (0..6).map(|v| v as f32 * 0.5).collect();
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&raw).unwrap();
        let compressed = encoder.finish().unwrap();

        let chunk =
            decode_chunk(&compressed, &codec(DataType::Float32, Compression::Zlib), &[2, 3]).unwrap();
        assert_eq!(chunk.shape(), &[2, 3]);
        assert_eq!(chunk[[1, 2]], 2.5);
    }

    #[test]
    fn test_decode_integer_chunk_and_size_mismatch() {
        let raw: Vec<u8> = [1i16, -2, 300, 4]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let chunk = decode_chunk(&raw, &codec(DataType::Int16, Compression::None), &[4]).unwrap();
        assert_eq!(chunk.iter().copied().collect::<Vec<_>>(), vec![1.0, -2.0, 300.0, 4.0]);

        assert!(matches!(
            decode_chunk(&raw, &codec(DataType::Int16, Compression::None), &[5]),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_shard_index() {
        let mut index = Vec::new();
        for (offset, nbytes) in [(0u64, 16u64), (u64::MAX, u64::MAX)] {
            index.extend_from_slice(&offset.to_le_bytes());
            index.extend_from_slice(&nbytes.to_le_bytes());
        }
        index.extend_from_slice(&[0; 4]);

        let entries = parse_shard_index(&index, 2, true).unwrap();
        assert_eq!(entries[0], Some(ShardEntry { offset: 0, nbytes: 16 }));
        assert_eq!(entries[1], None);

        assert_eq!(shard_position(&[3, 1, 0], &[2, 2, 1]), 3);
    }

    #[test]
    fn test_decode_text_coordinates() {
        let mut raw = Vec::new();
        for name in ["ppt", "tavg"] {
            let mut chars: Vec<u32> = name.chars().map(|c| c as u32).collect();
            chars.resize(4, 0);
            raw.extend(chars.iter().flat_map(|c| c.to_le_bytes()));
        }
        let codec = codec(DataType::Unicode(4), Compression::None);
        assert_eq!(
            decode_coordinates(&raw, &codec).unwrap(),
            vec![CoordValue::from("ppt"), CoordValue::from("tavg")]
        );
        assert!(matches!(decode_chunk(&raw, &codec, &[2]), Err(Error::Codec(_))));
    }
}
