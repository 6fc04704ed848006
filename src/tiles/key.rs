use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of one cell of the quad-tree pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
    pub z: u8,
}

impl TileKey {
    pub fn new(x: u32, y: u32, z: u8) -> Self {
        Self { x, y, z }
    }

    /// Number of tiles along one axis at level `z`
    pub fn dim(z: u8) -> u32 {
        1u32 << z
    }

    /// Checks if the tile is valid for its zoom level
    pub fn is_valid(&self) -> bool {
        let max_coord = Self::dim(self.z);
        self.x < max_coord && self.y < max_coord
    }

    /// Gets the parent tile at a lower zoom level
    pub fn parent(&self) -> Option<TileKey> {
        if self.z == 0 {
            None
        } else {
            Some(TileKey::new(self.x / 2, self.y / 2, self.z - 1))
        }
    }

    /// Gets the four child tiles at the next zoom level
    pub fn children(&self) -> [TileKey; 4] {
        let (x, y, z) = (self.x * 2, self.y * 2, self.z + 1);
        [
            TileKey::new(x, y, z),
            TileKey::new(x + 1, y, z),
            TileKey::new(x, y + 1, z),
            TileKey::new(x + 1, y + 1, z),
        ]
    }

    /// The tile at level `z` containing this one, if `z` is not deeper.
    pub fn ancestor_at(&self, z: u8) -> Option<TileKey> {
        if z > self.z {
            return None;
        }
        let shift = self.z - z;
        Some(TileKey::new(self.x >> shift, self.y >> shift, z))
    }

    /// Whether `self` lies strictly above `other` in the same branch of the tree.
    pub fn is_ancestor_of(&self, other: &TileKey) -> bool {
        self.z < other.z && other.ancestor_at(self.z) == Some(*self)
    }

    /// All tiles at level `z` covering this tile's footprint, row by row.
    pub fn descendants_at(&self, z: u8) -> Vec<TileKey> {
        if z < self.z {
            return Vec::new();
        }
        let factor = 1u32 << (z - self.z);
        let (x0, y0) = (self.x * factor, self.y * factor);
        let mut keys = Vec::with_capacity((factor * factor) as usize);
        for y in y0..y0 + factor {
            for x in x0..x0 + factor {
                keys.push(TileKey::new(x, y, z));
            }
        }
        keys
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.x, self.y, self.z)
    }
}

impl FromStr for TileKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let invalid = || Error::Config(format!("invalid tile key '{}'", s));
        if parts.len() != 3 {
            return Err(invalid());
        }
        let x = parts[0].parse().map_err(|_| invalid())?;
        let y = parts[1].parse().map_err(|_| invalid())?;
        let z = parts[2].parse().map_err(|_| invalid())?;
        Ok(TileKey::new(x, y, z))
    }
}

/// On-screen position of a tile before wraparound clipping.
///
/// `x` may fall outside `[0, 2^z)` when the world repeats horizontally; the
/// cache tile drawn at this position is the offset clipped back into range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileOffset {
    pub x: i64,
    pub y: i64,
    pub z: u8,
}

impl TileOffset {
    pub fn new(x: i64, y: i64, z: u8) -> Self {
        Self { x, y, z }
    }
}

impl From<TileKey> for TileOffset {
    fn from(key: TileKey) -> Self {
        TileOffset::new(key.x as i64, key.y as i64, key.z)
    }
}

/// Index vector of one storage chunk, one entry per dataset axis
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey(pub Vec<u64>);

impl ChunkKey {
    pub fn new(indices: Vec<u64>) -> Self {
        Self(indices)
    }

    pub fn indices(&self) -> &[u64] {
        &self.0
    }

    /// Storage key using `separator` between indices (`0.1.2` or `0/1/2`)
    pub fn encode(&self, separator: char) -> String {
        let mut out = String::new();
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(separator);
            }
            out.push_str(&index.to_string());
        }
        out
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode('.'))
    }
}

impl From<Vec<u64>> for ChunkKey {
    fn from(indices: Vec<u64>) -> Self {
        Self(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_key_string_form() {
        let key = TileKey::new(3, 5, 4);
        assert_eq!(key.to_string(), "3,5,4");
        assert_eq!("3,5,4".parse::<TileKey>().unwrap(), key);
        assert!("3,5".parse::<TileKey>().is_err());
    }

    #[test]
    fn test_parent_and_children() {
        let key = TileKey::new(5, 6, 3);
        assert_eq!(key.parent(), Some(TileKey::new(2, 3, 2)));
        assert_eq!(TileKey::new(0, 0, 0).parent(), None);
        for child in key.children() {
            assert_eq!(child.parent(), Some(key));
        }
    }

    #[test]
    fn test_ancestor_and_descendants() {
        let key = TileKey::new(1, 0, 1);
        let grandchildren = key.descendants_at(3);
        assert_eq!(grandchildren.len(), 16);
        assert!(grandchildren.iter().all(|k| k.ancestor_at(1) == Some(key)));
        assert!(key.is_ancestor_of(&grandchildren[5]));
        assert!(!key.is_ancestor_of(&key));
        assert_eq!(key.ancestor_at(2), None);
    }

    #[test]
    fn test_chunk_key_encoding() {
        let chunk = ChunkKey::new(vec![0, 2, 1]);
        assert_eq!(chunk.encode('.'), "0.2.1");
        assert_eq!(chunk.encode('/'), "0/2/1");
        assert_eq!(chunk.to_string(), "0.2.1");
    }
}
