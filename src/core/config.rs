//! Configuration for pyramid construction and cache behavior
//!
//! Cache behavior is chosen through presets, mirroring how the map engine's
//! performance profiles resolve into concrete options, or through a custom
//! [`CacheConfig`]. Options deserialize from JSON so a host application can
//! keep them alongside its other settings.

use crate::constants::{BALANCED_CHUNK_CAPACITY, LOW_MEMORY_CHUNK_CAPACITY};
use crate::tiles::selector::Selector;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Zarr metadata layout of a pyramid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZarrVersion {
    /// One consolidated `.zmetadata` document for the whole pyramid
    V2,
    /// A `zarr.json` document per group and array
    V3,
}

impl Default for ZarrVersion {
    fn default() -> Self {
        Self::V2
    }
}

impl FromStr for ZarrVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v2" => Ok(ZarrVersion::V2),
            "v3" => Ok(ZarrVersion::V3),
            other => Err(Error::Config(format!(
                "unexpected `version` provided: '{}', expected 'v2' or 'v3'",
                other
            ))),
        }
    }
}

impl fmt::Display for ZarrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZarrVersion::V2 => f.write_str("v2"),
            ZarrVersion::V3 => f.write_str("v3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheProfile {
    /// Bounded chunk cache sized for typical multi-level browsing
    Balanced,
    /// Small chunk cache and few concurrent requests
    LowMemory,
    /// Never evict, never throttle
    Unbounded,
    Custom(CacheConfig),
}

impl CacheProfile {
    pub fn resolve(&self) -> CacheConfig {
        match self {
            Self::Balanced => CacheConfig {
                chunk_cache_capacity: Some(BALANCED_CHUNK_CAPACITY),
                max_concurrent_fetches: Some(16),
            },
            Self::LowMemory => CacheConfig {
                chunk_cache_capacity: Some(LOW_MEMORY_CHUNK_CAPACITY),
                max_concurrent_fetches: Some(4),
            },
            Self::Unbounded => CacheConfig {
                chunk_cache_capacity: None,
                max_concurrent_fetches: None,
            },
            Self::Custom(config) => config.clone(),
        }
    }
}

impl Default for CacheProfile {
    fn default() -> Self {
        Self::Unbounded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Store-level chunk cache capacity in chunks; `None` keeps every chunk
    #[serde(default)]
    pub chunk_cache_capacity: Option<usize>,
    /// Upper bound on chunk requests in flight at once; `None` is unlimited
    #[serde(default)]
    pub max_concurrent_fetches: Option<usize>,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_cache_capacity == Some(0) {
            return Err(Error::Config("chunk_cache_capacity must be positive".into()));
        }
        if self.max_concurrent_fetches == Some(0) {
            return Err(Error::Config("max_concurrent_fetches must be positive".into()));
        }
        Ok(())
    }
}

/// Everything needed to open a pyramid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PyramidOptions {
    /// Root URL of the pyramid
    pub source: String,
    /// Name of the data variable to draw
    pub variable: String,
    #[serde(default)]
    pub version: ZarrVersion,
    /// Initial selection along the non-spatial dimensions
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub cache: CacheProfile,
}

impl PyramidOptions {
    pub fn new(source: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            variable: variable.into(),
            version: ZarrVersion::default(),
            selector: Selector::default(),
            cache: CacheProfile::default(),
        }
    }

    /// Parse options from a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::Config("must provide `source`".into()));
        }
        if self.variable.trim().is_empty() {
            return Err(Error::Config("must provide `variable`".into()));
        }
        self.cache.resolve().validate()
    }
}
