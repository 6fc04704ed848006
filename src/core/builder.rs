//! Pyramid builder for fluent API configuration
//!
//! This module provides a PyramidBuilder that assembles the options, transport,
//! metadata registry, spawner and loading state a pyramid needs.

use crate::{
    core::config::{CacheConfig, CacheProfile, PyramidOptions, ZarrVersion},
    runtime::{AsyncSpawner, TokioSpawner},
    store::{registry::MetadataRegistry, transport::Transport, PyramidStore, StoreConfig},
    tiles::{loading::LoadingState, pyramid::TilePyramid, selector::Selector},
    Error, Result,
};
use std::sync::Arc;

/// Builder for creating and configuring TilePyramid instances
pub struct PyramidBuilder {
    options: PyramidOptions,
    transport: Option<Arc<dyn Transport>>,
    registry: Option<Arc<MetadataRegistry>>,
    spawner: Option<Arc<dyn AsyncSpawner>>,
    loading: Option<Arc<LoadingState>>,
}

impl PyramidBuilder {
    /// Create a new PyramidBuilder for `variable` in the pyramid at `source`
    pub fn new(source: impl Into<String>, variable: impl Into<String>) -> Self {
        Self::from_options(PyramidOptions::new(source, variable))
    }

    /// Start from previously loaded options
    pub fn from_options(options: PyramidOptions) -> Self {
        Self {
            options,
            transport: None,
            registry: None,
            spawner: None,
            loading: None,
        }
    }

    /// Set the Zarr metadata layout
    pub fn with_version(mut self, version: ZarrVersion) -> Self {
        self.options.version = version;
        self
    }

    /// Set the initial selector, which also fixes the band names
    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.options.selector = selector;
        self
    }

    /// Set the cache profile
    pub fn with_cache_profile(mut self, profile: CacheProfile) -> Self {
        self.options.cache = profile;
        self
    }

    /// Set custom cache options
    pub fn with_cache_config(mut self, config: CacheConfig) -> Self {
        self.options.cache = CacheProfile::Custom(config);
        self
    }

    /// Fetch metadata and chunks through `transport` instead of HTTP
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share metadata with other pyramids through `registry` instead of the
    /// process-wide one
    pub fn with_registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run chunk loads on `spawner` instead of the current tokio runtime
    pub fn with_spawner(mut self, spawner: Arc<dyn AsyncSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Report progress into an existing loading state
    pub fn with_loading_state(mut self, loading: Arc<LoadingState>) -> Self {
        self.loading = Some(loading);
        self
    }

    fn default_transport() -> Result<Arc<dyn Transport>> {
        #[cfg(feature = "http")]
        {
            Ok(Arc::new(crate::store::transport::HttpTransport::new()))
        }

        #[cfg(not(feature = "http"))]
        {
            Err(Error::Config(
                "no transport given and the `http` feature is disabled".into(),
            ))
        }
    }

    /// Resolve the pyramid metadata and create every tile
    pub async fn build(self) -> Result<Arc<TilePyramid>> {
        self.options.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Self::default_transport()?,
        };
        let spawner: Arc<dyn AsyncSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(TokioSpawner::current()?),
        };
        let PyramidOptions {
            source,
            variable,
            version,
            selector,
            cache,
        } = self.options;

        let store = PyramidStore::open(StoreConfig {
            source,
            variable,
            version,
            cache: cache.resolve(),
            transport,
            registry: self.registry.unwrap_or_else(MetadataRegistry::global),
            loading: self.loading.unwrap_or_default(),
        })
        .await?;

        for dimension in selector.iter().map(|(d, _)| d) {
            if !store.dataset().dimensions.contains(dimension) {
                return Err(Error::InvalidSelector(format!(
                    "'{}' is not a dimension of '{}'",
                    dimension,
                    store.dataset().variable
                )));
            }
        }

        Ok(Arc::new(TilePyramid::new(store, selector, spawner)))
    }
}
