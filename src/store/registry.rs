//! Process-wide cache of metadata documents and coordinate arrays.
//!
//! Pyramids opened against the same source share one registry, so opening a
//! second pyramid (or re-opening the first) costs no metadata requests.

use crate::core::config::ZarrVersion;
use crate::prelude::{Arc, HashMap, Mutex};
use crate::store::transport::Transport;
use crate::tiles::flight::SingleFlight;
use crate::tiles::selector::CoordValue;
use crate::Result;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::future::Future;
use std::sync::PoisonError;

type DocumentKey = (ZarrVersion, String);

/// Coordinate values of one dimension, shared between pyramids
pub type Coordinates = Arc<Vec<CoordValue>>;

static GLOBAL_REGISTRY: Lazy<Arc<MetadataRegistry>> =
    Lazy::new(|| Arc::new(MetadataRegistry::new()));

#[derive(Default)]
pub struct MetadataRegistry {
    documents: Mutex<HashMap<DocumentKey, Arc<Value>>>,
    coordinates: Mutex<HashMap<String, Coordinates>>,
    document_flight: SingleFlight<DocumentKey, Arc<Value>>,
    coordinate_flight: SingleFlight<String, Coordinates>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry shared by every pyramid that is not given its own
    pub fn global() -> Arc<MetadataRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Fetches the JSON document at `url` once; later calls reuse it.
    pub async fn document(
        &self,
        transport: Arc<dyn Transport>,
        version: ZarrVersion,
        url: &str,
    ) -> Result<Arc<Value>> {
        let key = (version, url.to_string());
        if let Some(document) = self.cached_document(&key) {
            return Ok(document);
        }

        let fetch_url = url.to_string();
        let document = self
            .document_flight
            .get_or_create(key.clone(), move || async move {
                log::debug!("loading {} metadata from {}", version, fetch_url);
                transport.fetch_json(&fetch_url).await.map(Arc::new)
            })
            .await?;

        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&document));
        Ok(document)
    }

    fn cached_document(&self, key: &DocumentKey) -> Option<Arc<Value>> {
        self.documents
            .lock()
            .ok()
            .and_then(|documents| documents.get(key).cloned())
    }

    /// Coordinates cached under `key`, produced by `loader` on first use.
    pub async fn coordinates<F, Fut>(&self, key: String, loader: F) -> Result<Coordinates>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Coordinates>> + Send + 'static,
    {
        let cached = self
            .coordinates
            .lock()
            .ok()
            .and_then(|coordinates| coordinates.get(&key).cloned());
        if let Some(values) = cached {
            return Ok(values);
        }

        let values = self.coordinate_flight.get_or_create(key.clone(), loader).await?;
        self.coordinates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&values));
        Ok(values)
    }

    /// Number of cached metadata documents
    pub fn document_count(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Drops every cached document and coordinate array
    pub fn clear(&self) {
        if let Ok(mut documents) = self.documents.lock() {
            documents.clear();
        }
        if let Ok(mut coordinates) = self.coordinates.lock() {
            coordinates.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::transport::MemoryTransport;
    use serde_json::json;

    #[tokio::test]
    async fn test_documents_are_fetched_once() {
        let transport = Arc::new(MemoryTransport::new());
        transport.insert_json("mem://p/.zmetadata", &json!({ "metadata": {} }));
        let registry = MetadataRegistry::new();

        let (a, b) = futures::join!(
            registry.document(transport.clone(), ZarrVersion::V2, "mem://p/.zmetadata"),
            registry.document(transport.clone(), ZarrVersion::V2, "mem://p/.zmetadata"),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        registry
            .document(transport.clone(), ZarrVersion::V2, "mem://p/.zmetadata")
            .await
            .unwrap();

        assert_eq!(transport.request_count("mem://p/.zmetadata"), 1);
        assert_eq!(registry.document_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_documents_are_retried() {
        let transport = Arc::new(MemoryTransport::new());
        let registry = MetadataRegistry::new();

        assert!(registry
            .document(transport.clone(), ZarrVersion::V3, "mem://p/zarr.json")
            .await
            .is_err());
        transport.insert_json("mem://p/zarr.json", &json!({ "zarr_format": 3 }));
        assert!(registry
            .document(transport.clone(), ZarrVersion::V3, "mem://p/zarr.json")
            .await
            .is_ok());
        assert_eq!(transport.request_count("mem://p/zarr.json"), 2);
    }
}
