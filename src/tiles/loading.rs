//! Observable loading progress.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counters of outstanding work, shared by a pyramid and its store.
///
/// A host can poll [`LoadingState::snapshot`] to drive a spinner or await
/// [`LoadingState::idle`] to know when every pending load has settled.
#[derive(Debug, Default)]
pub struct LoadingState {
    metadata: AtomicUsize,
    tiles: AtomicUsize,
    fetches: AtomicUsize,
    fetched: AtomicUsize,
    settled: Notify,
}

/// Point-in-time copy of a [`LoadingState`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadingSnapshot {
    /// Metadata and coordinate reads in flight
    pub metadata: usize,
    /// Tiles waiting on their chunks, whether cached or not
    pub tiles: usize,
    /// Chunks being fetched from the transport
    pub fetches: usize,
    /// Chunk requests issued to the transport so far
    pub fetched: usize,
}

impl LoadingSnapshot {
    /// Any load at all is outstanding
    pub fn is_loading(&self) -> bool {
        self.metadata > 0 || self.tiles > 0 || self.fetches > 0
    }

    /// A chunk missing from the cache is being fetched
    pub fn is_fetching(&self) -> bool {
        self.fetches > 0
    }

    pub fn is_metadata_loading(&self) -> bool {
        self.metadata > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum LoadKind {
    Metadata,
    Tiles,
    Fetches,
}

impl LoadingState {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, kind: LoadKind) -> &AtomicUsize {
        match kind {
            LoadKind::Metadata => &self.metadata,
            LoadKind::Tiles => &self.tiles,
            LoadKind::Fetches => &self.fetches,
        }
    }

    /// Marks one load of `kind` as started until the guard is dropped.
    pub(crate) fn begin(self: &Arc<Self>, kind: LoadKind) -> LoadGuard {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
        LoadGuard {
            state: Arc::clone(self),
            kind,
        }
    }

    pub(crate) fn record_fetch(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LoadingSnapshot {
        LoadingSnapshot {
            metadata: self.metadata.load(Ordering::SeqCst),
            tiles: self.tiles.load(Ordering::SeqCst),
            fetches: self.fetches.load(Ordering::SeqCst),
            fetched: self.fetched.load(Ordering::Relaxed),
        }
    }

    pub fn is_loading(&self) -> bool {
        self.snapshot().is_loading()
    }

    pub fn is_fetching(&self) -> bool {
        self.fetches.load(Ordering::SeqCst) > 0
    }

    pub fn is_metadata_loading(&self) -> bool {
        self.metadata.load(Ordering::SeqCst) > 0
    }

    /// Resolves once no metadata, tile or fetch load is outstanding.
    pub async fn idle(&self) {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if !self.is_loading() {
                return;
            }
            settled.await;
        }
    }
}

pub(crate) struct LoadGuard {
    state: Arc<LoadingState>,
    kind: LoadKind,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        let previous = self.state.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !self.state.is_loading() {
            self.state.settled.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_waits_for_outstanding_loads() {
        let state = Arc::new(LoadingState::new());
        assert!(!state.is_loading());
        state.idle().await;

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let _guard = state.begin(LoadKind::Tiles);
                tokio::time::sleep(Duration::from_millis(20)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(state.snapshot().tiles, 1);

        tokio::time::timeout(Duration::from_secs(1), state.idle())
            .await
            .unwrap();
        assert!(!state.is_loading());
        waiter.await.unwrap();
    }

    #[test]
    fn test_signals_are_counted_separately() {
        let state = Arc::new(LoadingState::new());

        let tile = state.begin(LoadKind::Tiles);
        assert!(state.is_loading());
        assert!(!state.is_fetching());
        assert!(!state.is_metadata_loading());

        let fetch = state.begin(LoadKind::Fetches);
        let metadata = state.begin(LoadKind::Metadata);
        let snapshot = state.snapshot();
        assert_eq!((snapshot.metadata, snapshot.tiles, snapshot.fetches), (1, 1, 1));
        assert!(snapshot.is_fetching() && snapshot.is_metadata_loading());

        drop(tile);
        drop(metadata);
        assert!(state.is_loading());
        assert!(!state.is_metadata_loading());
        drop(fetch);
        assert_eq!(state.snapshot(), LoadingSnapshot::default());
    }
}
