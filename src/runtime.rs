//! Runtime abstraction for background chunk loads
//!
//! The pyramid never spawns tasks on its own; it is handed an [`AsyncSpawner`]
//! so hosts decide which executor runs chunk loads. [`TokioSpawner`] is the
//! default.

use crate::prelude::{Future, Pin};
use crate::{Error, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Boxed unit future handed to a spawner
pub type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A trait for spawning async tasks (object-safe version)
pub trait AsyncSpawner: Send + Sync + 'static {
    /// Spawn a future and return a handle to it
    fn spawn_boxed(&self, future: BoxedTask) -> Box<dyn AsyncHandle>;
}

/// Handle to a spawned async task
pub trait AsyncHandle: Send + Sync {
    /// Check if the task is finished
    fn is_finished(&self) -> bool;

    /// Cancel the task
    fn cancel(&self);
}

/// Spawn a future on `spawner` without boxing at the call site
pub fn spawn<F>(spawner: &dyn AsyncSpawner, future: F) -> Box<dyn AsyncHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    spawner.spawn_boxed(Box::pin(future))
}

/// Tokio-based async spawner
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    /// Spawner for the runtime the caller is running in
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| Error::Config(format!("no tokio runtime available: {}", e)))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl AsyncSpawner for TokioSpawner {
    fn spawn_boxed(&self, future: BoxedTask) -> Box<dyn AsyncHandle> {
        Box::new(TokioHandle(self.handle.spawn(future)))
    }
}

struct TokioHandle(JoinHandle<()>);

impl AsyncHandle for TokioHandle {
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    fn cancel(&self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_spawner() {
        let spawner = TokioSpawner::current().unwrap();
        let handle = spawn(&spawner, async {
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        });

        // Should not be finished immediately
        assert!(!handle.is_finished());

        // Wait a bit and check again
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_spawner_requires_runtime() {
        assert!(matches!(TokioSpawner::current(), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_cancel_stops_task() {
        let spawner = TokioSpawner::current().unwrap();
        let handle = spawn(&spawner, async {
            tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
        });
        handle.cancel();
        tokio::task::yield_now().await;
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        assert!(handle.is_finished());
    }
}
