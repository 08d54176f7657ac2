//! Queue connection abstraction.
//!
//! The reservation loop and every [`Job`](crate::Job) talk to the queue server
//! through the [`Backend`] trait. Two implementations ship with the crate:
//! [`BeanstalkdBackend`] speaks the beanstalkd text protocol over TCP, and
//! [`MemoryBackend`] keeps tubes in process for tests and local development.
//!
//! A backend is shared by the loop and every dispatch task, so implementations
//! must tolerate concurrent calls (Send + Sync, one operation at a time on the
//! wire if the transport requires it).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

pub mod beanstalkd;
pub mod memory;

pub use beanstalkd::BeanstalkdBackend;
pub use memory::MemoryBackend;

/// A job handed out by a successful reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    /// Server-assigned job id.
    pub id: u64,
    /// Raw job body.
    pub body: Vec<u8>,
}

/// Backend trait for queue server operations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reserve a ready job from `tube`, waiting at most `timeout`.
    ///
    /// Fails with [`WorkerError::Timeout`](crate::WorkerError::Timeout) when
    /// nothing is ready and with
    /// [`WorkerError::DeadlineSoon`](crate::WorkerError::DeadlineSoon) when a
    /// job held by this connection is about to expire. Any other error is a
    /// real fault.
    async fn reserve(&self, tube: &str, timeout: Duration) -> Result<Reserved>;

    /// Remove a job from the server.
    async fn delete(&self, id: u64) -> Result<()>;

    /// Put a reserved job back into the ready queue after `delay`.
    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<()>;

    /// Restart the time-to-run of a reserved job.
    async fn touch(&self, id: u64) -> Result<()>;

    /// Move a reserved job to the buried state.
    async fn bury(&self, id: u64, priority: u32) -> Result<()>;

    /// Fetch the key/value stats snapshot of a job.
    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;

    /// Resolve when new work may have become ready.
    ///
    /// Lets the idle wait end early. Backends that cannot tell never resolve,
    /// and an idle client then picks up new work only when its
    /// [`idle_wait`](crate::ClientConfig::idle_wait) elapses. This is the case
    /// for [`BeanstalkdBackend`]: the protocol has no way to announce a put
    /// to a connection that is not blocked in `reserve`, so a fresh job on an
    /// idle beanstalkd worker waits up to one idle interval. [`MemoryBackend`]
    /// wakes on every put and release.
    async fn wait_for_jobs(&self) {
        std::future::pending::<()>().await
    }
}

/// A type-erased backend that can be shared across threads.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Wrap an already shared backend.
    pub fn from_arc(inner: DynBackend) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn reserve(&self, tube: &str, timeout: Duration) -> Result<Reserved> {
        self.inner.reserve(tube, timeout).await
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        self.inner.release(id, priority, delay).await
    }

    async fn touch(&self, id: u64) -> Result<()> {
        self.inner.touch(id).await
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<()> {
        self.inner.bury(id, priority).await
    }

    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>> {
        self.inner.stats_job(id).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn wait_for_jobs(&self) {
        self.inner.wait_for_jobs().await
    }
}
