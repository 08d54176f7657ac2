//! Job handlers.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

use crate::job::Job;

/// Handles jobs reserved from a tube.
///
/// Handlers run on their own task per job and may be called concurrently, so
/// they must not assume exclusive access to anything. A handler reports the
/// outcome by acting on the job (delete, release, bury); nothing is returned
/// to the loop.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one job.
    async fn work(&self, job: Job);

    /// Tubes this handler routes, in reservation order.
    ///
    /// `None` means the handler takes whatever the client's default tube holds.
    fn tubes(&self) -> Option<Vec<String>> {
        None
    }
}

/// Adapter to use an async function or closure as a [`Handler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn work(&self, job: Job) {
        (self.f)(job).await
    }
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn work(&self, job: Job) {
        (**self).work(job).await
    }

    fn tubes(&self) -> Option<Vec<String>> {
        (**self).tubes()
    }
}
