//! Tube router.
//!
//! [`Router`] maps tube names to handlers and is itself a [`Handler`]: given a
//! job it calls the handler registered for the job's tube. When a router is
//! handed to a [`Client`](crate::Client), the client reserves from exactly the
//! tubes registered on it.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::handler::Handler;
use crate::job::Job;

/// Job multiplexer keyed by tube name.
#[derive(Default)]
pub struct Router {
    table: RwLock<BTreeMap<String, Arc<dyn Handler>>>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tube`.
    ///
    /// # Panics
    ///
    /// Panics if `tube` is empty or already has a handler. Both are setup
    /// bugs; registration never replaces an existing handler.
    pub fn handle(&self, tube: impl Into<String>, handler: impl Handler + 'static) {
        self.handle_arc(tube, Arc::new(handler));
    }

    /// Register an already shared handler for `tube`.
    ///
    /// # Panics
    ///
    /// Same conditions as [`handle`](Router::handle).
    pub fn handle_arc(&self, tube: impl Into<String>, handler: Arc<dyn Handler>) {
        let tube = tube.into();
        if tube.is_empty() {
            panic!("invalid tube");
        }

        let mut table = self.table.write();
        if table.contains_key(&tube) {
            panic!("multiple registrations for {}", tube);
        }
        tracing::debug!(tube = %tube, "Handler registered");
        table.insert(tube, handler);
    }

    /// Handler registered for `tube`, if any.
    pub fn handler(&self, tube: &str) -> Option<Arc<dyn Handler>> {
        self.table.read().get(tube).cloned()
    }

    /// Names of all registered tubes, sorted.
    pub fn tube_names(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }
}

#[async_trait]
impl Handler for Router {
    /// Dispatch `job` to the handler of its tube.
    ///
    /// # Panics
    ///
    /// Panics if no handler is registered for the job's tube. Dropping the job
    /// instead would leave it reserved until its time-to-run runs out.
    async fn work(&self, job: Job) {
        let handler = match self.handler(&job.tube) {
            Some(handler) => handler,
            None => panic!("no handler for tube {}", job.tube),
        };
        handler.work(job).await
    }

    fn tubes(&self) -> Option<Vec<String>> {
        Some(self.tube_names())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("tubes", &self.tube_names())
            .finish()
    }
}
