//! Reservation loop.
//!
//! A [`Client`] polls every tube of its handler in a fixed order with a
//! zero-wait reserve, hands each reserved job to the handler on its own task,
//! and idles for [`ClientConfig::idle_wait`] after a cycle that found nothing.
//! A stop (explicit or SIGINT/SIGTERM) ends reservations immediately; the run
//! returns once every dispatched handler has finished.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

use crate::backend::{Backend, BeanstalkdBackend, SharedBackend};
use crate::config::ClientConfig;
use crate::error::{Result, WorkerError};
use crate::handler::Handler;
use crate::job::Job;
use crate::shutdown::{SignalListener, StopReason, StopSignal};

/// Worker client that reserves jobs and dispatches them to a handler.
pub struct Client {
    config: ClientConfig,
    handler: Arc<dyn Handler>,
    /// Stop signal of the active run, if any.
    stop: Mutex<Option<Arc<StopSignal>>>,
}

impl Client {
    /// Create a client for the beanstalkd server at `addr`.
    pub fn new(addr: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self::with_config(ClientConfig::new(addr), handler)
    }

    /// Create a client with the given configuration.
    pub fn with_config(config: ClientConfig, handler: impl Handler + 'static) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            stop: Mutex::new(None),
        }
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.stop.lock().is_some()
    }

    /// Connect to the configured address and work until stopped.
    ///
    /// Returns the stop reason on a voluntary stop, or the first fatal error.
    pub async fn connect_and_work(&self) -> Result<StopReason> {
        self.config.validate()?;
        tracing::info!(addr = %self.config.addr, "Connecting to beanstalkd");
        let backend = BeanstalkdBackend::connect(self.config.addr.as_str()).await?;
        self.reserve(backend).await
    }

    /// Reserve and dispatch jobs on `backend` until stopped.
    ///
    /// The backend is closed before this returns, whatever the outcome.
    pub async fn reserve<B: Backend + 'static>(&self, backend: B) -> Result<StopReason> {
        let backend = SharedBackend::new(backend);

        let outcome = match self.arm() {
            Ok(stop) => {
                let outcome = self.run(&backend, &stop).await;
                self.disarm(&stop);
                outcome
            }
            Err(e) => Err(e),
        };

        if let Err(e) = backend.close().await {
            tracing::warn!(error = %e, "Failed to close connection");
        }

        match &outcome {
            Ok(reason) => tracing::info!(reason = ?reason, "Client stopped"),
            Err(e) => tracing::error!(error = %e, "Client stopped on error"),
        }
        outcome
    }

    /// Stop reserving jobs and let dispatched handlers finish.
    ///
    /// Returns `true` if this call stopped the active run, `false` if the run
    /// was already stopping or no run is active.
    pub fn stop(&self) -> bool {
        let current = self.stop.lock().clone();
        match current {
            Some(stop) => {
                let fired = stop.trigger(StopReason::Requested);
                if fired {
                    tracing::info!("Stop requested");
                } else {
                    tracing::warn!("Client is already stopping, ignoring stop");
                }
                fired
            }
            None => {
                tracing::warn!("Stop called while client is not running");
                false
            }
        }
    }

    fn arm(&self) -> Result<Arc<StopSignal>> {
        let mut current = self.stop.lock();
        if current.is_some() {
            return Err(WorkerError::AlreadyRunning);
        }
        let stop = Arc::new(StopSignal::new());
        *current = Some(stop.clone());
        Ok(stop)
    }

    fn disarm(&self, stop: &Arc<StopSignal>) {
        let mut current = self.stop.lock();
        if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, stop)) {
            *current = None;
        }
    }

    fn tubes(&self) -> Vec<String> {
        self.handler
            .tubes()
            .unwrap_or_else(|| vec![self.config.default_tube.clone()])
    }

    async fn run(&self, backend: &SharedBackend, stop: &Arc<StopSignal>) -> Result<StopReason> {
        // Outstanding work: the signal listener plus one task per dispatched job.
        let mut tasks = JoinSet::new();

        if self.config.handle_signals {
            let listener = SignalListener::install()?;
            tasks.spawn(listener.run(stop.clone()));
        }

        let tubes = self.tubes();
        if tubes.is_empty() {
            tracing::warn!("Handler routes no tubes, nothing will be reserved");
        }
        tracing::info!(tubes = ?tubes, "Client started");

        let outcome = self.poll(backend, &tubes, stop, &mut tasks).await;
        if outcome.is_err() {
            stop.abort();
        }

        tracing::debug!(outstanding = tasks.len(), "Draining");
        while let Some(result) = tasks.join_next().await {
            log_task_result(result);
        }

        outcome
    }

    async fn poll(
        &self,
        backend: &SharedBackend,
        tubes: &[String],
        stop: &StopSignal,
        tasks: &mut JoinSet<()>,
    ) -> Result<StopReason> {
        loop {
            let mut found = false;

            for tube in tubes {
                match backend.reserve(tube, self.config.reserve_timeout).await {
                    Ok(reserved) => {
                        found = true;
                        let job = Job::new(backend.clone(), tube.as_str(), reserved.id, reserved.body);
                        self.dispatch(tasks, job);
                    }
                    Err(e) if e.is_timeout_or_deadline() => {}
                    Err(e) => {
                        tracing::error!(tube = %tube, error = %e, "Reservation failed");
                        return Err(e);
                    }
                }

                if stop.is_stopped() {
                    return Ok(stopped_reason(stop));
                }
            }

            while let Some(result) = tasks.try_join_next() {
                log_task_result(result);
            }

            if found {
                // Drain the backlog without delay, but let dispatched tasks run.
                tokio::task::yield_now().await;
                continue;
            }

            tracing::trace!("No jobs ready");
            tokio::select! {
                _ = stop.stopped() => return Ok(stopped_reason(stop)),
                _ = tokio::time::sleep(self.config.idle_wait) => {}
                _ = backend.wait_for_jobs() => {}
            }
        }
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, job: Job) {
        tracing::debug!(job_id = job.id, tube = %job.tube, "Dispatching job");
        let handler = self.handler.clone();
        tasks.spawn(async move { handler.work(job).await });
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn stopped_reason(stop: &StopSignal) -> StopReason {
    stop.reason().unwrap_or(StopReason::Requested)
}

/// Handler panics stay inside their task; report them here.
fn log_task_result(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!(error = %e, "Handler panicked");
        } else {
            tracing::warn!(error = %e, "Task cancelled");
        }
    }
}

/// Connect to `addr` and dispatch jobs to `handler` until stopped.
pub async fn connect_and_work(
    addr: impl Into<String>,
    handler: impl Handler + 'static,
) -> Result<StopReason> {
    Client::new(addr, handler).connect_and_work().await
}
