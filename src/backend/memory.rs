//! In-process backend.
//!
//! `MemoryBackend` keeps tubes in memory and follows beanstalkd job semantics
//! closely enough to run workers without a server: priorities, delays,
//! time-to-run expiry, burying, and per-connection reservations. Clones share
//! one connection; [`MemoryBackend::connection`] opens another connection to
//! the same in-memory server.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::{Backend, Reserved};
use crate::error::{Result, WorkerError};

/// How close to its deadline a reserved job must be to trigger DEADLINE_SOON.
const SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// How often a waiting reserve re-checks the tube.
const RESERVE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ready,
    Delayed { until: Instant },
    Reserved { by: u64, deadline: Instant },
    Buried,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Ready => "ready",
            State::Delayed { .. } => "delayed",
            State::Reserved { .. } => "reserved",
            State::Buried => "buried",
        }
    }
}

#[derive(Debug)]
struct Entry {
    tube: String,
    body: Vec<u8>,
    priority: u32,
    delay: Duration,
    ttr: Duration,
    created: Instant,
    state: State,
    reserves: u64,
    releases: u64,
    buries: u64,
    touches: u64,
}

#[derive(Debug, Default)]
struct Server {
    next_id: u64,
    jobs: HashMap<u64, Entry>,
}

impl Server {
    /// Move delayed jobs whose delay passed and expired reservations to ready.
    fn tick(&mut self, now: Instant) {
        for entry in self.jobs.values_mut() {
            match entry.state {
                State::Delayed { until } if until <= now => entry.state = State::Ready,
                State::Reserved { deadline, .. } if deadline <= now => entry.state = State::Ready,
                _ => {}
            }
        }
    }

    fn deadline_soon(&self, conn: u64, now: Instant) -> bool {
        self.jobs.values().any(|entry| match entry.state {
            State::Reserved { by, deadline } => {
                by == conn && deadline.saturating_duration_since(now) <= SAFETY_MARGIN
            }
            _ => false,
        })
    }

    /// Ready job in `tube` with the most urgent priority, oldest first.
    fn next_ready(&self, tube: &str) -> Option<u64> {
        self.jobs
            .iter()
            .filter(|(_, e)| e.tube == tube && e.state == State::Ready)
            .min_by_key(|(id, e)| (e.priority, **id))
            .map(|(id, _)| *id)
    }

    /// Look up a job reserved by `conn`.
    fn reserved_by(&mut self, id: u64, conn: u64) -> Result<&mut Entry> {
        match self.jobs.get_mut(&id) {
            Some(entry) if matches!(entry.state, State::Reserved { by, .. } if by == conn) => {
                Ok(entry)
            }
            _ => Err(WorkerError::NotFound(id)),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    server: Mutex<Server>,
    next_conn: AtomicU64,
    ready: Notify,
}

/// In-memory backend for tests and local development.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    conn: u64,
    closed: Arc<AtomicBool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty in-memory server and a first connection to it.
    pub fn new() -> Self {
        Self::attach(Arc::new(Shared::default()))
    }

    /// Open another connection to the same in-memory server.
    pub fn connection(&self) -> Self {
        Self::attach(self.shared.clone())
    }

    fn attach(shared: Arc<Shared>) -> Self {
        let conn = shared.next_conn.fetch_add(1, Ordering::SeqCst);
        Self {
            shared,
            conn,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Put a job into `tube`. Returns the new job id.
    pub fn put(
        &self,
        tube: &str,
        body: impl Into<Vec<u8>>,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64> {
        self.ensure_open()?;
        if tube.is_empty() {
            return Err(WorkerError::Server("BAD_FORMAT".to_string()));
        }

        let now = Instant::now();
        let state = if delay.is_zero() {
            State::Ready
        } else {
            State::Delayed { until: now + delay }
        };

        let id = {
            let mut server = self.shared.server.lock();
            server.next_id += 1;
            let id = server.next_id;
            server.jobs.insert(
                id,
                Entry {
                    tube: tube.to_string(),
                    body: body.into(),
                    priority,
                    delay,
                    ttr: ttr.max(Duration::from_secs(1)),
                    created: now,
                    state,
                    reserves: 0,
                    releases: 0,
                    buries: 0,
                    touches: 0,
                },
            );
            id
        };

        if delay.is_zero() {
            self.shared.ready.notify_one();
        }
        tracing::trace!(job_id = id, tube = %tube, "Job put");
        Ok(id)
    }

    /// Number of jobs in `tube` currently in the ready state.
    pub fn ready_count(&self, tube: &str) -> usize {
        let mut server = self.shared.server.lock();
        server.tick(Instant::now());
        server
            .jobs
            .values()
            .filter(|e| e.tube == tube && e.state == State::Ready)
            .count()
    }

    fn try_reserve(&self, tube: &str) -> Result<Option<Reserved>> {
        let now = Instant::now();
        let mut server = self.shared.server.lock();
        server.tick(now);

        if server.deadline_soon(self.conn, now) {
            return Err(WorkerError::DeadlineSoon);
        }

        let Some(id) = server.next_ready(tube) else {
            return Ok(None);
        };
        let conn = self.conn;
        let entry = server
            .jobs
            .get_mut(&id)
            .ok_or(WorkerError::NotFound(id))?;
        entry.state = State::Reserved {
            by: conn,
            deadline: now + entry.ttr,
        };
        entry.reserves += 1;
        Ok(Some(Reserved {
            id,
            body: entry.body.clone(),
        }))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn reserve(&self, tube: &str, timeout: Duration) -> Result<Reserved> {
        let deadline = Instant::now() + timeout;
        loop {
            self.ensure_open()?;
            if let Some(job) = self.try_reserve(tube)? {
                return Ok(job);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(WorkerError::Timeout);
            }
            tokio::time::sleep(RESERVE_POLL.min(deadline - now)).await;
        }
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        let mut server = self.shared.server.lock();
        server.tick(Instant::now());
        let deletable = match server.jobs.get(&id).map(|e| e.state) {
            Some(State::Reserved { by, .. }) => by == self.conn,
            Some(_) => true,
            None => false,
        };
        if !deletable {
            return Err(WorkerError::NotFound(id));
        }
        server.jobs.remove(&id);
        Ok(())
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        self.ensure_open()?;
        {
            let now = Instant::now();
            let mut server = self.shared.server.lock();
            server.tick(now);
            let entry = server.reserved_by(id, self.conn)?;
            entry.priority = priority;
            entry.delay = delay;
            entry.releases += 1;
            entry.state = if delay.is_zero() {
                State::Ready
            } else {
                State::Delayed { until: now + delay }
            };
        }
        if delay.is_zero() {
            self.shared.ready.notify_one();
        }
        Ok(())
    }

    async fn touch(&self, id: u64) -> Result<()> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut server = self.shared.server.lock();
        server.tick(now);
        let conn = self.conn;
        let entry = server.reserved_by(id, conn)?;
        entry.state = State::Reserved {
            by: conn,
            deadline: now + entry.ttr,
        };
        entry.touches += 1;
        Ok(())
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<()> {
        self.ensure_open()?;
        let mut server = self.shared.server.lock();
        server.tick(Instant::now());
        let entry = server.reserved_by(id, self.conn)?;
        entry.priority = priority;
        entry.buries += 1;
        entry.state = State::Buried;
        Ok(())
    }

    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>> {
        self.ensure_open()?;
        let now = Instant::now();
        let mut server = self.shared.server.lock();
        server.tick(now);
        let entry = server.jobs.get(&id).ok_or(WorkerError::NotFound(id))?;

        let time_left = match entry.state {
            State::Reserved { deadline, .. } => deadline.saturating_duration_since(now),
            State::Delayed { until } => until.saturating_duration_since(now),
            State::Ready | State::Buried => Duration::ZERO,
        };

        let fields = [
            ("id", id.to_string()),
            ("tube", entry.tube.clone()),
            ("state", entry.state.name().to_string()),
            ("pri", entry.priority.to_string()),
            ("age", now.duration_since(entry.created).as_secs().to_string()),
            ("delay", entry.delay.as_secs().to_string()),
            ("ttr", entry.ttr.as_secs().to_string()),
            ("time-left", time_left.as_secs().to_string()),
            ("reserves", entry.reserves.to_string()),
            ("releases", entry.releases.to_string()),
            ("buries", entry.buries.to_string()),
            ("touches", entry.touches.to_string()),
        ];
        Ok(fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Like a dropped beanstalkd connection, reservations go back to ready.
        let released = {
            let mut server = self.shared.server.lock();
            let mut released = 0;
            for entry in server.jobs.values_mut() {
                if matches!(entry.state, State::Reserved { by, .. } if by == self.conn) {
                    entry.state = State::Ready;
                    released += 1;
                }
            }
            released
        };
        if released > 0 {
            self.shared.ready.notify_one();
        }
        Ok(())
    }

    async fn wait_for_jobs(&self) {
        self.shared.ready.notified().await
    }
}
