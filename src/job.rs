//! Reserved jobs and their state transitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::backend::{Backend, SharedBackend};
use crate::error::{Result, WorkerError};

/// A job reserved by a worker.
///
/// The id is only meaningful on the connection that reserved the job; every
/// operation goes through that connection and fails once it is closed. Exactly
/// one of [`delete`](Job::delete), [`release`](Job::release) or
/// [`bury`](Job::bury) should end the reservation.
#[derive(Clone)]
pub struct Job {
    /// Server-assigned job id.
    pub id: u64,
    /// Tube the job was reserved from.
    pub tube: String,
    /// Raw job body.
    pub body: Vec<u8>,
    conn: SharedBackend,
}

/// Statistical information about a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Job priority, 0 is most urgent.
    pub priority: u32,
    /// Time since the job was created.
    pub age: Duration,
    /// Time until the reservation expires.
    pub time_left: Duration,
}

impl JobStats {
    /// Build stats from a `stats-job` snapshot.
    ///
    /// Requires `pri`, `age` and `time-left`, all integers.
    pub fn from_snapshot(snapshot: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            priority: field(snapshot, "pri")?,
            age: Duration::from_secs(field(snapshot, "age")?),
            time_left: Duration::from_secs(field(snapshot, "time-left")?),
        })
    }
}

fn field<T: std::str::FromStr>(snapshot: &HashMap<String, String>, key: &str) -> Result<T> {
    let raw = snapshot
        .get(key)
        .ok_or_else(|| WorkerError::Stats(format!("missing field {}", key)))?;
    raw.trim()
        .parse()
        .map_err(|_| WorkerError::Stats(format!("field {} is not an integer: {:?}", key, raw)))
}

impl Job {
    /// Create a job reserved on `conn`.
    pub fn new(conn: SharedBackend, tube: impl Into<String>, id: u64, body: Vec<u8>) -> Self {
        Self {
            id,
            tube: tube.into(),
            body,
            conn,
        }
    }

    /// Delete the job. It is removed from the server entirely.
    pub async fn delete(&self) -> Result<()> {
        self.conn.delete(self.id).await
    }

    /// Release the job back to the ready queue, reservable again after `delay`.
    pub async fn release(&self, priority: u32, delay: Duration) -> Result<()> {
        self.conn.release(self.id, priority, delay).await
    }

    /// Ask for more time to work on the job.
    pub async fn touch(&self) -> Result<()> {
        self.conn.touch(self.id).await
    }

    /// Bury the job. Buried jobs are not reserved again until kicked.
    pub async fn bury(&self, priority: u32) -> Result<()> {
        self.conn.bury(self.id, priority).await
    }

    /// Fetch current stats for the job.
    pub async fn stats(&self) -> Result<JobStats> {
        let snapshot = self.conn.stats_job(self.id).await?;
        JobStats::from_snapshot(&snapshot)
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("tube", &self.tube)
            .field("body_len", &self.body.len())
            .finish()
    }
}
