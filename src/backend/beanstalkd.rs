//! beanstalkd backend implementation.
//!
//! One TCP connection speaking the beanstalkd text protocol. Every command and
//! its reply happen under a single async mutex, so the loop and any number of
//! dispatch tasks can share the backend without interleaving on the wire.
//!
//! Each exchange runs on its own task and always reads its reply, even when
//! the caller stops waiting for it. A dropped `touch` future therefore never
//! leaves a stale reply in front of the next command.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::backend::{Backend, Reserved};
use crate::error::{Result, WorkerError};

/// Longest tube name the server accepts.
const MAX_TUBE_NAME: usize = 200;

/// Largest body beanstalkd can be configured to hold (`-z`, 1 GiB).
const MAX_BODY_SIZE: u64 = 1 << 30;

/// beanstalkd backend over a single TCP connection.
///
/// The server cannot announce new work, so
/// [`wait_for_jobs`](Backend::wait_for_jobs) never resolves and an idle
/// client re-polls only once its idle wait elapses.
pub struct BeanstalkdBackend {
    session: Arc<Mutex<Option<Session>>>,
}

impl BeanstalkdBackend {
    /// Connect to a beanstalkd server.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::with_stream(stream))
    }

    /// Create a backend over an already connected stream.
    pub fn with_stream(stream: TcpStream) -> Self {
        Self {
            session: Arc::new(Mutex::new(Some(Session::new(stream)))),
        }
    }

    /// Put a job into `tube`. Returns the new job id.
    pub async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64> {
        validate_tube(tube)?;
        let request = Request::Put {
            tube: tube.to_string(),
            body: body.to_vec(),
            priority,
            delay,
            ttr,
        };
        match self.call(request).await? {
            Reply::Inserted(id) => Ok(id),
            _ => Err(mismatched("put")),
        }
    }

    /// Run one exchange to completion on its own task.
    async fn call(&self, request: Request) -> Result<Reply> {
        let session = self.session.clone();
        let exchange = tokio::spawn(async move {
            let mut guard = session.lock().await;
            let Some(conn) = guard.as_mut() else {
                return Err(WorkerError::ConnectionClosed);
            };
            let result = conn.execute(request).await;
            settle(&mut guard, result)
        });
        exchange
            .await
            .map_err(|e| WorkerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Run a command whose only success reply is `ok`.
    async fn simple(&self, id: u64, cmd: String, ok: &'static str) -> Result<()> {
        match self.call(Request::Simple { id, cmd, ok }).await? {
            Reply::Done => Ok(()),
            _ => Err(mismatched(ok)),
        }
    }
}

#[async_trait]
impl Backend for BeanstalkdBackend {
    async fn reserve(&self, tube: &str, timeout: Duration) -> Result<Reserved> {
        validate_tube(tube)?;
        let request = Request::Reserve {
            tube: tube.to_string(),
            timeout,
        };
        match self.call(request).await? {
            Reply::Reserved(job) => Ok(job),
            _ => Err(mismatched("reserve")),
        }
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.simple(id, format!("delete {}", id), "DELETED").await
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<()> {
        let cmd = format!("release {} {} {}", id, priority, delay.as_secs());
        self.simple(id, cmd, "RELEASED").await
    }

    async fn touch(&self, id: u64) -> Result<()> {
        self.simple(id, format!("touch {}", id), "TOUCHED").await
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<()> {
        self.simple(id, format!("bury {} {}", id, priority), "BURIED")
            .await
    }

    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>> {
        match self.call(Request::StatsJob { id }).await? {
            Reply::Stats(stats) => Ok(stats),
            _ => Err(mismatched("stats-job")),
        }
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(mut session) = session {
            // The peer may already be gone; the socket is dropped either way.
            if let Err(e) = session.stream.get_mut().shutdown().await {
                tracing::debug!(error = %e, "beanstalkd shutdown failed");
            }
            tracing::debug!("beanstalkd connection closed");
        }
        Ok(())
    }
}

/// Drop the session after a transport or protocol failure; the stream may be
/// desynced.
fn settle<T>(slot: &mut Option<Session>, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if matches!(e, WorkerError::Io(_) | WorkerError::Protocol(_)) {
            tracing::warn!(error = %e, "beanstalkd connection failed, discarding it");
            *slot = None;
        }
    }
    result
}

fn mismatched(op: &str) -> WorkerError {
    WorkerError::Protocol(format!("mismatched reply kind for {}", op))
}

/// One command/reply exchange, owned so it can outlive its caller.
enum Request {
    Reserve {
        tube: String,
        timeout: Duration,
    },
    Simple {
        id: u64,
        cmd: String,
        ok: &'static str,
    },
    StatsJob {
        id: u64,
    },
    Put {
        tube: String,
        body: Vec<u8>,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    },
}

enum Reply {
    Reserved(Reserved),
    Done,
    Stats(HashMap<String, String>),
    Inserted(u64),
}

struct Session {
    stream: BufReader<TcpStream>,
    /// Tubes on the watch list, as tracked locally.
    watched: Vec<String>,
    /// Tube targeted by `put`.
    used: String,
}

impl Session {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufReader::new(stream),
            watched: vec!["default".to_string()],
            used: "default".to_string(),
        }
    }

    async fn execute(&mut self, request: Request) -> Result<Reply> {
        match request {
            Request::Reserve { tube, timeout } => {
                self.reserve(&tube, timeout).await.map(Reply::Reserved)
            }
            Request::Simple { id, cmd, ok } => self.simple(id, &cmd, ok).await.map(|()| Reply::Done),
            Request::StatsJob { id } => self.stats_job(id).await.map(Reply::Stats),
            Request::Put {
                tube,
                body,
                priority,
                delay,
                ttr,
            } => self
                .put(&tube, &body, priority, delay, ttr)
                .await
                .map(Reply::Inserted),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )
            .into());
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        check_server_error(&line)?;
        Ok(line)
    }

    /// Read a `<bytes>`-long body followed by CRLF.
    async fn read_body(&mut self, len: u64) -> Result<Vec<u8>> {
        let len = body_len(len)?;
        let mut buf = vec![0u8; len + 2];
        self.stream.read_exact(&mut buf).await?;
        if !buf.ends_with(b"\r\n") {
            return Err(WorkerError::Protocol("body not terminated by CRLF".to_string()));
        }
        buf.truncate(len);
        Ok(buf)
    }

    async fn round_trip(&mut self, cmd: &str) -> Result<String> {
        self.write(format!("{}\r\n", cmd).as_bytes()).await?;
        self.read_line().await
    }

    async fn simple(&mut self, id: u64, cmd: &str, ok: &str) -> Result<()> {
        let reply = self.round_trip(cmd).await?;
        match reply.as_str() {
            r if r == ok => Ok(()),
            "NOT_FOUND" => Err(WorkerError::NotFound(id)),
            "BURIED" => Err(WorkerError::Buried(id)),
            _ => Err(unexpected(cmd, &reply)),
        }
    }

    /// Restrict the watch list to exactly `tube`.
    async fn watch_only(&mut self, tube: &str) -> Result<()> {
        if self.watched.len() == 1 && self.watched[0] == tube {
            return Ok(());
        }
        if !self.watched.iter().any(|t| t == tube) {
            let cmd = format!("watch {}", tube);
            let reply = self.round_trip(&cmd).await?;
            if !reply.starts_with("WATCHING ") {
                return Err(unexpected(&cmd, &reply));
            }
            self.watched.push(tube.to_string());
        }
        let others: Vec<String> = self
            .watched
            .iter()
            .filter(|t| t.as_str() != tube)
            .cloned()
            .collect();
        for other in others {
            let cmd = format!("ignore {}", other);
            let reply = self.round_trip(&cmd).await?;
            if !reply.starts_with("WATCHING ") {
                return Err(unexpected(&cmd, &reply));
            }
            self.watched.retain(|t| *t != other);
        }
        Ok(())
    }

    async fn reserve(&mut self, tube: &str, timeout: Duration) -> Result<Reserved> {
        self.watch_only(tube).await?;
        let cmd = format!("reserve-with-timeout {}", timeout.as_secs());
        let reply = self.round_trip(&cmd).await?;
        match reply.as_str() {
            "TIMED_OUT" => Err(WorkerError::Timeout),
            "DEADLINE_SOON" => Err(WorkerError::DeadlineSoon),
            _ => {
                let (id, len) = parse_two(&reply, "RESERVED")
                    .ok_or_else(|| unexpected(&cmd, &reply))?;
                let body = self.read_body(len).await?;
                Ok(Reserved { id, body })
            }
        }
    }

    async fn stats_job(&mut self, id: u64) -> Result<HashMap<String, String>> {
        let cmd = format!("stats-job {}", id);
        let reply = self.round_trip(&cmd).await?;
        if reply == "NOT_FOUND" {
            return Err(WorkerError::NotFound(id));
        }
        let len = reply
            .strip_prefix("OK ")
            .and_then(|n| n.parse::<u64>().ok())
            .ok_or_else(|| unexpected(&cmd, &reply))?;
        let body = self.read_body(len).await?;
        let text = String::from_utf8(body)
            .map_err(|_| WorkerError::Protocol("stats body is not UTF-8".to_string()))?;
        Ok(parse_yaml_dict(&text))
    }

    async fn put(
        &mut self,
        tube: &str,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64> {
        if self.used != tube {
            let cmd = format!("use {}", tube);
            let reply = self.round_trip(&cmd).await?;
            if reply != format!("USING {}", tube) {
                return Err(unexpected(&cmd, &reply));
            }
            self.used = tube.to_string();
        }

        let cmd = format!(
            "put {} {} {} {}",
            priority,
            delay.as_secs(),
            ttr.as_secs().max(1),
            body.len()
        );
        let mut frame = Vec::with_capacity(cmd.len() + body.len() + 4);
        frame.extend_from_slice(cmd.as_bytes());
        frame.extend_from_slice(b"\r\n");
        frame.extend_from_slice(body);
        frame.extend_from_slice(b"\r\n");
        self.write(&frame).await?;

        let reply = self.read_line().await?;
        if let Some(id) = reply.strip_prefix("INSERTED ").and_then(|n| n.parse().ok()) {
            return Ok(id);
        }
        if let Some(id) = reply.strip_prefix("BURIED ").and_then(|n| n.parse().ok()) {
            return Err(WorkerError::Buried(id));
        }
        Err(unexpected(&cmd, &reply))
    }
}

/// Map the generic error replies any command can receive.
fn check_server_error(line: &str) -> Result<()> {
    match line {
        "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND"
        | "EXPECTED_CRLF" | "JOB_TOO_BIG" | "DRAINING" | "NOT_IGNORED" => {
            Err(WorkerError::Server(line.to_string()))
        }
        _ => Ok(()),
    }
}

/// Bound a server-announced body length before allocating for it.
fn body_len(len: u64) -> Result<usize> {
    if len > MAX_BODY_SIZE {
        return Err(WorkerError::Protocol(format!(
            "body of {} bytes exceeds {} byte limit",
            len, MAX_BODY_SIZE
        )));
    }
    usize::try_from(len)
        .map_err(|_| WorkerError::Protocol(format!("body of {} bytes does not fit in memory", len)))
}

fn unexpected(cmd: &str, reply: &str) -> WorkerError {
    let op = cmd.split_whitespace().next().unwrap_or(cmd);
    WorkerError::Protocol(format!("unexpected reply to {}: {}", op, reply))
}

/// Parse `<word> <a> <b>`.
fn parse_two(line: &str, word: &str) -> Option<(u64, u64)> {
    let mut parts = line.split(' ');
    if parts.next()? != word {
        return None;
    }
    let a = parts.next()?.parse().ok()?;
    let b = parts.next()?.parse().ok()?;
    match parts.next() {
        None => Some((a, b)),
        Some(_) => None,
    }
}

/// Parse the flat YAML dictionary returned by the stats commands.
fn parse_yaml_dict(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter(|line| *line != "---")
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

fn validate_tube(tube: &str) -> Result<()> {
    let valid_char =
        |c: char| c.is_ascii_alphanumeric() || "-+/;.$_()".contains(c);
    if tube.is_empty()
        || tube.len() > MAX_TUBE_NAME
        || tube.starts_with('-')
        || !tube.chars().all(valid_char)
    {
        return Err(WorkerError::Protocol(format!("invalid tube name {:?}", tube)));
    }
    Ok(())
}
