//! # beanstalk-workers - Concurrent job workers for beanstalkd
//!
//! A Rust library for processing jobs from beanstalkd tubes, with per-tube
//! routing, one task per job, and graceful shutdown.
//!
//! ## Features
//!
//! - **Tube routing**: Register a handler per tube on a [`Router`]
//! - **Concurrent processing**: Every reserved job runs on its own task
//! - **Job control**: Delete, release, touch, bury, and inspect reserved jobs
//! - **Graceful shutdown**: SIGINT, SIGTERM, or [`Client::stop`] end
//!   reservations, then in-flight handlers run to completion
//! - **In-memory backend**: Run workers without a server in tests
//!
//! ## Quick Start
//!
//! ### Producer (Putting Jobs)
//!
//! ```rust,no_run
//! use beanstalk_workers::BeanstalkdBackend;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> beanstalk_workers::Result<()> {
//!     let conn = BeanstalkdBackend::connect("127.0.0.1:11300").await?;
//!     conn.put("emails", b"hello", 0, Duration::ZERO, Duration::from_secs(60)).await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Worker (Processing Jobs)
//!
//! ```rust,no_run
//! use beanstalk_workers::{handler_fn, Job, Router};
//!
//! async fn send_email(job: Job) {
//!     println!("sending {} bytes", job.body.len());
//!     if let Err(e) = job.delete().await {
//!         eprintln!("delete failed: {}", e);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> beanstalk_workers::Result<()> {
//!     let router = Router::new();
//!     router.handle("emails", handler_fn(send_email));
//!
//!     let reason = beanstalk_workers::connect_and_work("127.0.0.1:11300", router).await?;
//!     println!("stopped: {:?}", reason);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod router;
pub mod shutdown;

// Re-export main types
pub use backend::{Backend, BeanstalkdBackend, DynBackend, MemoryBackend, Reserved, SharedBackend};
pub use client::{connect_and_work, Client};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{Result, WorkerError};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use job::{Job, JobStats};
pub use router::Router;
pub use shutdown::{SignalListener, StopReason, StopSignal};
