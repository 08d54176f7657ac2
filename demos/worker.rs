//! Tube-routed worker example.
//!
//! This example demonstrates:
//! - Routing tubes to handlers with a `Router`
//! - Deleting, releasing, and burying jobs from a handler
//! - Graceful shutdown on Ctrl+C or SIGTERM
//!
//! Prerequisites:
//! - beanstalkd running on 127.0.0.1:11300 (or set `BEANSTALKD_ADDR`)
//!
//! Run with: `cargo run --example worker`

use beanstalk_workers::{handler_fn, BeanstalkdBackend, Client, ClientConfig, Job, Router};
use std::time::Duration;

/// Send an email; the body is the recipient.
async fn send_email(job: Job) {
    let to = String::from_utf8_lossy(&job.body).into_owned();
    println!("[emails] job={} to={}", job.id, to);

    tokio::time::sleep(Duration::from_millis(500)).await;

    if let Err(e) = job.delete().await {
        eprintln!("[emails] delete failed: {}", e);
    }
}

/// Resize an image; malformed bodies are buried for inspection.
async fn resize_image(job: Job) {
    let Ok(path) = std::str::from_utf8(&job.body) else {
        println!("[images] job={} malformed, burying", job.id);
        if let Err(e) = job.bury(0).await {
            eprintln!("[images] bury failed: {}", e);
        }
        return;
    };

    match job.stats().await {
        Ok(stats) => println!(
            "[images] job={} path={} pri={} time-left={:?}",
            job.id, path, stats.priority, stats.time_left
        ),
        Err(e) => eprintln!("[images] stats failed: {}", e),
    }

    // Long-running work: ask for more time halfway through.
    tokio::time::sleep(Duration::from_secs(1)).await;
    if let Err(e) = job.touch().await {
        eprintln!("[images] touch failed: {}", e);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    if path.ends_with(".tmp") {
        println!("[images] job={} not ready, retrying in 5s", job.id);
        if let Err(e) = job.release(0, Duration::from_secs(5)).await {
            eprintln!("[images] release failed: {}", e);
        }
        return;
    }

    if let Err(e) = job.delete().await {
        eprintln!("[images] delete failed: {}", e);
    }
}

#[tokio::main]
async fn main() -> beanstalk_workers::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beanstalk_workers=info".into()),
        )
        .init();

    let addr = std::env::var("BEANSTALKD_ADDR").unwrap_or_else(|_| "127.0.0.1:11300".to_string());

    println!("Connecting to {}...", addr);

    let producer = match BeanstalkdBackend::connect(addr.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure beanstalkd is running: docker run -d -p 11300:11300 schickling/beanstalkd");
            return Err(e);
        }
    };

    let ttr = Duration::from_secs(30);
    for to in ["alice@example.com", "bob@example.com"] {
        let id = producer.put("emails", to.as_bytes(), 0, Duration::ZERO, ttr).await?;
        println!("put: emails/{}", id);
    }
    for path in ["cat.png", "upload.tmp"] {
        let id = producer.put("images", path.as_bytes(), 10, Duration::ZERO, ttr).await?;
        println!("put: images/{}", id);
    }
    let id = producer.put("images", &[0xff, 0xfe], 10, Duration::ZERO, ttr).await?;
    println!("put: images/{} (malformed)", id);

    let router = Router::new();
    router.handle("emails", handler_fn(send_email));
    router.handle("images", handler_fn(resize_image));

    let config = ClientConfig::builder().addr(addr).build();
    let client = Client::with_config(config, router);

    println!("\nPress Ctrl+C to stop\n");

    let reason = client.connect_and_work().await?;

    println!("\nStopped: {:?}", reason);
    Ok(())
}
