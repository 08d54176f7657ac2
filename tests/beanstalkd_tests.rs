//! End-to-end tests against a live beanstalkd server.
//!
//! Run with `BEANSTALKD_ADDR=127.0.0.1:11300 cargo test -- --ignored`.

use beanstalk_workers::{
    handler_fn, Backend, BeanstalkdBackend, Client, ClientConfig, Job, Router, StopReason,
    WorkerError,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTR: Duration = Duration::from_secs(60);

fn addr() -> String {
    std::env::var("BEANSTALKD_ADDR").unwrap_or_else(|_| "127.0.0.1:11300".to_string())
}

/// Tube name unique to this test run, so reruns never see stale jobs.
fn unique_tube(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", prefix, nanos)
}

fn config() -> ClientConfig {
    ClientConfig::builder()
        .addr(addr())
        .idle_wait(Duration::from_millis(100))
        .handle_signals(false)
        .build()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
#[ignore = "requires running beanstalkd server"]
async fn test_job_lifecycle() {
    let tube = unique_tube("lifecycle");
    let conn = BeanstalkdBackend::connect(addr()).await.unwrap();
    let id = conn.put(&tube, b"payload", 10, Duration::ZERO, TTR).await.unwrap();

    let reserved = conn.reserve(&tube, Duration::ZERO).await.unwrap();
    assert_eq!(reserved.id, id);
    assert_eq!(reserved.body, b"payload");

    let job = Job::new(
        beanstalk_workers::SharedBackend::new(conn),
        tube.as_str(),
        reserved.id,
        reserved.body,
    );
    let stats = job.stats().await.unwrap();
    assert_eq!(stats.priority, 10);
    assert!(stats.time_left <= TTR);

    job.touch().await.unwrap();
    job.release(5, Duration::ZERO).await.unwrap();
    assert!(matches!(job.touch().await, Err(WorkerError::NotFound(_))));
}

#[tokio::test]
#[ignore = "requires running beanstalkd server"]
async fn test_empty_tube_times_out() {
    let tube = unique_tube("empty");
    let conn = BeanstalkdBackend::connect(addr()).await.unwrap();
    let err = conn.reserve(&tube, Duration::ZERO).await.unwrap_err();
    assert!(err.is_timeout_or_deadline());
    conn.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires running beanstalkd server"]
async fn test_client_routes_and_stops() {
    let first = unique_tube("first");
    let second = unique_tube("second");
    let producer = BeanstalkdBackend::connect(addr()).await.unwrap();
    producer.put(&first, b"one", 0, Duration::ZERO, TTR).await.unwrap();
    producer.put(&second, b"two", 0, Duration::ZERO, TTR).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let router = Router::new();
    for tube in [&first, &second] {
        let seen = seen.clone();
        router.handle(
            tube.as_str(),
            handler_fn(move |job: Job| {
                let seen = seen.clone();
                async move {
                    job.delete().await.unwrap();
                    seen.lock().push(job.tube.clone());
                }
            }),
        );
    }

    let client = Arc::new(Client::with_config(config(), router));
    let run = tokio::spawn({
        let client = client.clone();
        async move { client.connect_and_work().await }
    });

    wait_until(|| seen.lock().len() == 2).await;
    assert!(client.stop());
    assert_eq!(run.await.unwrap().unwrap(), StopReason::Requested);

    let mut seen = seen.lock().clone();
    seen.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(seen, expected);
}
