// End-to-end behaviour of QueueClient against the in-process broker.

use rabbit_relay::{BrokerConfig, MemoryBroker, QueueClient, QueueError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: String,
    payload: String,
}

fn job(id: &str, payload: &str) -> Job {
    Job {
        id: id.to_string(),
        payload: payload.to_string(),
    }
}

fn client() -> (QueueClient, MemoryBroker) {
    let broker = MemoryBroker::new();
    let client = QueueClient::in_memory(BrokerConfig::new("memory://localhost"), broker.clone());
    (client, broker)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Handler that reports each job it starts, then waits for a permit.
fn gated(
    started: mpsc::UnboundedSender<Job>,
    gate: Arc<Semaphore>,
) -> impl Fn(Job) -> HandlerFuture + Send + Sync + 'static {
    move |job: Job| -> HandlerFuture {
        let started = started.clone();
        let gate = gate.clone();
        Box::pin(async move {
            started.send(job)?;
            gate.acquire().await?.forget();
            anyhow::Ok(())
        })
    }
}

#[tokio::test]
async fn published_job_is_handled_once_then_acked() {
    let (client, broker) = client();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

    let _subscription = client
        .subscribe::<Job, _>(
            "jobs",
            move |job: Job| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(job.payload)?;
                    anyhow::Ok(())
                }
            },
            1,
        )
        .await
        .unwrap();

    client.publish("jobs", &job("x1", "hello")).await.unwrap();

    assert_eq!(seen_rx.recv().await.unwrap(), "hello");
    eventually(|| broker.stats("jobs").unwrap().acked == 1).await;

    assert!(
        timeout(Duration::from_millis(50), seen_rx.recv()).await.is_err(),
        "handler must run exactly once"
    );
    let stats = broker.stats("jobs").unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.ready, 0);
}

#[tokio::test]
async fn prefetch_one_delivers_the_next_job_only_after_the_ack() {
    let (client, broker) = client();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));

    client.publish("jobs", &job("a", "first")).await.unwrap();
    client.publish("jobs", &job("b", "second")).await.unwrap();

    let _subscription = client
        .subscribe::<Job, _>("jobs", gated(started_tx, gate.clone()), 1)
        .await
        .unwrap();

    assert_eq!(started_rx.recv().await.unwrap().id, "a");
    assert!(timeout(Duration::from_millis(100), started_rx.recv())
        .await
        .is_err());
    assert_eq!(broker.stats("jobs").unwrap().unacked, 1);
    assert_eq!(broker.stats("jobs").unwrap().ready, 1);

    gate.add_permits(1);
    assert_eq!(started_rx.recv().await.unwrap().id, "b");
    gate.add_permits(1);

    eventually(|| broker.stats("jobs").unwrap().acked == 2).await;
    assert_eq!(broker.stats("jobs").unwrap().peak_unacked, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_jobs_never_exceed_the_prefetch_limit() {
    let (client, broker) = client();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));

    for i in 0..10 {
        client
            .publish("jobs", &job(&i.to_string(), "work"))
            .await
            .unwrap();
    }

    let _subscription = client
        .subscribe::<Job, _>("jobs", gated(started_tx, gate.clone()), 3)
        .await
        .unwrap();

    for _ in 0..3 {
        started_rx.recv().await.unwrap();
    }
    assert!(timeout(Duration::from_millis(100), started_rx.recv())
        .await
        .is_err());
    assert_eq!(broker.stats("jobs").unwrap().unacked, 3);

    gate.add_permits(10);
    eventually(|| broker.stats("jobs").unwrap().acked == 10).await;
    assert_eq!(broker.stats("jobs").unwrap().peak_unacked, 3);
}

#[tokio::test]
async fn zero_prefetch_means_unbounded() {
    let (client, broker) = client();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let gate = Arc::new(Semaphore::new(0));

    for i in 0..5 {
        client
            .publish("jobs", &job(&i.to_string(), "work"))
            .await
            .unwrap();
    }

    let _subscription = client
        .subscribe::<Job, _>("jobs", gated(started_tx, gate.clone()), 0)
        .await
        .unwrap();

    for _ in 0..5 {
        started_rx.recv().await.unwrap();
    }
    assert_eq!(broker.stats("jobs").unwrap().unacked, 5);

    gate.add_permits(5);
    eventually(|| broker.stats("jobs").unwrap().acked == 5).await;
}

#[tokio::test]
async fn stuck_queue_does_not_delay_other_queues() {
    let (client, broker) = client();

    let _stuck = client
        .subscribe::<Job, _>(
            "slow",
            |_job: Job| async {
                futures::future::pending::<()>().await;
                anyhow::Ok(())
            },
            1,
        )
        .await
        .unwrap();

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _fast = client
        .subscribe::<Job, _>(
            "fast",
            move |job: Job| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(job.id)?;
                    anyhow::Ok(())
                }
            },
            1,
        )
        .await
        .unwrap();

    client.publish("slow", &job("s1", "never")).await.unwrap();
    client.publish("slow", &job("s2", "never")).await.unwrap();
    eventually(|| broker.stats("slow").unwrap().unacked == 1).await;

    for i in 0..3 {
        client
            .publish("fast", &job(&format!("f{}", i), "quick"))
            .await
            .unwrap();
    }
    for i in 0..3 {
        let id = timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, format!("f{}", i));
    }

    let slow = broker.stats("slow").unwrap();
    assert_eq!(slow.ready, 1);
    assert_eq!(slow.acked, 0);
}

#[tokio::test]
async fn only_successful_jobs_are_acked() {
    let (client, broker) = client();

    let mut subscription = client
        .subscribe::<Job, _>(
            "jobs",
            |job: Job| async move {
                if job.id == "1" {
                    anyhow::bail!("job {} rejected", job.id);
                }
                Ok(())
            },
            0,
        )
        .await
        .unwrap();

    client.publish("jobs", &job("1", "bad")).await.unwrap();
    client.publish("jobs", &job("2", "good")).await.unwrap();

    let failure = subscription.next_failure().await.unwrap();
    assert_eq!(failure.message_id.as_deref(), Some("1"));
    assert!(matches!(failure.error, QueueError::HandlerError { .. }));

    eventually(|| broker.stats("jobs").unwrap().acked == 1).await;
    let stats = broker.stats("jobs").unwrap();
    assert_eq!(stats.unacked, 1);
    assert!(subscription.try_next_failure().is_none());
}

#[tokio::test]
async fn shutdown_requeues_unacked_jobs_for_the_next_subscriber() {
    let (client, broker) = client();

    let first = client
        .subscribe::<Job, _>(
            "jobs",
            |_job: Job| async { Err::<(), _>(anyhow::anyhow!("not today")) },
            1,
        )
        .await
        .unwrap();

    client.publish("jobs", &job("r1", "retry me")).await.unwrap();
    eventually(|| broker.stats("jobs").unwrap().unacked == 1).await;

    client.shutdown().await.unwrap();
    timeout(Duration::from_secs(1), first.closed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker.stats("jobs").unwrap().ready, 1);

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let _second = client
        .subscribe::<Job, _>(
            "jobs",
            move |job: Job| {
                let seen_tx = seen_tx.clone();
                async move {
                    seen_tx.send(job)?;
                    anyhow::Ok(())
                }
            },
            1,
        )
        .await
        .unwrap();

    assert_eq!(seen_rx.recv().await.unwrap(), job("r1", "retry me"));
    eventually(|| broker.stats("jobs").unwrap().acked == 1).await;
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_and_subscribers_share_one_connection() {
    let broker = MemoryBroker::new().with_latency(Duration::from_millis(5));
    let client = QueueClient::in_memory(BrokerConfig::new("memory://localhost"), broker.clone());

    let mut tasks = Vec::new();
    for i in 0..8 {
        let client = client.clone();
        let queue = format!("queue-{}", i % 4);
        tasks.push(tokio::spawn(async move {
            client.publish(&queue, &job(&i.to_string(), "x")).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.channels_opened(), 4);
    let published: usize = (0..4)
        .map(|i| broker.stats(&format!("queue-{}", i)).unwrap().published)
        .sum();
    assert_eq!(published, 8);
}

#[tokio::test]
async fn unreachable_broker_surfaces_to_both_operations() {
    let (client, broker) = client();
    broker.refuse_connections(true);

    let err = client.publish("jobs", &job("1", "x")).await.unwrap_err();
    assert!(err.is_connectivity());

    let err = client
        .subscribe::<Job, _>("jobs", |_job: Job| async { anyhow::Ok(()) }, 1)
        .await
        .unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(broker.connections_opened(), 0);
}
