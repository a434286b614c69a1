// src/rabbitmq/consumer.rs

use super::channel_manager::ChannelRegistry;
use super::errors::{QueueError, Result};
use super::transport::{Delivery, DeliveryStream};
use crate::message::{self, Decoded};
use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Application callback run once per delivered message.
///
/// Returning `Ok` acknowledges the message. Returning `Err` (or panicking)
/// leaves it unacknowledged on the channel.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: T) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// A delivery that was not acknowledged, and why.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub queue: String,
    pub message_id: Option<String>,
    pub delivery_tag: u64,
    pub error: QueueError,
}

/// Handle on a running subscription.
///
/// Per-message failures arrive on [`Subscription::next_failure`]; the outcome
/// of the consumption loop itself comes from [`Subscription::closed`].
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    failures: mpsc::UnboundedReceiver<DeliveryFailure>,
    task: JoinHandle<Result<()>>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the next failed delivery. `None` once the loop and every
    /// in-flight handler have finished.
    pub async fn next_failure(&mut self) -> Option<DeliveryFailure> {
        self.failures.recv().await
    }

    pub fn try_next_failure(&mut self) -> Option<DeliveryFailure> {
        self.failures.try_recv().ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop and drops in-flight handlers. Their messages stay unacked.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the loop to end: `Ok` when the broker closed the stream,
    /// `Err` when the stream failed.
    pub async fn closed(self) -> Result<()> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(QueueError::ConsumeError(format!(
                "consumer task for '{}' failed: {}",
                self.queue, err
            ))),
        }
    }
}

/// Subscribes handlers to queues.
#[derive(Clone)]
pub struct Consumer {
    channels: Arc<ChannelRegistry>,
}

impl Consumer {
    pub fn new(channels: Arc<ChannelRegistry>) -> Self {
        Consumer { channels }
    }

    /// Starts consuming `queue` with at most `prefetch_limit` unacknowledged
    /// deliveries on its channel (0 for no limit). Returns once the broker
    /// has registered the consumer.
    pub async fn subscribe<T, H>(
        &self,
        queue: &str,
        handler: H,
        prefetch_limit: u16,
    ) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let channel = self.channels.get_channel(queue).await?;
        channel.broker().set_prefetch(prefetch_limit).await?;

        let consumer_tag = format!("{}-{}", queue, &Uuid::new_v4().simple().to_string()[..8]);
        let deliveries = channel.broker().consume(queue, &consumer_tag).await?;

        info!(
            queue,
            prefetch = prefetch_limit,
            consumer_tag = %consumer_tag,
            "Connected to queue"
        );

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let delivery_loop = DeliveryLoop {
            queue: Arc::from(queue),
            handler: Arc::new(handler),
            quiet: self.channels.connections().config().is_quiet(queue),
            failures: failures_tx,
            _message: PhantomData,
        };
        let task = tokio::spawn(delivery_loop.run(deliveries));

        Ok(Subscription {
            queue: queue.to_string(),
            consumer_tag,
            failures: failures_rx,
            task,
        })
    }
}

struct DeliveryLoop<T, H> {
    queue: Arc<str>,
    handler: Arc<H>,
    quiet: bool,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    _message: PhantomData<fn() -> T>,
}

impl<T, H> DeliveryLoop<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    async fn run(self, mut deliveries: DeliveryStream) -> Result<()> {
        let mut in_flight = JoinSet::new();

        let outcome = loop {
            tokio::select! {
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        in_flight.spawn(process::<T, H>(
                            self.queue.clone(),
                            self.handler.clone(),
                            self.quiet,
                            delivery,
                        ));
                    }
                    Some(Err(err)) => {
                        error!(queue = %self.queue, error = %err, "Delivery stream failed");
                        break Err(err);
                    }
                    None => {
                        info!(queue = %self.queue, "Delivery stream closed");
                        break Ok(());
                    }
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.reap(joined);
                }
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            self.reap(joined);
        }
        outcome
    }

    fn reap(&self, joined: std::result::Result<std::result::Result<(), DeliveryFailure>, JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(failure)) => {
                error!(
                    queue = %failure.queue,
                    message_id = failure.message_id.as_deref().unwrap_or("-"),
                    delivery_tag = failure.delivery_tag,
                    error = %failure.error,
                    "Message left unacknowledged"
                );
                if self.failures.send(failure).is_err() {
                    debug!(queue = %self.queue, "Subscription handle dropped; failure only logged");
                }
            }
            Err(err) => warn!(queue = %self.queue, error = %err, "Delivery task did not complete"),
        }
    }
}

/// Decodes, runs the handler and acks. Any failure skips the ack.
async fn process<T, H>(
    queue: Arc<str>,
    handler: Arc<H>,
    quiet: bool,
    delivery: Delivery,
) -> std::result::Result<(), DeliveryFailure>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    let Delivery {
        data,
        redelivered,
        handle,
    } = delivery;
    let delivery_tag = handle.delivery_tag();
    let failure = |message_id: Option<String>, error: QueueError| DeliveryFailure {
        queue: queue.to_string(),
        message_id,
        delivery_tag,
        error,
    };

    let Decoded {
        message,
        message_id,
    } = match message::decode::<T>(&data) {
        Ok(decoded) => decoded,
        Err(err) => return Err(failure(message::peek_id(&data), err)),
    };
    let label = message_id
        .clone()
        .unwrap_or_else(|| format!("#{}", delivery_tag));

    debug!(queue = %queue, message_id = %label, redelivered, "Received message");

    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(source)) => {
            return Err(failure(
                message_id,
                QueueError::HandlerError {
                    message_id: label,
                    source,
                },
            ))
        }
        Err(_) => return Err(failure(message_id, QueueError::HandlerPanic(label))),
    }

    if quiet {
        debug!(queue = %queue, message_id = %label, elapsed_ms, "Processed message");
    } else {
        info!(queue = %queue, message_id = %label, elapsed_ms, "Processed message");
    }

    handle.ack().await.map_err(|err| failure(message_id, err))
}
