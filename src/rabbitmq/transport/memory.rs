// src/rabbitmq/transport/memory.rs
// In-process broker: queues, per-channel prefetch, acks and requeue on channel loss.

use super::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryHandle, DeliveryStream,
    Transport,
};
use crate::message::MessageProperties;
use crate::rabbitmq::errors::{QueueError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Counters for one queue, as seen by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub durable: bool,
    pub ready: usize,
    pub unacked: usize,
    pub published: usize,
    pub delivered: usize,
    pub acked: usize,
    pub peak_unacked: usize,
}

/// Broker living inside the process. Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    connections_opened: AtomicUsize,
    refuse_connections: AtomicBool,
    latency_ms: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    rejected_declares: HashSet<String>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    channels_opened: usize,
}

#[derive(Default)]
struct QueueState {
    stats: QueueStats,
    ready: VecDeque<Pending>,
    last_properties: Option<MessageProperties>,
    consumers: Vec<Arc<Notify>>,
}

#[derive(Clone)]
struct Pending {
    data: Vec<u8>,
    redelivered: bool,
}

struct ChannelState {
    connection_id: u64,
    open: bool,
    prefetch: u16,
    unacked: HashMap<u64, (String, Pending)>,
    consumers: Vec<Arc<Notify>>,
}

impl BrokerInner {
    fn state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::ChannelError("broker state lock poisoned".to_string()))
    }

    // Every broker round trip suspends, so concurrent callers really interleave.
    async fn round_trip(&self) {
        match self.latency_ms.load(Ordering::SeqCst) {
            0 => tokio::task::yield_now().await,
            ms => tokio::time::sleep(Duration::from_millis(ms)).await,
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every connect, channel open, declare and consume by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Makes every later declaration of `queue` fail.
    pub fn reject_declare(&self, queue: &str) {
        if let Ok(mut state) = self.inner.state() {
            state.rejected_declares.insert(queue.to_string());
        }
    }

    pub fn accept_declare(&self, queue: &str) {
        if let Ok(mut state) = self.inner.state() {
            state.rejected_declares.remove(queue);
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.inner
            .state()
            .map(|state| state.channels_opened)
            .unwrap_or_default()
    }

    pub fn open_channels(&self) -> usize {
        self.inner
            .state()
            .map(|state| state.channels.values().filter(|ch| ch.open).count())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.inner
            .state()
            .map(|state| state.queues.contains_key(queue))
            .unwrap_or_default()
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.inner.state().ok()?;
        let q = state.queues.get(queue)?;
        Some(QueueStats {
            ready: q.ready.len(),
            ..q.stats.clone()
        })
    }

    pub fn last_properties(&self, queue: &str) -> Option<MessageProperties> {
        let state = self.inner.state().ok()?;
        state.queues.get(queue)?.last_properties.clone()
    }

    /// Places a raw body on `queue` as if some other client had published it.
    pub fn inject(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.inner.state()?;
        let q = state.queues.get_mut(queue).ok_or_else(|| {
            QueueError::PublishError(format!("NOT_FOUND - no queue '{}'", queue))
        })?;
        enqueue(q, payload.to_vec(), MessageProperties::json());
        Ok(())
    }
}

fn enqueue(queue: &mut QueueState, data: Vec<u8>, properties: MessageProperties) {
    queue.ready.push_back(Pending {
        data,
        redelivered: false,
    });
    queue.stats.published += 1;
    queue.last_properties = Some(properties);
    for consumer in &queue.consumers {
        consumer.notify_one();
    }
}

fn close_channel(state: &mut BrokerState, channel_id: u64) {
    let Some(channel) = state.channels.get_mut(&channel_id) else {
        return;
    };
    if !channel.open {
        return;
    }
    channel.open = false;

    let mut unacked: Vec<(u64, (String, Pending))> = channel.unacked.drain().collect();
    let waiters = std::mem::take(&mut channel.consumers);

    // Requeue at the head, oldest delivery first.
    unacked.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, (queue, mut pending)) in unacked {
        if let Some(q) = state.queues.get_mut(&queue) {
            q.stats.unacked = q.stats.unacked.saturating_sub(1);
            pending.redelivered = true;
            q.ready.push_front(pending);
        }
    }

    for q in state.queues.values_mut() {
        q.consumers
            .retain(|c| !waiters.iter().any(|w| Arc::ptr_eq(c, w)));
        if !q.ready.is_empty() {
            for consumer in &q.consumers {
                consumer.notify_one();
            }
        }
    }

    for waiter in waiters {
        waiter.notify_one();
    }
    debug!(channel_id, "memory channel closed");
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, addr: &str, connection_name: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.round_trip().await;

        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(QueueError::ConnectionError(format!(
                "connection refused by {}",
                addr
            )));
        }

        let id = self.inner.connections_opened.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        debug!(connection_id = id, connection_name, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            id,
            open: AtomicBool::new(true),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<BrokerInner>,
    id: u64,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.inner.round_trip().await;

        if !self.is_open() {
            return Err(QueueError::ChannelError("connection is closed".to_string()));
        }

        let mut state = self.inner.state()?;
        state.next_channel_id += 1;
        state.channels_opened += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                open: true,
                prefetch: 0,
                unacked: HashMap::new(),
                consumers: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            inner: self.inner.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);

        let mut state = self.inner.state()?;
        let owned: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection_id == self.id)
            .map(|(id, _)| *id)
            .collect();
        for channel_id in owned {
            close_channel(&mut state, channel_id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct MemoryChannel {
    inner: Arc<BrokerInner>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &BrokerState) -> Result<()> {
        match state.channels.get(&self.id) {
            Some(channel) if channel.open => Ok(()),
            _ => Err(QueueError::ChannelError(format!(
                "channel {} is closed",
                self.id
            ))),
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()> {
        self.inner.round_trip().await;

        let mut state = self.inner.state()?;
        self.ensure_open(&state)?;

        if state.rejected_declares.contains(queue) {
            return Err(QueueError::DeclareError {
                queue: queue.to_string(),
                reason: "ACCESS_REFUSED - declaration rejected".to_string(),
            });
        }

        let q = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState {
                stats: QueueStats {
                    durable,
                    ..QueueStats::default()
                },
                ..QueueState::default()
            });

        if q.stats.durable != durable {
            return Err(QueueError::DeclareError {
                queue: queue.to_string(),
                reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, limit: u16) -> Result<()> {
        let mut state = self.inner.state()?;
        self.ensure_open(&state)?;

        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = limit;
            for consumer in &channel.consumers {
                consumer.notify_one();
            }
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<()> {
        let mut state = self.inner.state()?;
        self.ensure_open(&state)
            .map_err(|e| QueueError::PublishError(e.to_string()))?;

        match state.queues.get_mut(queue) {
            Some(q) => enqueue(q, payload.to_vec(), properties.clone()),
            // The default exchange drops bodies routed to unknown queues.
            None => debug!(queue, "unroutable message dropped"),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.inner.round_trip().await;

        let notify = Arc::new(Notify::new());
        {
            let mut state = self.inner.state()?;
            self.ensure_open(&state)
                .map_err(|e| QueueError::ConsumeError(e.to_string()))?;

            let q = state.queues.get_mut(queue).ok_or_else(|| {
                QueueError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            q.consumers.push(notify.clone());

            if let Some(channel) = state.channels.get_mut(&self.id) {
                channel.consumers.push(notify.clone());
            }
        }
        debug!(queue, consumer_tag, channel_id = self.id, "memory consumer registered");

        let cursor = Cursor {
            inner: self.inner.clone(),
            channel_id: self.id,
            queue: queue.to_string(),
            notify,
            done: false,
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            loop {
                match cursor.step() {
                    Step::Deliver(delivery) => return Some((Ok(delivery), cursor)),
                    Step::Fail(e) => {
                        cursor.done = true;
                        return Some((Err(e), cursor));
                    }
                    Step::End => return None,
                    Step::Wait => cursor.notify.notified().await,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state()?;
        close_channel(&mut state, self.id);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner
            .state()
            .map(|state| self.ensure_open(&state).is_ok())
            .unwrap_or(false)
    }
}

enum Step {
    Deliver(Delivery),
    Wait,
    End,
    Fail(QueueError),
}

struct Cursor {
    inner: Arc<BrokerInner>,
    channel_id: u64,
    queue: String,
    notify: Arc<Notify>,
    done: bool,
}

impl Cursor {
    fn step(&self) -> Step {
        let mut guard = match self.inner.state() {
            Ok(guard) => guard,
            Err(e) => return Step::Fail(e),
        };
        let state = &mut *guard;

        let Some(channel) = state.channels.get_mut(&self.channel_id) else {
            return Step::End;
        };
        if !channel.open {
            return Step::End;
        }
        if channel.prefetch != 0 && channel.unacked.len() >= usize::from(channel.prefetch) {
            return Step::Wait;
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Step::End;
        };
        let Some(pending) = queue.ready.pop_front() else {
            return Step::Wait;
        };

        queue.stats.delivered += 1;
        queue.stats.unacked += 1;
        queue.stats.peak_unacked = queue.stats.peak_unacked.max(queue.stats.unacked);

        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;
        channel
            .unacked
            .insert(tag, (self.queue.clone(), pending.clone()));

        let acker = MemoryAcker {
            inner: self.inner.clone(),
            channel_id: self.channel_id,
        };
        Step::Deliver(Delivery {
            data: pending.data,
            redelivered: pending.redelivered,
            handle: DeliveryHandle::new(tag, Box::new(acker)),
        })
    }
}

struct MemoryAcker {
    inner: Arc<BrokerInner>,
    channel_id: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut guard = self.inner.state()?;
        let state = &mut *guard;

        let channel = state
            .channels
            .get_mut(&self.channel_id)
            .filter(|channel| channel.open)
            .ok_or_else(|| {
                QueueError::AckError(format!("channel {} is closed", self.channel_id))
            })?;

        let (queue, _) = channel.unacked.remove(&delivery_tag).ok_or_else(|| {
            QueueError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            ))
        })?;
        for consumer in &channel.consumers {
            consumer.notify_one();
        }

        if let Some(q) = state.queues.get_mut(&queue) {
            q.stats.unacked = q.stats.unacked.saturating_sub(1);
            q.stats.acked += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect("memory://test", "test").await.unwrap();
        connection.create_channel().await.unwrap()
    }

    #[tokio::test]
    async fn prefetch_holds_back_deliveries_until_ack() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("work", true).await.unwrap();
        channel.set_prefetch(1).await.unwrap();

        broker.inject("work", b"1").unwrap();
        broker.inject("work", b"2").unwrap();

        let mut stream = channel.consume("work", "tag").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"1");

        let blocked = timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        first.handle.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"2");

        let stats = broker.stats("work").unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.unacked, 1);
        assert_eq!(stats.peak_unacked, 1);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_and_ends_its_stream() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("work", true).await.unwrap();
        broker.inject("work", b"lost").unwrap();

        let mut stream = channel.consume("work", "tag").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);

        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(delivery.handle.ack().await.is_err());

        let stats = broker.stats("work").unwrap();
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.unacked, 0);

        let other = open_channel(&broker).await;
        let mut stream = other.consume("work", "tag-2").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.data, b"lost");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn redeclare_with_other_durability_fails() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel.declare_queue("work", true).await.unwrap();
        channel.declare_queue("work", true).await.unwrap();

        let err = channel.declare_queue("work", false).await.unwrap_err();
        assert!(matches!(err, QueueError::DeclareError { .. }));
    }

    #[tokio::test]
    async fn publishing_to_unknown_queue_is_dropped() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        channel
            .publish("nowhere", b"{}", &MessageProperties::json())
            .await
            .unwrap();
        assert!(!broker.queue_exists("nowhere"));
    }

    #[tokio::test]
    async fn consuming_unknown_queue_fails() {
        let broker = MemoryBroker::new();
        let channel = open_channel(&broker).await;
        let err = channel.consume("nowhere", "tag").await.err().unwrap();
        assert!(matches!(err, QueueError::ConsumeError(_)));
    }

    #[tokio::test]
    async fn closing_the_connection_closes_its_channels() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("memory://test", "test").await.unwrap();
        let first = connection.create_channel().await.unwrap();
        let second = connection.create_channel().await.unwrap();
        assert_eq!(broker.open_channels(), 2);

        connection.close().await.unwrap();
        assert!(!first.is_open());
        assert!(!second.is_open());
        assert_eq!(broker.open_channels(), 0);
        assert!(connection.create_channel().await.is_err());
    }
}
