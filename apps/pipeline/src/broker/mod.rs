//! Broker Client - durable priority queues with manual acknowledgement.
//!
//! Consumers receive messages one at a time with up to `prefetch` outstanding.
//! The handler decides `Ack` or `Nack { requeue }`; a handler error, a panic
//! or an undecodable payload is a `Nack` without requeue, which dead-letters
//! the message. Retries belong to the handler, never to blind redelivery.
//!
//! A delivery stays unacknowledged until it is settled. While its handler
//! runs the consumer refreshes its delivery time; deliveries nobody has
//! refreshed for `unacked_timeout` belonged to a worker that died, and the
//! periodic sweep puts them back on their queue.

mod redis_queue;

pub use redis_queue::RedisQueueStore;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;

pub const RESUME_PROCESSING_QUEUE: &str = "resume-processing";
pub const RANKING_QUEUE: &str = "resume-ranking";
pub const RANKING_STATUS_QUEUE: &str = "ranking-status";
pub const RESUME_STATUS_QUEUE: &str = "resume-status";
pub const DEAD_LETTER_QUEUE: &str = "resume-ranking-dead-letter";
pub const RETRY_EXCHANGE: &str = "ranking-retry";
pub const RANKING_ROUTING_KEY: &str = "ranking";

/// Status queues keep only their most recent updates; the oldest are dropped first.
pub const STATUS_QUEUE_MAX_LEN: usize = 1000;

/// Width of the FIFO sequence band inside one priority level.
const SEQ_SPAN: f64 = (1u64 << 40) as f64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSpec {
    pub name: &'static str,
    /// 0 means the queue ignores message priority.
    pub max_priority: u8,
    pub dead_letter: Option<&'static str>,
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct Binding {
    pub exchange: &'static str,
    pub routing_key: &'static str,
    pub queue: &'static str,
}

pub const QUEUES: &[QueueSpec] = &[
    QueueSpec {
        name: RESUME_PROCESSING_QUEUE,
        max_priority: 10,
        dead_letter: Some(DEAD_LETTER_QUEUE),
        max_length: None,
    },
    QueueSpec {
        name: RANKING_QUEUE,
        max_priority: 10,
        dead_letter: Some(DEAD_LETTER_QUEUE),
        max_length: None,
    },
    QueueSpec {
        name: RANKING_STATUS_QUEUE,
        max_priority: 0,
        dead_letter: None,
        max_length: Some(STATUS_QUEUE_MAX_LEN),
    },
    QueueSpec {
        name: RESUME_STATUS_QUEUE,
        max_priority: 0,
        dead_letter: None,
        max_length: Some(STATUS_QUEUE_MAX_LEN),
    },
    QueueSpec {
        name: DEAD_LETTER_QUEUE,
        max_priority: 0,
        dead_letter: None,
        max_length: None,
    },
];

pub const BINDINGS: &[Binding] = &[Binding {
    exchange: RETRY_EXCHANGE,
    routing_key: RANKING_ROUTING_KEY,
    queue: RANKING_QUEUE,
}];

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Message serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue '{0}' is not declared")]
    UnknownQueue(String),
}

/// Handler verdict for one delivery; the broker performs the side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
}

/// Where a settled delivery ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Remove,
    /// Back on its queue at its original position.
    Requeue,
    DeadLetter(&'static QueueSpec),
}

impl Settlement {
    pub fn for_ack(queue: &QueueSpec, ack: Acknowledgement) -> Result<Self, BrokerError> {
        Ok(match ack {
            Acknowledgement::Ack => Settlement::Remove,
            Acknowledgement::Nack { requeue: true } => Settlement::Requeue,
            Acknowledgement::Nack { requeue: false } => match queue.dead_letter {
                Some(dlq) => Settlement::DeadLetter(
                    queue_spec(dlq).ok_or_else(|| BrokerError::UnknownQueue(dlq.to_string()))?,
                ),
                None => Settlement::Remove,
            },
        })
    }
}

/// Wire envelope stored in a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub priority: u8,
    pub published_at: i64,
    pub body: Value,
}

/// A message taken off a queue and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDelivery {
    pub member: String,
    pub score: f64,
}

/// Storage behind the broker. Queue members are serialized envelopes ordered
/// by `delivery_score`; a popped member is held as unacknowledged until it is
/// settled or reclaimed.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Connects if needed and declares the topology on a fresh connection.
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn push(&self, queue: &'static QueueSpec, member: &str, priority: u8)
        -> Result<(), BrokerError>;

    /// Moves the head of `queue` into the unacknowledged set, stamped `now_ms`.
    async fn pop(&self, queue: &'static QueueSpec, now_ms: i64)
        -> Result<Option<RawDelivery>, BrokerError>;

    /// Refreshes the delivery time of an outstanding delivery.
    async fn touch(&self, queue: &'static QueueSpec, member: &str, now_ms: i64)
        -> Result<(), BrokerError>;

    async fn settle(
        &self,
        queue: &'static QueueSpec,
        delivery: &RawDelivery,
        settlement: Settlement,
    ) -> Result<(), BrokerError>;

    /// Requeues deliveries last stamped at or before `stale_before_ms`.
    async fn reclaim(&self, queue: &'static QueueSpec, stale_before_ms: i64)
        -> Result<usize, BrokerError>;

    async fn close(&self);
}

/// Publishing side of the broker, the seam producers depend on.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, queue: &str, body: Value, priority: u8) -> Result<(), BrokerError>;
}

/// Serializes `message` and publishes it as a persistent message.
pub async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn Publisher,
    queue: &str,
    message: &T,
    priority: u8,
) -> Result<(), BrokerError> {
    let body = serde_json::to_value(message)?;
    publisher.publish(queue, body, priority).await
}

pub fn queue_spec(name: &str) -> Option<&'static QueueSpec> {
    QUEUES.iter().find(|q| q.name == name)
}

/// Orders by priority (highest first), then by publish sequence.
pub fn delivery_score(spec: &QueueSpec, priority: u8, seq: u64) -> f64 {
    let effective = priority.min(spec.max_priority);
    f64::from(spec.max_priority - effective) * SEQ_SPAN + seq as f64
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// Idle wait of a consumer between empty polls.
    pub poll_interval: Duration,
    /// How long a delivery may go unrefreshed before it is requeued.
    pub unacked_timeout: Duration,
}

impl From<&PipelineConfig> for BrokerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.broker_poll_interval,
            unacked_timeout: config.unacked_timeout,
        }
    }
}

impl BrokerSettings {
    fn heartbeat_period(&self) -> Duration {
        (self.unacked_timeout / 3).max(Duration::from_millis(10))
    }

    fn sweep_period(&self) -> Duration {
        (self.unacked_timeout / 2).max(Duration::from_millis(10))
    }
}

#[derive(Debug)]
struct Delivery {
    queue: &'static QueueSpec,
    raw: RawDelivery,
    envelope: Envelope,
}

pub struct Broker {
    store: Arc<dyn QueueStore>,
    settings: BrokerSettings,
}

impl Broker {
    pub fn new(store: Arc<dyn QueueStore>, settings: BrokerSettings) -> Self {
        Self { store, settings }
    }

    /// Connects and declares the topology. Idempotent.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if let Err(e) = self.store.connect().await {
            error!("Error setting up broker queues: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Starts a consumer task on `queue`. Each delivery is handed to `handler`
    /// and settled with the returned acknowledgement.
    pub fn consume<T, H, Fut>(
        self: &Arc<Self>,
        queue: &str,
        prefetch: usize,
        handler: H,
    ) -> Result<ConsumerHandle, BrokerError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Acknowledgement>> + Send + 'static,
    {
        let spec = queue_spec(queue).ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let prefetch = prefetch.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = Arc::clone(self);
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            broker
                .consume_loop::<T, H, Fut>(spec, prefetch, handler, shutdown_rx)
                .await;
        });

        info!("Consumer started on {} (prefetch {prefetch})", spec.name);
        Ok(ConsumerHandle {
            queue: spec.name,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn consume_loop<T, H, Fut>(
        self: Arc<Self>,
        spec: &'static QueueSpec,
        prefetch: usize,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Acknowledgement>> + Send + 'static,
    {
        let permits = Arc::new(Semaphore::new(prefetch));
        let mut next_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_sweep {
                self.reclaim_stale(spec, now_ms()).await;
                next_sweep = Instant::now() + self.settings.sweep_period();
            }

            let permit = tokio::select! {
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.next_delivery(spec).await {
                Ok(Some(delivery)) => {
                    let broker = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        broker.dispatch::<T, H, Fut>(delivery, handler).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    warn!("Error receiving from {}: {e}", spec.name);
                    drop(permit);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        // Wait for in-flight deliveries to settle.
        let _ = permits.acquire_many(prefetch as u32).await;
        info!("Consumer on {} stopped", spec.name);
    }

    /// Requeues deliveries whose worker stopped refreshing them.
    pub async fn reclaim_stale(&self, spec: &'static QueueSpec, now_ms: i64) -> usize {
        let stale_before = now_ms - self.settings.unacked_timeout.as_millis() as i64;
        match self.store.reclaim(spec, stale_before).await {
            Ok(0) => 0,
            Ok(count) => {
                warn!("Requeued {count} abandoned deliveries on {}", spec.name);
                count
            }
            Err(e) => {
                warn!("Failed to reclaim deliveries on {}: {e}", spec.name);
                0
            }
        }
    }

    async fn next_delivery(&self, spec: &'static QueueSpec) -> Result<Option<Delivery>, BrokerError> {
        let Some(raw) = self.store.pop(spec, now_ms()).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Envelope>(&raw.member) {
            Ok(envelope) => Ok(Some(Delivery {
                queue: spec,
                raw,
                envelope,
            })),
            Err(e) => {
                // Not one of ours; route it away so it cannot block the queue.
                error!("Discarding malformed envelope on {}: {e}", spec.name);
                let settlement = Settlement::for_ack(spec, Acknowledgement::Nack { requeue: false })?;
                self.store.settle(spec, &raw, settlement).await?;
                Ok(None)
            }
        }
    }

    async fn dispatch<T, H, Fut>(&self, delivery: Delivery, handler: Arc<H>)
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Acknowledgement>> + Send + 'static,
    {
        let id = delivery.envelope.id.clone();
        let queue = delivery.queue.name;
        debug!("Delivering message {id} from {queue}");

        let ack = match serde_json::from_value::<T>(delivery.envelope.body.clone()) {
            Err(e) => {
                error!("Message {id} on {queue} could not be decoded: {e}");
                Acknowledgement::Nack { requeue: false }
            }
            // Spawned so a panicking handler is contained and still settles the message.
            Ok(message) => {
                let task = tokio::spawn((*handler)(message));
                match self.run_with_heartbeat(&delivery, task).await {
                    Ok(Ok(ack)) => ack,
                    Ok(Err(e)) => {
                        error!("Error processing message {id} from {queue}: {e:#}");
                        Acknowledgement::Nack { requeue: false }
                    }
                    Err(e) => {
                        error!("Handler for message {id} from {queue} panicked: {e}");
                        Acknowledgement::Nack { requeue: false }
                    }
                }
            }
        };

        if let Err(e) = self.settle(&delivery, ack).await {
            error!("Failed to settle message {id} on {queue} ({ack:?}): {e}");
        }
    }

    /// Awaits the handler task, refreshing the delivery so the sweep leaves it alone.
    async fn run_with_heartbeat(
        &self,
        delivery: &Delivery,
        mut task: JoinHandle<anyhow::Result<Acknowledgement>>,
    ) -> Result<anyhow::Result<Acknowledgement>, tokio::task::JoinError> {
        let period = self.settings.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                joined = &mut task => return joined,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.touch(delivery.queue, &delivery.raw.member, now_ms()).await {
                        warn!("Failed to refresh message {}: {e}", delivery.envelope.id);
                    }
                }
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, ack: Acknowledgement) -> Result<(), BrokerError> {
        let settlement = Settlement::for_ack(delivery.queue, ack)?;
        self.store.settle(delivery.queue, &delivery.raw, settlement).await?;
        match settlement {
            Settlement::DeadLetter(dlq) => warn!(
                "Message {} from {} dead-lettered to {}",
                delivery.envelope.id, delivery.queue.name, dlq.name
            ),
            Settlement::Remove if ack != Acknowledgement::Ack => warn!(
                "Message {} from {} rejected and dropped",
                delivery.envelope.id, delivery.queue.name
            ),
            _ => {}
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[async_trait]
impl Publisher for Broker {
    async fn publish(&self, queue: &str, body: Value, priority: u8) -> Result<(), BrokerError> {
        let spec = queue_spec(queue).ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))?;
        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            priority: priority.min(spec.max_priority),
            published_at: now_ms(),
            body,
        };
        let member = serde_json::to_string(&envelope)?;

        if let Err(e) = self.store.push(spec, &member, priority).await {
            error!("Error publishing message to {}: {e}", spec.name);
            return Err(e);
        }
        debug!("Published message {} to {} (priority {priority})", envelope.id, spec.name);
        Ok(())
    }
}

/// Running consumer. Dropping it stops the loop as well.
pub struct ConsumerHandle {
    queue: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stops fetching and waits for in-flight deliveries to settle.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Consumer on {} ended abnormally: {e}", self.queue);
        }
    }
}
