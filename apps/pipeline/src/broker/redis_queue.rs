//! Queue storage on Redis.
//!
//! Layout:
//! - `broker:queue:<name>`      sorted set of envelopes; lower score is delivered first
//! - `broker:unacked:<name>`    hash envelope → score for deliveries not yet settled
//! - `broker:inflight:<name>`   sorted set envelope → last delivery/refresh time (ms)
//! - `broker:seq:<name>`        FIFO sequence within a priority
//! - `broker:topology`          queue declarations (max priority, dead-letter target)
//! - `broker:exchange:<name>`   direct exchange bindings, routing key → queue

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{error, info};

use super::{
    delivery_score, BrokerError, QueueSpec, QueueStore, RawDelivery, Settlement, BINDINGS, QUEUES,
};
use crate::redis_conn::RedisHandle;

const TOPOLOGY_KEY: &str = "broker:topology";

fn queue_key(name: &str) -> String {
    format!("broker:queue:{name}")
}

fn unacked_key(name: &str) -> String {
    format!("broker:unacked:{name}")
}

fn inflight_key(name: &str) -> String {
    format!("broker:inflight:{name}")
}

fn seq_key(name: &str) -> String {
    format!("broker:seq:{name}")
}

fn exchange_key(name: &str) -> String {
    format!("broker:exchange:{name}")
}

/// Pops the head of a queue and records it as unacknowledged in one step.
const POP_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1], 1)
if #popped == 0 then
  return nil
end
redis.call('HSET', KEYS[2], popped[1], popped[2])
redis.call('ZADD', KEYS[3], ARGV[1], popped[1])
return popped
"#;

/// Moves deliveries stamped at or before ARGV[1] back onto their queue.
const RECLAIM_SCRIPT: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, member in ipairs(stale) do
  local score = redis.call('HGET', KEYS[2], member)
  if score then
    redis.call('ZADD', KEYS[1], score, member)
    redis.call('HDEL', KEYS[2], member)
  end
  redis.call('ZREM', KEYS[3], member)
end
return #stale
"#;

pub struct RedisQueueStore {
    redis: RedisHandle,
    pop_script: redis::Script,
    reclaim_script: redis::Script,
    /// Connection generation the topology was last declared on.
    provisioned: AtomicU64,
}

impl RedisQueueStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            redis,
            pop_script: redis::Script::new(POP_SCRIPT),
            reclaim_script: redis::Script::new(RECLAIM_SCRIPT),
            provisioned: AtomicU64::new(0),
        }
    }

    async fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        let mut conn = self.redis.connection().await?;
        let generation = self.redis.generation();
        if self.provisioned.load(Ordering::SeqCst) != generation {
            self.setup_topology(&mut conn).await?;
            self.provisioned.store(generation, Ordering::SeqCst);
        }
        Ok(conn)
    }

    async fn setup_topology(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for spec in QUEUES {
            pipe.hset(TOPOLOGY_KEY, spec.name, serde_json::to_string(spec)?)
                .ignore();
        }
        for binding in BINDINGS {
            pipe.hset(
                exchange_key(binding.exchange),
                binding.routing_key,
                binding.queue,
            )
            .ignore();
        }
        self.checked(pipe.query_async::<_, ()>(conn).await).await?;
        info!(
            "Broker topology declared: {} queues, {} bindings",
            QUEUES.len(),
            BINDINGS.len()
        );
        Ok(())
    }

    async fn next_seq(&self, conn: &mut MultiplexedConnection, queue: &str) -> Result<u64, BrokerError> {
        let mut cmd = redis::cmd("INCR");
        cmd.arg(seq_key(queue));
        self.checked(cmd.query_async(conn).await).await
    }

    /// Reports connection-level failures to the shared handle before propagating.
    async fn checked<T>(&self, result: redis::RedisResult<T>) -> Result<T, BrokerError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.redis.report_error(&e).await;
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.conn().await.map(|_| ())
    }

    async fn push(&self, queue: &'static QueueSpec, member: &str, priority: u8) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let seq = self.next_seq(&mut conn, queue.name).await?;

        let key = queue_key(queue.name);
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.zadd(&key, member, delivery_score(queue, priority, seq))
            .ignore();
        if let Some(max_length) = queue.max_length {
            // Drop-head: the lowest scores are the oldest updates.
            pipe.zremrangebyrank(&key, 0, -(max_length as isize) - 1)
                .ignore();
        }
        self.checked(pipe.query_async::<_, ()>(&mut conn).await).await
    }

    async fn pop(&self, queue: &'static QueueSpec, now_ms: i64) -> Result<Option<RawDelivery>, BrokerError> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, String)> = self
            .checked(
                self.pop_script
                    .key(queue_key(queue.name))
                    .key(unacked_key(queue.name))
                    .key(inflight_key(queue.name))
                    .arg(now_ms)
                    .invoke_async(&mut conn)
                    .await,
            )
            .await?;

        Ok(popped.map(|(member, score)| {
            let score = score.parse::<f64>().unwrap_or_else(|e| {
                error!("Unreadable score '{score}' on {}: {e}", queue.name);
                0.0
            });
            RawDelivery { member, score }
        }))
    }

    async fn touch(&self, queue: &'static QueueSpec, member: &str, now_ms: i64) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        // XX: a delivery that was already settled or reclaimed stays gone.
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(inflight_key(queue.name))
            .arg("XX")
            .arg(now_ms)
            .arg(member);
        self.checked(cmd.query_async::<_, ()>(&mut conn).await).await
    }

    async fn settle(
        &self,
        queue: &'static QueueSpec,
        delivery: &RawDelivery,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(unacked_key(queue.name), &delivery.member).ignore();
        pipe.zrem(inflight_key(queue.name), &delivery.member).ignore();

        match settlement {
            Settlement::Remove => {}
            Settlement::Requeue => {
                pipe.zadd(queue_key(queue.name), &delivery.member, delivery.score)
                    .ignore();
            }
            Settlement::DeadLetter(dlq) => {
                let seq = self.next_seq(&mut conn, dlq.name).await?;
                pipe.zadd(queue_key(dlq.name), &delivery.member, delivery_score(dlq, 0, seq))
                    .ignore();
            }
        }

        self.checked(pipe.query_async::<_, ()>(&mut conn).await).await
    }

    async fn reclaim(&self, queue: &'static QueueSpec, stale_before_ms: i64) -> Result<usize, BrokerError> {
        let mut conn = self.conn().await?;
        self.checked(
            self.reclaim_script
                .key(queue_key(queue.name))
                .key(unacked_key(queue.name))
                .key(inflight_key(queue.name))
                .arg(stale_before_ms)
                .invoke_async(&mut conn)
                .await,
        )
        .await
    }

    async fn close(&self) {
        self.redis.close().await;
    }
}
