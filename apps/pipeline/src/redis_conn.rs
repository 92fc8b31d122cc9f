//! Shared Redis connection handle used by the broker and the status cache.
//!
//! Connects lazily. Concurrent callers that arrive while a connection attempt
//! is running wait on that same attempt instead of opening their own. When a
//! command fails with a connection-level error the handle drops its
//! connection and schedules exactly one reconnect after `reconnect_delay`;
//! operations issued in the meantime fail and propagate to their caller
//! without touching the network. A failed connect backs off the same way.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, RedisError};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct RedisHandle {
    inner: Arc<Inner>,
}

struct Inner {
    name: &'static str,
    client: Client,
    reconnect_delay: Duration,
    conn: Mutex<ConnState>,
    reconnect_scheduled: AtomicBool,
    /// Bumped on every successful connect so callers can detect a fresh connection.
    generation: AtomicU64,
}

#[derive(Default)]
struct ConnState {
    conn: Option<MultiplexedConnection>,
    /// No connect is attempted before this instant.
    retry_at: Option<Instant>,
}

impl ConnState {
    fn backing_off(&self, now: Instant) -> bool {
        self.retry_at.is_some_and(|at| now < at)
    }
}

impl RedisHandle {
    pub fn open(name: &'static str, url: &str, reconnect_delay: Duration) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                client,
                reconnect_delay,
                conn: Mutex::new(ConnState::default()),
                reconnect_scheduled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the live connection, connecting first if needed.
    pub async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        // Holding the lock across the connect makes concurrent callers share one attempt.
        let mut guard = self.inner.conn.lock().await;
        if let Some(conn) = guard.conn.as_ref() {
            return Ok(conn.clone());
        }
        if guard.backing_off(Instant::now()) {
            return Err(RedisError::from((
                ErrorKind::IoError,
                "Reconnect pending",
                self.inner.name.to_string(),
            )));
        }

        info!("Connecting {} to Redis...", self.inner.name);
        match self.inner.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                guard.conn = Some(conn.clone());
                guard.retry_at = None;
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                info!("{} connected to Redis", self.inner.name);
                Ok(conn)
            }
            Err(e) => {
                error!("{} failed to connect to Redis: {e}", self.inner.name);
                guard.retry_at = Some(Instant::now() + self.inner.reconnect_delay);
                Err(e)
            }
        }
    }

    /// Connection generation; changes whenever a new connection is established.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Inspects a command failure. Connection-level failures clear the handle
    /// and schedule a single delayed reconnect.
    pub async fn report_error(&self, err: &RedisError) {
        if !is_connection_error(err) {
            return;
        }

        warn!("{} lost its Redis connection: {err}", self.inner.name);
        {
            let mut guard = self.inner.conn.lock().await;
            guard.conn = None;
            guard.retry_at = Some(Instant::now() + self.inner.reconnect_delay);
        }

        if self.inner.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(handle.inner.reconnect_delay).await;
            handle.inner.reconnect_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = handle.connection().await {
                error!("{} reconnection failed: {e}", handle.inner.name);
            }
        });
    }

    pub async fn close(&self) {
        if self.inner.conn.lock().await.conn.take().is_some() {
            info!("{} Redis connection closed", self.inner.name);
        }
    }
}

fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}
