//! Single shared Redis connection used by every queue and worker.
//!
//! Operations never wait for a reconnect: while disconnected they fail immediately with
//! `QueueError::RedisConnection`, and one background task keeps trying to reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time;

use log::{debug, info, warn};
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{Cmd, Pipeline, RedisError, RedisFuture, RedisResult, Value};
use tokio::sync::{broadcast, RwLock};

use crate::config::RedisConfig;
use crate::models::{QueueError, QueueResult};

/// Upper bound on the delay between connection attempts.
pub const MAX_RECONNECT_DELAY: time::Duration = time::Duration::from_millis(2000);

const RECONNECT_STEP_MILLIS: u64 = 50;
const EVENT_CAPACITY: usize = 64;

/// Lifecycle events emitted by the connection. Receivers only log them.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// A connection was established on the given attempt (1-based).
    Connected { attempt: u32 },

    /// A connection attempt or an operation on an open connection failed.
    Error { message: String },

    /// The connection was closed for good.
    Closed,
}

/// Delay before the given (1-based) connection attempt is retried.
pub fn reconnect_delay(attempt: u32) -> time::Duration {
    let millis = u64::from(attempt).saturating_mul(RECONNECT_STEP_MILLIS);
    time::Duration::from_millis(millis).min(MAX_RECONNECT_DELAY)
}

/// True if the error means the connection itself is unusable, rather than a single command
/// having failed.
fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

/// The open connection as handed out by `RedisConnection::get`, tagged with the generation it
/// was established in so a late error can't tear down a newer connection.
pub struct ConnectionLease {
    generation: u64,
    conn: MultiplexedConnection,
}

impl ConnectionLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl ConnectionLike for ConnectionLease {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        self.conn.req_packed_command(cmd)
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        self.conn.req_packed_commands(cmd, offset, count)
    }

    fn get_db(&self) -> i64 {
        self.conn.get_db()
    }
}

/// Cheaply cloneable handle to the shared connection.
#[derive(Clone)]
pub struct RedisConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    conn: RwLock<Option<(u64, MultiplexedConnection)>>,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    max_attempts: Option<u32>,
}

impl RedisConnection {
    /// Open the connection described by the given config, retrying with backoff until it
    /// succeeds or `connect_attempts` is exhausted.
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let url = config.connection_url();
        let client = redis::Client::open(url.as_str())?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let conn = RedisConnection {
            inner: Arc::new(Inner {
                client,
                conn: RwLock::new(None),
                generation: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
                max_attempts: config.connect_attempts,
            }),
        };

        debug!(
            "Connecting to Redis at {}:{} (tls: {})",
            config.host,
            config.port,
            config.use_tls()
        );
        let attempts = conn.establish().await?;
        info!("Connected to Redis after {} attempt(s)", attempts);
        Ok(conn)
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Get a handle to the open connection, failing fast if there isn't one.
    pub async fn get(&self) -> QueueResult<ConnectionLease> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::closed("Redis connection is closed"));
        }
        match &*self.inner.conn.read().await {
            Some((generation, conn)) => Ok(ConnectionLease {
                generation: *generation,
                conn: conn.clone(),
            }),
            None => Err(QueueError::RedisConnection(
                "not connected, reconnect in progress".to_owned(),
            )),
        }
    }

    /// Pass through the result of a command run on `lease`, dropping the connection and starting
    /// a background reconnect if the error shows the connection is gone.
    ///
    /// Errors from a connection that has already been replaced leave the current one alone.
    pub async fn observe<T>(&self, lease: &ConnectionLease, result: RedisResult<T>) -> QueueResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_connection_error(&err) && !self.inner.closed.load(Ordering::SeqCst) {
                    self.emit(ConnectionEvent::Error {
                        message: err.to_string(),
                    });
                    let mut current = self.inner.conn.write().await;
                    let is_current = matches!(&*current, Some((generation, _)) if *generation == lease.generation);
                    if is_current {
                        *current = None;
                        drop(current);
                        self.spawn_reconnect();
                    } else {
                        debug!(
                            "Ignoring error from replaced connection (generation {})",
                            lease.generation
                        );
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Close the connection. Later operations fail with `QueueError::Closed`.
    pub async fn close(&self) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::closed("Redis connection already closed"));
        }
        *self.inner.conn.write().await = None;
        self.emit(ConnectionEvent::Closed);
        info!("Redis connection closed");
        Ok(())
    }

    fn emit(&self, event: ConnectionEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    /// Returns the number of attempts it took.
    async fn establish(&self) -> QueueResult<u32> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.inner.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    self.install(conn).await;
                    self.emit(ConnectionEvent::Connected { attempt });
                    return Ok(attempt);
                }
                Err(err) => {
                    self.emit(ConnectionEvent::Error {
                        message: err.to_string(),
                    });
                    if let Some(max) = self.inner.max_attempts {
                        if attempt >= max {
                            return Err(QueueError::RedisConnection(format!(
                                "gave up after {} attempts: {}",
                                attempt, err
                            )));
                        }
                    }
                    tokio::time::sleep(reconnect_delay(attempt)).await;
                }
            }

            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(QueueError::closed("Redis connection closed while connecting"));
            }
        }
    }

    async fn install(&self, conn: MultiplexedConnection) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.conn.write().await = Some((generation, conn));
    }

    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            warn!("Redis connection lost, reconnecting in background");
            let mut attempt: u32 = 0;
            while !conn.inner.closed.load(Ordering::SeqCst) {
                attempt += 1;
                tokio::time::sleep(reconnect_delay(attempt)).await;
                match conn.inner.client.get_multiplexed_async_connection().await {
                    Ok(new_conn) => {
                        if !conn.inner.closed.load(Ordering::SeqCst) {
                            conn.install(new_conn).await;
                            conn.emit(ConnectionEvent::Connected { attempt });
                        }
                        break;
                    }
                    Err(err) => conn.emit(ConnectionEvent::Error {
                        message: err.to_string(),
                    }),
                }
            }
            conn.inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }
}
