//! Bounded connection pool.
//!
//! Checkout takes an idle connection, creates one while under
//! `size + max_overflow`, or waits up to the pool timeout. Checkin destroys
//! connections that are unhealthy, over the recycle age, or overflow; the
//! rest return to the idle set. All pool state lives behind one async mutex.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::broker::{Broker, Connection};
use crate::config::{BrokerConfig, PoolConfig};
use crate::error::{BrokerError, Result};

/// A pooled connection with its bookkeeping.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Arc<Connection>,
    created_at: Instant,
    overflow: bool,
}

impl PooledConnection {
    /// The underlying client connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

struct PoolState {
    idle: Vec<PooledConnection>,
    total: usize,
}

/// Bounded, recycling connection pool.
pub struct ConnectionPool {
    broker: Arc<Broker>,
    broker_config: BrokerConfig,
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Notify,
}

impl ConnectionPool {
    pub fn new(broker: Arc<Broker>, broker_config: BrokerConfig, config: PoolConfig) -> Self {
        info!(
            size = config.size,
            max_overflow = config.max_overflow,
            recycle = config.recycle.as_secs(),
            "connection pool created"
        );
        Self {
            broker,
            broker_config,
            config,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
            }),
            returned: Notify::new(),
        }
    }

    /// Take a connection, waiting up to the pool timeout.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.config.timeout;
        loop {
            {
                let mut state = self.state.lock().await;

                // Prefer an idle connection; replace it if it went stale
                // while pooled.
                while let Some(pooled) = state.idle.pop() {
                    if pooled.is_healthy() {
                        return Ok(pooled);
                    }
                    debug!(connection = pooled.id(), "idle connection unhealthy, destroying");
                    pooled.close();
                    state.total -= 1;
                }

                let cap = self.config.size + self.config.max_overflow;
                if state.total < cap {
                    state.total += 1;
                    let overflow = state.total > self.config.size;
                    drop(state);
                    match Connection::connect(&self.broker, &self.broker_config).await {
                        Ok(conn) => {
                            return Ok(PooledConnection {
                                conn: Arc::new(conn),
                                created_at: Instant::now(),
                                overflow,
                            });
                        }
                        Err(e) => {
                            self.state.lock().await.total -= 1;
                            self.returned.notify_one();
                            return Err(e);
                        }
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BrokerError::PoolExhausted(
                    self.config.timeout.as_secs_f64(),
                ));
            }
            if tokio::time::timeout(deadline - now, self.returned.notified())
                .await
                .is_err()
            {
                return Err(BrokerError::PoolExhausted(
                    self.config.timeout.as_secs_f64(),
                ));
            }
        }
    }

    /// Return a connection. Overflow, over-age and unhealthy connections
    /// are destroyed instead of pooled.
    pub async fn checkin(&self, pooled: PooledConnection) {
        let mut state = self.state.lock().await;
        let destroy = pooled.overflow
            || pooled.age() > self.config.recycle
            || !pooled.is_healthy();
        if destroy {
            debug!(
                connection = pooled.id(),
                overflow = pooled.overflow,
                age_secs = pooled.age().as_secs(),
                "destroying connection on checkin"
            );
            pooled.close();
            state.total -= 1;
        } else {
            state.idle.push(pooled);
        }
        drop(state);
        self.returned.notify_one();
    }

    /// Close every pooled connection.
    pub async fn close_all(&self) {
        let mut state = self.state.lock().await;
        let closed = state.idle.len();
        for pooled in state.idle.drain(..) {
            pooled.close();
        }
        state.total -= closed;
        if closed > 0 {
            info!(closed, "pool connections closed");
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }

    pub async fn total_count(&self) -> usize {
        self.state.lock().await.total
    }
}

static GLOBAL_POOL: OnceLock<Arc<ConnectionPool>> = OnceLock::new();

/// Process-wide pool singleton. The first caller's configuration wins;
/// later calls return the existing pool.
pub fn global_pool(
    broker: &Arc<Broker>,
    broker_config: BrokerConfig,
    config: PoolConfig,
) -> Arc<ConnectionPool> {
    GLOBAL_POOL
        .get_or_init(|| {
            Arc::new(ConnectionPool::new(
                Arc::clone(broker),
                broker_config,
                config,
            ))
        })
        .clone()
}
