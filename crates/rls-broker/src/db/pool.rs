use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use deadpool::Runtime;
use deadpool::managed::{self, Metrics, PoolError, RecycleError, RecycleResult, TimeoutType};
use tokio_util::sync::CancellationToken;

use super::connection::{Connector, DbError, SessionConnection};
use crate::constants::{HEALTH_CHECK_QUERY, ROLLBACK};
use crate::error::{Error, Result};

pub type SessionPool<C> = managed::Pool<SessionManager<C>>;
pub type PooledSession<C> = managed::Object<SessionManager<C>>;

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 20,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Pooled connection plus whether a transaction may still be open on it.
#[derive(Debug)]
pub struct SessionSlot<T> {
    conn: T,
    tx_open: bool,
}

impl<T> SessionSlot<T> {
    pub const fn tx_open(&self) -> bool {
        self.tx_open
    }

    pub(crate) const fn set_tx_open(&mut self, open: bool) {
        self.tx_open = open;
    }
}

impl<T> Deref for SessionSlot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.conn
    }
}

impl<T> DerefMut for SessionSlot<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.conn
    }
}

#[derive(Debug)]
pub struct SessionManager<C> {
    connector: C,
}

impl<C> SessionManager<C> {
    pub const fn new(connector: C) -> Self {
        Self { connector }
    }
}

impl<C: Connector> managed::Manager for SessionManager<C> {
    type Type = SessionSlot<C::Connection>;
    type Error = DbError;

    async fn create(&self) -> std::result::Result<Self::Type, DbError> {
        let conn = self.connector.connect().await?;
        Ok(SessionSlot {
            conn,
            tx_open: false,
        })
    }

    async fn recycle(&self, slot: &mut Self::Type, _: &Metrics) -> RecycleResult<DbError> {
        if slot.conn.is_closed() {
            return Err(RecycleError::Backend(DbError::Closed));
        }
        // A broker future dropped mid-transaction leaves the slot dirty.
        if slot.tx_open {
            tracing::warn!("Rolling back abandoned transaction before reuse");
            slot.conn
                .batch_execute(ROLLBACK)
                .await
                .map_err(RecycleError::Backend)?;
            slot.tx_open = false;
        }
        Ok(())
    }
}

pub fn create_pool<C: Connector>(connector: C, config: &PoolConfig) -> Result<SessionPool<C>> {
    SessionPool::builder(SessionManager::new(connector))
        .max_size(config.max_size)
        .wait_timeout(Some(config.wait_timeout))
        .create_timeout(Some(config.connect_timeout))
        .recycle_timeout(Some(Duration::from_secs(5)))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| Error::Config(format!("failed to build connection pool: {e}")))
}

/// Acquire a session, suspending while the pool is saturated.
pub async fn acquire<C: Connector>(pool: &SessionPool<C>) -> Result<PooledSession<C>> {
    let started = Instant::now();
    let result = pool.get().await.map_err(pool_error);

    #[cfg(feature = "metrics")]
    crate::observability::record_pool_wait(started.elapsed(), result.is_ok());
    tracing::trace!(waited_ms = started.elapsed().as_millis() as u64, "Pool acquire");

    result
}

pub(crate) fn pool_error(err: PoolError<DbError>) -> Error {
    match err {
        PoolError::Timeout(TimeoutType::Wait) => Error::PoolExhausted,
        PoolError::Timeout(kind) => {
            Error::DatabaseUnreachable(format!("pool timeout: {kind:?}"))
        }
        PoolError::Backend(e) => Error::DatabaseUnreachable(e.to_string()),
        PoolError::Closed => Error::DatabaseUnreachable("pool closed".into()),
        other => Error::Config(other.to_string()),
    }
}

/// Round-trip one connection; failure means nothing downstream can work.
pub async fn validate<C: Connector>(pool: &SessionPool<C>, name: &str) -> Result<()> {
    let mut session = pool.get().await.map_err(|e| match pool_error(e) {
        Error::PoolExhausted => Error::DatabaseUnreachable(format!("{name} pool: no connection")),
        other => other,
    })?;
    session
        .batch_execute(HEALTH_CHECK_QUERY)
        .await
        .map_err(|e| Error::DatabaseUnreachable(format!("{name} pool: {e}")))?;
    tracing::info!(pool = name, "Database connection validated");
    Ok(())
}

/// Background task evicting connections idle longer than `idle_timeout`.
#[derive(Debug)]
pub struct IdleReaper {
    cancel: CancellationToken,
}

impl IdleReaper {
    pub fn spawn<C: Connector>(
        pool: SessionPool<C>,
        name: &'static str,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let interval = (idle_timeout / 2).max(Duration::from_secs(1));
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        tracing::debug!("Idle reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = reap_idle(&pool, idle_timeout);
                        if evicted > 0 {
                            tracing::debug!(pool = name, evicted, "Evicted idle connections");
                        }
                        #[cfg(feature = "metrics")]
                        {
                            let status = pool.status();
                            crate::observability::set_pool_stats(
                                name,
                                status.max_size,
                                status.available,
                                status.waiting,
                            );
                        }
                    }
                }
            }
        });
        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for IdleReaper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn reap_idle<C: Connector>(pool: &SessionPool<C>, idle_timeout: Duration) -> usize {
    pool.retain(|_, metrics| metrics.last_used() < idle_timeout)
        .removed
        .len()
}
