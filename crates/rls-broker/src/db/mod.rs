//! Connection pools and database backends
//!
//! Two pools exist per process: `admin` (schema bootstrap, health checks)
//! and `authenticated` (restricted role, used only inside broker
//! transactions).

mod connection;
pub mod memory;
mod pool;
pub mod postgres;
mod tls;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use connection::{Connector, DbError, SessionConnection};
pub use pool::{
    IdleReaper, PoolConfig, PooledSession, SessionManager, SessionPool, SessionSlot, acquire,
    create_pool, reap_idle, validate,
};
pub use tls::TlsOptions;

use crate::constants::{DEFAULT_INIT_SQL, DEFAULT_INSTALL_SQL};
use crate::error::{Error, Result};

/// Database-side procedures scoping a transaction to one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProcedures {
    /// Resets per-transaction session state. No arguments.
    pub init: String,
    /// Installs the signed credential, bound as `$1`.
    pub install: String,
}

impl Default for SessionProcedures {
    fn default() -> Self {
        Self {
            init: DEFAULT_INIT_SQL.to_string(),
            install: DEFAULT_INSTALL_SQL.to_string(),
        }
    }
}

/// The admin and authenticated pools.
#[derive(Debug)]
pub struct DatabasePools<C: Connector> {
    admin: SessionPool<C>,
    authenticated: SessionPool<C>,
    reapers: Vec<IdleReaper>,
}

impl<C: Connector> DatabasePools<C> {
    pub fn new(admin: C, authenticated: C, config: &PoolConfig) -> Result<Self> {
        Ok(Self {
            admin: create_pool(admin, config)?,
            authenticated: create_pool(authenticated, config)?,
            reapers: Vec::new(),
        })
    }

    pub const fn admin(&self) -> &SessionPool<C> {
        &self.admin
    }

    pub const fn authenticated(&self) -> &SessionPool<C> {
        &self.authenticated
    }

    /// Round-trip both pools. Failure is fatal to startup.
    pub async fn validate(&self) -> Result<()> {
        validate(&self.admin, "admin").await?;
        validate(&self.authenticated, "authenticated").await
    }

    /// Run schema bootstrap SQL on the admin pool.
    pub async fn bootstrap(&self, sql: &str) -> Result<()> {
        let mut session = acquire(&self.admin).await?;
        session
            .batch_execute(sql)
            .await
            .map_err(|e| Error::DatabaseUnreachable(format!("bootstrap failed: {e}")))?;
        tracing::info!(bytes = sql.len(), "Schema bootstrap applied");
        Ok(())
    }

    /// Evict idle connections from both pools until `cancel` fires.
    pub fn start_idle_reaper(&mut self, idle_timeout: Duration, cancel: &CancellationToken) {
        self.reapers = vec![
            IdleReaper::spawn(
                self.admin.clone(),
                "admin",
                idle_timeout,
                cancel.child_token(),
            ),
            IdleReaper::spawn(
                self.authenticated.clone(),
                "authenticated",
                idle_timeout,
                cancel.child_token(),
            ),
        ];
    }

    pub fn close(&self) {
        for reaper in &self.reapers {
            reaper.stop();
        }
        self.admin.close();
        self.authenticated.close();
    }
}
