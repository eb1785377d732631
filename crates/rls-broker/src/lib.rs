//! Token exchange and transaction-scoped row-level-security sessions
//!
//! Verifies a bearer token from an external identity provider, maps it to a
//! tenant and role, re-signs it with the process Ed25519 key and runs caller
//! work inside one PostgreSQL transaction where that credential is installed.
//! Row-level-security policies in the database read it from the session.

pub mod auth;
pub mod broker;
pub mod config;
mod constants;
pub mod context;
pub mod db;
mod error;
pub mod observability;

pub use auth::{AuthError, InternalToken, KeyMaterial, Provider, PublicJwk};
pub use broker::{Identity, SessionBroker, SessionScope, SessionState, TxStage};
pub use config::{Config, ConfigBuilder, TelemetryConfig};
pub use context::BrokerContext;
pub use db::{DatabasePools, PoolConfig, SessionProcedures, TlsOptions};
pub use error::{BoxError, Error, PublicError, Result};
