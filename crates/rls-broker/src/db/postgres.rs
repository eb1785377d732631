//! PostgreSQL backend

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config};
use tokio_postgres_rustls::MakeRustlsConnect;

use super::connection::{Connector, DbError, SessionConnection};
use super::tls::{TlsOptions, UrlSslMode, make_connector, normalize_ssl_params};

/// Opens PostgreSQL sessions from a connection URL.
///
/// TLS follows the URL's `sslmode`; `prefer` falls back to plaintext only
/// when the server refuses the upgrade.
#[derive(Clone)]
pub struct PostgresConnector {
    config: Config,
    tls: MakeRustlsConnect,
}

impl fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnector")
            .field("user", &self.config.get_user())
            .field("dbname", &self.config.get_dbname())
            .field("password", &self.config.get_password().map(|_| "<redacted>"))
            .field("ssl_mode", &self.config.get_ssl_mode())
            .finish_non_exhaustive()
    }
}

impl PostgresConnector {
    pub fn new(url: &str, connect_timeout: Duration, tls: &TlsOptions) -> Result<Self, DbError> {
        let (url, mode) = normalize_ssl_params(url)?;
        let mut config: Config = url
            .parse()
            .map_err(|e: tokio_postgres::Error| DbError::Connect(format!("invalid URL: {e}")))?;
        config.connect_timeout(connect_timeout);

        match mode {
            UrlSslMode::Disable if tls.require => {
                return Err(DbError::Connect(
                    "TLS is required but the URL sets sslmode=disable".to_string(),
                ));
            }
            UrlSslMode::Verify if !tls.verify_certificate => {
                return Err(DbError::Connect(
                    "sslmode=verify-* conflicts with disabled certificate verification"
                        .to_string(),
                ));
            }
            UrlSslMode::Prefer if tls.require => {
                config.ssl_mode(SslMode::Require);
            }
            _ => {}
        }

        let tls = make_connector(tls)?;
        Ok(Self { config, tls })
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.config.get_ssl_mode()
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection, DbError> {
        let (client, connection) = self
            .config
            .connect(self.tls.clone())
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(PgConnection { client })
    }
}

/// Pooled PostgreSQL session.
pub struct PgConnection {
    client: Client,
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish()
    }
}

impl PgConnection {
    /// Client for queries inside a broker transaction.
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl SessionConnection for PgConnection {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| statement_error(&e))
    }

    async fn call(&mut self, sql: &str, arg: &str) -> Result<(), DbError> {
        self.client
            .query(sql, &[&arg])
            .await
            .map(|_| ())
            .map_err(|e| statement_error(&e))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn statement_error(err: &tokio_postgres::Error) -> DbError {
    if err.is_closed() {
        return DbError::Closed;
    }
    match err.as_db_error() {
        Some(db) => DbError::Statement(format!("{}: {}", db.code().code(), db.message())),
        None => DbError::Statement(err.to_string()),
    }
}
