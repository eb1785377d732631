//! Process-wide wiring: keys, verifiers, pools and the broker

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{
    Auth0Verifier, InternalTokenSigner, KeyMaterial, NamespacedClaimMapper, VerifierRegistry,
};
use crate::broker::SessionBroker;
use crate::config::Config;
use crate::db::postgres::PostgresConnector;
use crate::db::{Connector, DatabasePools, SessionPool};
use crate::error::{Error, Result};

/// Load and cross-check the process signing key.
pub fn load_keys(config: &Config) -> Result<KeyMaterial> {
    Ok(KeyMaterial::from_hex(
        &config.signing.private_key_hex,
        &config.signing.public_key_hex,
    )?)
}

/// Verifiers for every provider with settings in `config`.
pub fn build_verifiers(config: &Config) -> Result<VerifierRegistry> {
    let mut registry = VerifierRegistry::new();
    if let Some(auth0) = config.auth0_config() {
        registry.register(Arc::new(Auth0Verifier::new(auth0)?));
    }
    if !registry.is_registered(config.provider) {
        tracing::warn!(
            provider = %config.provider,
            "No verifier available for configured provider; exchanges will fail"
        );
    }
    Ok(registry)
}

/// Broker over `pool` with the signer, mapper and procedures from `config`.
///
/// Does not touch the database; pools connect lazily.
pub fn build_broker<C: Connector>(
    config: &Config,
    verifiers: VerifierRegistry,
    pool: SessionPool<C>,
) -> Result<SessionBroker<C>> {
    let keys = Arc::new(load_keys(config)?);
    let signer = InternalTokenSigner::new(keys, config.signing.kid.clone())
        .with_max_ttl(config.signing.max_token_ttl);
    let mapper = Arc::new(NamespacedClaimMapper::new(&config.claim_namespace));

    Ok(SessionBroker::new(verifiers, mapper, signer, pool)
        .with_procedures(config.procedures.clone()))
}

/// Everything a running broker owns.
pub struct BrokerContext<C: Connector> {
    broker: Arc<SessionBroker<C>>,
    pools: DatabasePools<C>,
    shutdown: CancellationToken,
}

impl<C: Connector> fmt::Debug for BrokerContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerContext")
            .field("broker", &self.broker)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl BrokerContext<PostgresConnector> {
    /// Connect to PostgreSQL and assemble the broker from `config`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let verifiers = build_verifiers(config)?;

        let admin = PostgresConnector::new(
            config.admin_url.as_str(),
            config.pool.connect_timeout,
            &config.tls,
        )
        .map_err(|e| Error::Config(format!("admin database: {e}")))?;
        let authenticated = PostgresConnector::new(
            config.authenticated_url.as_str(),
            config.pool.connect_timeout,
            &config.tls,
        )
        .map_err(|e| Error::Config(format!("authenticated database: {e}")))?;
        let pools = DatabasePools::new(admin, authenticated, &config.pool)?;

        let bootstrap = match &config.bootstrap_sql {
            Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "Failed to read bootstrap SQL {}: {e}",
                    path.display()
                ))
            })?),
            None => None,
        };

        Self::assemble(config, verifiers, pools, bootstrap.as_deref()).await
    }
}

impl<C: Connector> BrokerContext<C> {
    /// Validate pools, apply bootstrap SQL and start background upkeep.
    pub async fn assemble(
        config: &Config,
        verifiers: VerifierRegistry,
        mut pools: DatabasePools<C>,
        bootstrap_sql: Option<&str>,
    ) -> Result<Self> {
        let broker = build_broker(config, verifiers, pools.authenticated().clone())?;

        pools.validate().await?;
        if let Some(sql) = bootstrap_sql {
            pools.bootstrap(sql).await?;
        }

        let shutdown = CancellationToken::new();
        pools.start_idle_reaper(config.pool.idle_timeout, &shutdown);

        tracing::info!(
            provider = %config.provider,
            kid = %config.signing.kid,
            pool_max_size = config.pool.max_size,
            "Broker ready"
        );

        Ok(Self {
            broker: Arc::new(broker),
            pools,
            shutdown,
        })
    }

    pub const fn broker(&self) -> &Arc<SessionBroker<C>> {
        &self.broker
    }

    pub const fn pools(&self) -> &DatabasePools<C> {
        &self.pools
    }

    /// Cancelled on shutdown; hand to long-running transactions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn shutdown(&self) {
        tracing::info!("Shutting down broker");
        self.shutdown.cancel();
        self.pools.close();
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::auth::test_keys::hex_pair;
    use crate::auth::test_support::{AUDIENCE, DOMAIN, sign_external, valid_claims, verifier};
    use crate::auth::{AuthError, Provider};
    use crate::broker::Identity;
    use crate::config::ConfigBuilder;
    use crate::db::memory::{MemoryConnector, MemoryDatabase};
    use crate::db::PoolConfig;

    const INTERNAL_SEED: [u8; 32] = [11u8; 32];

    fn config() -> Config {
        let (private_hex, public_hex) = hex_pair(&INTERNAL_SEED);
        ConfigBuilder::new()
            .admin_url(Url::parse("postgres://admin@localhost/app").unwrap())
            .authenticated_url(Url::parse("postgres://authenticated@localhost/app").unwrap())
            .signing_key_hex(private_hex)
            .public_key_hex(public_hex)
            .auth0_domain(DOMAIN)
            .auth0_audience(vec![AUDIENCE.to_string()])
            .build()
            .unwrap()
    }

    fn memory_pools(config: &Config) -> (MemoryDatabase, DatabasePools<MemoryConnector>) {
        let keys = load_keys(config).unwrap();
        let db = MemoryDatabase::new(keys.jwk()).unwrap();
        let pools =
            DatabasePools::new(db.connector(), db.connector(), &PoolConfig::default()).unwrap();
        (db, pools)
    }

    fn registry() -> VerifierRegistry {
        let (_, verifier) = verifier();
        VerifierRegistry::new().with(Arc::new(verifier))
    }

    #[test]
    fn test_load_keys_rejects_mismatched_pair() {
        let (private_hex, _) = hex_pair(&INTERNAL_SEED);
        let (_, other_public) = hex_pair(&[3u8; 32]);
        let config = ConfigBuilder::new()
            .admin_url(Url::parse("postgres://localhost/app").unwrap())
            .authenticated_url(Url::parse("postgres://localhost/app").unwrap())
            .signing_key_hex(private_hex)
            .public_key_hex(other_public)
            .provider(Provider::Clerk)
            .build()
            .unwrap();

        let err = load_keys(&config).unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidKeyMaterial(_))));
    }

    #[test]
    fn test_build_verifiers_registers_auth0() {
        let registry = build_verifiers(&config()).unwrap();
        assert!(registry.is_registered(Provider::Auth0));
        assert!(!registry.is_registered(Provider::Kinde));
    }

    #[test]
    fn test_build_verifiers_without_settings_is_empty() {
        let (private_hex, public_hex) = hex_pair(&INTERNAL_SEED);
        let config = ConfigBuilder::new()
            .admin_url(Url::parse("postgres://localhost/app").unwrap())
            .authenticated_url(Url::parse("postgres://localhost/app").unwrap())
            .signing_key_hex(private_hex)
            .public_key_hex(public_hex)
            .provider(Provider::Kinde)
            .build()
            .unwrap();

        let registry = build_verifiers(&config).unwrap();
        assert!(!registry.is_registered(Provider::Kinde));
    }

    #[tokio::test]
    async fn test_assemble_validates_and_bootstraps() {
        let config = config();
        let (db, pools) = memory_pools(&config);

        let context = BrokerContext::assemble(
            &config,
            registry(),
            pools,
            Some("CREATE SCHEMA IF NOT EXISTS auth"),
        )
        .await
        .unwrap();

        assert_eq!(db.connections_opened(), 2);
        assert_eq!(db.executed(), vec!["CREATE SCHEMA IF NOT EXISTS auth"]);
        assert_eq!(context.broker().signer().kid(), "db-token-signer-1");
        context.shutdown();
    }

    #[tokio::test]
    async fn test_assemble_fails_when_database_unreachable() {
        let config = config();
        let (db, pools) = memory_pools(&config);
        db.set_unreachable(true);

        let err = BrokerContext::assemble(&config, registry(), pools, None)
            .await
            .unwrap_err();
        assert!(err.is_database_unreachable());
    }

    #[tokio::test]
    async fn test_assembled_broker_runs_transactions() {
        let config = config();
        let (db, pools) = memory_pools(&config);
        let context = BrokerContext::assemble(&config, registry(), pools, None)
            .await
            .unwrap();

        let mut claims = valid_claims();
        claims["tenant_id"] = json!("t-7");
        let identity = Identity::bearer(sign_external(&claims), Provider::Auth0);

        context
            .broker()
            .with_secure_transaction(identity, |scope| {
                async move { scope.insert("invoice-1").await }.boxed()
            })
            .await
            .unwrap();

        assert_eq!(db.committed_rows("t-7"), vec!["invoice-1"]);
        assert_eq!(db.open_transactions(), 0);
        context.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_closes_pools_and_token() {
        let config = config();
        let (_db, pools) = memory_pools(&config);
        let context = BrokerContext::assemble(&config, registry(), pools, None)
            .await
            .unwrap();

        let token = context.shutdown_token();
        context.shutdown();

        assert!(token.is_cancelled());
        assert!(context.pools().authenticated().is_closed());
        assert!(context.pools().admin().is_closed());
    }
}
