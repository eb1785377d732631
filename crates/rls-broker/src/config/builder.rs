//! Configuration builder

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use zeroize::Zeroizing;

use crate::Error;
use crate::auth::{Auth0Config, Provider};
use crate::constants::{DEFAULT_CLAIM_NAMESPACE, DEFAULT_SIGNER_KID};
use crate::db::{PoolConfig, SessionProcedures, TlsOptions};

/// Broker configuration
#[derive(Clone)]
pub struct Config {
    /// Privileged role: schema bootstrap and health checks.
    pub admin_url: Url,
    /// Restricted role used inside secure transactions.
    pub authenticated_url: Url,
    /// Transport security for both pools.
    pub tls: TlsOptions,
    pub signing: SigningConfig,
    pub provider: Provider,
    pub auth0: Option<Auth0Settings>,
    pub claim_namespace: String,
    pub pool: PoolConfig,
    pub procedures: SessionProcedures,
    pub bootstrap_sql: Option<PathBuf>,
    pub telemetry: TelemetryConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("admin_url", &redact_url(&self.admin_url))
            .field("authenticated_url", &redact_url(&self.authenticated_url))
            .field("tls", &self.tls)
            .field("signing", &self.signing)
            .field("provider", &self.provider)
            .field("auth0", &self.auth0)
            .field("claim_namespace", &self.claim_namespace)
            .field("pool", &self.pool)
            .field("procedures", &self.procedures)
            .field("bootstrap_sql", &self.bootstrap_sql)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

impl Config {
    #[must_use]
    pub const fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Auth0 verifier settings, when Auth0 is configured.
    #[must_use]
    pub fn auth0_config(&self) -> Option<Auth0Config> {
        self.auth0.as_ref().map(|settings| {
            let mut config = Auth0Config::new(settings.domain.clone(), String::new());
            config.audience.clone_from(&settings.audience);
            config.insecure_relaxed_audience = settings.insecure_relaxed_audience;
            config
        })
    }
}

/// Process signing key, as 64-char hex strings.
#[derive(Clone)]
pub struct SigningConfig {
    pub private_key_hex: Zeroizing<String>,
    pub public_key_hex: String,
    pub kid: String,
    /// Upper bound on internal credential lifetime.
    pub max_token_ttl: Option<Duration>,
}

impl fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningConfig")
            .field("private_key_hex", &"<redacted>")
            .field("public_key_hex", &self.public_key_hex)
            .field("kid", &self.kid)
            .field("max_token_ttl", &self.max_token_ttl)
            .finish()
    }
}

/// Auth0 tenant settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth0Settings {
    pub domain: String,
    pub audience: Vec<String>,
    pub insecure_relaxed_audience: bool,
}

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Configuration builder with fluent API
pub struct ConfigBuilder {
    admin_url: Option<Url>,
    authenticated_url: Option<Url>,
    tls: TlsOptions,
    private_key_hex: Option<Zeroizing<String>>,
    public_key_hex: Option<String>,
    signer_kid: Option<String>,
    max_token_ttl: Option<Duration>,
    provider: Provider,
    auth0_domain: Option<String>,
    auth0_audience: Vec<String>,
    insecure_relaxed_audience: bool,
    claim_namespace: Option<String>,
    pool: PoolConfig,
    procedures: Option<SessionProcedures>,
    bootstrap_sql: Option<PathBuf>,
    telemetry: Option<TelemetryConfig>,
}

impl fmt::Debug for ConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigBuilder")
            .field("admin_url", &self.admin_url.as_ref().map(redact_url))
            .field(
                "authenticated_url",
                &self.authenticated_url.as_ref().map(redact_url),
            )
            .field("private_key_hex", &self.private_key_hex.as_ref().map(|_| "<redacted>"))
            .field("public_key_hex", &self.public_key_hex)
            .field("provider", &self.provider)
            .field("auth0_domain", &self.auth0_domain)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl ConfigBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            admin_url: None,
            authenticated_url: None,
            tls: TlsOptions::new(),
            private_key_hex: None,
            public_key_hex: None,
            signer_kid: None,
            max_token_ttl: None,
            provider: Provider::Auth0,
            auth0_domain: None,
            auth0_audience: Vec::new(),
            insecure_relaxed_audience: false,
            claim_namespace: None,
            pool: PoolConfig {
                max_size: 20,
                idle_timeout: Duration::from_secs(30),
                connect_timeout: Duration::from_secs(10),
                wait_timeout: Duration::from_secs(10),
            },
            procedures: None,
            bootstrap_sql: None,
            telemetry: None,
        }
    }

    #[must_use]
    pub fn admin_url(mut self, url: Url) -> Self {
        self.admin_url = Some(url);
        self
    }

    #[must_use]
    pub fn authenticated_url(mut self, url: Url) -> Self {
        self.authenticated_url = Some(url);
        self
    }

    /// Refuse plaintext database connections.
    #[must_use]
    pub const fn db_tls_require(mut self, require: bool) -> Self {
        self.tls.require = require;
        self
    }

    /// Check database server certificates. On by default.
    #[must_use]
    pub const fn db_tls_verify(mut self, verify: bool) -> Self {
        self.tls.verify_certificate = verify;
        self
    }

    /// Trust the PEM certificates in `path` in addition to the web PKI roots.
    #[must_use]
    pub fn db_tls_ca_file(mut self, path: PathBuf) -> Self {
        self.tls.ca_file = Some(path);
        self
    }

    #[must_use]
    pub fn signing_key_hex(mut self, hex: impl Into<String>) -> Self {
        self.private_key_hex = Some(Zeroizing::new(hex.into()));
        self
    }

    #[must_use]
    pub fn public_key_hex(mut self, hex: impl Into<String>) -> Self {
        self.public_key_hex = Some(hex.into());
        self
    }

    #[must_use]
    pub fn signer_kid(mut self, kid: impl Into<String>) -> Self {
        self.signer_kid = Some(kid.into());
        self
    }

    #[must_use]
    pub const fn max_token_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.max_token_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn auth0_domain(mut self, domain: impl Into<String>) -> Self {
        self.auth0_domain = Some(domain.into());
        self
    }

    /// Replace the accepted audiences.
    #[must_use]
    pub fn auth0_audience(mut self, audience: Vec<String>) -> Self {
        self.auth0_audience = audience;
        self
    }

    #[must_use]
    pub const fn insecure_relaxed_audience(mut self, relaxed: bool) -> Self {
        self.insecure_relaxed_audience = relaxed;
        self
    }

    #[must_use]
    pub fn claim_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.claim_namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub const fn pool_max_size(mut self, size: usize) -> Self {
        self.pool.max_size = size;
        self
    }

    #[must_use]
    pub const fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn pool_connect_timeout(mut self, timeout: Duration) -> Self {
        self.pool.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool.wait_timeout = timeout;
        self
    }

    #[must_use]
    pub fn procedures(mut self, procedures: SessionProcedures) -> Self {
        self.procedures = Some(procedures);
        self
    }

    #[must_use]
    pub fn bootstrap_sql(mut self, path: PathBuf) -> Self {
        self.bootstrap_sql = Some(path);
        self
    }

    #[must_use]
    pub fn telemetry(mut self, config: TelemetryConfig) -> Self {
        self.telemetry = Some(config);
        self
    }

    #[must_use]
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.telemetry.get_or_insert_with(TelemetryConfig::default).log_level = level.into();
        self
    }

    #[must_use]
    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.telemetry.get_or_insert_with(TelemetryConfig::default).json_logs = enabled;
        self
    }

    /// Build configuration
    ///
    /// # Errors
    ///
    /// Returns error if a required setting is missing or invalid.
    pub fn build(self) -> Result<Config, Error> {
        let admin_url = self
            .admin_url
            .ok_or_else(|| Error::Config("admin database URL is required".into()))?;
        let authenticated_url = self
            .authenticated_url
            .ok_or_else(|| Error::Config("authenticated database URL is required".into()))?;
        check_postgres_url(&admin_url)?;
        check_postgres_url(&authenticated_url)?;

        let private_key_hex = self
            .private_key_hex
            .ok_or_else(|| Error::Config("signing key is required".into()))?;
        let public_key_hex = self
            .public_key_hex
            .ok_or_else(|| Error::Config("public key is required".into()))?;

        if self.pool.max_size == 0 {
            return Err(Error::Config("pool max size must be positive".into()));
        }
        if self.max_token_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::Config("token max TTL must be positive".into()));
        }

        let auth0 = match (self.auth0_domain, self.provider) {
            (Some(domain), _) => {
                if self.auth0_audience.is_empty() && !self.insecure_relaxed_audience {
                    return Err(Error::Config(
                        "Auth0 audience is required unless insecure_relaxed_audience is set"
                            .into(),
                    ));
                }
                Some(Auth0Settings {
                    domain,
                    audience: self.auth0_audience,
                    insecure_relaxed_audience: self.insecure_relaxed_audience,
                })
            }
            (None, Provider::Auth0) => {
                return Err(Error::Config(
                    "Auth0 domain is required when the provider is auth0".into(),
                ));
            }
            (None, _) => None,
        };

        if !self.tls.verify_certificate {
            tracing::warn!("Database TLS certificate verification disabled by configuration");
        }

        Ok(Config {
            admin_url,
            authenticated_url,
            tls: self.tls,
            signing: SigningConfig {
                private_key_hex,
                public_key_hex,
                kid: self
                    .signer_kid
                    .unwrap_or_else(|| DEFAULT_SIGNER_KID.to_string()),
                max_token_ttl: self.max_token_ttl,
            },
            provider: self.provider,
            auth0,
            claim_namespace: self
                .claim_namespace
                .unwrap_or_else(|| DEFAULT_CLAIM_NAMESPACE.to_string()),
            pool: self.pool,
            procedures: self.procedures.unwrap_or_default(),
            bootstrap_sql: self.bootstrap_sql,
            telemetry: self.telemetry.unwrap_or_default(),
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn check_postgres_url(url: &Url) -> Result<(), Error> {
    match url.scheme() {
        "postgres" | "postgresql" => Ok(()),
        other => Err(Error::Config(format!(
            "unsupported database URL scheme '{other}'"
        ))),
    }
}

/// URL with the password masked.
pub fn redact_url(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("***"));
    }
    shown.to_string()
}
