//! TOML configuration file loading

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use super::builder::ConfigBuilder;
use crate::Result;
use crate::auth::Provider;
use crate::db::SessionProcedures;

/// Configuration file locations checked in order
const CONFIG_PATHS: &[&str] = &[
    "./rls-broker.toml",
    "~/.config/rls-broker/config.toml",
    "/etc/rls-broker/config.toml",
];

/// Find the first existing configuration file
pub fn find_config_file() -> Option<PathBuf> {
    for path_str in CONFIG_PATHS {
        let path = if path_str.starts_with('~') {
            if let Ok(home) = std::env::var("HOME") {
                PathBuf::from(path_str.replacen('~', &home, 1))
            } else {
                continue;
            }
        } else {
            PathBuf::from(path_str)
        };

        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path, builder: ConfigBuilder) -> Result<ConfigBuilder> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;

    let file_config: FileConfig = toml::from_str(&content).map_err(|e| {
        crate::Error::Config(format!(
            "Failed to parse config file {}: {}",
            path.display(),
            e
        ))
    })?;

    apply_file_config(builder, file_config, path.parent())
}

fn apply_file_config(
    mut builder: ConfigBuilder,
    config: FileConfig,
    base_dir: Option<&Path>,
) -> Result<ConfigBuilder> {
    if let Some(db) = config.database {
        if let Some(url_str) = db.admin_url {
            builder = builder.admin_url(parse_url("admin_url", &url_str)?);
        }
        if let Some(url_str) = db.authenticated_url {
            builder = builder.authenticated_url(parse_url("authenticated_url", &url_str)?);
        }
        // Relative to the file that names it
        if let Some(path) = db.bootstrap_sql {
            builder = builder.bootstrap_sql(resolve(base_dir, path));
        }
        if let Some(tls) = db.tls {
            if let Some(require) = tls.require {
                builder = builder.db_tls_require(require);
            }
            if let Some(verify) = tls.verify_certificate {
                builder = builder.db_tls_verify(verify);
            }
            if let Some(path) = tls.ca_file {
                builder = builder.db_tls_ca_file(resolve(base_dir, path));
            }
        }
    }

    if let Some(pool) = config.pool {
        if let Some(size) = pool.max_size {
            builder = builder.pool_max_size(size);
        }
        if let Some(secs) = pool.idle_timeout_secs {
            builder = builder.pool_idle_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = pool.connect_timeout_secs {
            builder = builder.pool_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = pool.wait_timeout_secs {
            builder = builder.pool_wait_timeout(Duration::from_secs(secs));
        }
    }

    if let Some(signing) = config.signing {
        if let Some(key) = signing.private_key {
            builder = builder.signing_key_hex(key);
        }
        if let Some(key) = signing.public_key {
            builder = builder.public_key_hex(key);
        }
        if let Some(kid) = signing.kid {
            builder = builder.signer_kid(kid);
        }
        if let Some(secs) = signing.max_token_ttl_secs {
            builder = builder.max_token_ttl(Some(Duration::from_secs(secs)));
        }
    }

    if let Some(auth) = config.auth {
        if let Some(provider) = auth.provider {
            let provider: Provider = provider
                .parse()
                .map_err(|e| crate::Error::Config(format!("Invalid auth.provider: {e}")))?;
            builder = builder.provider(provider);
        }
        if let Some(namespace) = auth.claim_namespace {
            builder = builder.claim_namespace(namespace);
        }
        if let Some(auth0) = auth.auth0 {
            if let Some(domain) = auth0.domain {
                builder = builder.auth0_domain(domain);
            }
            if let Some(audience) = auth0.audience {
                builder = builder.auth0_audience(audience.into_vec());
            }
            if let Some(relaxed) = auth0.insecure_relaxed_audience {
                builder = builder.insecure_relaxed_audience(relaxed);
            }
        }
    }

    if let Some(session) = config.session {
        let defaults = SessionProcedures::default();
        builder = builder.procedures(SessionProcedures {
            init: session.init_sql.unwrap_or(defaults.init),
            install: session.install_sql.unwrap_or(defaults.install),
        });
    }

    if let Some(obs) = config.observability {
        if let Some(level) = obs.log_level {
            builder = builder.log_level(level);
        }
        if let Some(json) = obs.json_logs {
            builder = builder.json_logs(json);
        }
    }

    Ok(builder)
}

fn resolve(base_dir: Option<&Path>, path: PathBuf) -> PathBuf {
    match base_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path,
    }
}

fn parse_url(field: &str, value: &str) -> Result<Url> {
    Url::parse(value)
        .map_err(|e| crate::Error::Config(format!("Invalid database.{field}: {e}")))
}

/// Root configuration file structure
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    database: Option<DatabaseConfig>,
    pool: Option<PoolFileConfig>,
    signing: Option<SigningFileConfig>,
    auth: Option<AuthConfig>,
    session: Option<SessionConfig>,
    observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    admin_url: Option<String>,
    authenticated_url: Option<String>,
    bootstrap_sql: Option<PathBuf>,
    tls: Option<DatabaseTlsConfig>,
}

#[derive(Debug, Deserialize)]
struct DatabaseTlsConfig {
    require: Option<bool>,
    verify_certificate: Option<bool>,
    ca_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PoolFileConfig {
    max_size: Option<usize>,
    idle_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SigningFileConfig {
    private_key: Option<String>,
    public_key: Option<String>,
    kid: Option<String>,
    max_token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AuthConfig {
    provider: Option<String>,
    claim_namespace: Option<String>,
    auth0: Option<Auth0FileConfig>,
}

#[derive(Debug, Deserialize)]
struct Auth0FileConfig {
    domain: Option<String>,
    audience: Option<Audience>,
    insecure_relaxed_audience: Option<bool>,
}

/// `audience = "x"` or `audience = ["x", "y"]`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(aud) => vec![aud],
            Self::Many(auds) => auds,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SessionConfig {
    init_sql: Option<String>,
    install_sql: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: Option<String>,
    json_logs: Option<bool>,
}
