//! Environment variable loading for configuration

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use super::builder::ConfigBuilder;
use crate::Result;
use crate::auth::Provider;

/// Environment variable names
mod vars {
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const DATABASE_AUTHENTICATED_URL: &str = "DATABASE_AUTHENTICATED_URL";
    pub const DATABASE_SSL_ROOT_CERT: &str = "DATABASE_SSL_ROOT_CERT";
    pub const BROKER_DB_REQUIRE_TLS: &str = "BROKER_DB_REQUIRE_TLS";
    pub const BROKER_DB_TLS_VERIFY: &str = "BROKER_DB_TLS_VERIFY";
    pub const ED25519_SIGNING_KEY: &str = "ED25519_SIGNING_KEY";
    pub const ED25519_PUBLIC_KEY: &str = "ED25519_PUBLIC_KEY";
    pub const AUTH_PROVIDER: &str = "AUTH_PROVIDER";
    pub const AUTH0_DOMAIN: &str = "AUTH0_DOMAIN";
    pub const AUTH0_AUDIENCE: &str = "AUTH0_AUDIENCE";
    pub const BROKER_CLAIM_NAMESPACE: &str = "BROKER_CLAIM_NAMESPACE";
    pub const BROKER_POOL_MAX_SIZE: &str = "BROKER_POOL_MAX_SIZE";
    pub const BROKER_POOL_IDLE_TIMEOUT_SECS: &str = "BROKER_POOL_IDLE_TIMEOUT_SECS";
    pub const BROKER_POOL_CONNECT_TIMEOUT_SECS: &str = "BROKER_POOL_CONNECT_TIMEOUT_SECS";
    pub const BROKER_POOL_WAIT_TIMEOUT_SECS: &str = "BROKER_POOL_WAIT_TIMEOUT_SECS";
    pub const BROKER_TOKEN_MAX_TTL_SECS: &str = "BROKER_TOKEN_MAX_TTL_SECS";
    pub const BROKER_INSECURE_RELAXED_AUDIENCE: &str = "BROKER_INSECURE_RELAXED_AUDIENCE";
    pub const RUST_LOG: &str = "RUST_LOG";
    pub const BROKER_JSON_LOGS: &str = "BROKER_JSON_LOGS";
}

/// Load configuration from environment variables
pub fn load_from_env(mut builder: ConfigBuilder) -> Result<ConfigBuilder> {
    if let Ok(url_str) = env::var(vars::DATABASE_URL) {
        builder = builder.admin_url(parse_url(vars::DATABASE_URL, &url_str)?);
    }
    if let Ok(url_str) = env::var(vars::DATABASE_AUTHENTICATED_URL) {
        builder = builder.authenticated_url(parse_url(vars::DATABASE_AUTHENTICATED_URL, &url_str)?);
    }
    if let Ok(path) = env::var(vars::DATABASE_SSL_ROOT_CERT) {
        builder = builder.db_tls_ca_file(PathBuf::from(path));
    }
    if let Ok(val) = env::var(vars::BROKER_DB_REQUIRE_TLS) {
        builder = builder.db_tls_require(parse_bool(&val));
    }
    if let Ok(val) = env::var(vars::BROKER_DB_TLS_VERIFY) {
        builder = builder.db_tls_verify(parse_bool(&val));
    }

    if let Ok(key) = env::var(vars::ED25519_SIGNING_KEY) {
        builder = builder.signing_key_hex(key);
    }
    if let Ok(key) = env::var(vars::ED25519_PUBLIC_KEY) {
        builder = builder.public_key_hex(key);
    }

    if let Ok(provider) = env::var(vars::AUTH_PROVIDER) {
        let provider: Provider = provider.parse().map_err(|e| {
            crate::Error::Config(format!("Invalid {}: {e}", vars::AUTH_PROVIDER))
        })?;
        builder = builder.provider(provider);
    }

    if let Ok(domain) = env::var(vars::AUTH0_DOMAIN) {
        builder = builder.auth0_domain(domain);
    }
    // Comma-separated for multiple audiences
    if let Ok(audience) = env::var(vars::AUTH0_AUDIENCE) {
        builder = builder.auth0_audience(split_list(&audience));
    }
    if let Ok(val) = env::var(vars::BROKER_INSECURE_RELAXED_AUDIENCE) {
        builder = builder.insecure_relaxed_audience(parse_bool(&val));
    }

    if let Ok(namespace) = env::var(vars::BROKER_CLAIM_NAMESPACE) {
        builder = builder.claim_namespace(namespace);
    }

    if let Ok(size_str) = env::var(vars::BROKER_POOL_MAX_SIZE)
        && let Ok(size) = size_str.parse::<usize>()
    {
        builder = builder.pool_max_size(size);
    }
    if let Some(timeout) = parse_secs(vars::BROKER_POOL_IDLE_TIMEOUT_SECS) {
        builder = builder.pool_idle_timeout(timeout);
    }
    if let Some(timeout) = parse_secs(vars::BROKER_POOL_CONNECT_TIMEOUT_SECS) {
        builder = builder.pool_connect_timeout(timeout);
    }
    if let Some(timeout) = parse_secs(vars::BROKER_POOL_WAIT_TIMEOUT_SECS) {
        builder = builder.pool_wait_timeout(timeout);
    }
    if let Some(ttl) = parse_secs(vars::BROKER_TOKEN_MAX_TTL_SECS) {
        builder = builder.max_token_ttl(Some(ttl));
    }

    if let Ok(level) = env::var(vars::RUST_LOG) {
        builder = builder.log_level(level);
    }
    if let Ok(val) = env::var(vars::BROKER_JSON_LOGS) {
        builder = builder.json_logs(parse_bool(&val));
    }

    Ok(builder)
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    Url::parse(value).map_err(|e| crate::Error::Config(format!("Invalid {name}: {e}")))
}

fn parse_secs(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        vars::DATABASE_URL,
        vars::DATABASE_AUTHENTICATED_URL,
        vars::DATABASE_SSL_ROOT_CERT,
        vars::BROKER_DB_REQUIRE_TLS,
        vars::BROKER_DB_TLS_VERIFY,
        vars::ED25519_SIGNING_KEY,
        vars::ED25519_PUBLIC_KEY,
        vars::AUTH_PROVIDER,
        vars::AUTH0_DOMAIN,
        vars::AUTH0_AUDIENCE,
        vars::BROKER_CLAIM_NAMESPACE,
        vars::BROKER_POOL_MAX_SIZE,
        vars::BROKER_POOL_IDLE_TIMEOUT_SECS,
        vars::BROKER_POOL_CONNECT_TIMEOUT_SECS,
        vars::BROKER_POOL_WAIT_TIMEOUT_SECS,
        vars::BROKER_TOKEN_MAX_TTL_SECS,
        vars::BROKER_INSECURE_RELAXED_AUDIENCE,
        vars::RUST_LOG,
        vars::BROKER_JSON_LOGS,
    ];

    /// Run `f` with exactly `vars` set among the broker's variables.
    fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_MUTEX.lock().unwrap();

        let old_values: Vec<_> = ALL_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();

        for key in ALL_VARS {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::remove_var(key) };
        }
        for (key, value) in vars {
            // SAFETY: We hold a mutex lock to ensure no concurrent modifications
            unsafe { env::set_var(key, value) };
        }

        let result = f();

        for (key, old_value) in old_values {
            match old_value {
                // SAFETY: We hold a mutex lock to ensure no concurrent modifications
                Some(v) => unsafe { env::set_var(key, v) },
                None => unsafe { env::remove_var(key) },
            }
        }

        result
    }

    fn required() -> Vec<(&'static str, String)> {
        vec![
            (vars::DATABASE_URL, "postgres://admin:pw@localhost/app".into()),
            (
                vars::DATABASE_AUTHENTICATED_URL,
                "postgres://authenticated:pw@localhost/app".into(),
            ),
            (vars::ED25519_SIGNING_KEY, "aa".repeat(32)),
            (vars::ED25519_PUBLIC_KEY, "bb".repeat(32)),
            (vars::AUTH0_DOMAIN, "tenant.example.com".into()),
            (vars::AUTH0_AUDIENCE, "https://api.example.com".into()),
        ]
    }

    fn as_refs<'a>(owned: &'a [(&'static str, String)]) -> Vec<(&'static str, &'a str)> {
        owned.iter().map(|(k, v)| (*k, v.as_str())).collect()
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("1"));
        assert!(parse_bool("yes"));
        assert!(parse_bool("on"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("a, b,,c "), vec!["a", "b", "c"]);
        assert!(split_list(" , ").is_empty());
    }

    #[test]
    fn test_load_required_from_env() {
        let owned = required();
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert_eq!(config.admin_url.username(), "admin");
            assert_eq!(config.authenticated_url.username(), "authenticated");
            assert_eq!(config.signing.public_key_hex, "bb".repeat(32));
            assert_eq!(config.provider, Provider::Auth0);
            let auth0 = config.auth0.unwrap();
            assert_eq!(auth0.domain, "tenant.example.com");
            assert_eq!(auth0.audience, vec!["https://api.example.com".to_string()]);
            assert!(!auth0.insecure_relaxed_audience);
        });
    }

    #[test]
    fn test_pool_and_ttl_overrides() {
        let mut owned = required();
        owned.extend([
            (vars::BROKER_POOL_MAX_SIZE, "4".to_string()),
            (vars::BROKER_POOL_IDLE_TIMEOUT_SECS, "5".to_string()),
            (vars::BROKER_POOL_CONNECT_TIMEOUT_SECS, "2".to_string()),
            (vars::BROKER_POOL_WAIT_TIMEOUT_SECS, "1".to_string()),
            (vars::BROKER_TOKEN_MAX_TTL_SECS, "600".to_string()),
            (vars::BROKER_CLAIM_NAMESPACE, "https://example.org".to_string()),
        ]);
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert_eq!(config.pool.max_size, 4);
            assert_eq!(config.pool.idle_timeout, Duration::from_secs(5));
            assert_eq!(config.pool.connect_timeout, Duration::from_secs(2));
            assert_eq!(config.pool.wait_timeout, Duration::from_secs(1));
            assert_eq!(config.signing.max_token_ttl, Some(Duration::from_secs(600)));
            assert_eq!(config.claim_namespace, "https://example.org");
        });
    }

    #[test]
    fn test_unparseable_numbers_are_ignored() {
        let mut owned = required();
        owned.push((vars::BROKER_POOL_MAX_SIZE, "many".to_string()));
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert_eq!(config.pool.max_size, 20);
        });
    }

    #[test]
    fn test_multiple_audiences_and_relaxed_flag() {
        let mut owned = required();
        owned.push((vars::AUTH0_AUDIENCE, "aud-1, aud-2".to_string()));
        owned.push((vars::BROKER_INSECURE_RELAXED_AUDIENCE, "true".to_string()));
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            let auth0 = config.auth0.unwrap();
            assert_eq!(auth0.audience, vec!["aud-1".to_string(), "aud-2".to_string()]);
            assert!(auth0.insecure_relaxed_audience);
        });
    }

    #[test]
    fn test_database_tls_from_env() {
        let mut owned = required();
        owned.push((vars::DATABASE_SSL_ROOT_CERT, "/etc/ssl/db-ca.pem".to_string()));
        owned.push((vars::BROKER_DB_REQUIRE_TLS, "true".to_string()));
        owned.push((vars::BROKER_DB_TLS_VERIFY, "false".to_string()));
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert!(config.tls.require);
            assert!(!config.tls.verify_certificate);
            assert_eq!(config.tls.ca_file, Some(PathBuf::from("/etc/ssl/db-ca.pem")));
        });
    }

    #[test]
    fn test_invalid_url_is_error() {
        with_env_vars(&[(vars::DATABASE_URL, "not a url")], || {
            let err = load_from_env(ConfigBuilder::new()).unwrap_err();
            assert!(err.to_string().contains("DATABASE_URL"));
        });
    }

    #[test]
    fn test_provider_from_env() {
        with_env_vars(&[(vars::AUTH_PROVIDER, "aws_cognito")], || {
            let builder = load_from_env(ConfigBuilder::new()).unwrap();
            let debug = format!("{builder:?}");
            assert!(debug.contains("AwsCognito"));
        });

        with_env_vars(&[(vars::AUTH_PROVIDER, "okta")], || {
            let err = load_from_env(ConfigBuilder::new()).unwrap_err();
            assert!(err.to_string().contains("AUTH_PROVIDER"));
        });
    }

    #[test]
    fn test_telemetry_from_env() {
        let mut owned = required();
        owned.push((vars::RUST_LOG, "rls_broker=debug".to_string()));
        owned.push((vars::BROKER_JSON_LOGS, "1".to_string()));
        with_env_vars(&as_refs(&owned), || {
            let config = load_from_env(ConfigBuilder::new()).unwrap().build().unwrap();
            assert_eq!(config.telemetry.log_level, "rls_broker=debug");
            assert!(config.telemetry.json_logs);
        });
    }

    #[test]
    fn test_empty_env_leaves_builder_untouched() {
        with_env_vars(&[], || {
            let err = load_from_env(ConfigBuilder::new())
                .unwrap()
                .build()
                .unwrap_err();
            assert!(err.is_config());
        });
    }
}
