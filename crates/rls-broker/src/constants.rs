//! Protocol constants

/// Round-trip query validating a connection
pub const HEALTH_CHECK_QUERY: &str = "SELECT 1";

pub const BEGIN: &str = "BEGIN";
pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

/// Resets per-transaction session state
pub const DEFAULT_INIT_SQL: &str = "SELECT auth.init()";

/// Verifies the signed credential and exposes its claims to row policies
pub const DEFAULT_INSTALL_SQL: &str = "SELECT auth.jwt_session_init($1)";

/// Key id placed in internal credential headers
pub const DEFAULT_SIGNER_KID: &str = "db-token-signer-1";

/// Namespace for provider-set tenant and role claims
pub const DEFAULT_CLAIM_NAMESPACE: &str = "https://nucleus-platform.com";
