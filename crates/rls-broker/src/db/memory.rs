//! In-memory row-security database
//!
//! Behaves like a database with row-level security enabled on a single
//! `records` table: the install procedure verifies the internal credential
//! against the published JWK, and every row operation is scoped to the
//! tenant of the installed credential. Rows written inside a transaction
//! become visible to other sessions only on commit.
//!
//! Used by the test suite and benches; not a storage engine.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use parking_lot::Mutex;

use super::SessionProcedures;
use super::connection::{Connector, DbError, SessionConnection};
use crate::auth::{InternalClaims, PublicJwk};
use crate::constants::{BEGIN, COMMIT, HEALTH_CHECK_QUERY, ROLLBACK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub tenant_id: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct Store {
    rows: Vec<Row>,
    open_transactions: usize,
    commits: usize,
    rollbacks: usize,
    executed: Vec<String>,
    failing: HashSet<String>,
    unreachable: bool,
}

struct Shared {
    store: Mutex<Store>,
    key: DecodingKey,
    procedures: SessionProcedures,
    connections: AtomicUsize,
}

/// Handle to one simulated database; clones share state.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("procedures", &self.shared.procedures)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    /// Database trusting credentials signed by the key behind `jwk`.
    pub fn new(jwk: &PublicJwk) -> Result<Self, DbError> {
        let key = jwk
            .decoding_key()
            .map_err(|e| DbError::Connect(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                key,
                procedures: SessionProcedures::default(),
                connections: AtomicUsize::new(0),
            }),
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        let keys = crate::auth::test_keys::key_material();
        Self::new(keys.jwk()).unwrap()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector { db: self.clone() }
    }

    /// Make every subsequent execution of `sql` fail.
    pub fn fail_on(&self, sql: &str) {
        self.shared.store.lock().failing.insert(sql.to_string());
    }

    pub fn clear_failures(&self) {
        self.shared.store.lock().failing.clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.store.lock().unreachable = unreachable;
    }

    pub fn open_transactions(&self) -> usize {
        self.shared.store.lock().open_transactions
    }

    pub fn commits(&self) -> usize {
        self.shared.store.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.shared.store.lock().rollbacks
    }

    pub fn connections_opened(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Committed rows of one tenant, bypassing row security.
    pub fn committed_rows(&self, tenant_id: &str) -> Vec<String> {
        self.shared
            .store
            .lock()
            .rows
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.payload.clone())
            .collect()
    }

    /// Statements run outside the session protocol, such as bootstrap SQL.
    pub fn executed(&self) -> Vec<String> {
        self.shared.store.lock().executed.clone()
    }

    fn check_failure(&self, sql: &str) -> Result<(), DbError> {
        if self.shared.store.lock().failing.contains(sql) {
            return Err(DbError::Statement(format!("injected failure: {sql}")));
        }
        Ok(())
    }

    fn verify(&self, token: &str) -> Result<InternalClaims, DbError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.leeway = 0;
        decode::<InternalClaims>(token, &self.shared.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| DbError::Statement(format!("invalid session token: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    db: MemoryDatabase,
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, DbError> {
        if self.db.shared.store.lock().unreachable {
            return Err(DbError::Connect("connection refused".into()));
        }
        self.db.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            db: self.db.clone(),
            tx: None,
            closed: false,
        })
    }
}

#[derive(Debug, Default)]
struct Transaction {
    initialized: bool,
    identity: Option<InternalClaims>,
    pending: Vec<Row>,
}

#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    tx: Option<Transaction>,
    closed: bool,
}

impl MemoryConnection {
    pub const fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// Tenant of the identity installed in the current transaction.
    pub fn current_tenant(&self) -> Option<&str> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.identity.as_ref())
            .map(|claims| claims.tenant_id.as_str())
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Insert a row owned by the session's tenant.
    pub async fn insert(&mut self, payload: &str) -> Result<(), DbError> {
        self.round_trip().await;
        let tenant_id = self.require_identity()?.tenant_id.clone();
        if let Some(tx) = self.tx.as_mut() {
            tx.pending.push(Row {
                tenant_id,
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    /// Rows visible to the session's tenant, own uncommitted writes included.
    pub async fn select_visible(&self) -> Result<Vec<String>, DbError> {
        self.round_trip().await;
        let tenant_id = self.require_identity()?.tenant_id.clone();
        let mut rows: Vec<String> = self
            .db
            .shared
            .store
            .lock()
            .rows
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.payload.clone())
            .collect();
        if let Some(tx) = &self.tx {
            rows.extend(tx.pending.iter().map(|r| r.payload.clone()));
        }
        Ok(rows)
    }

    /// Yield to the scheduler, standing in for a network round trip.
    pub async fn round_trip(&self) {
        tokio::task::yield_now().await;
    }

    fn require_identity(&self) -> Result<&InternalClaims, DbError> {
        self.tx
            .as_ref()
            .and_then(|tx| tx.identity.as_ref())
            .ok_or_else(|| DbError::Statement("permission denied: no session identity".into()))
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Closed);
        }
        Ok(())
    }

    fn end_transaction(&mut self, commit: bool) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let mut store = self.db.shared.store.lock();
        store.open_transactions = store.open_transactions.saturating_sub(1);
        if commit {
            store.rows.extend(tx.pending);
            store.commits += 1;
        } else {
            store.rollbacks += 1;
        }
    }
}

#[async_trait]
impl SessionConnection for MemoryConnection {
    async fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        self.db.check_failure(sql)?;

        let procedures = &self.db.shared.procedures;
        if sql == BEGIN {
            if self.tx.is_some() {
                return Err(DbError::Statement("transaction already open".into()));
            }
            self.tx = Some(Transaction::default());
            self.db.shared.store.lock().open_transactions += 1;
        } else if sql == COMMIT {
            self.end_transaction(true);
        } else if sql == ROLLBACK {
            self.end_transaction(false);
        } else if sql == procedures.init {
            let tx = self
                .tx
                .as_mut()
                .ok_or_else(|| DbError::Statement("init outside transaction".into()))?;
            tx.initialized = true;
            tx.identity = None;
        } else if sql != HEALTH_CHECK_QUERY {
            self.db.shared.store.lock().executed.push(sql.to_string());
        }
        Ok(())
    }

    async fn call(&mut self, sql: &str, arg: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        self.db.check_failure(sql)?;

        if sql != self.db.shared.procedures.install {
            return Err(DbError::Statement(format!("unknown procedure: {sql}")));
        }
        let claims = self.db.verify(arg)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| DbError::Statement("install outside transaction".into()))?;
        if !tx.initialized {
            return Err(DbError::Statement("session not initialized".into()));
        }
        tx.identity = Some(claims);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::test_keys::key_material;
    use crate::auth::{InternalTokenSigner, KeyMaterial, SignRequest};

    fn token_for(keys: KeyMaterial, tenant: &str) -> String {
        let signer = InternalTokenSigner::new(Arc::new(keys), "db-token-signer-1");
        let token = signer
            .sign(SignRequest {
                subject: "user-1".into(),
                tenant_id: tenant.into(),
                role: "member".into(),
                not_before: None,
                expiry: jsonwebtoken::get_current_timestamp() as i64 + 600,
                token_id: None,
            })
            .unwrap();
        token.as_str().to_string()
    }

    async fn session(db: &MemoryDatabase, token: &str) -> MemoryConnection {
        let procedures = SessionProcedures::default();
        let mut conn = db.connector().connect().await.unwrap();
        conn.batch_execute(BEGIN).await.unwrap();
        conn.batch_execute(&procedures.init).await.unwrap();
        conn.call(&procedures.install, token).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_rows_require_identity() {
        let db = MemoryDatabase::for_tests();
        let mut conn = db.connector().connect().await.unwrap();
        conn.batch_execute(BEGIN).await.unwrap();

        assert!(conn.insert("x").await.is_err());
        assert!(conn.select_visible().await.is_err());
    }

    #[tokio::test]
    async fn test_commit_publishes_rows_to_tenant_only() {
        let db = MemoryDatabase::for_tests();
        let mut a = session(&db, &token_for(key_material(), "t-a")).await;
        a.insert("a-1").await.unwrap();
        assert_eq!(a.current_tenant(), Some("t-a"));
        a.batch_execute(COMMIT).await.unwrap();

        let b = session(&db, &token_for(key_material(), "t-b")).await;
        assert!(b.select_visible().await.unwrap().is_empty());
        assert_eq!(db.committed_rows("t-a"), vec!["a-1"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let db = MemoryDatabase::for_tests();
        let mut conn = session(&db, &token_for(key_material(), "t-a")).await;
        conn.insert("gone").await.unwrap();
        conn.batch_execute(ROLLBACK).await.unwrap();

        assert!(db.committed_rows("t-a").is_empty());
        assert_eq!(db.open_transactions(), 0);
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_install_rejects_foreign_signature() {
        let db = MemoryDatabase::for_tests();
        let procedures = SessionProcedures::default();
        let forged = token_for(KeyMaterial::from_seed(&[1u8; 32]).unwrap(), "t-a");

        let mut conn = db.connector().connect().await.unwrap();
        conn.batch_execute(BEGIN).await.unwrap();
        conn.batch_execute(&procedures.init).await.unwrap();
        assert!(conn.call(&procedures.install, &forged).await.is_err());
        assert_eq!(conn.current_tenant(), None);
    }

    #[tokio::test]
    async fn test_install_requires_init() {
        let db = MemoryDatabase::for_tests();
        let procedures = SessionProcedures::default();
        let mut conn = db.connector().connect().await.unwrap();
        conn.batch_execute(BEGIN).await.unwrap();

        let token = token_for(key_material(), "t-a");
        assert!(conn.call(&procedures.install, &token).await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let db = MemoryDatabase::for_tests();
        db.fail_on(COMMIT);
        let mut conn = db.connector().connect().await.unwrap();
        conn.batch_execute(BEGIN).await.unwrap();
        assert!(conn.batch_execute(COMMIT).await.is_err());

        db.clear_failures();
        conn.batch_execute(COMMIT).await.unwrap();
    }
}
