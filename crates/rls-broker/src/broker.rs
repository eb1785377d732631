//! Transaction-scoped identity sessions
//!
//! [`SessionBroker::with_secure_transaction`] runs caller work inside one
//! database transaction whose row visibility is governed by a freshly
//! installed credential:
//!
//! ```text
//! Idle -> ConnectionAcquired -> TransactionOpen -> IdentityInstalled
//!      -> WorkRunning -> Committed | RolledBack
//! ```
//!
//! The identity is resolved (verified, mapped, signed) before a connection
//! is taken from the pool. Every exit after `BEGIN` ends in `COMMIT` or
//! `ROLLBACK`, including errors and panics in caller work and explicit
//! cancellation. If the broker future itself is dropped, the pool rolls the
//! connection back before handing it out again.

use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    ClaimMapper, InternalClaims, InternalToken, InternalTokenSigner, Provider, SignRequest,
    VerifierRegistry,
};
use crate::constants::{BEGIN, COMMIT, ROLLBACK};
use crate::db::{
    Connector, PooledSession, SessionConnection, SessionPool, SessionProcedures, acquire,
};
use crate::error::{BoxError, Error, Result};

/// Who the transaction runs as.
pub enum Identity {
    /// Raw provider token; verified, mapped and re-signed by the broker.
    Bearer { token: String, provider: Provider },
    /// Credential minted earlier by [`SessionBroker::exchange`] or parsed
    /// with [`InternalToken::parse`].
    Internal(InternalToken),
}

impl Identity {
    pub fn bearer(token: impl Into<String>, provider: Provider) -> Self {
        Self::Bearer {
            token: token.into(),
            provider,
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer { provider, .. } => f
                .debug_struct("Bearer")
                .field("provider", provider)
                .field("token", &"<redacted>")
                .finish(),
            Self::Internal(token) => f.debug_tuple("Internal").field(token).finish(),
        }
    }
}

impl From<InternalToken> for Identity {
    fn from(token: InternalToken) -> Self {
        Self::Internal(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ConnectionAcquired,
    TransactionOpen,
    IdentityInstalled,
    WorkRunning,
    Committed,
    RolledBack,
}

/// Transaction step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Begin,
    Init,
    Install,
    Work,
    Commit,
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::Init => "init",
            Self::Install => "install",
            Self::Work => "work",
            Self::Commit => "commit",
        })
    }
}

/// Transaction-scoped handle given to caller work.
///
/// Derefs to the backend connection; the identity it runs as is fixed for
/// the lifetime of the scope.
pub struct SessionScope<C: Connector> {
    session: PooledSession<C>,
    claims: InternalClaims,
    state: SessionState,
}

impl<C: Connector> fmt::Debug for SessionScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionScope")
            .field("tenant_id", &self.claims.tenant_id)
            .field("role", &self.claims.role)
            .field("state", &self.state)
            .finish()
    }
}

impl<C: Connector> SessionScope<C> {
    pub fn tenant_id(&self) -> &str {
        &self.claims.tenant_id
    }

    pub fn role(&self) -> &str {
        &self.claims.role
    }

    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, state: SessionState) {
        tracing::debug!(
            from = ?self.state,
            to = ?state,
            tenant_id = %self.claims.tenant_id,
            "Session state"
        );
        self.state = state;
    }

    async fn exec(&mut self, sql: &str, stage: TxStage) -> Result<()> {
        self.session
            .batch_execute(sql)
            .await
            .map_err(|e| Error::transaction(stage, e))
    }

    async fn rollback(&mut self) {
        match self.session.batch_execute(ROLLBACK).await {
            Ok(()) => self.session.set_tx_open(false),
            // Left dirty: the pool retries on recycle and discards on failure.
            Err(e) => tracing::error!(error = %e, "Rollback failed"),
        }
        self.transition(SessionState::RolledBack);
    }
}

impl<C: Connector> Deref for SessionScope<C> {
    type Target = C::Connection;

    fn deref(&self) -> &C::Connection {
        &self.session
    }
}

impl<C: Connector> DerefMut for SessionScope<C> {
    fn deref_mut(&mut self) -> &mut C::Connection {
        &mut self.session
    }
}

/// Verifies, re-signs and runs work under tenant identities.
pub struct SessionBroker<C: Connector> {
    verifiers: VerifierRegistry,
    mapper: Arc<dyn ClaimMapper>,
    signer: InternalTokenSigner,
    pool: SessionPool<C>,
    procedures: SessionProcedures,
}

impl<C: Connector> fmt::Debug for SessionBroker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBroker")
            .field("verifiers", &self.verifiers)
            .field("mapper", &self.mapper)
            .field("signer_kid", &self.signer.kid())
            .field("pool", &self.pool.status())
            .field("procedures", &self.procedures)
            .finish()
    }
}

impl<C: Connector> SessionBroker<C> {
    pub fn new(
        verifiers: VerifierRegistry,
        mapper: Arc<dyn ClaimMapper>,
        signer: InternalTokenSigner,
        pool: SessionPool<C>,
    ) -> Self {
        Self {
            verifiers,
            mapper,
            signer,
            pool,
            procedures: SessionProcedures::default(),
        }
    }

    #[must_use]
    pub fn with_procedures(mut self, procedures: SessionProcedures) -> Self {
        self.procedures = procedures;
        self
    }

    pub const fn pool(&self) -> &SessionPool<C> {
        &self.pool
    }

    pub const fn signer(&self) -> &InternalTokenSigner {
        &self.signer
    }

    /// Verify a provider token, map its claims and mint an internal credential.
    pub async fn exchange(&self, token: &str, provider: Provider) -> Result<InternalToken> {
        let result = self.exchange_inner(token, provider).await;

        #[cfg(feature = "metrics")]
        crate::observability::record_exchange(
            provider,
            result.as_ref().err().map_or("ok", Error::tag),
        );
        if let Err(ref e) = result {
            tracing::warn!(provider = %provider, tag = e.tag(), "Token exchange failed");
        }
        result
    }

    async fn exchange_inner(&self, token: &str, provider: Provider) -> Result<InternalToken> {
        let external = self.verifiers.verify(token, provider).await?;
        let identity = self.mapper.map(&external)?;
        let request = SignRequest::from_external(&external, identity);
        Ok(self.signer.sign(request)?)
    }

    async fn resolve(&self, identity: Identity) -> Result<InternalToken> {
        match identity {
            Identity::Bearer { token, provider } => self.exchange(&token, provider).await,
            Identity::Internal(token) => Ok(token),
        }
    }

    /// Run `work` in one transaction under `identity`.
    ///
    /// Work errors roll the transaction back and surface as
    /// [`Error::TransactionFailed`] with stage [`TxStage::Work`]; the
    /// original error is available through [`Error::work_error`].
    pub async fn with_secure_transaction<T, E, F>(&self, identity: Identity, work: F) -> Result<T>
    where
        T: Send,
        E: Into<BoxError>,
        F: for<'s> FnOnce(&'s mut SessionScope<C>) -> BoxFuture<'s, std::result::Result<T, E>>
            + Send,
    {
        self.run(identity, std::future::pending(), work).await
    }

    /// As [`with_secure_transaction`](Self::with_secure_transaction), rolling
    /// back and returning [`Error::Cancelled`] once `cancel` fires.
    pub async fn with_secure_transaction_cancellable<T, E, F>(
        &self,
        identity: Identity,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T>
    where
        T: Send,
        E: Into<BoxError>,
        F: for<'s> FnOnce(&'s mut SessionScope<C>) -> BoxFuture<'s, std::result::Result<T, E>>
            + Send,
    {
        self.run(identity, cancel.cancelled(), work).await
    }

    async fn run<T, E, F, X>(&self, identity: Identity, cancelled: X, work: F) -> Result<T>
    where
        E: Into<BoxError>,
        F: for<'s> FnOnce(&'s mut SessionScope<C>) -> BoxFuture<'s, std::result::Result<T, E>>,
        X: Future<Output = ()>,
    {
        let started = Instant::now();
        let result = self.run_inner(identity, cancelled, work).await;

        #[cfg(feature = "metrics")]
        crate::observability::record_transaction(
            result.as_ref().err().map_or("committed", Error::tag),
            started.elapsed(),
        );
        match &result {
            Ok(_) => tracing::debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Secure transaction committed"
            ),
            Err(e) => tracing::warn!(tag = e.tag(), error = %e, "Secure transaction failed"),
        }
        result
    }

    async fn run_inner<T, E, F, X>(&self, identity: Identity, cancelled: X, work: F) -> Result<T>
    where
        E: Into<BoxError>,
        F: for<'s> FnOnce(&'s mut SessionScope<C>) -> BoxFuture<'s, std::result::Result<T, E>>,
        X: Future<Output = ()>,
    {
        let token = self.resolve(identity).await?;

        let mut cancelled = std::pin::pin!(cancelled);
        let session = tokio::select! {
            biased;
            () = &mut cancelled => return Err(Error::Cancelled),
            session = acquire(&self.pool) => session?,
        };

        let mut scope = SessionScope {
            session,
            claims: token.claims().clone(),
            state: SessionState::Idle,
        };
        scope.transition(SessionState::ConnectionAcquired);

        // Marked before BEGIN so a drop at any later await is rolled back on recycle.
        scope.session.set_tx_open(true);
        if let Err(e) = scope.exec(BEGIN, TxStage::Begin).await {
            scope.rollback().await;
            return Err(e);
        }
        scope.transition(SessionState::TransactionOpen);

        if let Err(e) = self.install(&mut scope, &token).await {
            scope.rollback().await;
            return Err(e);
        }
        drop(token);
        scope.transition(SessionState::IdentityInstalled);

        scope.transition(SessionState::WorkRunning);
        let outcome = {
            let work = AssertUnwindSafe(work(&mut scope)).catch_unwind();
            tokio::select! {
                biased;
                () = &mut cancelled => None,
                result = work => Some(result),
            }
        };

        match outcome {
            None => {
                scope.rollback().await;
                Err(Error::Cancelled)
            }
            Some(Err(panic)) => {
                scope.rollback().await;
                std::panic::resume_unwind(panic)
            }
            Some(Ok(Err(e))) => {
                let err = Error::transaction(TxStage::Work, e);
                scope.rollback().await;
                Err(err)
            }
            Some(Ok(Ok(value))) => {
                if let Err(e) = scope.exec(COMMIT, TxStage::Commit).await {
                    scope.rollback().await;
                    return Err(e);
                }
                scope.session.set_tx_open(false);
                scope.transition(SessionState::Committed);
                Ok(value)
            }
        }
    }

    /// `init` then `install identity`, strictly in that order.
    async fn install(&self, scope: &mut SessionScope<C>, token: &InternalToken) -> Result<()> {
        scope.exec(&self.procedures.init, TxStage::Init).await?;
        scope
            .session
            .call(&self.procedures.install, token.as_str())
            .await
            .map_err(|e| Error::transaction(TxStage::Install, e))
    }
}
