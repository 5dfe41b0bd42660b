//! Nested transactions over a [`Connection`].
//!
//! Transaction depth lives in the [`TxScope`] of the [`Session`] that owns the
//! connection, so every logical operation carries its own stack of open
//! transactions and savepoints. The outermost `with_transaction` issues
//! `BEGIN`/`COMMIT`; nested calls use named savepoints, so an inner failure only
//! unwinds its own work.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::resilience::backoff_delay;
use crate::store::{Connection, ErrorKind, StoreError, StoreResult};

pub type TxFuture<'c, T> = BoxFuture<'c, StoreResult<T>>;

/// One step of a batch run by [`TransactionManager::with_batch_transaction`]
pub type BatchOperation<C, T> =
    Box<dyn for<'c> FnOnce(&'c mut Session<C>) -> TxFuture<'c, T> + Send>;

/// Box a closure as a [`BatchOperation`]
pub fn batch_op<C, T, F>(f: F) -> BatchOperation<C, T>
where
    F: for<'c> FnOnce(&'c mut Session<C>) -> TxFuture<'c, T> + Send + 'static,
{
    Box::new(f)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatement {
    Begin(IsolationLevel),
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
}

impl TxStatement {
    pub fn to_sql(&self) -> String {
        match self {
            TxStatement::Begin(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
            TxStatement::Commit => "COMMIT".to_string(),
            TxStatement::Rollback => "ROLLBACK".to_string(),
            TxStatement::Savepoint(name) => format!("SAVEPOINT {}", name),
            TxStatement::ReleaseSavepoint(name) => format!("RELEASE SAVEPOINT {}", name),
            TxStatement::RollbackToSavepoint(name) => format!("ROLLBACK TO SAVEPOINT {}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TxFrame {
    name: String,
    savepoint: Option<String>,
}

/// Stack of open transaction/savepoint frames for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxScope {
    frames: Vec<TxFrame>,
}

impl TxScope {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn in_transaction(&self) -> bool {
        !self.frames.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.frames.iter().map(|f| f.name.as_str()).collect()
    }

    /// Savepoint identifiers are generated, never taken verbatim from callers
    fn savepoint_name(depth: usize, name: &str) -> String {
        let cleaned: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .take(40)
            .collect();
        format!("sp_{}_{}", depth, cleaned)
    }

    fn push(&mut self, name: &str, savepoint: Option<String>) {
        self.frames.push(TxFrame {
            name: name.to_string(),
            savepoint,
        });
    }

    fn truncate(&mut self, depth: usize) {
        self.frames.truncate(depth);
    }

    fn savepoint_at(&self, depth: usize) -> Option<&str> {
        self.frames
            .get(depth)
            .and_then(|frame| frame.savepoint.as_deref())
    }
}

/// A connection owned by one logical operation, together with its transaction scope
#[derive(Debug)]
pub struct Session<C> {
    conn: C,
    scope: TxScope,
}

impl<C> Session<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            scope: TxScope::default(),
        }
    }

    pub fn scope(&self) -> &TxScope {
        &self.scope
    }

    pub fn into_inner(self) -> C {
        self.conn
    }
}

impl<C> Deref for Session<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for Session<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlockRetry {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DeadlockRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Complete,
    Partial,
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub outcomes: Vec<StoreResult<T>>,
}

impl<T> BatchOutcome<T> {
    pub fn status(&self) -> BatchStatus {
        if self.outcomes.iter().all(Result::is_ok) {
            BatchStatus::Complete
        } else {
            BatchStatus::Partial
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn errors(&self) -> Vec<(usize, &StoreError)> {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.as_ref().err().map(|e| (index, e)))
            .collect()
    }

    pub fn report(&self) -> BatchReport {
        BatchReport {
            status: self.status(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            errors: self
                .errors()
                .into_iter()
                .map(|(index, error)| BatchItemError {
                    index,
                    kind: error.kind(),
                    message: error.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItemError {
    pub index: usize,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<BatchItemError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransactionManager {
    isolation: IsolationLevel,
    deadlock_retry: DeadlockRetry,
}

impl TransactionManager {
    pub fn new(isolation: IsolationLevel, deadlock_retry: DeadlockRetry) -> Self {
        Self {
            isolation,
            deadlock_retry,
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn deadlock_retry(&self) -> DeadlockRetry {
        self.deadlock_retry
    }

    /// Run `f` atomically: a new transaction at depth 0, a savepoint otherwise.
    pub async fn with_transaction<C, T, F>(
        &self,
        session: &mut Session<C>,
        name: &str,
        f: F,
    ) -> StoreResult<T>
    where
        C: Connection,
        T: Send,
        F: for<'c> FnOnce(&'c mut Session<C>) -> TxFuture<'c, T> + Send,
    {
        let depth = session.scope.depth();
        let (open, done, undo) = if depth == 0 {
            (
                TxStatement::Begin(self.isolation),
                TxStatement::Commit,
                TxStatement::Rollback,
            )
        } else {
            let savepoint = TxScope::savepoint_name(depth, name);
            (
                TxStatement::Savepoint(savepoint.clone()),
                TxStatement::ReleaseSavepoint(savepoint.clone()),
                TxStatement::RollbackToSavepoint(savepoint),
            )
        };

        let savepoint = match &open {
            TxStatement::Savepoint(sp) => Some(sp.clone()),
            _ => None,
        };
        session.scope.push(name, savepoint);

        if let Err(e) = session.conn.execute_control(&open).await {
            session.scope.truncate(depth);
            return Err(e);
        }
        log::debug!("{} ('{}', depth {})", open.to_sql(), name, depth);

        let result = match f(session).await {
            Ok(value) => match session.conn.execute_control(&done).await {
                Ok(()) => {
                    log::debug!("{} ('{}')", done.to_sql(), name);
                    Ok(value)
                }
                Err(e) => {
                    log::warn!("{} failed for '{}': {}", done.to_sql(), name, e);
                    Self::cleanup(session, &undo).await;
                    Err(e)
                }
            },
            Err(e) => {
                log::debug!("{} ('{}'): {}", undo.to_sql(), name, e);
                Self::cleanup(session, &undo).await;
                Err(e)
            }
        };

        session.scope.truncate(depth);
        result
    }

    /// Run `f` in a fresh transaction, retrying the whole attempt on deadlock or
    /// lock timeout. Inside an existing transaction this degrades to a single
    /// savepoint attempt, since a deadlock invalidates the enclosing transaction.
    pub async fn with_retryable_transaction<C, T, F>(
        &self,
        session: &mut Session<C>,
        name: &str,
        retry: DeadlockRetry,
        mut f: F,
    ) -> StoreResult<T>
    where
        C: Connection,
        T: Send,
        F: for<'c> FnMut(&'c mut Session<C>) -> TxFuture<'c, T> + Send,
    {
        if session.scope.in_transaction() {
            log::debug!(
                "'{}' nested inside {:?}, running without deadlock retry",
                name,
                session.scope.names()
            );
            return self.with_transaction(session, name, |s| f(s)).await;
        }

        let mut retries = 0;
        loop {
            match self.with_transaction(session, name, |s| f(s)).await {
                Err(e) if e.is_deadlock() && retries < retry.max_retries => {
                    let delay = backoff_delay(retry.base_delay, 2.0, retry.max_delay, retries);
                    retries += 1;
                    log::warn!(
                        "'{}' hit {} (retry {}/{}), restarting in {:?}",
                        name,
                        e,
                        retries,
                        retry.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Run `operations` sequentially in one transaction.
    ///
    /// With `stop_on_error` the first failure rolls back the whole batch. Without
    /// it each operation runs in its own savepoint, failures are recorded by index
    /// and the rest still execute; the outcome then reports `Partial`.
    pub async fn with_batch_transaction<C, T>(
        &self,
        session: &mut Session<C>,
        name: &str,
        operations: Vec<BatchOperation<C, T>>,
        stop_on_error: bool,
    ) -> StoreResult<BatchOutcome<T>>
    where
        C: Connection,
        T: Send + 'static,
    {
        let tx = *self;
        let label = name.to_string();
        self.with_transaction(session, name, move |s| {
            Box::pin(async move {
                let mut outcomes = Vec::with_capacity(operations.len());
                for (index, operation) in operations.into_iter().enumerate() {
                    if stop_on_error {
                        match operation(s).await {
                            Ok(value) => outcomes.push(Ok(value)),
                            Err(e) => {
                                log::warn!("Batch '{}' stopped at operation {}: {}", label, index, e);
                                return Err(e);
                            }
                        }
                    } else {
                        let step = format!("{}_{}", label, index);
                        let outcome = tx.with_transaction(s, &step, operation).await;
                        if let Err(e) = &outcome {
                            log::warn!("Batch '{}' operation {} failed: {}", label, index, e);
                        }
                        outcomes.push(outcome);
                    }
                }
                Ok(BatchOutcome { outcomes })
            })
        })
        .await
    }

    /// Race `f` against a timer. On expiry the work opened by `f` is rolled back
    /// here and the session's scope is restored to its depth before the call.
    pub async fn with_transaction_timeout<C, T, F>(
        &self,
        session: &mut Session<C>,
        name: &str,
        timeout: Duration,
        f: F,
    ) -> StoreResult<T>
    where
        C: Connection,
        T: Send,
        F: for<'c> FnOnce(&'c mut Session<C>) -> TxFuture<'c, T> + Send,
    {
        let depth = session.scope.depth();
        let raced = tokio::time::timeout(timeout, self.with_transaction(session, name, f)).await;

        match raced {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Transaction '{}' timed out after {:?}", name, timeout);
                if session.scope.depth() > depth {
                    let undo = match session.scope.savepoint_at(depth) {
                        Some(savepoint) => TxStatement::RollbackToSavepoint(savepoint.to_string()),
                        None => TxStatement::Rollback,
                    };
                    Self::cleanup(session, &undo).await;
                    session.scope.truncate(depth);
                }
                Err(StoreError::Timeout {
                    name: name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    async fn cleanup<C: Connection>(session: &mut Session<C>, undo: &TxStatement) {
        if let Err(e) = session.conn.execute_control(undo).await {
            log::warn!("{} failed during cleanup: {}", undo.to_sql(), e);
        }
    }
}
