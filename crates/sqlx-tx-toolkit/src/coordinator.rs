//! Retrying transaction coordinator

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sqlx_conn_pool::{
   Connection, ConnectionId, ConnectionPool, Connector, PooledConnection, SqliteConnector,
};
use tracing::{debug, trace, warn};

use crate::context::{
   ContextTable, Hook, HookFuture, HookKind, RoutedConnection, SharedConnection, TaskId,
};
use crate::isolation::{IsolationLevel, isolation_statement};
use crate::transaction::Transaction;
use crate::{Error, Result};

/// One failed transaction attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryAttempt {
   /// 1-based attempt number
   pub attempt: u32,
   pub error: String,
   /// Rollback hooks that failed after this attempt rolled back, as an
   /// [`Error::HookFailed`] message naming the count and the first failure
   pub rollback_hooks: Option<String>,
   /// Time from acquiring the connection until the attempt was abandoned
   pub elapsed: Duration,
}

/// Where an attempt is in its lifecycle. Only used for tracing.
#[derive(Debug, Clone, Copy)]
enum AttemptState {
   Connected,
   IsolationSet,
   Begun,
   Committed,
   RolledBack,
   Released,
}

enum AttemptError {
   /// Rolled back; another attempt may succeed
   Retry {
      error: Error,
      rollback_hooks: Option<Error>,
   },
   /// Nothing left to undo, stop now
   Fatal(Error),
}

/// Runs units of work inside transactions on a [`ConnectionPool`].
///
/// Each attempt checks out its own connection, sets the isolation level,
/// begins, runs the caller's body and commits. Any failure before the
/// commit lands rolls back, runs the rollback hooks and starts over on a
/// fresh connection until the attempts run out.
///
/// While a body runs, its connection is registered against the body's task
/// scope. [`DatabaseWrapper`](crate::DatabaseWrapper) queries and hook
/// registrations issued from that scope go to the transaction without
/// touching the pool, so a body never waits on itself even when the pool
/// has a single connection.
///
/// `TransactionCoordinator` is a cheap handle; clones share the same pool and
/// context table.
pub struct TransactionCoordinator<C: Connector = SqliteConnector> {
   pool: ConnectionPool<C>,
   contexts: Arc<Mutex<ContextTable<C>>>,
}

impl<C: Connector> Clone for TransactionCoordinator<C> {
   fn clone(&self) -> Self {
      Self {
         pool: self.pool.clone(),
         contexts: Arc::clone(&self.contexts),
      }
   }
}

impl<C: Connector> TransactionCoordinator<C> {
   pub fn new(pool: ConnectionPool<C>) -> Self {
      Self {
         pool,
         contexts: Arc::new(Mutex::new(ContextTable::default())),
      }
   }

   pub fn pool(&self) -> &ConnectionPool<C> {
      &self.pool
   }

   /// Whether the calling task is inside one of this coordinator's
   /// transaction bodies.
   pub fn in_transaction(&self) -> bool {
      self.contexts.lock().active_connection().is_some()
   }

   /// Run `hook` after the current transaction commits.
   ///
   /// Only valid from inside a transaction body; anywhere else (including
   /// tasks spawned from a body) fails with [`Error::NotInTransaction`].
   pub fn on_commit<F, Fut>(&self, hook: F) -> Result<()>
   where
      F: FnOnce() -> Fut + Send + 'static,
      Fut: Future<Output = Result<()>> + Send + 'static,
   {
      self.contexts.lock().add_hook(HookKind::Commit, boxed_hook(hook))
   }

   /// Run `hook` after the current transaction rolls back.
   ///
   /// Rollback hooks run once per failed attempt. Their failures are logged
   /// and never replace the error that caused the rollback.
   pub fn on_rollback<F, Fut>(&self, hook: F) -> Result<()>
   where
      F: FnOnce() -> Fut + Send + 'static,
      Fut: Future<Output = Result<()>> + Send + 'static,
   {
      self
         .contexts
         .lock()
         .add_hook(HookKind::Rollback, boxed_hook(hook))
   }

   /// Connection for a query issued outside any [`Transaction`] handle.
   pub(crate) async fn route(&self) -> Result<RoutedConnection<C>> {
      let active = self.contexts.lock().active_connection();
      match active {
         Some(shared) => Ok(RoutedConnection::Transaction(shared.lock_owned().await)),
         None => Ok(RoutedConnection::Pooled(self.pool.acquire().await?)),
      }
   }

   /// Run `unit_of_work` in a transaction, retrying up to `attempts` times.
   ///
   /// The closure is called once per attempt with a fresh [`Transaction`].
   /// `isolation` overrides the family default for every attempt.
   ///
   /// Fails immediately, without retrying, when `attempts` is zero, when the
   /// isolation level is not supported, when no connection can be acquired,
   /// or when commit hooks fail after a successful commit
   /// ([`Error::HookFailed`]). When every attempt fails the last error is
   /// returned inside [`Error::TransactionFailed`] together with a record of
   /// each attempt.
   pub async fn run<T, F, Fut>(
      &self,
      mut unit_of_work: F,
      attempts: u32,
      isolation: Option<IsolationLevel>,
   ) -> Result<T>
   where
      F: FnMut(Transaction<C>) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      if attempts == 0 {
         return Err(Error::InvalidArgument(
            "transaction attempts must be at least 1".to_string(),
         ));
      }
      let isolation_sql = isolation_statement(self.pool.family(), isolation)?;

      let mut history = Vec::new();
      let mut attempt = 0;
      loop {
         attempt += 1;
         let conn = self.pool.acquire().await?;
         let started = Instant::now();

         match self
            .attempt(conn, &mut unit_of_work, isolation_sql.as_deref(), attempt)
            .await
         {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Retry {
               error: e,
               rollback_hooks,
            }) => {
               debug!(attempt, attempts, error = %e, "Transaction attempt failed");
               history.push(RetryAttempt {
                  attempt,
                  error: e.to_string(),
                  rollback_hooks: rollback_hooks.map(|hook_err| hook_err.to_string()),
                  elapsed: started.elapsed(),
               });

               if attempt >= attempts {
                  return Err(Error::TransactionFailed {
                     attempts,
                     history,
                     source: Box::new(e),
                  });
               }
            }
         }
      }
   }

   async fn attempt<T, F, Fut>(
      &self,
      conn: PooledConnection<C>,
      unit_of_work: &mut F,
      isolation_sql: Option<&str>,
      attempt: u32,
   ) -> std::result::Result<T, AttemptError>
   where
      F: FnMut(Transaction<C>) -> Fut,
      Fut: Future<Output = Result<T>>,
   {
      let id = conn.id();
      let shared: SharedConnection<C> = Arc::new(tokio::sync::Mutex::new(Some(conn)));
      trace_state(attempt, id, AttemptState::Connected);

      let task = TaskId::next();
      let guard = ContextTable::register(&self.contexts, task, id, Arc::clone(&shared))
         .map_err(AttemptError::Fatal)?;

      let outcome = async {
         begin(&shared, isolation_sql, attempt, id).await?;

         let tx = Transaction::new(self.clone(), Arc::clone(&shared), id);
         let value = task.scope(async { unit_of_work(tx).await }).await?;

         let mut slot = shared.lock().await;
         let conn = slot.as_mut().ok_or(Error::TransactionAlreadyFinalized)?;
         conn
            .commit()
            .await
            .map_err(|e| Error::Transaction(format!("COMMIT failed: {e}")))?;
         Ok::<T, Error>(value)
      }
      .await;

      // The body is done; take the connection back from any handle clones
      let conn = shared.lock().await.take();

      match outcome {
         Ok(value) => {
            trace_state(attempt, id, AttemptState::Committed);
            let hooks = guard
               .finish()
               .map(|context| context.into_hooks(HookKind::Commit))
               .unwrap_or_default();
            if let Some(conn) = conn {
               conn.release().await;
               trace_state(attempt, id, AttemptState::Released);
            }
            debug!(connection_id = %id, attempt, "Transaction committed");

            run_hooks(hooks, HookKind::Commit)
               .await
               .map_err(AttemptError::Fatal)?;
            Ok(value)
         }
         Err(e) => {
            let hooks = guard
               .finish()
               .map(|context| context.into_hooks(HookKind::Rollback))
               .unwrap_or_default();
            if let Some(mut conn) = conn {
               if conn.in_transaction() {
                  match conn.rollback().await {
                     Ok(()) => trace_state(attempt, id, AttemptState::RolledBack),
                     Err(rollback_err) => {
                        warn!(connection_id = %id, error = %rollback_err, "Rollback failed")
                     }
                  }
               }
               conn.release().await;
               trace_state(attempt, id, AttemptState::Released);
            }
            debug!(connection_id = %id, attempt, error = %e, "Transaction rolled back");

            let rollback_hooks = run_hooks(hooks, HookKind::Rollback).await.err();
            Err(AttemptError::Retry {
               error: e,
               rollback_hooks,
            })
         }
      }
   }
}

async fn begin<C: Connector>(
   shared: &SharedConnection<C>,
   isolation_sql: Option<&str>,
   attempt: u32,
   id: ConnectionId,
) -> Result<()> {
   let mut slot = shared.lock().await;
   let conn = slot.as_mut().ok_or(Error::TransactionAlreadyFinalized)?;

   if let Some(sql) = isolation_sql {
      conn
         .execute(sql, &[])
         .await
         .map_err(|e| Error::Transaction(format!("failed to set isolation level: {e}")))?;
      trace_state(attempt, id, AttemptState::IsolationSet);
   }

   conn
      .begin()
      .await
      .map_err(|e| Error::Transaction(format!("BEGIN failed: {e}")))?;
   trace_state(attempt, id, AttemptState::Begun);
   Ok(())
}

fn trace_state(attempt: u32, id: ConnectionId, state: AttemptState) {
   trace!(attempt, connection_id = %id, ?state, "Transaction state");
}

fn boxed_hook<F, Fut>(hook: F) -> Hook
where
   F: FnOnce() -> Fut + Send + 'static,
   Fut: Future<Output = Result<()>> + Send + 'static,
{
   Box::new(move || -> HookFuture { Box::pin(hook()) })
}

/// Run every hook in registration order. All of them run; the failures are
/// counted and the first one is reported.
async fn run_hooks(hooks: Vec<Hook>, kind: HookKind) -> Result<()> {
   let mut failed = 0;
   let mut first = None;

   for hook in hooks {
      if let Err(e) = hook().await {
         warn!(?kind, error = %e, "Transaction hook failed");
         failed += 1;
         first.get_or_insert(e);
      }
   }

   match first {
      None => Ok(()),
      Some(first) => Err(Error::HookFailed {
         failed,
         first: Box::new(first),
      }),
   }
}
