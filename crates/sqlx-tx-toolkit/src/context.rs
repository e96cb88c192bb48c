//! Bookkeeping for transactions that are in flight
//!
//! Every transaction attempt runs its body inside a task scope carrying a
//! fresh [`TaskId`]. The [`ContextTable`] maps that id to the connection the
//! attempt holds, which is how plain queries and hook registrations issued
//! from inside the body find their transaction without being handed it.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sqlx_conn_pool::{ConnectionId, Connector, PooledConnection};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use crate::{Error, Result};

/// Future returned by a commit or rollback hook.
pub type HookFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub(crate) type Hook = Box<dyn FnOnce() -> HookFuture + Send>;

/// The connection a transaction runs on, shared between the coordinator, the
/// transaction handle and ambient routing. `None` once the coordinator has
/// taken it back to commit or roll back.
pub(crate) type SharedConnection<C> = Arc<tokio::sync::Mutex<Option<PooledConnection<C>>>>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
   static TASK_SCOPE: Arc<[TaskId]>;
}

/// Logical task key for one transaction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(u64);

impl TaskId {
   pub(crate) fn next() -> Self {
      TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
   }

   /// Run `future` with this id as the innermost task scope.
   ///
   /// Outer ids stay visible so a body that opens a transaction on another
   /// database can still reach the outer one.
   pub(crate) async fn scope<F: Future>(self, future: F) -> F::Output {
      let mut ids = current_scope().map(|ids| ids.to_vec()).unwrap_or_default();
      ids.push(self);
      TASK_SCOPE.scope(ids.into(), future).await
   }
}

/// Task ids visible to the caller, innermost last. `None` outside any
/// transaction body, including in tasks spawned from one.
fn current_scope() -> Option<Arc<[TaskId]>> {
   TASK_SCOPE.try_with(Arc::clone).ok()
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum HookKind {
   Commit,
   Rollback,
}

pub(crate) struct TransactionContext<C: Connector> {
   task: TaskId,
   connection: SharedConnection<C>,
   commit_hooks: Vec<Hook>,
   rollback_hooks: Vec<Hook>,
}

impl<C: Connector> TransactionContext<C> {
   pub(crate) fn into_hooks(self, kind: HookKind) -> Vec<Hook> {
      match kind {
         HookKind::Commit => self.commit_hooks,
         HookKind::Rollback => self.rollback_hooks,
      }
   }
}

/// Active transactions of one coordinator, keyed both ways.
pub(crate) struct ContextTable<C: Connector> {
   tasks: HashMap<TaskId, ConnectionId>,
   contexts: HashMap<ConnectionId, TransactionContext<C>>,
}

impl<C: Connector> Default for ContextTable<C> {
   fn default() -> Self {
      Self {
         tasks: HashMap::new(),
         contexts: HashMap::new(),
      }
   }
}

impl<C: Connector> ContextTable<C> {
   /// Record a new transaction context. The returned guard removes it again.
   pub(crate) fn register(
      table: &Arc<Mutex<Self>>,
      task: TaskId,
      id: ConnectionId,
      connection: SharedConnection<C>,
   ) -> Result<ContextGuard<C>> {
      let mut state = table.lock();

      // One context per checked-out connection
      match state.contexts.entry(id) {
         Entry::Vacant(e) => {
            e.insert(TransactionContext {
               task,
               connection,
               commit_hooks: Vec::new(),
               rollback_hooks: Vec::new(),
            });
         }
         Entry::Occupied(_) => {
            return Err(Error::TransactionStateCorrupted(format!(
               "connection {id} already has an active transaction"
            )));
         }
      }
      state.tasks.insert(task, id);
      trace!(connection_id = %id, task = ?task, "Registered transaction context");

      Ok(ContextGuard {
         table: Arc::clone(table),
         id,
         armed: true,
      })
   }

   /// Connection of the innermost transaction the calling task is inside.
   fn current(&self) -> Option<ConnectionId> {
      let scope = current_scope()?;
      scope.iter().rev().find_map(|task| self.tasks.get(task).copied())
   }

   pub(crate) fn active_connection(&self) -> Option<SharedConnection<C>> {
      let id = self.current()?;
      self
         .contexts
         .get(&id)
         .map(|context| Arc::clone(&context.connection))
   }

   pub(crate) fn add_hook(&mut self, kind: HookKind, hook: Hook) -> Result<()> {
      let id = self.current().ok_or(Error::NotInTransaction)?;
      let context = self.contexts.get_mut(&id).ok_or_else(|| {
         Error::TransactionStateCorrupted(format!(
            "task is mapped to connection {id} which has no transaction context"
         ))
      })?;

      match kind {
         HookKind::Commit => context.commit_hooks.push(hook),
         HookKind::Rollback => context.rollback_hooks.push(hook),
      }
      trace!(connection_id = %id, ?kind, "Registered transaction hook");
      Ok(())
   }

   fn remove(&mut self, id: ConnectionId) -> Option<TransactionContext<C>> {
      let context = self.contexts.remove(&id)?;
      self.tasks.remove(&context.task);
      Some(context)
   }

   #[cfg(test)]
   pub(crate) fn len(&self) -> usize {
      debug_assert_eq!(self.tasks.len(), self.contexts.len());
      self.contexts.len()
   }
}

/// Removes a transaction context when the attempt ends, however it ends.
#[must_use = "if unused, the transaction context is removed immediately"]
pub(crate) struct ContextGuard<C: Connector> {
   table: Arc<Mutex<ContextTable<C>>>,
   id: ConnectionId,
   armed: bool,
}

impl<C: Connector> ContextGuard<C> {
   /// Remove the context now and hand back its hooks.
   pub(crate) fn finish(mut self) -> Option<TransactionContext<C>> {
      self.armed = false;
      self.table.lock().remove(self.id)
   }
}

impl<C: Connector> Drop for ContextGuard<C> {
   fn drop(&mut self) {
      if self.armed && self.table.lock().remove(self.id).is_some() {
         trace!(connection_id = %self.id, "Removed abandoned transaction context");
      }
   }
}

/// Where an ambient query runs: on the caller's transaction connection, or
/// on one checked out of the pool just for this call.
pub(crate) enum RoutedConnection<C: Connector> {
   Transaction(OwnedMutexGuard<Option<PooledConnection<C>>>),
   Pooled(PooledConnection<C>),
}

impl<C: Connector> RoutedConnection<C> {
   pub(crate) fn connection(&mut self) -> Result<&mut C::Connection> {
      match self {
         RoutedConnection::Transaction(guard) => (**guard)
            .as_mut()
            .map(|conn| &mut **conn)
            .ok_or(Error::TransactionAlreadyFinalized),
         RoutedConnection::Pooled(conn) => Ok(&mut **conn),
      }
   }

   /// Give back whatever was borrowed. Pooled connections are released.
   pub(crate) async fn finish(self) {
      if let RoutedConnection::Pooled(conn) = self {
         conn.release().await;
      }
   }
}
