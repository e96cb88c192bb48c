//! Bounded connection pool with FIFO hand-off to waiting tasks

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::{DatabaseConfig, DatabaseFamily, PoolConfig};
use crate::connection::{Connection, ConnectionId, Connector};
use crate::sqlite::SqliteConnector;
use crate::{Error, Result};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
   /// Open connections, idle or checked out
   pub active: usize,
   /// Connections parked in the idle queue
   pub idle: usize,
   /// Tasks suspended waiting for a connection
   pub waiting: usize,
   pub max_size: usize,
}

/// A bounded pool of database connections shared by many async tasks.
///
/// ## Architecture
///
/// - **Lazy growth**: connections are opened on demand, never more than
///   `max_size` at once
/// - **Idle reuse**: released connections are parked in an idle queue and
///   handed out again without touching the database
/// - **Fair waiting**: when the pool is exhausted, callers queue up and are
///   served strictly in arrival order. A released connection goes straight
///   to the oldest waiter instead of through the idle queue
/// - **Self-healing**: every release checks the connection; dead ones are
///   dropped and, when someone is waiting, replaced immediately
///
/// All bookkeeping happens under a short synchronous lock that is never
/// held across an `.await`, so no task can observe a half-updated pool.
///
/// `ConnectionPool` is a cheap handle; clones share the same pool.
pub struct ConnectionPool<C: Connector = SqliteConnector> {
   inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
   fn clone(&self) -> Self {
      Self {
         inner: Arc::clone(&self.inner),
      }
   }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ConnectionPool")
         .field("family", &self.inner.family)
         .field("stats", &self.stats())
         .finish()
   }
}

struct PoolInner<C: Connector> {
   config: DatabaseConfig,
   family: DatabaseFamily,
   max_size: usize,
   connector: C,
   next_id: AtomicU64,
   state: Mutex<PoolState<C::Connection>>,
}

struct IdleConnection<T> {
   id: ConnectionId,
   conn: T,
}

/// A task suspended in [`ConnectionPool::acquire`].
///
/// The channel only ever carries a connection. A waiter that must be failed
/// instead has the error parked in `rejection` before the sender is dropped.
struct Waiter<T> {
   tx: oneshot::Sender<IdleConnection<T>>,
   rejection: Arc<Mutex<Option<Error>>>,
}

struct WaitTicket<T> {
   rx: oneshot::Receiver<IdleConnection<T>>,
   rejection: Arc<Mutex<Option<Error>>>,
}

enum AcquirePlan<T> {
   /// A slot was reserved for the caller
   Open,
   /// The caller queued behind older waiters
   Wait {
      ticket: WaitTicket<T>,
      open_for_oldest: bool,
   },
}

impl<T> Waiter<T> {
   fn new() -> (Self, WaitTicket<T>) {
      let (tx, rx) = oneshot::channel();
      let rejection = Arc::new(Mutex::new(None));
      (
         Self {
            tx,
            rejection: Arc::clone(&rejection),
         },
         WaitTicket { rx, rejection },
      )
   }

   fn is_closed(&self) -> bool {
      self.tx.is_closed()
   }

   /// Fail the waiting task with `error`.
   fn reject(self, error: Error) {
      *self.rejection.lock() = Some(error);
      drop(self.tx);
   }
}

impl<T> WaitTicket<T> {
   async fn wait(self) -> Result<IdleConnection<T>> {
      match self.rx.await {
         Ok(idle) => Ok(idle),
         // Sender dropped without a hand-off: rejected, or the pool went away
         Err(_) => Err(self.rejection.lock().take().unwrap_or(Error::PoolClosed)),
      }
   }
}

struct PoolState<T> {
   idle: VecDeque<IdleConnection<T>>,
   waiters: VecDeque<Waiter<T>>,
   active: usize,
   closed: bool,
}

impl<T> PoolState<T> {
   /// Drop waiters at the front of the queue that stopped listening
   /// (e.g. the caller wrapped `acquire` in a timeout that fired).
   fn prune_waiters(&mut self) {
      while self.waiters.front().is_some_and(|w| w.is_closed()) {
         self.waiters.pop_front();
      }
   }

   fn waiting(&self) -> usize {
      self.waiters.iter().filter(|w| !w.is_closed()).count()
   }
}

impl ConnectionPool<SqliteConnector> {
   /// Create a pool using the built-in driver for the configured family.
   ///
   /// Validates the configuration; no connection is opened until the first
   /// [`acquire`](ConnectionPool::acquire).
   pub fn new(config: DatabaseConfig, pool_config: Option<PoolConfig>) -> Result<Self> {
      let family = config.validate()?;
      if family != DatabaseFamily::Sqlite {
         return Err(Error::Configuration(format!(
            "no built-in connector for {family}; supply one with ConnectionPool::with_connector"
         )));
      }
      Self::with_connector(config, pool_config, SqliteConnector)
   }
}

impl<C: Connector> ConnectionPool<C> {
   /// Create a pool that opens connections through `connector`.
   pub fn with_connector(
      config: DatabaseConfig,
      pool_config: Option<PoolConfig>,
      connector: C,
   ) -> Result<Self> {
      let family = config.validate()?;
      let pool_config = pool_config.unwrap_or_default();
      pool_config.validate()?;

      debug!(%family, max_size = pool_config.max_size, "Created connection pool");

      Ok(Self {
         inner: Arc::new(PoolInner {
            config,
            family,
            max_size: pool_config.max_size,
            connector,
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState {
               idle: VecDeque::new(),
               waiters: VecDeque::new(),
               active: 0,
               closed: false,
            }),
         }),
      })
   }

   pub fn family(&self) -> DatabaseFamily {
      self.inner.family
   }

   pub fn config(&self) -> &DatabaseConfig {
      &self.inner.config
   }

   pub fn max_size(&self) -> usize {
      self.inner.max_size
   }

   /// Check out a connection.
   ///
   /// Returns an idle connection immediately when one exists, otherwise
   /// opens a new one if the pool has room. When the pool is full the
   /// calling task suspends until another task releases a connection to it;
   /// waiters are served first come, first served.
   pub async fn acquire(&self) -> Result<PooledConnection<C>> {
      let plan = {
         let mut state = self.inner.state.lock();
         if state.closed {
            return Err(Error::PoolClosed);
         }

         if let Some(idle) = state.idle.pop_front() {
            trace!(connection_id = %idle.id, "Reusing idle connection");
            return Ok(self.inner.wrap(idle));
         }

         state.prune_waiters();
         let has_room = state.active < self.inner.max_size;
         if has_room {
            state.active += 1;
         }

         if has_room && state.waiting() == 0 {
            AcquirePlan::Open
         } else {
            // Older waiters go first; spare room is spent on the oldest one
            let (waiter, ticket) = Waiter::new();
            state.waiters.push_back(waiter);
            trace!(waiting = state.waiters.len(), "Pool exhausted, waiting for a connection");
            AcquirePlan::Wait {
               ticket,
               open_for_oldest: has_room,
            }
         }
      };

      match plan {
         AcquirePlan::Open => {
            let reservation = SlotReservation::new(&self.inner);
            let opened = self.inner.open().await?;
            reservation.disarm();
            Ok(self.inner.wrap(opened))
         }
         AcquirePlan::Wait {
            ticket,
            open_for_oldest,
         } => {
            if open_for_oldest {
               self.inner.serve_waiters().await;
            }
            let handed = ticket.wait().await?;
            Ok(self.inner.wrap(handed))
         }
      }
   }

   /// [`acquire`](ConnectionPool::acquire) with a deadline.
   ///
   /// The pool itself never times out; this only stops waiting. A connection
   /// released after the deadline goes to the next waiter instead.
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection<C>> {
      tokio::time::timeout(timeout, self.acquire())
         .await
         .map_err(|_| Error::AcquireTimeout(timeout))?
   }

   /// Return a connection to the pool.
   ///
   /// Never fails: a dead connection is dropped (and replaced for the oldest
   /// waiter, if any), a live one has any open transaction rolled back and
   /// then goes to the oldest waiter or the idle queue.
   pub async fn release(&self, mut conn: PooledConnection<C>) {
      if let Some(conn) = conn.take() {
         self.inner.check_in(conn).await;
      }
   }

   /// Point-in-time counters. No side effects.
   pub fn stats(&self) -> PoolStats {
      let state = self.inner.state.lock();
      PoolStats {
         active: state.active,
         idle: state.idle.len(),
         waiting: state.waiting(),
         max_size: self.inner.max_size,
      }
   }

   /// Close the pool.
   ///
   /// Drops every idle connection, fails every queued waiter with
   /// [`Error::PoolClosed`] and zeroes the counters. Connections still checked
   /// out are discarded when released. The pool cannot be reopened.
   pub fn close(&self) {
      let (idle, waiters) = {
         let mut state = self.inner.state.lock();
         state.closed = true;
         state.active = 0;
         (
            std::mem::take(&mut state.idle),
            std::mem::take(&mut state.waiters),
         )
      };

      debug!(
         idle = idle.len(),
         waiters = waiters.len(),
         "Closing connection pool"
      );

      for waiter in waiters {
         waiter.reject(Error::PoolClosed);
      }
      drop(idle);
   }

   pub fn is_closed(&self) -> bool {
      self.inner.state.lock().closed
   }
}

impl<C: Connector> PoolInner<C> {
   async fn open(&self) -> Result<IdleConnection<C::Connection>> {
      match self.connector.connect(&self.config).await {
         Ok(conn) => {
            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
            debug!(connection_id = %id, family = %self.family, "Opened database connection");
            Ok(IdleConnection { id, conn })
         }
         Err(e) => {
            warn!(family = %self.family, error = %e, "Failed to open database connection");
            Err(Error::ConnectionPool(e))
         }
      }
   }

   fn wrap(self: &Arc<Self>, idle: IdleConnection<C::Connection>) -> PooledConnection<C> {
      PooledConnection {
         id: idle.id,
         conn: Some(idle.conn),
         pool: Arc::downgrade(self),
      }
   }

   async fn check_in(self: &Arc<Self>, mut idle: IdleConnection<C::Connection>) {
      if self.state.lock().closed {
         trace!(connection_id = %idle.id, "Pool closed, discarding released connection");
         return;
      }

      if !idle.conn.is_alive().await {
         debug!(connection_id = %idle.id, "Released connection is dead, discarding");
         drop(idle);
         self.discard_slot().await;
         return;
      }

      if idle.conn.in_transaction() {
         match idle.conn.rollback().await {
            Ok(()) => trace!(connection_id = %idle.id, "Rolled back open transaction on release"),
            Err(e) => {
               debug!(connection_id = %idle.id, error = %e, "Rollback on release failed, discarding");
               drop(idle);
               self.discard_slot().await;
               return;
            }
         }
      }

      self.hand_off(idle);
   }

   /// Give a live connection to the oldest listening waiter, or park it.
   fn hand_off(&self, mut idle: IdleConnection<C::Connection>) {
      let mut state = self.state.lock();
      if state.closed {
         return;
      }

      while let Some(waiter) = state.waiters.pop_front() {
         let id = idle.id;
         match waiter.tx.send(idle) {
            Ok(()) => {
               trace!(connection_id = %id, "Handed connection to waiting task");
               return;
            }
            // Receiver gone; take the connection back and try the next one
            Err(back) => idle = back,
         }
      }

      trace!(connection_id = %idle.id, "Returned connection to idle queue");
      state.idle.push_back(idle);
   }

   /// Hand the slot of a discarded connection to the oldest waiter, or
   /// forget it when nobody is waiting.
   ///
   /// Returns true when the slot stays counted and a connection must be
   /// opened for the waiters.
   fn retire_slot(&self) -> bool {
      let mut state = self.state.lock();
      if state.closed {
         return false;
      }
      state.prune_waiters();
      if state.waiting() > 0 {
         return true;
      }
      state.active = state.active.saturating_sub(1);
      false
   }

   async fn discard_slot(self: &Arc<Self>) {
      if self.retire_slot() {
         self.serve_waiters().await;
      }
   }

   /// Open a connection for the oldest waiter on a slot already counted in
   /// `active`.
   ///
   /// A creation failure is delivered to the oldest waiter, never to the
   /// task doing the opening. The slot is kept for the next waiter, if any.
   async fn serve_waiters(self: &Arc<Self>) {
      loop {
         let reservation = SlotReservation::new(self);
         match self.open().await {
            Ok(opened) => {
               reservation.disarm();
               trace!(connection_id = %opened.id, "Opened connection for waiter");
               self.hand_off(opened);
               return;
            }
            Err(e) => {
               reservation.disarm();
               let (waiter, keep_slot) = {
                  let mut state = self.state.lock();
                  if state.closed {
                     return;
                  }
                  state.prune_waiters();
                  let waiter = state.waiters.pop_front();
                  state.prune_waiters();
                  let keep_slot = state.waiting() > 0;
                  if !keep_slot {
                     state.active = state.active.saturating_sub(1);
                  }
                  (waiter, keep_slot)
               };
               if let Some(waiter) = waiter {
                  waiter.reject(e);
               }
               if !keep_slot {
                  return;
               }
            }
         }
      }
   }

   /// Release a slot whose connection is gone without awaiting anything.
   fn free_slot(self: &Arc<Self>) {
      let handle = tokio::runtime::Handle::try_current();
      if self.retire_slot() {
         match handle {
            Ok(handle) => {
               let inner = Arc::clone(self);
               handle.spawn(async move { inner.serve_waiters().await });
            }
            // No runtime to open on; give the slot up after all
            Err(_) => {
               let mut state = self.state.lock();
               if !state.closed {
                  state.active = state.active.saturating_sub(1);
               }
            }
         }
      }
   }
}

/// A counted slot whose connection is still being opened.
///
/// Gives the slot back if the opening task is cancelled or fails.
struct SlotReservation<'a, C: Connector> {
   inner: &'a Arc<PoolInner<C>>,
   armed: bool,
}

impl<'a, C: Connector> SlotReservation<'a, C> {
   fn new(inner: &'a Arc<PoolInner<C>>) -> Self {
      Self { inner, armed: true }
   }

   fn disarm(mut self) {
      self.armed = false;
   }
}

impl<C: Connector> Drop for SlotReservation<'_, C> {
   fn drop(&mut self) {
      if self.armed {
         self.inner.free_slot();
      }
   }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to the driver connection. Hand it back with
/// [`release`](PooledConnection::release); if it is dropped instead, it is
/// released on a background task (or discarded outside a tokio runtime).
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection<C: Connector> {
   id: ConnectionId,
   conn: Option<C::Connection>,
   pool: Weak<PoolInner<C>>,
}

impl<C: Connector> PooledConnection<C> {
   pub fn id(&self) -> ConnectionId {
      self.id
   }

   /// Return this connection to its pool.
   pub async fn release(mut self) {
      if let (Some(conn), Some(pool)) = (self.take(), self.pool.upgrade()) {
         pool.check_in(conn).await;
      }
   }

   fn take(&mut self) -> Option<IdleConnection<C::Connection>> {
      self
         .conn
         .take()
         .map(|conn| IdleConnection { id: self.id, conn })
   }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PooledConnection").field("id", &self.id).finish()
   }
}

impl<C: Connector> Deref for PooledConnection<C> {
   type Target = C::Connection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection already released")
   }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn.as_mut().expect("connection already released")
   }
}

impl<C: Connector> Drop for PooledConnection<C> {
   fn drop(&mut self) {
      let Some(idle) = self.take() else {
         return;
      };
      let Some(pool) = self.pool.upgrade() else {
         return;
      };

      match tokio::runtime::Handle::try_current() {
         Ok(handle) => {
            trace!(connection_id = %idle.id, "Connection dropped without release, releasing in background");
            handle.spawn(async move { pool.check_in(idle).await });
         }
         Err(_) => {
            debug!(connection_id = %idle.id, "Connection dropped outside a runtime, discarding");
            drop(idle);
            pool.free_slot();
         }
      }
   }
}
