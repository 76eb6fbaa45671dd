//! Fixed-size pool of SQLite connections.
//!
//! Each request checks out its own connection and hands it back on drop, so
//! no connection is ever shared between two in-flight operations. The
//! connections sit behind a `parking_lot::Mutex` (sync) and are only touched
//! from blocking tasks, never held across an `.await`.

use parking_lot::Mutex as SyncMutex;
use rusqlite::Connection;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StoreError;

struct PoolInner {
    idle: SyncMutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    size: usize,
}

impl ConnectionPool {
    /// Open `size` connections to the database file at `path`.
    pub fn open(path: &Path, size: usize, busy_timeout: Duration) -> Result<Self, StoreError> {
        let size = size.max(1);
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(path)?;
            configure(&conn, busy_timeout)?;
            conns.push(conn);
        }
        Ok(Self::from_connections(conns))
    }

    /// A single in-memory connection (for tests and throwaway runs).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::from_connections(vec![conn]))
    }

    fn from_connections(conns: Vec<Connection>) -> Self {
        let size = conns.len();
        Self {
            inner: Arc::new(PoolInner {
                idle: SyncMutex::new(conns),
                permits: Arc::new(Semaphore::new(size)),
            }),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for a free connection.
    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StoreError::PoolClosed)?;
        self.checkout(permit)
    }

    /// Take a free connection without waiting.
    pub fn try_acquire(&self) -> Result<PooledConnection, StoreError> {
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| StoreError::PoolClosed)?;
        self.checkout(permit)
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection, StoreError> {
        // One permit per idle connection, so a permit holder always finds one.
        let conn = self.inner.idle.lock().pop().ok_or(StoreError::PoolClosed)?;
        Ok(PooledConnection {
            conn: Some(conn),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Stop handing out connections. Pending acquisitions fail.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

/// A checked-out connection, returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.inner.idle.lock().push(conn);
        }
        // `_permit` is released after the connection is back in `idle`.
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous  = NORMAL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(())
}
