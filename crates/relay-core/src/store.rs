//! Durable event storage on SQLite.
//!
//! Duplicate detection and the one-row-per-author rule for replaceable kinds
//! are enforced by unique indexes, not by reading before writing. Every
//! mutation runs in an IMMEDIATE transaction, which takes the database write
//! lock at `BEGIN`, so concurrent replacements of the same `(pubkey, kind)`
//! serialize and the last committed writer wins.

use rusqlite::{params, params_from_iter, Connection, ErrorCode, Row, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::event::{Event, Tag, REPLACEABLE_KINDS};
use crate::filter::Predicate;
use crate::pool::ConnectionPool;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        seq        INTEGER PRIMARY KEY AUTOINCREMENT,
        id         TEXT NOT NULL UNIQUE,
        pubkey     TEXT NOT NULL,
        kind       INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        tags       TEXT NOT NULL,
        content    TEXT NOT NULL,
        sig        TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind);
    CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
    CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);
    CREATE UNIQUE INDEX IF NOT EXISTS idx_events_replaceable
        ON events(pubkey, kind) WHERE kind IN (0, 3);

    CREATE TABLE IF NOT EXISTS event_tags (
        event_seq INTEGER NOT NULL REFERENCES events(seq) ON DELETE CASCADE,
        name      TEXT NOT NULL,
        value     TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_tags_name_value ON event_tags(name, value);
    CREATE INDEX IF NOT EXISTS idx_event_tags_event ON event_tags(event_seq);
";

const SELECT_COLUMNS: &str = "SELECT id, pubkey, kind, created_at, tags, content, sig FROM events";

/// Tuning for [`EventStore::open`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub pool_size: usize,
    /// Upper bound for one store call, including waiting for a connection.
    pub timeout: Duration,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(3),
        }
    }
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stored {
    /// Insertion sequence number.
    pub seq: i64,
    /// Rows removed by replacement.
    pub replaced: usize,
}

/// Counters for observability and tests.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub queries: AtomicU64,
    pub inserted: AtomicU64,
    pub replaced: AtomicU64,
}

impl StoreMetrics {
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }
}

/// Pooled SQLite event store. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    pool: ConnectionPool,
    timeout: Duration,
    metrics: Arc<StoreMetrics>,
}

impl EventStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, options: &StoreOptions) -> Result<Self, StoreError> {
        let pool = ConnectionPool::open(path, options.pool_size, options.busy_timeout)?;
        let store = Self::with_pool(pool, options.timeout);
        store.init_schema_blocking()?;
        info!(
            "Event store opened at {} ({} connections)",
            path.display(),
            store.pool.size()
        );
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self::with_pool(ConnectionPool::open_in_memory()?, StoreOptions::default().timeout);
        store.init_schema_blocking()?;
        Ok(store)
    }

    fn with_pool(pool: ConnectionPool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            metrics: Arc::new(StoreMetrics::default()),
        }
    }

    fn init_schema_blocking(&self) -> Result<(), StoreError> {
        // Runs before the store is shared, so a free connection is guaranteed.
        let conn = self.pool.try_acquire()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Insert a new event. Fails with [`StoreError::Duplicate`] when the id
    /// is already stored, leaving the existing row untouched.
    pub async fn insert(&self, event: Event) -> Result<Stored, StoreError> {
        let metrics = Arc::clone(&self.metrics);
        self.with_connection("insert", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let seq = insert_row(&tx, &event)?;
            tx.commit()?;
            metrics.inserted.fetch_add(1, Ordering::Relaxed);
            Ok(Stored { seq, replaced: 0 })
        })
        .await
    }

    /// Delete every stored event of `pubkey` with the given replaceable
    /// `kind`. Other kinds are never deleted; the call returns 0 for them.
    pub async fn replace_by_author_kind(&self, pubkey: &str, kind: u32) -> Result<usize, StoreError> {
        if !REPLACEABLE_KINDS.contains(&kind) {
            return Ok(0);
        }
        let pubkey = pubkey.to_string();
        let metrics = Arc::clone(&self.metrics);
        self.with_connection("replace", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let deleted = delete_author_kind(&tx, &pubkey, kind)?;
            tx.commit()?;
            metrics.replaced.fetch_add(deleted as u64, Ordering::Relaxed);
            Ok(deleted)
        })
        .await
    }

    /// Persist an accepted event, applying replacement for replaceable kinds.
    ///
    /// Replacement and insertion share one transaction. The id is looked up
    /// under the write lock before anything is deleted, so resubmitting the
    /// stored event returns [`StoreError::Duplicate`] and changes nothing.
    pub async fn store(&self, event: Event) -> Result<Stored, StoreError> {
        if !event.is_replaceable() {
            return self.insert(event).await;
        }
        let metrics = Arc::clone(&self.metrics);
        self.with_connection("replace+insert", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if id_exists(&tx, &event.id)? {
                return Err(StoreError::Duplicate);
            }
            let replaced = delete_author_kind(&tx, &event.pubkey, event.kind)?;
            // Dropping `tx` on error rolls the delete back.
            let seq = insert_row(&tx, &event)?;
            tx.commit()?;
            metrics.inserted.fetch_add(1, Ordering::Relaxed);
            metrics.replaced.fetch_add(replaced as u64, Ordering::Relaxed);
            if replaced > 0 {
                debug!(
                    "Replaced {} kind-{} event(s) for {}",
                    replaced,
                    event.kind,
                    crate::event::short_hex(&event.pubkey)
                );
            }
            Ok(Stored { seq, replaced })
        })
        .await
    }

    /// Up to `limit` events matching `predicate`, newest first; equal
    /// timestamps keep insertion order.
    pub async fn query(&self, predicate: &Predicate, limit: usize) -> Result<Vec<Event>, StoreError> {
        let Some((condition, mut values)) = predicate.to_sql() else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.metrics.queries.fetch_add(1, Ordering::Relaxed);
        let sql = format!("{SELECT_COLUMNS} WHERE {condition} ORDER BY created_at DESC, seq ASC LIMIT ?");
        values.push(rusqlite::types::Value::Integer(
            i64::try_from(limit).unwrap_or(i64::MAX),
        ));
        self.with_connection("query", move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_event)?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
        .await
    }

    /// Look up one event by id.
    pub async fn get(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let id = id.to_string();
        self.with_connection("get", move |conn| {
            let mut stmt = conn.prepare_cached(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
            let row = stmt.query_row(params![id], row_to_event);
            match row {
                Ok(event) => Ok(Some(event)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Total number of stored events.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.with_connection("count", |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
        .await
    }

    /// Run `f` on a pooled connection in a blocking task, bounded by the
    /// store timeout. Once handed to the blocking pool, `f` always runs to
    /// completion, so a timed-out or cancelled caller never leaves a
    /// half-applied transaction behind.
    async fn with_connection<T, F>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let work = async move {
            let mut conn = pool.acquire().await?;
            tokio::task::spawn_blocking(move || f(&mut *conn)).await?
        };
        match tokio::time::timeout(self.timeout, work).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(StoreError::Duplicate)) => Err(StoreError::Duplicate),
            Ok(Err(e)) => {
                error!("Store {} failed: {}", op, e);
                Err(e)
            }
            Err(_) => {
                warn!("Store {} timed out after {:?}", op, self.timeout);
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

fn insert_row(conn: &Connection, event: &Event) -> Result<i64, StoreError> {
    let tags = serde_json::to_string(&event.tags)?;
    conn.execute(
        "INSERT INTO events (id, pubkey, kind, created_at, tags, content, sig)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.id,
            event.pubkey,
            i64::from(event.kind),
            event.created_at,
            tags,
            event.content,
            event.sig
        ],
    )
    .map_err(classify_insert_error)?;
    let seq = conn.last_insert_rowid();

    let mut stmt =
        conn.prepare_cached("INSERT INTO event_tags (event_seq, name, value) VALUES (?1, ?2, ?3)")?;
    for (name, value) in event.tag_pairs() {
        stmt.execute(params![seq, name, value])?;
    }
    Ok(seq)
}

fn id_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM events WHERE id = ?1")?;
    Ok(stmt.exists(params![id])?)
}

fn delete_author_kind(conn: &Connection, pubkey: &str, kind: u32) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM events WHERE pubkey = ?1 AND kind = ?2",
        params![pubkey, i64::from(kind)],
    )?;
    Ok(deleted)
}

fn classify_insert_error(err: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(code, Some(msg)) = &err {
        if code.code == ErrorCode::ConstraintViolation {
            if msg.contains("events.id") {
                return StoreError::Duplicate;
            }
            return StoreError::Constraint(msg.clone());
        }
    }
    StoreError::Database(err)
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let tags_json: String = row.get(4)?;
    let tags: Vec<Tag> = serde_json::from_str(&tags_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let kind: i64 = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        pubkey: row.get(1)?,
        kind: u32::try_from(kind).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Integer, Box::new(e))
        })?,
        created_at: row.get(3)?,
        tags,
        content: row.get(5)?,
        sig: row.get(6)?,
    })
}
