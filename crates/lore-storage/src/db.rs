//! Bounded SQLite connection pool.
//!
//! Holds up to `pool_size` rusqlite connections behind a semaphore. Acquiring
//! a connection suspends until one is free or the acquire timeout elapses, in
//! which case the caller gets `ResourceExhausted` instead of waiting forever.

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use lore_core::config::StorageConfig;
use lore_core::error::{LoreError, Result};

use crate::migrations;

/// Pool of SQLite connections sharing one database file.
pub struct Database {
    idle: Mutex<Vec<Connection>>,
    permits: Semaphore,
    size: usize,
    acquire_timeout: Duration,
}

/// A connection checked out of the pool. Returned on drop.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a Database,
    _permit: SemaphorePermit<'a>,
}

impl Database {
    /// Open (or create) a database at the given path with `config.pool_size`
    /// connections.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys and the busy
    /// timeout on every connection, and runs pending migrations once.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let size = config.pool_size.max(1);
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open(path)
                .map_err(|e| LoreError::Storage(format!("Failed to open database: {}", e)))?;
            configure(&conn, config.busy_timeout())?;
            conns.push(conn);
        }

        if let Some(first) = conns.first() {
            migrations::run_migrations(first)?;
        }

        info!(pool_size = size, "Database opened at {}", path.display());
        Ok(Self::from_connections(conns, config.acquire_timeout()))
    }

    /// Open an in-memory database (for testing).
    ///
    /// An in-memory database lives inside a single connection, so the pool
    /// has exactly one slot.
    pub fn in_memory() -> Result<Self> {
        let config = StorageConfig::default();
        let conn = Connection::open_in_memory()
            .map_err(|e| LoreError::Storage(format!("Failed to open in-memory db: {}", e)))?;
        configure(&conn, config.busy_timeout())?;
        migrations::run_migrations(&conn)?;
        Ok(Self::from_connections(vec![conn], config.acquire_timeout()))
    }

    fn from_connections(conns: Vec<Connection>, acquire_timeout: Duration) -> Self {
        let size = conns.len();
        Self {
            idle: Mutex::new(conns),
            permits: Semaphore::new(size),
            size,
            acquire_timeout,
        }
    }

    /// Number of connections in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Check out a connection, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<'_>> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Check out a connection, waiting at most `timeout`.
    pub async fn acquire_within(&self, timeout: Duration) -> Result<PooledConnection<'_>> {
        let permit = match tokio::time::timeout(timeout, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(LoreError::Storage("connection pool closed".into())),
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    pool_size = self.size,
                    "Connection pool exhausted"
                );
                return Err(LoreError::ResourceExhausted {
                    resource: "connection_pool",
                    retry_after: timeout,
                });
            }
        };

        let conn = self
            .idle
            .lock()
            .map_err(|e| LoreError::Storage(format!("Pool lock poisoned: {}", e)))?
            .pop()
            .ok_or_else(|| LoreError::Storage("permit granted but no idle connection".into()))?;

        debug!(available = self.available(), "Connection acquired");
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
            _permit: permit,
        })
    }

    /// Execute a closure with a pooled connection, using the default timeout.
    ///
    /// The closure runs synchronously; the connection returns to the pool as
    /// soon as it finishes.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        self.with_conn_within(self.acquire_timeout, f).await
    }

    /// Execute a closure with a pooled connection acquired within `timeout`.
    ///
    /// On a multi-threaded runtime the closure runs under
    /// [`tokio::task::block_in_place`], so a long query or a write waiting on
    /// the busy timeout does not stall the other tasks on this worker.
    pub async fn with_conn_within<F, T>(&self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.acquire_within(timeout).await?;
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| f(&mut conn))
            }
            _ => f(&mut conn),
        }
    }
}

fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA cache_size = -65536;",
    )
    .map_err(|e| LoreError::Storage(format!("Failed to set pragmas: {}", e)))?;
    conn.busy_timeout(busy_timeout)
        .map_err(|e| LoreError::Storage(format!("Failed to set busy timeout: {}", e)))?;
    Ok(())
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            match self.pool.idle.lock() {
                Ok(mut idle) => idle.push(conn),
                Err(poisoned) => poisoned.into_inner().push(conn),
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("size", &self.size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM characters", [], |row| row.get(0))
                    .map_err(|e| LoreError::Storage(e.to_string()))
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(db.size(), 1);
    }

    #[tokio::test]
    async fn test_file_database_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("lore.db");
        let config = StorageConfig {
            pool_size: 3,
            ..Default::default()
        };
        let db = Database::open(&path, &config).unwrap();
        assert_eq!(db.size(), 3);
        assert!(path.exists());

        let a = db.acquire().await.unwrap();
        let b = db.acquire().await.unwrap();
        assert_eq!(db.available(), 1);
        drop(a);
        drop(b);
        assert_eq!(db.available(), 3);
    }

    #[tokio::test]
    async fn test_acquire_timeout_is_resource_exhausted() {
        let db = Database::in_memory().unwrap();
        let held = db.acquire().await.unwrap();

        let err = db
            .acquire_within(Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            LoreError::ResourceExhausted {
                resource: "connection_pool",
                ..
            }
        ));
        assert!(err.is_retryable());

        drop(held);
        assert!(db.acquire_within(Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_connection() {
        let db = std::sync::Arc::new(Database::in_memory().unwrap());
        let held = db.acquire().await.unwrap();

        let db2 = db.clone();
        let waiter = tokio::spawn(async move {
            db2.acquire_within(Duration::from_secs(2))
                .await
                .map(|_| ())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_slow_query_does_not_stall_other_tasks() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let db = Arc::new(Database::in_memory().unwrap());
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let slow = {
            let (db, started, finished) = (db.clone(), started.clone(), finished.clone());
            tokio::spawn(async move {
                db.with_conn(|_| {
                    started.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(300));
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await
            })
        };
        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        // The only worker is inside the query; this task still gets to run.
        let finished_seen = finished.clone();
        let other = tokio::spawn(async move { finished_seen.load(Ordering::SeqCst) });
        assert!(!other.await.unwrap());
        slow.await.unwrap().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();
        let fk: i64 = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| LoreError::Storage(e.to_string()))
            })
            .await
            .unwrap();
        assert_eq!(fk, 1);
    }
}
