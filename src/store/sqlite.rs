//! SQLite-backed [`ConversionStore`].
//!
//! ## Why one connection per operation?
//!
//! `rusqlite::Connection` is blocking and `!Sync`. Each operation opens its
//! own connection inside `spawn_blocking`, so lookups from many tasks proceed
//! in parallel under WAL and no connection is ever shared across threads.
//! Opening a SQLite connection to an existing file costs microseconds; the
//! blob reads dominate.
//!
//! ## Atomicity and idempotence
//!
//! An insert is a single `BEGIN IMMEDIATE` transaction: the existence check
//! and the row write happen under SQLite's write lock, so two processes
//! racing on the same digest serialise and the loser sees the winner's row.
//! Both hash columns also carry `UNIQUE` constraints as a last line of
//! defence. Any error rolls the transaction back; a half-written row is never
//! visible.

use super::{BlobEntry, CachedConversion, ConversionStore, Counterpart, InsertOutcome};
use crate::config::CacheConfig;
use crate::error::StoreError;
use crate::fingerprint::Digest;
use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    format_a_hash  TEXT NOT NULL UNIQUE,
    format_a_blob  BLOB NOT NULL,
    format_b_hash  TEXT NOT NULL UNIQUE,
    format_b_blob  BLOB NOT NULL,
    created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);
";

const SELECT_COLUMNS: &str =
    "id, format_a_hash, format_a_blob, format_b_hash, format_b_blob, created_at";

/// Conversion store persisted in a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    op_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// `busy_timeout` bounds how long SQLite waits for another writer's lock;
    /// `op_timeout` bounds each whole async operation.
    pub async fn open(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
            op_timeout,
        };

        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Unavailable(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        store.run("migrate", migrate).await?;
        info!("Conversion store ready at {}", store.path.display());
        Ok(store)
    }

    /// Open the store described by `config`.
    pub async fn from_config(config: &CacheConfig) -> Result<Self, StoreError> {
        Self::open(
            &config.db_path,
            Duration::from_millis(config.sqlite_busy_timeout_ms),
            Duration::from_secs(config.store_timeout_secs),
        )
        .await
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on a fresh connection in the blocking pool, bounded by the
    /// operation timeout.
    ///
    /// On timeout the blocking task is detached, not killed: an insert that
    /// commits late is still a valid record.
    async fn run<T, F>(&self, what: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        let busy = self.busy_timeout;
        let handle = tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path, busy)?;
            op(&mut conn)
        });

        match tokio::time::timeout(self.op_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StoreError::Unavailable(format!("{what} task failed: {join}"))),
            Err(_) => Err(StoreError::Unavailable(format!(
                "{what} timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let conn = Connection::open(path).map_err(|e| {
        StoreError::Unavailable(format!("cannot open {}: {e}", path.display()))
    })?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    debug!("SQLite journal mode: {mode}");

    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "database schema version {version} is newer than supported version {SCHEMA_VERSION}"
        )));
    }

    conn.execute_batch(SCHEMA)?;
    conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    Ok(())
}

/// Raw column values, before digest parsing.
struct RawRow {
    id: i64,
    a_hash: String,
    a_blob: Vec<u8>,
    b_hash: String,
    b_blob: Vec<u8>,
    created_at: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            a_hash: row.get(1)?,
            a_blob: row.get(2)?,
            b_hash: row.get(3)?,
            b_blob: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<CachedConversion, StoreError> {
        let id = self.id;
        let parse = |column: &str, hex: &str| {
            Digest::from_hex(hex).map_err(|e| StoreError::Corrupt {
                id,
                detail: format!("{column}: {e}"),
            })
        };
        Ok(CachedConversion {
            id,
            format_a_hash: parse("format_a_hash", &self.a_hash)?,
            format_a_blob: Bytes::from(self.a_blob),
            format_b_hash: parse("format_b_hash", &self.b_hash)?,
            format_b_blob: Bytes::from(self.b_blob),
            created_at: self.created_at,
        })
    }
}

#[async_trait]
impl ConversionStore for SqliteStore {
    async fn lookup(&self, digest: &Digest) -> Result<Option<Counterpart>, StoreError> {
        let digest = *digest;
        self.run("lookup", move |conn| {
            let sql = format!(
                "SELECT {SELECT_COLUMNS} FROM conversions \
                 WHERE format_a_hash = ?1 OR format_b_hash = ?1 LIMIT 1"
            );
            let raw = conn
                .query_row(&sql, params![digest.to_hex()], RawRow::from_row)
                .optional()?;

            let Some(raw) = raw else {
                return Ok(None);
            };
            let record = raw.into_record()?;
            record.verify()?;

            record
                .counterpart_of(&digest)
                .map(Some)
                .ok_or_else(|| StoreError::Corrupt {
                    id: record.id,
                    detail: format!("row matched {} but neither hash equals it", digest.short()),
                })
        })
        .await
    }

    async fn insert(
        &self,
        source: BlobEntry,
        target: BlobEntry,
        source_is_format_a: bool,
    ) -> Result<InsertOutcome, StoreError> {
        let (a, b) = if source_is_format_a {
            (source, target)
        } else {
            (target, source)
        };

        self.run("insert", move |conn| {
            let a_hex = a.digest.to_hex();
            let b_hex = b.digest.to_hex();
            let (source_hex, target_hex) = if source_is_format_a {
                (a_hex.as_str(), b_hex.as_str())
            } else {
                (b_hex.as_str(), a_hex.as_str())
            };

            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let known = |hex: &str| -> rusqlite::Result<bool> {
                tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM conversions \
                     WHERE format_a_hash = ?1 OR format_b_hash = ?1)",
                    params![hex],
                    |row| row.get(0),
                )
            };

            if known(source_hex)? {
                debug!(
                    "Record for {} ⇄ {} already present; skipping insert",
                    a.digest.short(),
                    b.digest.short()
                );
                return Ok(InsertOutcome::AlreadyPresent);
            }
            if known(target_hex)? {
                return Ok(InsertOutcome::CounterpartOwned);
            }

            tx.execute(
                "INSERT INTO conversions \
                 (format_a_hash, format_a_blob, format_b_hash, format_b_blob) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![a_hex, &a.bytes[..], b_hex, &b.bytes[..]],
            )?;
            tx.commit()?;

            debug!(
                "Stored record {} ⇄ {} ({} + {} bytes)",
                a.digest.short(),
                b.digest.short(),
                a.bytes.len(),
                b.bytes.len()
            );
            Ok(InsertOutcome::Inserted)
        })
        .await
    }

    async fn len(&self) -> Result<u64, StoreError> {
        self.run("count", |conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM conversions", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::digest;
    use crate::format::Side;
    use tempfile::TempDir;

    fn entry(data: &'static [u8]) -> BlobEntry {
        BlobEntry::new(digest(data), Bytes::from_static(data))
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(
            dir.path().join("conversions.db"),
            Duration::from_millis(500),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn miss_on_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        assert!(store.lookup(&digest(b"hello-doc")).await.unwrap().is_none());
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn lookup_returns_the_other_side_in_both_directions() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let outcome = store
            .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted);

        let hit = store.lookup(&digest(b"hello-doc")).await.unwrap().unwrap();
        assert_eq!(hit.side, Side::B);
        assert_eq!(&hit.bytes[..], b"HELLO-PDF");

        let hit = store.lookup(&digest(b"HELLO-PDF")).await.unwrap().unwrap();
        assert_eq!(hit.side, Side::A);
        assert_eq!(&hit.bytes[..], b"hello-doc");
    }

    #[tokio::test]
    async fn source_is_format_b_lands_in_b_column() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .insert(entry(b"%PDF scan"), entry(b"docx body"), false)
            .await
            .unwrap();

        let conn = Connection::open(store.path()).unwrap();
        let a_hash: String = conn
            .query_row("SELECT format_a_hash FROM conversions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(a_hash, digest(b"docx body").to_hex());
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
            .await
            .unwrap();
        let second = store
            .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::AlreadyPresent);

        // Reverse direction of the same pair is also a duplicate.
        let third = store
            .insert(entry(b"HELLO-PDF"), entry(b"hello-doc"), false)
            .await
            .unwrap();
        assert_eq!(third, InsertOutcome::AlreadyPresent);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn output_owned_by_another_record_is_not_reused() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        store
            .insert(entry(b"doc-one"), entry(b"SAME-PDF"), true)
            .await
            .unwrap();
        let second = store
            .insert(entry(b"doc-two"), entry(b"SAME-PDF"), true)
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::CounterpartOwned);
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.lookup(&digest(b"doc-two")).await.unwrap().is_none());

        // The owning record still answers for its own input.
        let hit = store.lookup(&digest(b"SAME-PDF")).await.unwrap().unwrap();
        assert_eq!(&hit.bytes[..], b"doc-one");
    }

    #[tokio::test]
    async fn racing_identical_inserts_commit_once() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let outcomes = futures::future::join_all(
            (0..10).map(|_| store.insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)),
        )
        .await;

        let inserted = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(InsertOutcome::Inserted)))
            .count();
        let present = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(InsertOutcome::AlreadyPresent)))
            .count();
        assert_eq!(inserted, 1, "outcomes: {outcomes:?}");
        assert_eq!(present, 9, "outcomes: {outcomes:?}");
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_insert_leaves_no_partial_record() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        // Abort after the row is written, before commit.
        let conn = Connection::open(store.path()).unwrap();
        conn.execute_batch(
            "CREATE TRIGGER simulated_fault AFTER INSERT ON conversions \
             BEGIN SELECT RAISE(ABORT, 'simulated storage fault'); END;",
        )
        .unwrap();

        let err = store
            .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)), "got: {err:?}");

        assert!(store.lookup(&digest(b"hello-doc")).await.unwrap().is_none());
        assert!(store.lookup(&digest(b"HELLO-PDF")).await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tampered_blob_is_reported_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        store
            .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
            .await
            .unwrap();

        let conn = Connection::open(store.path()).unwrap();
        conn.execute(
            "UPDATE conversions SET format_b_blob = ?1",
            params![&b"garbage"[..]],
        )
        .unwrap();

        let err = store.lookup(&digest(b"hello-doc")).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            store
                .insert(entry(b"hello-doc"), entry(b"HELLO-PDF"), true)
                .await
                .unwrap();
        }
        let store = open_store(&dir).await;
        let hit = store.lookup(&digest(b"hello-doc")).await.unwrap().unwrap();
        assert_eq!(&hit.bytes[..], b"HELLO-PDF");
    }

    #[tokio::test]
    async fn concurrent_inserts_for_different_digests_both_land() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let (r1, r2) = tokio::join!(
            store.insert(entry(b"one.docx"), entry(b"one.pdf"), true),
            store.insert(entry(b"two.docx"), entry(b"two.pdf"), true),
        );
        assert_eq!(r1.unwrap(), InsertOutcome::Inserted);
        assert_eq!(r2.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unwritable_location_is_unavailable() {
        let dir = TempDir::new().unwrap();
        // A regular file where the parent directory should be.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = SqliteStore::open(
            blocker.join("conversions.db"),
            Duration::from_millis(100),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
