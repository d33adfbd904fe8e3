//! SQLite-backed spill store for disk-assisted queues.
//!
//! Rows are appended in FIFO order and read through an in-memory cursor.
//! Consumed rows are deleted at each checkpoint, so a crash between
//! checkpoints re-delivers at most the rows read since the last one.

use lf_common::{Message, QueueConfig};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::{QueueError, Result};

pub struct DiskStore {
    pool: SqlitePool,
    path: PathBuf,
    read_cursor: Option<i64>,
    rows: usize,
    bytes: u64,
    max_bytes: u64,
    persist_every: u64,
    since_checkpoint: u64,
}

impl DiskStore {
    /// Opens (or creates) the store and recovers any rows left by a previous run.
    pub async fn open(path: impl Into<PathBuf>, config: &QueueConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Persistence(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let synchronous = if config.sync_queue_files {
            SqliteSynchronous::Full
        } else {
            SqliteSynchronous::Normal
        };
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(synchronous);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let mut store = Self {
            pool,
            path,
            read_cursor: None,
            rows: 0,
            bytes: 0,
            max_bytes: config.max_disk_space,
            persist_every: config.persist_update_count,
            since_checkpoint: 0,
        };
        store.create_schema().await?;
        store.recover().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spill (
                seq INTEGER PRIMARY KEY,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover(&mut self) -> Result<()> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, COALESCE(SUM(LENGTH(payload)), 0) AS bytes FROM spill",
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        let bytes: i64 = row.get("bytes");
        self.rows = n.max(0) as usize;
        self.bytes = bytes.max(0) as u64;
        if self.rows > 0 {
            info!(path = %self.path.display(), rows = self.rows, "Recovered disk-assist queue content");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Appends one message. Returns `false` when it would exceed the configured disk space.
    pub async fn append(&mut self, message: &Message) -> Result<bool> {
        let payload = serde_json::to_string(message)?;
        if self.max_bytes > 0 && self.bytes + payload.len() as u64 > self.max_bytes {
            return Ok(false);
        }
        sqlx::query("INSERT INTO spill (payload) VALUES (?)")
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        self.rows += 1;
        self.bytes += payload.len() as u64;
        Ok(true)
    }

    /// Reads up to `max` messages past the cursor, oldest first.
    pub async fn read_batch(&mut self, max: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT seq, payload FROM spill WHERE seq > ? ORDER BY seq LIMIT ?")
            .bind(self.read_cursor.unwrap_or(i64::MIN))
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await?;

        if rows.is_empty() {
            // counters drifted from the file; trust the file
            self.rows = 0;
            return Ok(Vec::new());
        }

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.get("seq");
            let payload: String = row.get("payload");
            self.read_cursor = Some(seq);
            self.rows = self.rows.saturating_sub(1);
            self.bytes = self.bytes.saturating_sub(payload.len() as u64);
            match serde_json::from_str::<Message>(&payload) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(seq, error = %e, "Skipping unreadable disk-assist record"),
            }
        }

        self.since_checkpoint += rows.len() as u64;
        if self.persist_every > 0 && self.since_checkpoint >= self.persist_every {
            self.checkpoint().await?;
        }
        Ok(messages)
    }

    /// Deletes every row read so far.
    ///
    /// The cursor is cleared afterwards: nothing at or below it is left, and
    /// rows written later (prepended or reusing freed sequence numbers) may
    /// sort below the old position.
    pub async fn checkpoint(&mut self) -> Result<()> {
        if let Some(cursor) = self.read_cursor.take() {
            let result = sqlx::query("DELETE FROM spill WHERE seq <= ?")
                .bind(cursor)
                .execute(&self.pool)
                .await?;
            debug!(path = %self.path.display(), removed = result.rows_affected(), "Disk-assist checkpoint");
        }
        self.since_checkpoint = 0;
        Ok(())
    }

    /// Stores `messages` ahead of everything already on disk, keeping their order.
    pub async fn prepend(&mut self, messages: Vec<Message>) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }
        self.checkpoint().await?;

        let first: Option<i64> = sqlx::query("SELECT MIN(seq) AS first FROM spill")
            .fetch_one(&self.pool)
            .await?
            .get("first");
        let start = first.unwrap_or(1) - messages.len() as i64;

        let mut tx = self.pool.begin().await?;
        for (offset, message) in messages.iter().enumerate() {
            let payload = serde_json::to_string(message)?;
            sqlx::query("INSERT INTO spill (seq, payload) VALUES (?, ?)")
                .bind(start + offset as i64)
                .bind(&payload)
                .execute(&mut *tx)
                .await?;
            self.bytes += payload.len() as u64;
        }
        tx.commit().await?;

        self.rows += messages.len();
        Ok(messages.len())
    }

    /// Final checkpoint, then closes the connection pool.
    pub async fn close(mut self) -> Result<()> {
        self.checkpoint().await?;
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> QueueConfig {
        QueueConfig {
            file_prefix: Some("test".to_string()),
            ..QueueConfig::in_memory(10)
        }
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let dir = tempdir().unwrap();
        let mut store = DiskStore::open(dir.path().join("q.qdb"), &config()).await.unwrap();

        for i in 0..5 {
            assert!(store.append(&Message::new(format!("m{}", i))).await.unwrap());
        }
        assert_eq!(store.len(), 5);

        let first = store.read_batch(3).await.unwrap();
        let second = store.read_batch(3).await.unwrap();
        let payloads: Vec<_> = first.iter().chain(second.iter()).map(|m| m.payload().into_owned()).collect();
        assert_eq!(payloads, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_unread_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.qdb");
        {
            let mut store = DiskStore::open(&path, &config()).await.unwrap();
            for i in 0..4 {
                store.append(&Message::new(format!("m{}", i))).await.unwrap();
            }
            store.read_batch(1).await.unwrap();
            store.close().await.unwrap();
        }

        let mut store = DiskStore::open(&path, &config()).await.unwrap();
        assert_eq!(store.len(), 3);
        let rest = store.read_batch(10).await.unwrap();
        assert_eq!(rest[0].payload(), "m1");
    }

    #[tokio::test]
    async fn test_uncheckpointed_reads_are_redelivered() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.qdb");
        {
            let mut store = DiskStore::open(&path, &config()).await.unwrap();
            store.append(&Message::new("a")).await.unwrap();
            store.append(&Message::new("b")).await.unwrap();
            store.read_batch(1).await.unwrap();
            // dropped without close: simulates a crash
        }
        let store = DiskStore::open(&path, &config()).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_persist_update_count_checkpoints() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.qdb");
        let config = QueueConfig { persist_update_count: 1, ..config() };
        {
            let mut store = DiskStore::open(&path, &config).await.unwrap();
            store.append(&Message::new("a")).await.unwrap();
            store.append(&Message::new("b")).await.unwrap();
            store.read_batch(1).await.unwrap();
        }
        let store = DiskStore::open(&path, &config).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_max_disk_space() {
        let dir = tempdir().unwrap();
        let config = QueueConfig { max_disk_space: 1, ..config() };
        let mut store = DiskStore::open(dir.path().join("q.qdb"), &config).await.unwrap();
        assert!(!store.append(&Message::new("too big")).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_prepend_goes_first() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.qdb");
        {
            let mut store = DiskStore::open(&path, &config()).await.unwrap();
            store.append(&Message::new("spilled")).await.unwrap();
            store
                .prepend(vec![Message::new("mem-1"), Message::new("mem-2")])
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        let mut store = DiskStore::open(&path, &config()).await.unwrap();
        let all = store.read_batch(10).await.unwrap();
        let payloads: Vec<_> = all.iter().map(|m| m.payload().into_owned()).collect();
        assert_eq!(payloads, vec!["mem-1", "mem-2", "spilled"]);
    }

    #[tokio::test]
    async fn test_prepend_after_read_survives_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("q.qdb");
        {
            let mut store = DiskStore::open(&path, &config()).await.unwrap();
            store.append(&Message::new("a")).await.unwrap();
            store.append(&Message::new("b")).await.unwrap();
            store.read_batch(1).await.unwrap();
            assert_eq!(store.prepend(vec![Message::new("saved")]).await.unwrap(), 1);
            store.close().await.unwrap();
        }
        let mut store = DiskStore::open(&path, &config()).await.unwrap();
        assert_eq!(store.len(), 2);
        let all = store.read_batch(10).await.unwrap();
        let payloads: Vec<_> = all.iter().map(|m| m.payload().into_owned()).collect();
        assert_eq!(payloads, vec!["saved", "b"]);
    }

    #[tokio::test]
    async fn test_rows_appended_after_emptying_checkpoint_are_read() {
        let dir = tempdir().unwrap();
        let mut store = DiskStore::open(dir.path().join("q.qdb"), &config()).await.unwrap();
        store.append(&Message::new("first")).await.unwrap();
        store.read_batch(10).await.unwrap();
        store.checkpoint().await.unwrap();

        // the emptied table may hand out the same sequence number again
        store.append(&Message::new("second")).await.unwrap();
        let next = store.read_batch(10).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload(), "second");
    }
}
