//! Durable append-only buffer of recent messages.
//!
//! Backed by a single SQLite file in WAL mode with `synchronous=FULL`, so an
//! acknowledged append is on disk. The store is the system's single source
//! of truth for message ordering: ids are minted here, and a message is
//! visible to recipients iff its row has been persisted.

use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;

use parlor_common::MessageIdGenerator;

use crate::error::StoreError;

/// Appends past `cap + GUARD` rows in one room trigger an inline cap sweep
/// instead of waiting for the next scheduled pass.
const CAP_SWEEP_GUARD: u32 = 50;

/// A persisted chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// 26-char ULID; lexicographic order is persistence order.
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    /// Name in effect when the message was sent. Never rewritten.
    pub display_name: String,
    pub text: String,
    pub mentions: Option<Vec<String>>,
    /// Milliseconds since epoch, derived from `id`.
    pub ts: i64,
}

pub struct HistoryStore {
    pool: SqlitePool,
    ids: MessageIdGenerator,
    retention_ttl: Duration,
    per_room_cap: u32,
}

impl HistoryStore {
    /// Open (creating if missing) the history database and apply the schema.
    pub async fn connect(
        database_path: &str,
        retention_ttl: Duration,
        per_room_cap: u32,
    ) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                text TEXT NOT NULL,
                mentions TEXT,
                ts INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_room_ts ON messages (room_id, ts DESC)",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages (ts)")
            .execute(&pool)
            .await?;

        tracing::info!(database_path, "history store opened");

        Ok(Self {
            pool,
            ids: MessageIdGenerator::new(),
            retention_ttl,
            per_room_cap,
        })
    }

    /// Assign an id and timestamp, persist the row, return the record.
    pub async fn append(
        &self,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        text: &str,
        mentions: Option<Vec<String>>,
    ) -> Result<Message, StoreError> {
        let (id, ts) = self.ids.generate_with_ts();
        let mentions_json = mentions
            .as_ref()
            .filter(|m| !m.is_empty())
            .map(|m| serde_json::to_string(m).expect("serialize mention list"));

        sqlx::query(
            "INSERT INTO messages (id, room_id, user_id, display_name, text, mentions, ts)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(room_id)
        .bind(user_id)
        .bind(display_name)
        .bind(text)
        .bind(&mentions_json)
        .bind(ts)
        .execute(&self.pool)
        .await?;

        // A hot room can outrun the scheduled sweep; re-establish the cap
        // inline once the overshoot passes the guard threshold.
        let count = self.room_count(room_id).await?;
        if count > i64::from(self.per_room_cap + CAP_SWEEP_GUARD) {
            let trimmed = self.sweep_room_cap(room_id).await?;
            tracing::debug!(room_id, trimmed, "inline cap sweep");
        }

        Ok(Message {
            id,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            text: text.to_string(),
            mentions: mentions.filter(|m| !m.is_empty()),
            ts,
        })
    }

    /// Up to `limit` most recent rows for the room, oldest-first.
    pub async fn recent(&self, room_id: &str, limit: u32) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, room_id, user_id, display_name, text, mentions, ts
             FROM messages WHERE room_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(room_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(row_to_message).collect();
        messages.reverse(); // ascending (chronological) order
        Ok(messages)
    }

    /// Every row for the room with `ts > ts_exclusive`, oldest-first.
    pub async fn since(&self, room_id: &str, ts_exclusive: i64) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, room_id, user_id, display_name, text, mentions, ts
             FROM messages WHERE room_id = ? AND ts > ? ORDER BY id ASC",
        )
        .bind(room_id)
        .bind(ts_exclusive)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    /// Up to `limit` rows with id strictly preceding `id_exclusive`,
    /// oldest-first.
    pub async fn before(
        &self,
        room_id: &str,
        id_exclusive: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, room_id, user_id, display_name, text, mentions, ts
             FROM messages WHERE room_id = ? AND id < ? ORDER BY id DESC LIMIT ?",
        )
        .bind(room_id)
        .bind(id_exclusive)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<Message> = rows.into_iter().map(row_to_message).collect();
        messages.reverse();
        Ok(messages)
    }

    /// Apply retention: TTL expiry first, then the per-room cap.
    /// Returns `(ttl_deleted, cap_deleted)`.
    pub async fn sweep(&self, now_ms: i64) -> Result<(u64, u64), StoreError> {
        let cutoff = now_ms - self.retention_ttl.as_millis() as i64;
        let ttl_deleted = sqlx::query("DELETE FROM messages WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        let rooms: Vec<String> = sqlx::query("SELECT DISTINCT room_id FROM messages")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get("room_id"))
            .collect();

        let mut cap_deleted = 0;
        for room_id in rooms {
            cap_deleted += self.sweep_room_cap(&room_id).await?;
        }

        Ok((ttl_deleted, cap_deleted))
    }

    /// Cheap storage reachability probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Number of rows currently stored for the room.
    pub async fn room_count(&self, room_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE room_id = ?")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Keep only the newest `per_room_cap` rows in the room.
    async fn sweep_room_cap(&self, room_id: &str) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            "DELETE FROM messages WHERE room_id = ? AND id NOT IN (
                SELECT id FROM messages WHERE room_id = ? ORDER BY id DESC LIMIT ?
            )",
        )
        .bind(room_id)
        .bind(room_id)
        .bind(i64::from(self.per_room_cap))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }
}

fn row_to_message(row: SqliteRow) -> Message {
    let mentions: Option<String> = row.get("mentions");
    Message {
        id: row.get("id"),
        room_id: row.get("room_id"),
        user_id: row.get("user_id"),
        display_name: row.get("display_name"),
        text: row.get("text"),
        mentions: mentions.and_then(|m| serde_json::from_str(&m).ok()),
        ts: row.get("ts"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path() -> String {
        std::env::temp_dir()
            .join(format!("parlor-history-{}.db", ulid::Ulid::new()))
            .to_string_lossy()
            .into_owned()
    }

    async fn open_store(cap: u32) -> HistoryStore {
        HistoryStore::connect(&temp_db_path(), Duration::from_secs(86_400), cap)
            .await
            .expect("open store")
    }

    async fn fill(store: &HistoryStore, room: &str, n: usize) -> Vec<Message> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(
                store
                    .append(room, "usr_a", "Alice", &format!("msg {i}"), None)
                    .await
                    .unwrap(),
            );
        }
        out
    }

    #[tokio::test]
    async fn append_assigns_monotonic_ids_consistent_with_ts() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 50).await;

        for pair in msgs.windows(2) {
            assert!(pair[0].id < pair[1].id, "id order broke");
            assert!(pair[0].ts <= pair[1].ts, "ts order broke");
        }
        assert_eq!(msgs[0].id.len(), 26);
    }

    #[tokio::test]
    async fn recent_returns_newest_rows_oldest_first() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 10).await;

        let page = store.recent("default", 4).await.unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].id, msgs[6].id);
        assert_eq!(page[3].id, msgs[9].id);
    }

    #[tokio::test]
    async fn recent_is_scoped_to_the_room() {
        let store = open_store(500).await;
        fill(&store, "default", 3).await;
        fill(&store, "lounge", 2).await;

        assert_eq!(store.recent("default", 100).await.unwrap().len(), 3);
        assert_eq!(store.recent("lounge", 100).await.unwrap().len(), 2);
        assert!(store.recent("empty", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn since_is_exclusive_of_the_cursor_ts() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 5).await;

        // Resume from m3's ts: only rows with a strictly greater ts return.
        let resumed = store.since("default", msgs[2].ts).await.unwrap();
        assert!(resumed.iter().all(|m| m.ts > msgs[2].ts));
        assert!(!resumed.iter().any(|m| m.id == msgs[2].id));
        // Everything after m3 with a later ts is present, in order.
        for pair in resumed.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn before_pages_backward_exclusively() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 10).await;

        let page = store.before("default", &msgs[7].id, 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].id, msgs[4].id);
        assert_eq!(page[2].id, msgs[6].id);
        assert!(!page.iter().any(|m| m.id == msgs[7].id));

        // Paging before the very first id yields nothing.
        let empty = store.before("default", &msgs[0].id, 3).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn sweep_enforces_per_room_cap() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 501).await;

        let (_ttl, cap) = store
            .sweep(chrono::Utc::now().timestamp_millis())
            .await
            .unwrap();
        assert_eq!(cap, 1);

        let kept = store.recent("default", 1000).await.unwrap();
        assert_eq!(kept.len(), 500);
        assert!(!kept.iter().any(|m| m.id == msgs[0].id));
    }

    #[tokio::test]
    async fn sweep_enforces_ttl() {
        let store = open_store(500).await;
        let msgs = fill(&store, "default", 5).await;

        // A "now" far enough in the future puts every row past the TTL.
        let future = msgs[4].ts + 86_400_000 + 1_000;
        let (ttl, _cap) = store.sweep(future).await.unwrap();
        assert_eq!(ttl, 5);
        assert!(store.recent("default", 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_caps_each_room_independently() {
        let store = open_store(3).await;
        fill(&store, "a", 5).await;
        fill(&store, "b", 2).await;

        store
            .sweep(chrono::Utc::now().timestamp_millis())
            .await
            .unwrap();
        assert_eq!(store.room_count("a").await.unwrap(), 3);
        assert_eq!(store.room_count("b").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn append_triggers_inline_cap_sweep_past_guard() {
        let store = open_store(3).await;
        // 3 (cap) + 50 (guard) + 1 appends crosses the inline threshold.
        fill(&store, "default", 54).await;
        assert_eq!(store.room_count("default").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn display_name_snapshot_survives_renames() {
        let store = open_store(500).await;
        store
            .append("default", "usr_a", "Alice", "before rename", None)
            .await
            .unwrap();
        store
            .append("default", "usr_a", "Alicia", "after rename", None)
            .await
            .unwrap();

        let rows = store.recent("default", 10).await.unwrap();
        assert_eq!(rows[0].display_name, "Alice");
        assert_eq!(rows[1].display_name, "Alicia");
    }

    #[tokio::test]
    async fn mentions_round_trip_through_storage() {
        let store = open_store(500).await;
        store
            .append(
                "default",
                "usr_a",
                "Alice",
                "hello @Bob",
                Some(vec!["usr_b".to_string()]),
            )
            .await
            .unwrap();
        store
            .append("default", "usr_a", "Alice", "no mentions", Some(vec![]))
            .await
            .unwrap();

        let rows = store.recent("default", 10).await.unwrap();
        assert_eq!(rows[0].mentions, Some(vec!["usr_b".to_string()]));
        // An empty resolved set is stored (and returned) as absent.
        assert_eq!(rows[1].mentions, None);
    }

    #[tokio::test]
    async fn unicode_text_round_trips() {
        let store = open_store(500).await;
        let text = "héllo 👋\nsecond line — ok";
        store
            .append("default", "usr_a", "Alice", text, None)
            .await
            .unwrap();

        let rows = store.recent("default", 1).await.unwrap();
        assert_eq!(rows[0].text, text);
    }
}
