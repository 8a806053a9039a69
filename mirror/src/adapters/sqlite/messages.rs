use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode};
use std::collections::HashSet;

use super::DbPool;
use crate::error::MirrorError;

/// One row of the `messages` table. Identity is (mailbox, uid, generation).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub mailbox: String,
    pub uid: u32,
    pub generation: u32,
    pub encoded: Vec<u8>,
    pub message_id: Option<String>,
    pub date: Option<i64>,             // unix epoch ms, None when unknown
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub has_attachments: bool,
    pub imap_flags: Vec<String>,
    pub gmail_labels: Vec<String>,
    pub gmail_thread_id: Option<u64>,
    pub gmail_message_id: Option<u64>,
    pub internal_date: Option<i64>,    // unix epoch ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The (mailbox, uid, uidvalidity) row already exists; nothing was written.
    Duplicate,
}

const INSERT_MESSAGE: &str = "INSERT INTO messages (
        mailbox, uid, uidvalidity, encoded,
        message_id, date, from_address, subject, has_attachments,
        imap_flags, gmail_labels, gmail_thread_id, gmail_message_id,
        internal_date, size_bytes, fetched_at
    ) VALUES (
        ?1, ?2, ?3, ?4,
        ?5, ?6, ?7, ?8, ?9,
        ?10, ?11, ?12, ?13,
        ?14, ?15, ?16
    )";

/// Insert one row. Never updates: an existing row is reported as
/// [`InsertOutcome::Duplicate`].
pub fn insert_message(conn: &Connection, msg: &StoredMessage) -> Result<InsertOutcome, MirrorError> {
    let mut stmt = conn.prepare_cached(INSERT_MESSAGE)?;
    let now = chrono::Utc::now().timestamp_millis();

    let result = stmt.execute(params![
        msg.mailbox,
        msg.uid,
        msg.generation,
        msg.encoded,
        msg.message_id,
        msg.date,
        msg.from_address,
        msg.subject,
        msg.has_attachments as i32,
        serde_json::to_string(&msg.imap_flags)?,
        serde_json::to_string(&msg.gmail_labels)?,
        msg.gmail_thread_id.map(|id| id as i64),
        msg.gmail_message_id.map(|id| id as i64),
        msg.internal_date,
        msg.encoded.len() as i64,
        now,
    ]);

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

/// Holds one pooled connection for the lifetime of a mailbox run so every
/// insert goes through the same prepared statement.
pub struct MessageWriter {
    conn: PooledConnection<SqliteConnectionManager>,
}

impl MessageWriter {
    pub fn new(pool: &DbPool) -> Result<Self, MirrorError> {
        Ok(Self { conn: pool.get()? })
    }

    pub fn insert(&self, msg: &StoredMessage) -> Result<InsertOutcome, MirrorError> {
        insert_message(&self.conn, msg)
    }
}

/// All UIDs stored for one mailbox generation, ascending.
pub fn get_uids(pool: &DbPool, mailbox: &str, generation: u32) -> Result<Vec<u32>, MirrorError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT uid FROM messages WHERE mailbox = ?1 AND uidvalidity = ?2 ORDER BY uid",
    )?;

    let rows = stmt.query_map(params![mailbox, generation], |row| row.get::<_, u32>(0))?;

    let mut uids = Vec::new();
    for row in rows {
        uids.push(row?);
    }
    Ok(uids)
}

/// Delete the given UIDs of one mailbox generation. Returns rows removed.
pub fn delete_uids(
    pool: &DbPool,
    mailbox: &str,
    generation: u32,
    uids: &[u32],
) -> Result<usize, MirrorError> {
    if uids.is_empty() {
        return Ok(0);
    }

    let conn = pool.get()?;
    let tx = conn.unchecked_transaction()?;
    let mut removed = 0;
    {
        let mut stmt = tx.prepare_cached(
            "DELETE FROM messages WHERE mailbox = ?1 AND uidvalidity = ?2 AND uid = ?3",
        )?;
        let unique: HashSet<u32> = uids.iter().copied().collect();
        for uid in unique {
            removed += stmt.execute(params![mailbox, generation, uid])?;
        }
    }
    tx.commit()?;
    Ok(removed)
}

/// Distinct UIDVALIDITY values stored for a mailbox with their row counts,
/// ascending by generation.
pub fn stored_generations(pool: &DbPool, mailbox: &str) -> Result<Vec<(u32, usize)>, MirrorError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT uidvalidity, COUNT(*) FROM messages WHERE mailbox = ?1
         GROUP BY uidvalidity ORDER BY uidvalidity",
    )?;

    let rows = stmt.query_map(params![mailbox], |row| {
        Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as usize))
    })?;

    let mut generations = Vec::new();
    for row in rows {
        generations.push(row?);
    }
    Ok(generations)
}

/// Delete every row of `mailbox` whose generation is not `keep`.
pub fn delete_other_generations(pool: &DbPool, mailbox: &str, keep: u32) -> Result<usize, MirrorError> {
    let conn = pool.get()?;
    let removed = conn.execute(
        "DELETE FROM messages WHERE mailbox = ?1 AND uidvalidity != ?2",
        params![mailbox, keep],
    )?;
    Ok(removed)
}

pub fn count_messages(pool: &DbPool, mailbox: &str, generation: u32) -> Result<usize, MirrorError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE mailbox = ?1 AND uidvalidity = ?2",
        params![mailbox, generation],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
