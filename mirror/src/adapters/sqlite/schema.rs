use rusqlite::Connection;

use crate::error::MirrorError;

pub fn initialize_schema(conn: &Connection) -> Result<(), MirrorError> {
    conn.execute_batch("
        -- Raw message store (one row per mailbox/uid/uidvalidity)
        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY,
            mailbox          TEXT NOT NULL,
            uid              INTEGER NOT NULL,
            uidvalidity      INTEGER NOT NULL,
            encoded          BLOB NOT NULL,      -- raw RFC 5322 bytes as served

            -- Convenience fields, best effort
            message_id       TEXT,
            date             INTEGER,            -- unix epoch ms, NULL when unknown
            from_address     TEXT,
            subject          TEXT,
            has_attachments  INTEGER NOT NULL DEFAULT 0,

            -- Protocol metadata
            imap_flags       TEXT NOT NULL DEFAULT '[]',  -- JSON array
            gmail_labels     TEXT NOT NULL DEFAULT '[]',  -- JSON array, empty for non-Gmail
            gmail_thread_id  INTEGER,
            gmail_message_id INTEGER,
            internal_date    INTEGER,            -- unix epoch ms
            size_bytes       INTEGER NOT NULL,
            fetched_at       INTEGER NOT NULL,

            UNIQUE(mailbox, uid, uidvalidity)
        );

        -- Preflight loads every uid of a mailbox generation
        CREATE INDEX IF NOT EXISTS idx_messages_generation ON messages(mailbox, uidvalidity, uid);
        CREATE INDEX IF NOT EXISTS idx_messages_message_id ON messages(message_id);
    ")?;

    Ok(())
}
