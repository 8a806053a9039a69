use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Connection resets, TLS/stream read errors and timeouts. Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered NO/BAD or sent something we could not use.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Server did not report UIDVALIDITY for {mailbox}")]
    GenerationUnavailable { mailbox: String },

    #[error("UIDVALIDITY of {mailbox} changed from {expected} to {actual}")]
    GenerationChanged {
        mailbox: String,
        expected: u32,
        actual: u32,
    },

    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Row already stored: {mailbox} uid={uid} uidvalidity={generation}")]
    Duplicate {
        mailbox: String,
        uid: u32,
        generation: u32,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Interrupted")]
    Interrupted,
}

impl MirrorError {
    /// Whether reconnecting and re-issuing the command may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, MirrorError::Network(_))
    }
}

// Event payloads carry errors as plain strings.
impl Serialize for MirrorError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl From<r2d2::Error> for MirrorError {
    fn from(e: r2d2::Error) -> Self {
        MirrorError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for MirrorError {
    fn from(e: rusqlite::Error) -> Self {
        MirrorError::Database(e.to_string())
    }
}

impl From<std::io::Error> for MirrorError {
    fn from(e: std::io::Error) -> Self {
        MirrorError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for MirrorError {
    fn from(e: toml::de::Error) -> Self {
        MirrorError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        MirrorError::Parse(e.to_string())
    }
}

impl From<async_imap::error::Error> for MirrorError {
    fn from(e: async_imap::error::Error) -> Self {
        use async_imap::error::Error;
        match e {
            Error::Io(e) => MirrorError::Network(e.to_string()),
            Error::ConnectionLost => MirrorError::Network("connection lost".into()),
            other => MirrorError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
