//! IMAP access, always read-only.
//!
//! The engine talks to the server through [`Connector`] and [`MailClient`];
//! [`connection::ImapConnector`] is the async-imap implementation. Mailboxes
//! are only ever opened with EXAMINE and bodies fetched with BODY.PEEK, so
//! mirroring never changes server state.

use async_trait::async_trait;

use crate::error::MirrorError;

pub mod connection;
pub mod fetch;
pub mod folders;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use folders::FolderInfo;
pub use session::MailboxSession;

/// One FETCH response, before it is turned into a stored row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub uid: u32,
    pub body: Vec<u8>,
    pub flags: Vec<String>,
    /// INTERNALDATE as unix epoch ms
    pub internal_date: Option<i64>,
    pub gmail_labels: Vec<String>,
    pub gmail_thread_id: Option<u64>,
    pub gmail_message_id: Option<u64>,
}

/// An authenticated IMAP session.
#[async_trait]
pub trait MailClient: Send {
    /// LIST "" "*"
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>, MirrorError>;

    /// EXAMINE `mailbox` and return the UIDVALIDITY the server reported.
    async fn examine(&mut self, mailbox: &str) -> Result<Option<u32>, MirrorError>;

    /// UID SEARCH UID 1:* on the examined mailbox, ascending.
    async fn uid_search_all(&mut self) -> Result<Vec<u32>, MirrorError>;

    /// UID FETCH of raw bodies (peek), flags, internal date and provider
    /// extensions for `uids` in the examined mailbox. UIDs the server no
    /// longer has are silently absent from the result.
    async fn uid_fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MirrorError>;

    async fn logout(&mut self);
}

/// Opens new [`MailClient`] sessions. Shared by all workers.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: MailClient + Sync + 'static;

    async fn connect(&self) -> Result<Self::Client, MirrorError>;
}
