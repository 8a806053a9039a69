//! Eddie Mirror - read-only IMAP to SQLite mirroring
//!
//! Copies every message of an IMAP account into a local SQLite table, once
//! per (mailbox, UID, UIDVALIDITY), without ever changing server state.
//!
//! ## Module Organization
//!
//! - `adapters/`: IMAP wire access and SQLite storage
//! - `services/`: the sync engine (preflight, runner, consistency, orchestrator)
//! - `config/`: settings loading and validation
//! - `error`: crate error type

pub mod adapters;
pub mod config;
pub mod error;
pub mod services;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use adapters::imap::connection::ImapConnector;
pub use config::Settings;
pub use error::{MirrorError, Result};
pub use services::sync::consistency::Confirm;
pub use services::sync::helpers::events::{EventSink, NullSink, RecordingSink, SyncEvent, TracingSink};
pub use services::sync::{MailboxStatus, MailboxSummary, Orchestrator, RunReport};

/// Mirror the account described by `settings` over TLS into its database.
///
/// Settings are validated before the database is opened or any connection
/// is made. `confirm` is consulted for purges that were not configured;
/// pass `None` outside an interactive context.
pub async fn run(
    settings: Settings,
    sink: Arc<dyn EventSink>,
    confirm: Option<Arc<dyn Confirm>>,
    cancel: CancellationToken,
) -> Result<RunReport> {
    settings.validate()?;

    let pool = adapters::sqlite::open(&settings.database)?;
    let connector = Arc::new(ImapConnector::from_settings(&settings)?);

    Orchestrator::new(connector, pool, settings, sink)?
        .with_confirm(confirm)
        .with_cancel(cancel)
        .run()
        .await
}
