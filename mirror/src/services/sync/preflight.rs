use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::imap::{Connector, MailboxSession};
use crate::adapters::sqlite::{messages, DbPool};
use crate::config::RetryPolicy;
use crate::error::MirrorError;
use crate::services::sync::helpers::events::{self, EventSink, SyncEvent};

/// What one mailbox needs, computed before any fetch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightResult {
    pub mailbox: String,
    pub generation: u32,
    /// On the server, not stored locally. Ascending.
    pub to_fetch: Vec<u32>,
    /// Stored locally under this generation, gone from the server. Ascending.
    pub local_only: Vec<u32>,
    pub server_count: usize,
    pub local_count: usize,
}

impl PreflightResult {
    pub fn diff(mailbox: &str, generation: u32, server: &[u32], local: &[u32]) -> Self {
        let server: BTreeSet<u32> = server.iter().copied().collect();
        let local: BTreeSet<u32> = local.iter().copied().collect();

        Self {
            mailbox: mailbox.to_string(),
            generation,
            to_fetch: server.difference(&local).copied().collect(),
            local_only: local.difference(&server).copied().collect(),
            server_count: server.len(),
            local_count: local.len(),
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.to_fetch.is_empty()
    }
}

/// Diff one mailbox: EXAMINE, UID SEARCH everything, compare with the rows
/// stored for the same generation.
pub async fn compute<C: Connector>(
    session: &mut MailboxSession<C>,
    pool: &DbPool,
    mailbox: &str,
) -> Result<PreflightResult, MirrorError> {
    let generation = session.open_with_retry(mailbox).await?;
    let server = session.search_all().await?;
    let local = messages::get_uids(pool, mailbox, generation)?;

    let result = PreflightResult::diff(mailbox, generation, &server, &local);
    debug!(
        mailbox = %mailbox,
        generation = generation,
        server = result.server_count,
        local = result.local_count,
        to_fetch = result.to_fetch.len(),
        local_only = result.local_only.len(),
        "Preflight computed"
    );
    Ok(result)
}

/// Preflight `mailboxes` with `workers` concurrent sessions pulling from a
/// shared queue. Results come back in the order of `mailboxes`; mailboxes not
/// reached before `cancel` fired are absent.
pub async fn run_pool<C: Connector>(
    connector: Arc<C>,
    pool: DbPool,
    mailboxes: Vec<String>,
    workers: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
    sink: Arc<dyn EventSink>,
) -> Vec<(String, Result<PreflightResult, MirrorError>)> {
    sink.emit(
        SyncEvent::new(events::PREFLIGHT_STARTED)
            .with("mailboxes", mailboxes.len())
            .with("workers", workers),
    );

    // Fill the queue completely before any worker starts
    let (queue_tx, queue_rx) = flume::unbounded();
    for entry in mailboxes.iter().cloned().enumerate() {
        let _ = queue_tx.send(entry);
    }
    drop(queue_tx);

    let worker_count = workers.clamp(1, mailboxes.len().max(1));
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let queue = queue_rx.clone();
        let connector = Arc::clone(&connector);
        let pool = pool.clone();
        let cancel = cancel.clone();
        let sink = Arc::clone(&sink);

        handles.push(tokio::spawn(async move {
            let mut session = MailboxSession::new(connector, retry).with_cancel(cancel.clone());
            let mut done = Vec::new();

            while !cancel.is_cancelled() {
                let Ok((index, mailbox)) = queue.try_recv() else {
                    break;
                };

                let result = compute(&mut session, &pool, &mailbox).await;
                match &result {
                    Ok(pre) => sink.emit(
                        SyncEvent::new(events::PREFLIGHT_MAILBOX)
                            .with("mailbox", mailbox.as_str())
                            .with("generation", pre.generation)
                            .with("server_count", pre.server_count)
                            .with("local_count", pre.local_count)
                            .with("to_fetch", pre.to_fetch.len())
                            .with("local_only", pre.local_only.len()),
                    ),
                    Err(e) => {
                        warn!(mailbox = %mailbox, worker = worker_id, "Preflight failed: {}", e);
                        sink.emit(
                            SyncEvent::new(events::PREFLIGHT_FAILED)
                                .with("mailbox", mailbox.as_str())
                                .with("error", e.to_string()),
                        );
                    }
                }
                done.push((index, mailbox, result));
            }

            session.close().await;
            done
        }));
    }

    let mut collected = Vec::with_capacity(mailboxes.len());
    for handle in handles {
        match handle.await {
            Ok(done) => collected.extend(done),
            Err(e) => warn!("Preflight worker crashed: {}", e),
        }
    }
    collected.sort_by_key(|(index, _, _)| *index);

    let failed = collected.iter().filter(|(_, _, r)| r.is_err()).count();
    sink.emit(
        SyncEvent::new(events::PREFLIGHT_FINISHED)
            .with("mailboxes", collected.len())
            .with("failed", failed),
    );

    collected
        .into_iter()
        .map(|(_, mailbox, result)| (mailbox, result))
        .collect()
}
