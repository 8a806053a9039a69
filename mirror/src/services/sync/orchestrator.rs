use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::imap::{folders, Connector, MailboxSession};
use crate::adapters::sqlite::DbPool;
use crate::config::Settings;
use crate::error::MirrorError;
use crate::services::sync::consistency::{Confirm, ConsistencyManager, PruneReport};
use crate::services::sync::helpers::events::{self, EventSink, SyncEvent};
use crate::services::sync::helpers::filters::MailboxFilter;
use crate::services::sync::preflight::{self, PreflightResult};
use crate::services::sync::runner::{MailboxRunner, RunOutcome, RunnerStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Completed,
    Aborted,
    /// Nothing to fetch; only the local consistency steps ran
    UpToDate,
}

impl MailboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::UpToDate => "up_to_date",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MailboxSummary {
    pub mailbox: String,
    pub generation: u32,
    /// Messages on the server
    pub total: usize,
    pub prune_candidates: usize,
    pub pruned: usize,
    pub purged: usize,
    pub processed: usize,
    pub errors: usize,
    pub pending: usize,
    pub status: MailboxStatus,
    pub cause: Option<String>,
}

impl MailboxSummary {
    fn event(&self) -> SyncEvent {
        SyncEvent::new(events::MAILBOX_SUMMARY)
            .with("mailbox", self.mailbox.as_str())
            .with("generation", self.generation)
            .with("total", self.total)
            .with("prune_candidates", self.prune_candidates)
            .with("pruned", self.pruned)
            .with("purged", self.purged)
            .with("processed", self.processed)
            .with("errors", self.errors)
            .with("status", self.status.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub mailboxes: Vec<MailboxSummary>,
    pub completed: usize,
    pub aborted: usize,
    pub up_to_date: usize,
    pub processed: usize,
    /// UIDs known to be missing locally that this run did not fetch
    pub pending: usize,
    /// Selected mailboxes never reached because the run was interrupted
    pub skipped: Vec<String>,
    pub interrupted: bool,
}

impl RunReport {
    fn record(&mut self, summary: MailboxSummary) {
        match summary.status {
            MailboxStatus::Completed => self.completed += 1,
            MailboxStatus::Aborted => self.aborted += 1,
            MailboxStatus::UpToDate => self.up_to_date += 1,
        }
        self.processed += summary.processed;
        self.pending += summary.pending;
        self.mailboxes.push(summary);
    }
}

/// Runs a whole mirror pass over one account.
///
/// Mailboxes are listed once, filtered, preflighted concurrently, then
/// fetched one after the other. Every mailbox that was reached ends with a
/// `mailbox_summary` event.
pub struct Orchestrator<C: Connector> {
    connector: Arc<C>,
    pool: DbPool,
    settings: Settings,
    filter: MailboxFilter,
    sink: Arc<dyn EventSink>,
    confirm: Option<Arc<dyn Confirm>>,
    cancel: CancellationToken,
}

impl<C: Connector> Orchestrator<C> {
    /// Fails with [`MirrorError::Config`] before any connection is made when
    /// the settings cannot work.
    pub fn new(
        connector: Arc<C>,
        pool: DbPool,
        settings: Settings,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, MirrorError> {
        settings.validate()?;
        let filter = MailboxFilter::new(&settings.only, &settings.exclude)?;

        Ok(Self {
            connector,
            pool,
            settings,
            filter,
            sink,
            confirm: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_confirm(mut self, confirm: Option<Arc<dyn Confirm>>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Selectable mailboxes that pass the allow/deny lists, in server order.
    pub async fn select_mailboxes(&self) -> Result<Vec<String>, MirrorError> {
        let mut session = MailboxSession::new(Arc::clone(&self.connector), self.settings.retry_policy())
            .with_cancel(self.cancel.clone());
        let listed = session.list_folders().await;
        session.close().await;

        let selected: Vec<String> = folders::selectable(listed?)
            .into_iter()
            .map(|folder| folder.name)
            .filter(|name| self.filter.allows(name))
            .collect();

        info!(mailboxes = selected.len(), "Mailboxes selected");
        Ok(selected)
    }

    pub async fn run(&self) -> Result<RunReport, MirrorError> {
        let start = std::time::Instant::now();
        let mut report = RunReport::default();

        // Step 1: what to mirror
        let mailboxes = self.select_mailboxes().await?;

        // Step 2: preflight everything before fetching anything
        let preflights = preflight::run_pool(
            Arc::clone(&self.connector),
            self.pool.clone(),
            mailboxes.clone(),
            self.settings.preflight_workers,
            self.settings.retry_policy(),
            self.cancel.clone(),
            Arc::clone(&self.sink),
        )
        .await;

        let consistency = ConsistencyManager::new(
            self.pool.clone(),
            self.settings.prune,
            self.settings.purge,
            Arc::clone(&self.sink),
        )
        .with_confirm(self.confirm.clone());

        let runner = MailboxRunner::new(
            Arc::clone(&self.connector),
            self.pool.clone(),
            &self.settings,
            Arc::clone(&self.sink),
        )
        .with_cancel(self.cancel.clone());

        // Step 3: one mailbox at a time
        let mut reached = Vec::with_capacity(preflights.len());
        for (mailbox, result) in preflights {
            if self.cancel.is_cancelled() {
                if let Ok(pre) = &result {
                    report.pending += pre.to_fetch.len();
                }
                continue;
            }
            reached.push(mailbox.clone());

            let summary = match result {
                Ok(pre) => self.sync_mailbox(&pre, &runner, &consistency).await,
                Err(e) => preflight_failure(&mailbox, &e),
            };
            self.sink.emit(summary.event());
            report.record(summary);
        }

        report.skipped = mailboxes
            .into_iter()
            .filter(|name| !reached.contains(name))
            .collect();
        report.interrupted = self.cancel.is_cancelled();

        if report.interrupted {
            warn!(
                completed = report.completed,
                skipped = report.skipped.len(),
                pending = report.pending,
                "Run interrupted"
            );
            self.sink.emit(
                SyncEvent::new(events::RUN_INTERRUPTED)
                    .with("skipped", report.skipped.clone())
                    .with("pending", report.pending),
            );
        }

        info!(
            completed = report.completed,
            aborted = report.aborted,
            up_to_date = report.up_to_date,
            processed = report.processed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Run finished"
        );
        self.sink.emit(
            SyncEvent::new(events::RUN_FINISHED)
                .with("mailboxes", report.mailboxes.len())
                .with("completed", report.completed)
                .with("aborted", report.aborted)
                .with("up_to_date", report.up_to_date)
                .with("processed", report.processed)
                .with("pending", report.pending)
                .with("interrupted", report.interrupted),
        );

        Ok(report)
    }

    async fn sync_mailbox(
        &self,
        pre: &PreflightResult,
        runner: &MailboxRunner<C>,
        consistency: &ConsistencyManager,
    ) -> MailboxSummary {
        let mut summary = MailboxSummary {
            mailbox: pre.mailbox.clone(),
            generation: pre.generation,
            total: pre.server_count,
            prune_candidates: pre.local_only.len(),
            pruned: 0,
            purged: 0,
            processed: 0,
            errors: 0,
            pending: 0,
            status: MailboxStatus::UpToDate,
            cause: None,
        };

        let aborted = if pre.is_up_to_date() {
            false
        } else {
            self.sink.emit(
                SyncEvent::new(events::MAILBOX_STARTED)
                    .with("mailbox", pre.mailbox.as_str())
                    .with("generation", pre.generation)
                    .with("to_fetch", pre.to_fetch.len()),
            );
            let outcome = runner.run(pre).await;
            apply_outcome(&mut summary, outcome);
            summary.status == MailboxStatus::Aborted
        };

        match consistency.prune(&pre.mailbox, pre.generation, &pre.local_only, aborted) {
            Ok(PruneReport { pruned, .. }) => summary.pruned = pruned,
            Err(e) => {
                warn!(mailbox = %pre.mailbox, "Prune failed: {}", e);
                summary.errors += 1;
            }
        }

        // Never after an abort: the server may already be on a newer generation
        if !aborted {
            match consistency.purge(&pre.mailbox, pre.generation) {
                Ok(purged) => summary.purged = purged,
                Err(e) => {
                    warn!(mailbox = %pre.mailbox, "Purge failed: {}", e);
                    summary.errors += 1;
                }
            }
        }

        if !pre.is_up_to_date() {
            self.sink.emit(
                SyncEvent::new(events::MAILBOX_FINISHED)
                    .with("mailbox", pre.mailbox.as_str())
                    .with("status", summary.status.as_str()),
            );
        }

        summary
    }
}

fn apply_outcome(summary: &mut MailboxSummary, outcome: RunOutcome) {
    summary.processed = outcome.processed;
    summary.errors += outcome.errors;
    summary.pending = outcome.pending;
    summary.cause = outcome.cause;
    summary.status = match outcome.status {
        RunnerStatus::Completed => MailboxStatus::Completed,
        RunnerStatus::Aborted => MailboxStatus::Aborted,
    };
}

fn preflight_failure(mailbox: &str, error: &MirrorError) -> MailboxSummary {
    MailboxSummary {
        mailbox: mailbox.to_string(),
        generation: 0,
        total: 0,
        prune_candidates: 0,
        pruned: 0,
        purged: 0,
        processed: 0,
        errors: 1,
        pending: 0,
        status: MailboxStatus::Aborted,
        cause: Some(error.to_string()),
    }
}
