use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::imap::{Connector, MailboxSession, RawMessage};
use crate::adapters::sqlite::messages::{InsertOutcome, MessageWriter, StoredMessage};
use crate::adapters::sqlite::DbPool;
use crate::config::{RetryPolicy, Settings};
use crate::error::MirrorError;
use crate::services::sync::helpers::events::{self, EventSink, SyncEvent};
use crate::services::sync::helpers::message_builder::{self, ParseStrategy};
use crate::services::sync::preflight::PreflightResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Completed,
    Aborted,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mailbox: String,
    pub generation: u32,
    pub status: RunnerStatus,
    /// Rows written
    pub processed: usize,
    /// Rows the writer found already stored
    pub duplicates: usize,
    /// Duplicates, failed inserts and failed batches
    pub errors: usize,
    /// UIDs never fetched because the run stopped early
    pub pending: usize,
    pub interrupted: bool,
    pub cause: Option<String>,
}

/// Fetches the `to_fetch` set of one mailbox into the database.
///
/// Batches go into a queue that is filled before any worker starts. Each
/// fetch worker owns a session attached to `(mailbox, generation)` and pops
/// batches until the queue is empty or the run is stopped; parsed rows flow
/// through one bounded channel into a single blocking writer.
pub struct MailboxRunner<C: Connector> {
    connector: Arc<C>,
    pool: DbPool,
    workers: usize,
    batch_size: usize,
    write_queue: usize,
    retry: RetryPolicy,
    strict: bool,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

/// State every task of one run can see. The first abort cause wins.
///
/// `in_flight` holds, per worker, the UIDs it popped but has not handed to
/// the writer yet, so a crashed worker's batch still counts as pending.
#[derive(Default)]
struct Shared {
    abort: AtomicBool,
    cause: Mutex<Option<String>>,
    in_flight: Mutex<HashMap<usize, Vec<u32>>>,
}

impl Shared {
    fn abort(&self, cause: String) {
        if let Ok(mut slot) = self.cause.lock() {
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn cause(&self) -> Option<String> {
        self.cause.lock().ok().and_then(|slot| slot.clone())
    }

    fn claim(&self, worker: usize, batch: &[u32]) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(worker, batch.to_vec());
        }
    }

    fn handed_over(&self, worker: usize, uid: u32) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            if let Some(batch) = in_flight.get_mut(&worker) {
                if let Some(pos) = batch.iter().position(|&u| u == uid) {
                    batch.swap_remove(pos);
                }
            }
        }
    }

    /// UIDs `worker` still held, sorted.
    fn release(&self, worker: usize) -> Vec<u32> {
        let mut left = self
            .in_flight
            .lock()
            .ok()
            .and_then(|mut in_flight| in_flight.remove(&worker))
            .unwrap_or_default();
        left.sort_unstable();
        left
    }
}

#[derive(Debug, Default)]
struct WriterStats {
    inserted: usize,
    duplicates: usize,
    failures: usize,
}

#[derive(Debug, Default)]
struct WorkerStats {
    unfinished: Vec<u32>,
    failed_batches: usize,
}

struct WorkerContext<C: Connector> {
    id: usize,
    connector: Arc<C>,
    mailbox: String,
    generation: u32,
    retry: RetryPolicy,
    strict: bool,
    queue: flume::Receiver<Vec<u32>>,
    rows: flume::Sender<StoredMessage>,
    shared: Arc<Shared>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl<C: Connector> MailboxRunner<C> {
    pub fn new(connector: Arc<C>, pool: DbPool, settings: &Settings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            connector,
            pool,
            workers: settings.fetch_workers.max(1),
            batch_size: settings.batch_size.max(1),
            write_queue: settings.write_queue.max(1),
            retry: settings.retry_policy(),
            strict: settings.strict,
            sink,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, preflight: &PreflightResult) -> RunOutcome {
        let mailbox = preflight.mailbox.clone();
        let generation = preflight.generation;
        let start = std::time::Instant::now();

        let mut outcome = RunOutcome {
            mailbox: mailbox.clone(),
            generation,
            status: RunnerStatus::Completed,
            processed: 0,
            duplicates: 0,
            errors: 0,
            pending: 0,
            interrupted: false,
            cause: None,
        };

        if preflight.to_fetch.is_empty() {
            return outcome;
        }

        // Step 1: queue every batch up front
        let (queue_tx, queue_rx) = flume::unbounded();
        let mut batch_count = 0;
        for batch in preflight.to_fetch.chunks(self.batch_size) {
            let _ = queue_tx.send(batch.to_vec());
            batch_count += 1;
        }
        drop(queue_tx);

        info!(
            mailbox = %mailbox,
            generation = generation,
            uids = preflight.to_fetch.len(),
            batches = batch_count,
            "Fetching mailbox"
        );

        let shared = Arc::new(Shared::default());

        // Step 2: the single writer
        let (rows_tx, rows_rx) = flume::bounded::<StoredMessage>(self.write_queue);
        let writer = {
            let pool = self.pool.clone();
            let shared = Arc::clone(&shared);
            let sink = Arc::clone(&self.sink);
            let strict = self.strict;
            tokio::task::spawn_blocking(move || write_rows(&pool, rows_rx, &shared, sink.as_ref(), strict))
        };

        // Step 3: fetch workers, never more than there are batches
        let worker_count = self.workers.min(batch_count);
        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let ctx = WorkerContext {
                id,
                connector: Arc::clone(&self.connector),
                mailbox: mailbox.clone(),
                generation,
                retry: self.retry,
                strict: self.strict,
                queue: queue_rx.clone(),
                rows: rows_tx.clone(),
                shared: Arc::clone(&shared),
                sink: Arc::clone(&self.sink),
                cancel: self.cancel.clone(),
            };
            handles.push(tokio::spawn(fetch_worker(ctx)));
        }
        drop(rows_tx);

        // Step 4: wait for the workers, then for the writer to drain
        let mut unfinished = Vec::new();
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(stats) => {
                    unfinished.extend(stats.unfinished);
                    outcome.errors += stats.failed_batches;
                }
                Err(e) => {
                    error!(mailbox = %mailbox, worker = id, "Fetch worker crashed: {}", e);
                    unfinished.extend(shared.release(id));
                    outcome.errors += 1;
                    shared.abort(format!("fetch worker crashed: {}", e));
                }
            }
        }
        while let Ok(batch) = queue_rx.try_recv() {
            unfinished.extend(batch);
        }

        let written = match writer.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(mailbox = %mailbox, "Writer crashed: {}", e);
                shared.abort(format!("writer crashed: {}", e));
                WriterStats::default()
            }
        };

        outcome.processed = written.inserted;
        outcome.duplicates = written.duplicates;
        outcome.errors += written.duplicates + written.failures;
        outcome.pending = unfinished.len();

        if self.cancel.is_cancelled() && (outcome.pending > 0 || shared.is_aborted()) {
            outcome.interrupted = true;
            if !shared.is_aborted() {
                shared.abort(MirrorError::Interrupted.to_string());
            }
        }

        if shared.is_aborted() {
            outcome.status = RunnerStatus::Aborted;
            outcome.cause = shared.cause();
            warn!(
                mailbox = %mailbox,
                generation = generation,
                processed = outcome.processed,
                pending = outcome.pending,
                "Mailbox aborted: {}",
                outcome.cause.as_deref().unwrap_or("unknown")
            );
            self.sink.emit(
                SyncEvent::new(events::MAILBOX_ABORTED)
                    .with("mailbox", mailbox.as_str())
                    .with("generation", generation)
                    .with("cause", outcome.cause.clone().unwrap_or_default())
                    .with("pending", outcome.pending),
            );
        } else {
            info!(
                mailbox = %mailbox,
                processed = outcome.processed,
                errors = outcome.errors,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Mailbox fetched"
            );
        }

        outcome
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

async fn fetch_worker<C: Connector>(ctx: WorkerContext<C>) -> WorkerStats {
    let mut stats = WorkerStats::default();
    let mut session = MailboxSession::new(Arc::clone(&ctx.connector), ctx.retry).with_cancel(ctx.cancel.clone());
    let mut attached = false;

    loop {
        if ctx.shared.is_aborted() || ctx.cancel.is_cancelled() {
            break;
        }
        let Ok(batch) = ctx.queue.try_recv() else {
            break;
        };
        ctx.shared.claim(ctx.id, &batch);

        // Connect on the first batch so idle workers never log in
        if !attached {
            if let Err(e) = session.attach(&ctx.mailbox, ctx.generation).await {
                warn!(mailbox = %ctx.mailbox, worker = ctx.id, "Could not attach: {}", e);
                stats.unfinished.extend(ctx.shared.release(ctx.id));
                stats.failed_batches += 1;
                ctx.shared.abort(e.to_string());
                break;
            }
            attached = true;
        }

        let raws = match session.fetch_batch(&batch).await {
            Ok(raws) => raws,
            Err(e) => {
                warn!(
                    mailbox = %ctx.mailbox,
                    worker = ctx.id,
                    first_uid = batch.first().copied().unwrap_or_default(),
                    size = batch.len(),
                    "Batch failed: {}", e
                );
                stats.unfinished.extend(ctx.shared.release(ctx.id));
                stats.failed_batches += 1;
                ctx.shared.abort(e.to_string());
                break;
            }
        };

        if raws.len() < batch.len() {
            debug!(
                mailbox = %ctx.mailbox,
                requested = batch.len(),
                returned = raws.len(),
                "Server returned fewer messages than requested"
            );
        }

        if let Err(e) = forward(&ctx, raws).await {
            stats.unfinished.extend(ctx.shared.release(ctx.id));
            stats.failed_batches += 1;
            ctx.shared.abort(e.to_string());
            break;
        }
        // Whatever is left vanished from the server
        ctx.shared.release(ctx.id);
    }

    session.close().await;
    stats
}

/// Build rows for one fetched batch and hand them to the writer.
async fn forward<C: Connector>(ctx: &WorkerContext<C>, raws: Vec<RawMessage>) -> Result<(), MirrorError> {
    for raw in raws {
        let uid = raw.uid;
        let built = message_builder::build(raw, &ctx.mailbox, ctx.generation, ctx.strict)?;

        if built.strategy != Some(ParseStrategy::Raw) {
            ctx.sink.emit(
                SyncEvent::new(events::PARSE_FALLBACK)
                    .with("mailbox", ctx.mailbox.as_str())
                    .with("uid", uid)
                    .with("strategy", built.strategy.map(|s| s.as_str()).unwrap_or("none")),
            );
        }

        ctx.rows
            .send_async(built.message)
            .await
            .map_err(|_| MirrorError::Database("writer stopped".into()))?;
        ctx.shared.handed_over(ctx.id, uid);
    }
    Ok(())
}

fn write_rows(
    pool: &DbPool,
    rows: flume::Receiver<StoredMessage>,
    shared: &Shared,
    sink: &dyn EventSink,
    strict: bool,
) -> WriterStats {
    let mut stats = WriterStats::default();

    let writer = match MessageWriter::new(pool) {
        Ok(writer) => writer,
        Err(e) => {
            error!("Writer could not get a connection: {}", e);
            shared.abort(e.to_string());
            return stats;
        }
    };

    for msg in rows.iter() {
        match writer.insert(&msg) {
            Ok(InsertOutcome::Inserted) => stats.inserted += 1,
            Ok(InsertOutcome::Duplicate) => {
                stats.duplicates += 1;
                warn!(
                    mailbox = %msg.mailbox,
                    uid = msg.uid,
                    generation = msg.generation,
                    "Row already stored, skipping"
                );
                sink.emit(
                    SyncEvent::new(events::DUPLICATE_SKIPPED)
                        .with("mailbox", msg.mailbox.as_str())
                        .with("uid", msg.uid)
                        .with("generation", msg.generation),
                );
                if strict {
                    shared.abort(
                        MirrorError::Duplicate {
                            mailbox: msg.mailbox.clone(),
                            uid: msg.uid,
                            generation: msg.generation,
                        }
                        .to_string(),
                    );
                }
            }
            Err(e) => {
                stats.failures += 1;
                error!(mailbox = %msg.mailbox, uid = msg.uid, "Insert failed: {}", e);
            }
        }
    }

    stats
}
