use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::adapters::sqlite::{messages, DbPool};
use crate::error::MirrorError;
use crate::services::sync::helpers::events::{self, EventSink, SyncEvent};

/// Asks the operator before destructive work that was not configured.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub candidates: usize,
    pub pruned: usize,
}

/// Keeps one mailbox's rows consistent with what the server has now:
/// prune drops UIDs the server no longer lists, purge drops rows stored
/// under any other UIDVALIDITY.
pub struct ConsistencyManager {
    pool: DbPool,
    prune: bool,
    purge: bool,
    confirm: Option<Arc<dyn Confirm>>,
    sink: Arc<dyn EventSink>,
}

impl ConsistencyManager {
    pub fn new(pool: DbPool, prune: bool, purge: bool, sink: Arc<dyn EventSink>) -> Self {
        Self {
            pool,
            prune,
            purge,
            confirm: None,
            sink,
        }
    }

    pub fn with_confirm(mut self, confirm: Option<Arc<dyn Confirm>>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Delete `local_only` rows of `(mailbox, generation)`. Does nothing
    /// unless pruning is enabled and the mailbox run was not aborted.
    pub fn prune(
        &self,
        mailbox: &str,
        generation: u32,
        local_only: &[u32],
        aborted: bool,
    ) -> Result<PruneReport, MirrorError> {
        let mut report = PruneReport {
            candidates: local_only.len(),
            pruned: 0,
        };
        if local_only.is_empty() {
            return Ok(report);
        }

        if !self.prune {
            self.sink.emit(
                SyncEvent::new(events::PRUNE_CANDIDATES)
                    .with("mailbox", mailbox)
                    .with("generation", generation)
                    .with("count", local_only.len()),
            );
            return Ok(report);
        }

        if aborted {
            self.sink.emit(
                SyncEvent::new(events::PRUNE_SKIPPED_ABORTED)
                    .with("mailbox", mailbox)
                    .with("generation", generation)
                    .with("count", local_only.len()),
            );
            return Ok(report);
        }

        report.pruned = messages::delete_uids(&self.pool, mailbox, generation, local_only)?;
        info!(mailbox = %mailbox, generation = generation, pruned = report.pruned, "Pruned rows gone from server");
        self.sink.emit(
            SyncEvent::new(events::PRUNED_MISSING)
                .with("mailbox", mailbox)
                .with("generation", generation)
                .with("count", report.pruned),
        );
        Ok(report)
    }

    /// Delete rows of `mailbox` stored under any generation but `current`.
    /// Runs when purging is configured or the operator confirms; otherwise
    /// the stale rows are reported and kept.
    pub fn purge(&self, mailbox: &str, current: u32) -> Result<usize, MirrorError> {
        let stale: Vec<(u32, usize)> = messages::stored_generations(&self.pool, mailbox)?
            .into_iter()
            .filter(|(generation, _)| *generation != current)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let stale_rows: usize = stale.iter().map(|(_, count)| count).sum();
        let generations: Vec<u32> = stale.iter().map(|(generation, _)| *generation).collect();

        let approved = self.purge
            || self.confirm.as_ref().is_some_and(|confirm| {
                confirm.confirm(&format!(
                    "{} has {} rows from older UIDVALIDITY {:?} (current {}). Delete them?",
                    mailbox, stale_rows, generations, current
                ))
            });

        if !approved {
            self.sink.emit(
                SyncEvent::new(events::PURGE_SKIPPED)
                    .with("mailbox", mailbox)
                    .with("generation", current)
                    .with("stale_generations", generations)
                    .with("stale_rows", stale_rows),
            );
            return Ok(0);
        }

        let purged = messages::delete_other_generations(&self.pool, mailbox, current)?;
        info!(mailbox = %mailbox, generation = current, purged = purged, "Purged old generations");
        self.sink.emit(
            SyncEvent::new(events::PURGE_OLD_GENERATION)
                .with("mailbox", mailbox)
                .with("generation", current)
                .with("stale_generations", generations)
                .with("count", purged),
        );
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::messages::tests::{seed, temp_pool};
    use crate::adapters::sqlite::messages::{get_uids, stored_generations};
    use crate::services::sync::helpers::events::RecordingSink;

    struct Answer(bool);

    impl Confirm for Answer {
        fn confirm(&self, _prompt: &str) -> bool {
            self.0
        }
    }

    #[test]
    fn test_prune_removes_only_missing_uids() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 10, &[1, 2, 3, 4]);
        seed(&pool, "INBOX", 9, &[2, 4]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool.clone(), true, false, sink.clone());

        // server has {1, 3}
        let report = manager.prune("INBOX", 10, &[2, 4], false).unwrap();

        assert_eq!(report, PruneReport { candidates: 2, pruned: 2 });
        assert_eq!(get_uids(&pool, "INBOX", 10).unwrap(), vec![1, 3]);
        assert_eq!(get_uids(&pool, "INBOX", 9).unwrap(), vec![2, 4]);
        assert_eq!(sink.named(events::PRUNED_MISSING)[0].get_u64("count"), Some(2));
    }

    #[test]
    fn test_prune_disabled_reports_candidates() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 10, &[1, 2]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool.clone(), false, false, sink.clone());

        let report = manager.prune("INBOX", 10, &[2], false).unwrap();

        assert_eq!(report, PruneReport { candidates: 1, pruned: 0 });
        assert_eq!(get_uids(&pool, "INBOX", 10).unwrap(), vec![1, 2]);
        assert_eq!(sink.named(events::PRUNE_CANDIDATES).len(), 1);
        assert!(sink.named(events::PRUNED_MISSING).is_empty());
    }

    #[test]
    fn test_prune_skipped_after_abort() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 10, &[1, 2]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool.clone(), true, false, sink.clone());

        let report = manager.prune("INBOX", 10, &[2], true).unwrap();

        assert_eq!(report.pruned, 0);
        assert_eq!(get_uids(&pool, "INBOX", 10).unwrap(), vec![1, 2]);
        assert_eq!(sink.named(events::PRUNE_SKIPPED_ABORTED).len(), 1);
    }

    #[test]
    fn test_purge_keeps_current_generation_only() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 1, &[1, 2]);
        seed(&pool, "INBOX", 2, &[1]);
        seed(&pool, "INBOX", 3, &[1, 2, 3]);
        seed(&pool, "Sent", 1, &[1]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool.clone(), false, true, sink.clone());

        let purged = manager.purge("INBOX", 3).unwrap();

        assert_eq!(purged, 3);
        assert_eq!(stored_generations(&pool, "INBOX").unwrap(), vec![(3, 3)]);
        assert_eq!(stored_generations(&pool, "Sent").unwrap(), vec![(1, 1)]);
        let event = &sink.named(events::PURGE_OLD_GENERATION)[0];
        assert_eq!(event.get("stale_generations"), Some(&serde_json::json!([1, 2])));
    }

    #[test]
    fn test_purge_without_consent_is_reported() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 1, &[1, 2]);
        seed(&pool, "INBOX", 2, &[1]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool.clone(), false, false, sink.clone());

        assert_eq!(manager.purge("INBOX", 2).unwrap(), 0);
        assert_eq!(stored_generations(&pool, "INBOX").unwrap(), vec![(1, 2), (2, 1)]);
        let skipped = sink.named(events::PURGE_SKIPPED);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].get_u64("stale_rows"), Some(2));

        let declined = ConsistencyManager::new(pool.clone(), false, false, sink.clone())
            .with_confirm(Some(Arc::new(Answer(false))));
        assert_eq!(declined.purge("INBOX", 2).unwrap(), 0);

        let confirmed = ConsistencyManager::new(pool.clone(), false, false, sink.clone())
            .with_confirm(Some(Arc::new(Answer(true))));
        assert_eq!(confirmed.purge("INBOX", 2).unwrap(), 2);
        assert_eq!(stored_generations(&pool, "INBOX").unwrap(), vec![(2, 1)]);
    }

    #[test]
    fn test_purge_with_nothing_stale_is_silent() {
        let (_dir, pool) = temp_pool();
        seed(&pool, "INBOX", 2, &[1]);
        let sink = Arc::new(RecordingSink::default());
        let manager = ConsistencyManager::new(pool, false, false, sink.clone());

        assert_eq!(manager.purge("INBOX", 2).unwrap(), 0);
        assert!(sink.events().is_empty());
    }
}
