//! Structured progress events.
//!
//! The engine never prints; it reports through an [`EventSink`]. Each event
//! has a name and a flat key/value payload.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

pub const PREFLIGHT_STARTED: &str = "preflight_started";
pub const PREFLIGHT_MAILBOX: &str = "preflight_mailbox";
pub const PREFLIGHT_FAILED: &str = "preflight_failed";
pub const PREFLIGHT_FINISHED: &str = "preflight_finished";
pub const MAILBOX_STARTED: &str = "mailbox_started";
pub const MAILBOX_ABORTED: &str = "mailbox_aborted";
pub const MAILBOX_SUMMARY: &str = "mailbox_summary";
pub const MAILBOX_FINISHED: &str = "mailbox_finished";
pub const DUPLICATE_SKIPPED: &str = "duplicate_skipped";
pub const PARSE_FALLBACK: &str = "parse_fallback";
pub const PRUNED_MISSING: &str = "pruned_missing";
pub const PRUNE_CANDIDATES: &str = "prune_candidates";
pub const PRUNE_SKIPPED_ABORTED: &str = "prune_skipped_aborted";
pub const PURGE_OLD_GENERATION: &str = "purge_old_generation";
pub const PURGE_SKIPPED: &str = "purge_skipped";
pub const RUN_INTERRUPTED: &str = "run_interrupted";
pub const RUN_FINISHED: &str = "run_finished";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SyncEvent {
    pub name: &'static str,
    pub fields: BTreeMap<&'static str, Value>,
}

impl SyncEvent {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl Into<Value>) -> Self {
        self.fields.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

/// Renders every event as an `info!` record with a JSON payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SyncEvent) {
        let payload = serde_json::to_string(&event.fields).unwrap_or_default();
        info!(event = event.name, payload = %payload);
    }
}

/// Drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SyncEvent) {}
}

/// Keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Vec<SyncEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
