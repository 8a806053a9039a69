//! In-memory IMAP server for tests. Scripts transient failures and
//! UIDVALIDITY changes, counts connections.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{Connector, FolderInfo, MailClient, RawMessage};
use crate::error::MirrorError;

#[derive(Debug, Clone)]
pub(crate) struct FakeMailbox {
    pub uidvalidity: Option<u32>,
    pub messages: BTreeMap<u32, Vec<u8>>,
    pub attributes: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    mailboxes: BTreeMap<String, FakeMailbox>,
    fetch_failures: usize,
    connect_failures: usize,
    search_failures: usize,
    cancel_on_fetch: Option<(usize, CancellationToken)>,
}

#[derive(Default)]
pub(crate) struct FakeServer {
    state: Mutex<FakeState>,
    connects: AtomicUsize,
    fetch_calls: AtomicUsize,
    open_sessions: AtomicUsize,
    max_open_sessions: AtomicUsize,
    logouts: AtomicUsize,
    /// A fetch that includes this UID panics. Zero disables.
    crash_uid: AtomicU32,
}

pub(crate) fn sample_message(mailbox: &str, uid: u32) -> Vec<u8> {
    format!(
        "Message-ID: <{uid}.{mailbox}@fake.example>\r\n\
         Date: Tue, 1 Jul 2025 10:52:37 +0200\r\n\
         From: Alice <alice@example.com>\r\n\
         Subject: message {uid} in {mailbox}\r\n\
         \r\n\
         Hello {uid}\r\n"
    )
    .into_bytes()
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            server: Arc::clone(self),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake server state poisoned")
    }

    pub fn add_mailbox(&self, name: &str, uidvalidity: Option<u32>, uids: &[u32]) {
        let messages = uids
            .iter()
            .map(|&uid| (uid, sample_message(name, uid)))
            .collect();
        self.state().mailboxes.insert(
            name.to_string(),
            FakeMailbox {
                uidvalidity,
                messages,
                attributes: Vec::new(),
            },
        );
    }

    pub fn add_noselect(&self, name: &str) {
        self.state().mailboxes.insert(
            name.to_string(),
            FakeMailbox {
                uidvalidity: None,
                messages: BTreeMap::new(),
                attributes: vec!["NoSelect".to_string()],
            },
        );
    }

    pub fn set_uidvalidity(&self, name: &str, uidvalidity: Option<u32>) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            mailbox.uidvalidity = uidvalidity;
        }
    }

    pub fn set_body(&self, name: &str, uid: u32, body: &[u8]) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            mailbox.messages.insert(uid, body.to_vec());
        }
    }

    pub fn remove_messages(&self, name: &str, uids: &[u32]) {
        if let Some(mailbox) = self.state().mailboxes.get_mut(name) {
            for uid in uids {
                mailbox.messages.remove(uid);
            }
        }
    }

    pub fn fail_next_fetches(&self, count: usize) {
        self.state().fetch_failures = count;
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn fail_next_searches(&self, count: usize) {
        self.state().search_failures = count;
    }

    /// Fire `cancel` while fetch number `nth` (1-based) is being served.
    pub fn cancel_on_fetch(&self, nth: usize, cancel: CancellationToken) {
        self.state().cancel_on_fetch = Some((nth, cancel));
    }

    pub fn crash_on_fetch_of(&self, uid: u32) {
        self.crash_uid.store(uid, Ordering::SeqCst);
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn max_open_sessions(&self) -> usize {
        self.max_open_sessions.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeConnector {
    server: Arc<FakeServer>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Client = FakeClient;

    async fn connect(&self) -> Result<FakeClient, MirrorError> {
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.server.state();
            if state.connect_failures > 0 {
                state.connect_failures -= 1;
                return Err(MirrorError::Network("connection refused".into()));
            }
        }

        let open = self.server.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.max_open_sessions.fetch_max(open, Ordering::SeqCst);

        // Give other workers a chance to interleave.
        tokio::task::yield_now().await;

        Ok(FakeClient {
            server: Arc::clone(&self.server),
            examined: None,
        })
    }
}

pub(crate) struct FakeClient {
    server: Arc<FakeServer>,
    examined: Option<String>,
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        self.server.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailClient for FakeClient {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>, MirrorError> {
        let state = self.server.state();
        Ok(state
            .mailboxes
            .iter()
            .map(|(name, mailbox)| FolderInfo::new(name.clone(), mailbox.attributes.clone()))
            .collect())
    }

    async fn examine(&mut self, mailbox: &str) -> Result<Option<u32>, MirrorError> {
        let state = self.server.state();
        match state.mailboxes.get(mailbox) {
            Some(found) if found.attributes.is_empty() => {
                self.examined = Some(mailbox.to_string());
                Ok(found.uidvalidity)
            }
            _ => Err(MirrorError::Backend(format!("NO [NONEXISTENT] {}", mailbox))),
        }
    }

    async fn uid_search_all(&mut self) -> Result<Vec<u32>, MirrorError> {
        let mut state = self.server.state();
        if state.search_failures > 0 {
            state.search_failures -= 1;
            return Err(MirrorError::Network("connection reset by peer".into()));
        }
        let name = self
            .examined
            .as_ref()
            .ok_or_else(|| MirrorError::Backend("BAD no mailbox examined".into()))?;
        Ok(state
            .mailboxes
            .get(name)
            .map(|m| m.messages.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn uid_fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MirrorError> {
        let call = self.server.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let crash_uid = self.server.crash_uid.load(Ordering::SeqCst);
        if crash_uid != 0 && uids.contains(&crash_uid) {
            panic!("fake server crashed on uid {}", crash_uid);
        }

        let messages = {
            let mut state = self.server.state();
            if let Some((nth, cancel)) = &state.cancel_on_fetch {
                if *nth == call {
                    cancel.cancel();
                }
            }
            if state.fetch_failures > 0 {
                state.fetch_failures -= 1;
                return Err(MirrorError::Network("connection reset by peer".into()));
            }
            let name = self
                .examined
                .as_ref()
                .ok_or_else(|| MirrorError::Backend("BAD no mailbox examined".into()))?;
            let mailbox = state
                .mailboxes
                .get(name)
                .ok_or_else(|| MirrorError::Backend(format!("NO {}", name)))?;

            uids.iter()
                .filter_map(|uid| {
                    mailbox.messages.get(uid).map(|body| RawMessage {
                        uid: *uid,
                        body: body.clone(),
                        flags: vec!["\\Seen".to_string()],
                        internal_date: Some(1_751_359_957_000),
                        ..Default::default()
                    })
                })
                .collect::<Vec<_>>()
        };

        tokio::task::yield_now().await;
        Ok(messages)
    }

    async fn logout(&mut self) {
        self.server.logouts.fetch_add(1, Ordering::SeqCst);
    }
}
