use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Connector, FolderInfo, MailClient, RawMessage};
use crate::config::RetryPolicy;
use crate::error::MirrorError;

/// One read-only session on one mailbox, able to reconnect itself.
///
/// `open` authenticates lazily and EXAMINEs the mailbox. `reopen` throws the
/// connection away and starts over, asserting the UIDVALIDITY did not move.
/// `open_with_retry`, `attach`, `list_folders`, `fetch_batch` and
/// `search_all` absorb transient failures by reconnecting, within the
/// [`RetryPolicy`] budget.
pub struct MailboxSession<C: Connector> {
    connector: Arc<C>,
    client: Option<C::Client>,
    mailbox: Option<String>,
    generation: u32,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<C: Connector> MailboxSession<C> {
    pub fn new(connector: Arc<C>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            client: None,
            mailbox: None,
            generation: 0,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Backoff sleeps end early with [`MirrorError::Interrupted`] once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// EXAMINE `mailbox`, connecting first if needed. Returns its UIDVALIDITY.
    pub async fn open(&mut self, mailbox: &str) -> Result<u32, MirrorError> {
        let client = self.connected().await?;

        let reported = match client.examine(mailbox).await {
            Ok(reported) => reported,
            Err(e) => {
                if e.is_transient() {
                    self.client = None;
                }
                return Err(e);
            }
        };

        let generation = reported.ok_or_else(|| MirrorError::GenerationUnavailable {
            mailbox: mailbox.to_string(),
        })?;

        debug!(mailbox = %mailbox, generation = generation, "Mailbox examined");
        self.mailbox = Some(mailbox.to_string());
        self.generation = generation;
        Ok(generation)
    }

    /// Drop the current connection, log in again and re-EXAMINE. A non-zero
    /// `expected` generation that no longer matches fails with
    /// [`MirrorError::GenerationChanged`].
    pub async fn reopen(&mut self, mailbox: &str, expected: u32) -> Result<u32, MirrorError> {
        self.close().await;

        let actual = self.open(mailbox).await?;
        if expected != 0 && actual != expected {
            return Err(MirrorError::GenerationChanged {
                mailbox: mailbox.to_string(),
                expected,
                actual,
            });
        }
        Ok(actual)
    }

    /// Open `mailbox` expecting `generation`, spending the retry budget on
    /// transient failures. Fetch workers use this to join a run.
    pub async fn attach(&mut self, mailbox: &str, generation: u32) -> Result<(), MirrorError> {
        self.mailbox = Some(mailbox.to_string());
        self.generation = generation;

        match self.reopen(mailbox, generation).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => {
                let mut attempt = 0;
                self.recover(&mut attempt, e).await
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`open`](Self::open), but transient failures spend the retry
    /// budget instead of surfacing. Preflight uses this before it knows the
    /// generation, so reconnects do not assert one.
    pub async fn open_with_retry(&mut self, mailbox: &str) -> Result<u32, MirrorError> {
        match self.open(mailbox).await {
            Ok(generation) => Ok(generation),
            Err(e) if e.is_transient() => {
                self.mailbox = Some(mailbox.to_string());
                self.generation = 0;
                let mut attempt = 0;
                self.recover(&mut attempt, e).await?;
                Ok(self.generation)
            }
            Err(e) => Err(e),
        }
    }

    /// LIST every folder on the account, connecting first if needed.
    pub async fn list_folders(&mut self) -> Result<Vec<FolderInfo>, MirrorError> {
        let mut attempt = 0;
        loop {
            let result = match self.connected().await {
                Ok(client) => client.list_folders().await,
                Err(e) => Err(e),
            };

            match result {
                Ok(folders) => return Ok(folders),
                Err(e) if e.is_transient() => {
                    // dead connection, LOGOUT would only hang
                    self.client = None;
                    self.wait_for_retry(&mut attempt, &e, "LIST").await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// UID FETCH `uids` in the open mailbox.
    pub async fn fetch_batch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MirrorError> {
        let mut attempt = 0;
        loop {
            let result = match self.client.as_mut() {
                Some(client) => client.uid_fetch(uids).await,
                None => Err(MirrorError::Network("not connected".into())),
            };

            match result {
                Ok(messages) => return Ok(messages),
                Err(e) if e.is_transient() => self.recover(&mut attempt, e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Every UID in the open mailbox, ascending.
    pub async fn search_all(&mut self) -> Result<Vec<u32>, MirrorError> {
        let mut attempt = 0;
        loop {
            let result = match self.client.as_mut() {
                Some(client) => client.uid_search_all().await,
                None => Err(MirrorError::Network("not connected".into())),
            };

            match result {
                Ok(uids) => return Ok(uids),
                Err(e) if e.is_transient() => self.recover(&mut attempt, e).await?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Spend reconnect attempts until one succeeds or the budget runs out.
    async fn recover(&mut self, attempt: &mut u32, mut error: MirrorError) -> Result<(), MirrorError> {
        let mailbox = self
            .mailbox
            .clone()
            .ok_or_else(|| MirrorError::Backend("no mailbox open".into()))?;
        let generation = self.generation;

        // The connection that failed is not worth a LOGOUT round trip
        self.client = None;

        loop {
            self.wait_for_retry(attempt, &error, &mailbox).await?;

            match self.reopen(&mailbox, generation).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() => error = e,
                Err(e) => return Err(e),
            }
        }
    }

    /// Count one attempt against the budget and sleep its backoff.
    async fn wait_for_retry(&self, attempt: &mut u32, error: &MirrorError, scope: &str) -> Result<(), MirrorError> {
        *attempt += 1;
        if !self.retry.allows(*attempt) {
            return Err(MirrorError::RetriesExhausted {
                attempts: *attempt - 1,
                last_error: error.to_string(),
            });
        }

        let delay = self.retry.delay_for(*attempt);
        warn!(
            scope = %scope,
            attempt = *attempt,
            delay_ms = delay.as_millis() as u64,
            "Transient IMAP failure, reconnecting: {}", error
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(MirrorError::Interrupted),
                _ = tokio::time::sleep(delay) => {}
            }
        } else if self.cancel.is_cancelled() {
            return Err(MirrorError::Interrupted);
        }
        Ok(())
    }

    async fn connected(&mut self) -> Result<&mut C::Client, MirrorError> {
        if self.client.is_none() {
            self.client = Some(self.connector.connect().await?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| MirrorError::Network("not connected".into()))
    }

    /// LOGOUT and forget the connection. The mailbox and generation are kept
    /// so a later `reopen` can assert against them.
    pub async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.logout().await;
        }
    }
}
