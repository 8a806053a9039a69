use std::future::Future;
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use super::fetch::{collect_tolerant, fetch_query, to_raw_message, uid_set};
use super::folders::FolderInfo;
use super::{Connector, MailClient, RawMessage};
use crate::config::Settings;
use crate::error::MirrorError;

// TLS over tokio TCP, bridged to futures-io for async-imap.
pub type ImapSession = Session<TlsStream<Compat<TcpStream>>>;

pub struct ImapConnection {
    pub session: ImapSession,
    pub has_gmail_ext: bool,
    timeout: Duration,
    examined: Option<String>,
}

/// Bound a protocol round trip; an elapsed timer is a transient failure.
async fn within<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T, MirrorError>
where
    F: Future<Output = Result<T, MirrorError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MirrorError::Network(format!("{} timed out after {:?}", what, timeout))),
    }
}

#[async_trait]
impl MailClient for ImapConnection {
    async fn list_folders(&mut self) -> Result<Vec<FolderInfo>, MirrorError> {
        let session = &mut self.session;
        let names: Vec<_> = within(self.timeout, "LIST", async {
            let stream = session.list(Some(""), Some("*")).await?;
            let names: Vec<_> = stream.try_collect().await?;
            Ok::<_, MirrorError>(names)
        })
        .await?;

        let folders: Vec<FolderInfo> = names
            .iter()
            .map(|n| {
                let attributes: Vec<String> =
                    n.attributes().iter().map(|a| format!("{:?}", a)).collect();
                FolderInfo::new(n.name().to_string(), attributes)
            })
            .collect();

        debug!("Listed {} IMAP folders", folders.len());
        Ok(folders)
    }

    async fn examine(&mut self, mailbox: &str) -> Result<Option<u32>, MirrorError> {
        let session = &mut self.session;
        let selected = within(self.timeout, "EXAMINE", async {
            Ok::<_, MirrorError>(session.examine(mailbox).await?)
        })
        .await?;

        self.examined = Some(mailbox.to_string());
        Ok(selected.uid_validity)
    }

    async fn uid_search_all(&mut self) -> Result<Vec<u32>, MirrorError> {
        let session = &mut self.session;
        let found = within(self.timeout, "UID SEARCH", async {
            Ok::<_, MirrorError>(session.uid_search("UID 1:*").await?)
        })
        .await?;

        let mut uids: Vec<u32> = found.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn uid_fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MirrorError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let context = self.examined.clone().unwrap_or_default();
        let query = fetch_query(self.has_gmail_ext);
        let set = uid_set(uids);
        let session = &mut self.session;

        let fetches = within(self.timeout, "UID FETCH", async {
            let stream = session.uid_fetch(&set, query).await?;
            collect_tolerant(stream, &context).await
        })
        .await?;

        Ok(fetches.iter().filter_map(to_raw_message).collect())
    }

    async fn logout(&mut self) {
        let session = &mut self.session;
        let _ = within(self.timeout, "LOGOUT", async {
            Ok::<_, MirrorError>(session.logout().await?)
        }).await;
    }
}

/// Connects to one account over implicit TLS.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    user: String,
    password: String,
    timeout: Duration,
}

impl ImapConnector {
    /// Resolves the password once; every worker reuses it.
    pub fn from_settings(settings: &Settings) -> Result<Self, MirrorError> {
        Ok(Self {
            host: settings.imap.host.clone(),
            port: settings.imap.port,
            user: settings.imap.user.clone(),
            password: settings.imap.password.resolve()?,
            timeout: settings.io_timeout(),
        })
    }
}

#[async_trait]
impl Connector for ImapConnector {
    type Client = ImapConnection;

    async fn connect(&self) -> Result<ImapConnection, MirrorError> {
        connect(&self.host, self.port, &self.user, &self.password, self.timeout).await
    }
}

pub async fn connect(
    host: &str,
    port: u16,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<ImapConnection, MirrorError> {
    info!(host = %host, port = port, "Connecting to IMAP server");

    let session = within(timeout, "connect", async {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| MirrorError::Network(format!("TCP connection failed: {}", e)))?;

        let tcp = tcp.compat();
        let tls = async_native_tls::TlsConnector::new();
        let tls_stream = tls
            .connect(host, tcp)
            .await
            .map_err(|e| MirrorError::Network(format!("TLS handshake failed: {}", e)))?;

        let client = async_imap::Client::new(tls_stream);

        client
            .login(username, password)
            .await
            .map_err(|(e, _)| match MirrorError::from(e) {
                MirrorError::Backend(msg) => MirrorError::Backend(format!("Login failed: {}", msg)),
                other => other,
            })
    })
    .await?;

    // Gmail by hostname; X-GM-EXT-1 in CAPABILITY would also do
    let has_gmail_ext = host.contains("gmail.com")
        || host.contains("googlemail.com");

    Ok(ImapConnection {
        session,
        has_gmail_ext,
        timeout,
        examined: None,
    })
}
