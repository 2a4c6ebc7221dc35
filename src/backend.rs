//! Bridge between the async engine and the blocking IMAP client.
//!
//! Each authenticated session owns one `ImapWorker`: a dedicated OS
//! thread holding the backend connection, fed through an unbounded FIFO
//! call queue. Exactly one call executes at a time; results travel back
//! on a per-call oneshot whose completion wakes the event loop.

use std::sync::mpsc;
use std::thread;

use thiserror::Error;
use tokio::sync::oneshot;

use imap::{ClientBuilder, ConnectionMode, TlsKind};

use crate::config::{ImapConfig, ImapSecurity};

/// The flag the gateway stores on messages deleted through POP3, so that
/// later sessions exclude them from their working set.
pub const SEEN: &str = "\\Seen";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("imap: {0}")]
    Imap(#[from] imap::error::Error),
    #[error("backend worker is shutting down")]
    Closing,
    #[error("backend worker is gone")]
    Gone,
    #[error("operation requires an authenticated backend connection")]
    NotAuthenticated,
    #[error("backend returned no data for message {0}")]
    MissingData(u32),
    #[error("unexpected reply shape for {0}")]
    BadReply(&'static str),
}

/// Size and flag metadata for one remote message.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub uid: u32,
    pub size: u32,
    pub retired: bool,
}

/// The reference deployment overloads `\Seen` as "already consumed by a
/// previous POP3 session". Keep the check behind this predicate; it does
/// not generalize to other flags.
pub fn is_retired(flags: &[imap::types::Flag<'_>]) -> bool {
    flags.iter().any(|f| matches!(f, imap::types::Flag::Seen))
}

enum Op {
    Login { user: String, pass: String },
    Select { folder: String },
    Search,
    FetchMeta { uids: Vec<u32> },
    FetchBody { uid: u32 },
    StoreFlags { uids: Vec<u32>, flags: String },
    Logout,
    /// Sentinel: stops the worker loop. Must be the last call submitted.
    Shutdown,
}

enum Reply {
    Unit,
    Count(u32),
    Uids(Vec<u32>),
    Meta(Vec<MessageMeta>),
    Body(Vec<u8>),
}

struct PendingCall {
    op: Op,
    reply: oneshot::Sender<Result<Reply, BackendError>>,
}

pub struct ImapWorker {
    calls: mpsc::Sender<PendingCall>,
    thread: Option<thread::JoinHandle<()>>,
    closing: bool,
}

impl ImapWorker {
    /// Spawns the worker thread. The thread connects to the backend on
    /// startup; a connection failure surfaces on the first call.
    pub fn spawn(config: ImapConfig) -> Self {
        let (calls, queue) = mpsc::channel();
        let thread = thread::spawn(move || run(config, queue));
        Self {
            calls,
            thread: Some(thread),
            closing: false,
        }
    }

    async fn invoke(&self, op: Op) -> Result<Reply, BackendError> {
        if self.closing {
            return Err(BackendError::Closing);
        }
        let (tx, rx) = oneshot::channel();
        self.calls
            .send(PendingCall { op, reply: tx })
            .map_err(|_| BackendError::Gone)?;
        // Suspension point: the worker thread resolves the oneshot once
        // the blocking call finishes, which wakes this task.
        rx.await.map_err(|_| BackendError::Gone)?
    }

    pub async fn login(&self, user: &str, pass: &str) -> Result<(), BackendError> {
        self.invoke(Op::Login {
            user: user.into(),
            pass: pass.into(),
        })
        .await
        .map(|_| ())
    }

    /// Selects `folder`, returning its message count.
    pub async fn select(&self, folder: &str) -> Result<u32, BackendError> {
        match self
            .invoke(Op::Select {
                folder: folder.into(),
            })
            .await?
        {
            Reply::Count(n) => Ok(n),
            _ => Err(BackendError::BadReply("select")),
        }
    }

    /// All UIDs in the selected folder, ascending.
    pub async fn search(&self) -> Result<Vec<u32>, BackendError> {
        match self.invoke(Op::Search).await? {
            Reply::Uids(uids) => Ok(uids),
            _ => Err(BackendError::BadReply("search")),
        }
    }

    pub async fn fetch_meta(&self, uids: &[u32]) -> Result<Vec<MessageMeta>, BackendError> {
        match self
            .invoke(Op::FetchMeta {
                uids: uids.to_vec(),
            })
            .await?
        {
            Reply::Meta(meta) => Ok(meta),
            _ => Err(BackendError::BadReply("fetch_meta")),
        }
    }

    /// Full raw message for one UID.
    pub async fn fetch_body(&self, uid: u32) -> Result<Vec<u8>, BackendError> {
        match self.invoke(Op::FetchBody { uid }).await? {
            Reply::Body(body) => Ok(body),
            _ => Err(BackendError::BadReply("fetch_body")),
        }
    }

    pub async fn add_flags(&self, uids: &[u32], flags: &str) -> Result<(), BackendError> {
        self.invoke(Op::StoreFlags {
            uids: uids.to_vec(),
            flags: format!("+FLAGS.SILENT ({})", flags),
        })
        .await
        .map(|_| ())
    }

    /// Orderly teardown: best-effort logout, then the shutdown sentinel,
    /// then join the thread. No backend connection survives this call.
    pub async fn disconnect(&mut self) {
        if self.thread.is_none() {
            return;
        }
        if !self.closing {
            let _ = self.invoke(Op::Logout).await;
            self.closing = true;
            let (tx, rx) = oneshot::channel();
            let _ = self.calls.send(PendingCall {
                op: Op::Shutdown,
                reply: tx,
            });
            let _ = rx.await;
        }
        if let Some(handle) = self.thread.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

/// Connection handle as the worker thread sees it. `login` consumes the
/// fresh client, so the thread carries an explicit state.
enum Link {
    Fresh(imap::Client<imap::Connection>),
    Authed(imap::Session<imap::Connection>),
    Gone,
}

fn connection_mode(security: ImapSecurity) -> ConnectionMode {
    match security {
        ImapSecurity::Plain => ConnectionMode::Plaintext,
        ImapSecurity::StartTls => ConnectionMode::StartTls,
        ImapSecurity::Tls => ConnectionMode::Tls,
    }
}

fn connect(config: &ImapConfig) -> Result<imap::Client<imap::Connection>, BackendError> {
    let client = ClientBuilder::new(config.host.as_str(), config.port)
        .tls_kind(TlsKind::Rust)
        .mode(connection_mode(config.security))
        .connect()?;
    Ok(client)
}

fn run(config: ImapConfig, queue: mpsc::Receiver<PendingCall>) {
    let client = match connect(&config) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(host = %config.host, err = %e, "backend connection failed");
            // The first caller gets the connection error, then we give up.
            if let Ok(call) = queue.recv() {
                let _ = call.reply.send(Err(e));
            }
            return;
        }
    };

    let mut link = Link::Fresh(client);
    let mut sentinel = None;
    while let Ok(call) = queue.recv() {
        if matches!(call.op, Op::Shutdown) {
            sentinel = Some(call.reply);
            break;
        }
        let outcome = execute(&mut link, call.op);
        // A dropped receiver means the caller was cancelled; the result
        // is simply discarded.
        let _ = call.reply.send(outcome);
    }

    // Release the backend connection before acknowledging the sentinel.
    if let Link::Authed(mut session) = std::mem::replace(&mut link, Link::Gone) {
        let _ = session.logout();
    }
    if let Some(reply) = sentinel {
        let _ = reply.send(Ok(Reply::Unit));
    }
}

fn authed(link: &mut Link) -> Result<&mut imap::Session<imap::Connection>, BackendError> {
    match link {
        Link::Authed(session) => Ok(session),
        _ => Err(BackendError::NotAuthenticated),
    }
}

fn execute(link: &mut Link, op: Op) -> Result<Reply, BackendError> {
    match op {
        Op::Login { user, pass } => match std::mem::replace(link, Link::Gone) {
            Link::Fresh(client) => match client.login(&user, &pass) {
                Ok(session) => {
                    *link = Link::Authed(session);
                    Ok(Reply::Unit)
                }
                Err((e, client)) => {
                    *link = Link::Fresh(client);
                    Err(e.into())
                }
            },
            other => {
                *link = other;
                Err(BackendError::NotAuthenticated)
            }
        },
        Op::Select { folder } => {
            let mailbox = authed(link)?.select(&folder)?;
            Ok(Reply::Count(mailbox.exists))
        }
        Op::Search => {
            let mut uids: Vec<u32> = authed(link)?.uid_search("ALL")?.into_iter().collect();
            uids.sort_unstable();
            Ok(Reply::Uids(uids))
        }
        Op::FetchMeta { uids } => {
            let fetches = authed(link)?.uid_fetch(uid_set(&uids), "(FLAGS RFC822.SIZE)")?;
            let mut meta = Vec::new();
            for fetch in fetches.iter() {
                let uid = match fetch.uid {
                    Some(uid) => uid,
                    None => continue,
                };
                meta.push(MessageMeta {
                    uid,
                    size: fetch.size.unwrap_or(0),
                    retired: is_retired(fetch.flags()),
                });
            }
            Ok(Reply::Meta(meta))
        }
        Op::FetchBody { uid } => {
            let fetches = authed(link)?.uid_fetch(uid.to_string(), "RFC822")?;
            fetches
                .iter()
                .find_map(|f| f.body())
                .map(|body| Reply::Body(body.to_vec()))
                .ok_or(BackendError::MissingData(uid))
        }
        Op::StoreFlags { uids, flags } => {
            authed(link)?.uid_store(uid_set(&uids), &flags)?;
            Ok(Reply::Unit)
        }
        Op::Logout => {
            if let Link::Authed(mut session) = std::mem::replace(link, Link::Gone) {
                session.logout()?;
            }
            Ok(Reply::Unit)
        }
        // Intercepted by the worker loop.
        Op::Shutdown => Ok(Reply::Unit),
    }
}

fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
