//! Gateway business logic: one `Session` per client connection, owning
//! the numbered message list and the backend worker.

use async_trait::async_trait;
use thiserror::Error;

use crate::backend::{BackendError, ImapWorker, MessageMeta, SEEN};
use crate::config::ImapConfig;

/// How a hook reports failure to the protocol engine.
#[derive(Debug, Error)]
pub enum HookError {
    /// Ordinal out of the session's range.
    #[error("no such message")]
    NoSuchMessage,
    /// The handler does not provide this hook.
    #[error("not implemented")]
    Unimplemented,
    /// A session-specific failure with its own response text.
    #[error("{0}")]
    Reply(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Hooks the protocol engine dispatches mailbox commands to. One method
/// per POP3 command; the defaults mean "not implemented" and are mapped
/// to the protocol's generic response by the engine.
#[async_trait]
pub trait MailHandler: Send {
    /// Accept or refuse a username before the password arrives. The
    /// default accepts anything, as the credentials are only checked
    /// against the backend once the password is known.
    async fn user(&mut self, _name: &str) -> Result<(), HookError> {
        Ok(())
    }

    async fn pass(&mut self, user: &str, pass: &str) -> Result<(), HookError>;

    /// Message count and total size, both over non-hidden messages.
    async fn stat(&mut self) -> Result<(usize, u64), HookError> {
        Err(HookError::Unimplemented)
    }

    /// Size of message `n`; `Ok(None)` when the slot exists but is hidden.
    async fn list(&mut self, _n: usize) -> Result<Option<u32>, HookError> {
        Err(HookError::Unimplemented)
    }

    /// Unique id of message `n`; `Ok(None)` when hidden.
    async fn uidl(&mut self, _n: usize) -> Result<Option<String>, HookError> {
        Err(HookError::Unimplemented)
    }

    /// Full raw message `n`.
    async fn retr(&mut self, _n: usize) -> Result<Vec<u8>, HookError> {
        Err(HookError::Unimplemented)
    }

    async fn dele(&mut self, _n: usize) -> Result<(), HookError> {
        Err(HookError::Unimplemented)
    }

    async fn rset(&mut self) -> Result<(), HookError> {
        Err(HookError::Unimplemented)
    }

    /// Headers plus the first `lines` body lines of message `n`.
    async fn top(&mut self, _n: usize, _lines: usize) -> Result<Vec<u8>, HookError> {
        Err(HookError::Unimplemented)
    }

    async fn noop(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Session cleanup on QUIT; the only point where local deletions are
    /// materialized upstream.
    async fn quit(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Always called once the read loop is over, whatever the reason.
    /// Must be safe to call after `quit`.
    async fn close(&mut self) {}

    /// Post-handshake veto for the transport upgrade; returning false
    /// puts the connection in refused mode until it closes.
    fn accept_tls(&mut self) -> bool {
        true
    }

    /// Whether TOP is served, for capability advertisement.
    fn has_top(&self) -> bool {
        false
    }
}

/// One slot in the session's numbered list. The ordinal is the 1-based
/// position in the Vec, assigned at login and never renumbered; hiding a
/// message keeps its slot reserved.
#[derive(Debug, Clone)]
pub struct WorkingMessage {
    pub uid: u32,
    pub size: u32,
    pub hidden: bool,
}

pub struct Session {
    config: ImapConfig,
    worker: Option<ImapWorker>,
    messages: Vec<WorkingMessage>,
}

impl Session {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            worker: None,
            messages: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_messages(config: ImapConfig, messages: Vec<WorkingMessage>) -> Self {
        Self {
            config,
            worker: None,
            messages,
        }
    }

    fn lookup(&self, n: usize) -> Result<&WorkingMessage, HookError> {
        // Range checks run against the original list length: hidden
        // slots stay in range for the whole session.
        if n == 0 || n > self.messages.len() {
            return Err(HookError::NoSuchMessage);
        }
        Ok(&self.messages[n - 1])
    }

    fn lookup_mut(&mut self, n: usize) -> Result<&mut WorkingMessage, HookError> {
        if n == 0 || n > self.messages.len() {
            return Err(HookError::NoSuchMessage);
        }
        Ok(&mut self.messages[n - 1])
    }

    fn worker(&self) -> Result<&ImapWorker, HookError> {
        self.worker
            .as_ref()
            .ok_or_else(|| HookError::Reply("backend not connected".into()))
    }

    fn hidden_uids(&self) -> Vec<u32> {
        self.messages
            .iter()
            .filter(|m| m.hidden)
            .map(|m| m.uid)
            .collect()
    }

    async fn load_messages(
        worker: &ImapWorker,
        folder: &str,
    ) -> Result<Vec<WorkingMessage>, BackendError> {
        let count = worker.select(folder).await?;
        if count == 0 {
            tracing::info!(folder, "selected folder is empty");
            return Ok(Vec::new());
        }
        let uids = worker.search().await?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let meta = worker.fetch_meta(&uids).await?;
        Ok(working_set(meta))
    }
}

/// Ordinals follow the fetch-response order; messages the backend marks
/// as retired never enter the working set.
fn working_set(meta: Vec<MessageMeta>) -> Vec<WorkingMessage> {
    meta.into_iter()
        .filter(|m| !m.retired)
        .map(|m| WorkingMessage {
            uid: m.uid,
            size: m.size,
            hidden: false,
        })
        .collect()
}

#[async_trait]
impl MailHandler for Session {
    async fn pass(&mut self, user: &str, pass: &str) -> Result<(), HookError> {
        let mut worker = ImapWorker::spawn(self.config.clone());
        let outcome = match worker.login(user, pass).await {
            Ok(()) => Self::load_messages(&worker, &self.config.folder).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(messages) => {
                tracing::info!(user, count = messages.len(), "remote login successful");
                self.messages = messages;
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(user, err = %e, "remote login failed");
                worker.disconnect().await;
                Err(HookError::Backend(e))
            }
        }
    }

    async fn stat(&mut self) -> Result<(usize, u64), HookError> {
        let visible = self.messages.iter().filter(|m| !m.hidden);
        let (mut count, mut size) = (0usize, 0u64);
        for m in visible {
            count += 1;
            size += m.size as u64;
        }
        Ok((count, size))
    }

    async fn list(&mut self, n: usize) -> Result<Option<u32>, HookError> {
        let m = self.lookup(n)?;
        Ok((!m.hidden).then_some(m.size))
    }

    async fn uidl(&mut self, n: usize) -> Result<Option<String>, HookError> {
        let m = self.lookup(n)?;
        Ok((!m.hidden).then(|| m.uid.to_string()))
    }

    async fn retr(&mut self, n: usize) -> Result<Vec<u8>, HookError> {
        let uid = {
            let m = self.lookup(n)?;
            if m.hidden {
                return Err(HookError::NoSuchMessage);
            }
            m.uid
        };
        Ok(self.worker()?.fetch_body(uid).await?)
    }

    async fn dele(&mut self, n: usize) -> Result<(), HookError> {
        let m = self.lookup_mut(n)?;
        if m.hidden {
            return Err(HookError::Reply("message already deleted".into()));
        }
        m.hidden = true;
        Ok(())
    }

    async fn rset(&mut self) -> Result<(), HookError> {
        for m in &mut self.messages {
            m.hidden = false;
        }
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), HookError> {
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            // Not authenticated: nothing to materialize or tear down.
            None => return Ok(()),
        };
        let hidden = self.hidden_uids();
        let outcome = if hidden.is_empty() {
            Ok(())
        } else {
            tracing::info!(count = hidden.len(), "retiring deleted messages upstream");
            worker.add_flags(&hidden, SEEN).await
        };
        worker.disconnect().await;
        outcome.map_err(HookError::Backend)
    }

    async fn close(&mut self) {
        // Transport lost without QUIT: the mailbox stays untouched, but
        // the worker thread must still be joined.
        if let Some(mut worker) = self.worker.take() {
            worker.disconnect().await;
        }
    }
}
