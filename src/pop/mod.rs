//! The POP3 protocol engine: per-connection command loop, dispatch
//! table, response framing and the in-place TLS upgrade.

pub mod flow;
pub mod response;
pub mod transport;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::backend::BackendError;
use crate::session::{HookError, MailHandler};

use flow::{lookup, parse_message_number, State, Verb};
use response::crlf_lines;
use transport::Transport;

/// Name the gateway announces in its greeting.
pub const IDENT: &str = concat!("popgate ", env!("CARGO_PKG_VERSION"));

enum Flow {
    Continue,
    Quit,
}

/// Full lifecycle of one client connection. Generic over the stream so
/// tests can drive it over in-memory pipes.
pub struct Connection<S, H> {
    stream: Transport<S>,
    state: State,
    username: Option<String>,
    handler: H,
    hostname: String,
    tls: Option<TlsAcceptor>,
    /// Cleared when the handler vetoes the TLS handshake; from then on
    /// every command except QUIT is refused.
    gate_ok: bool,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    H: MailHandler,
{
    pub fn new(stream: S, hostname: String, tls: Option<TlsAcceptor>, handler: H) -> Self {
        Self {
            stream: Transport::plain(stream),
            state: State::Authorization,
            username: None,
            handler,
            hostname,
            tls,
            gate_ok: true,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        // The cleanup hook runs whatever ended the loop, so the backend
        // worker is always joined.
        self.handler.close().await;
        let _ = self.stream.shutdown().await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        self.push(&format!("+OK {} {}", self.hostname, IDENT)).await?;
        let mut line = String::new();
        loop {
            line.clear();
            let n = match self.stream.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    tracing::debug!("dropping connection on undecodable input");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                tracing::debug!("EOF received");
                return Ok(());
            }
            let trimmed = line.trim_end_matches(|c| c == '\r' || c == '\n');
            if trimmed.is_empty() {
                self.push("-ERR Error: bad syntax").await?;
                continue;
            }
            let (verb, arg) = match trimmed.split_once(' ') {
                Some((verb, arg)) => (verb, Some(arg)),
                None => (trimmed, None),
            };
            tracing::debug!(verb, "command received");

            if !self.gate_ok && verb != "QUIT" {
                self.push("554 Command refused due to lack of security").await?;
                continue;
            }
            let spec = match lookup(verb) {
                Some(spec) => spec,
                None => {
                    self.push(&format!("-ERR command \"{}\" not recognized", verb))
                        .await?;
                    continue;
                }
            };
            if let Some(required) = spec.state {
                if required != self.state {
                    self.push(&format!("-ERR wrong state for \"{}\"", verb))
                        .await?;
                    continue;
                }
            }
            match self.dispatch(spec.cmd, arg).await {
                Ok(Flow::Continue) => (),
                Ok(Flow::Quit) => return Ok(()),
                Err(e) => {
                    // Containment: convert to a response and keep going;
                    // if the transport is gone, leave silently.
                    let status = format!("-ERR Error: ({}) {}", error_category(&e), e);
                    if self.push(&status).await.is_err() {
                        tracing::debug!(err = %e, "transport lost while reporting error");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, cmd: Verb, arg: Option<&str>) -> Result<Flow> {
        match cmd {
            Verb::Capa => self.cmd_capa(arg).await,
            Verb::Stls => self.cmd_stls(arg).await,
            Verb::User => self.cmd_user(arg).await,
            Verb::Pass => self.cmd_pass(arg).await,
            Verb::Quit => self.cmd_quit(arg).await,
            Verb::Stat => self.cmd_stat(arg).await,
            Verb::List => self.cmd_list(arg).await,
            Verb::Uidl => self.cmd_uidl(arg).await,
            Verb::Retr => self.cmd_retr(arg).await,
            Verb::Dele => self.cmd_dele(arg).await,
            Verb::Rset => self.cmd_rset(arg).await,
            Verb::Top => self.cmd_top(arg).await,
            Verb::Noop => self.cmd_noop(arg).await,
        }
    }

    async fn push(&mut self, status: &str) -> Result<()> {
        tracing::trace!(status, "reply");
        self.stream.write_all(status.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn push_multi(&mut self, status: &str, data: &[u8]) -> Result<()> {
        self.stream.write_all(status.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        if !data.is_empty() {
            for line in crlf_lines(data) {
                // Transparency: double a leading termination marker.
                if line.first() == Some(&b'.') {
                    self.stream.write_all(b".").await?;
                }
                self.stream.write_all(line).await?;
                self.stream.write_all(b"\r\n").await?;
            }
        }
        self.stream.write_all(b".\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Maps the non-success hook outcomes onto their wire responses;
    /// backend failures bubble up to the containment layer.
    async fn push_hook_err(&mut self, err: HookError, not_implemented: &str) -> Result<()> {
        match err {
            HookError::NoSuchMessage => self.push("-ERR no such message").await,
            HookError::Unimplemented => self.push(not_implemented).await,
            HookError::Reply(msg) => self.push(&format!("-ERR {}", msg)).await,
            HookError::Backend(e) => Err(e.into()),
        }
    }

    async fn cmd_capa(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: CAPA").await?;
            return Ok(Flow::Continue);
        }
        let mut caps: Vec<&str> = vec!["USER", "UIDL"];
        if self.tls.is_some() {
            caps.push("STLS");
        }
        if self.handler.has_top() {
            caps.push("TOP");
        }
        let body = caps.join("\r\n");
        self.push_multi("+OK Capability list follows", body.as_bytes())
            .await?;
        Ok(Flow::Continue)
    }

    async fn cmd_stls(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: STLS").await?;
            return Ok(Flow::Continue);
        }
        let acceptor = match &self.tls {
            Some(acceptor) => acceptor.clone(),
            None => {
                self.push("-ERR TLS not available").await?;
                return Ok(Flow::Continue);
            }
        };
        if self.stream.is_tls() {
            self.push("-ERR TLS already active").await?;
            return Ok(Flow::Continue);
        }
        self.push("+OK Begin TLS negotiation").await?;
        let plain = match self.stream.take_plain() {
            Some(stream) => stream,
            None => return Ok(Flow::Quit),
        };
        // The handshake consumes the plaintext stream, so no stray close
        // event can fire on it after the upgrade.
        let encrypted = acceptor.accept(plain).await?;
        self.stream.install_tls(encrypted);
        // The upgrade logically re-establishes the connection: identity
        // must be supplied again over the encrypted transport.
        self.username = None;
        if !self.handler.accept_tls() {
            tracing::warn!("TLS session vetoed by handler, refusing further commands");
            self.gate_ok = false;
        }
        Ok(Flow::Continue)
    }

    async fn cmd_user(&mut self, arg: Option<&str>) -> Result<Flow> {
        let name = match arg {
            Some(name) => name,
            None => {
                self.push("-ERR Syntax: USER <username>").await?;
                return Ok(Flow::Continue);
            }
        };
        if self.username.is_some() {
            self.push("-ERR already supplied username").await?;
            return Ok(Flow::Continue);
        }
        match self.handler.user(name).await {
            Ok(()) | Err(HookError::Unimplemented) => {
                self.username = Some(name.to_string());
                self.push("+OK name is a valid mailbox").await?;
            }
            Err(HookError::Reply(msg)) => self.push(&format!("-ERR {}", msg)).await?,
            Err(e) => return Err(e.into()),
        }
        Ok(Flow::Continue)
    }

    async fn cmd_pass(&mut self, arg: Option<&str>) -> Result<Flow> {
        let pass = match arg {
            Some(pass) => pass,
            None => {
                self.push("-ERR Syntax: PASS <password>").await?;
                return Ok(Flow::Continue);
            }
        };
        let user = match self.username.clone() {
            Some(user) => user,
            None => {
                self.push("-ERR must supply username first").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.pass(&user, pass).await {
            Ok(()) => {
                self.state = State::Transaction;
                self.push("+OK remote login successful").await?;
            }
            Err(e) => {
                // Generic response on purpose: the reason stays in the
                // log, and the cleared username allows a fresh retry.
                tracing::info!(user, err = %e, "authentication failed");
                self.username = None;
                self.push("-ERR authentication failed").await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn cmd_quit(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: QUIT").await?;
            return Ok(Flow::Continue);
        }
        match self.handler.quit().await {
            Ok(()) | Err(HookError::Unimplemented) => {
                self.push("+OK Bye").await?;
            }
            Err(e) => {
                // The session still ends; the client learns why first.
                let e = anyhow::Error::from(e);
                let status = format!("-ERR Error: ({}) {}", error_category(&e), e);
                let _ = self.push(&status).await;
            }
        }
        Ok(Flow::Quit)
    }

    async fn cmd_stat(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: STAT").await?;
            return Ok(Flow::Continue);
        }
        match self.handler.stat().await {
            Ok((count, size)) => self.push(&format!("+OK {} {}", count, size)).await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_list(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_none() {
            let mut lines = Vec::new();
            let mut n = 1usize;
            loop {
                match self.handler.list(n).await {
                    Ok(Some(size)) => lines.push(format!("{} {}", n, size)),
                    // Hidden: the slot stays reserved, the listing skips it.
                    Ok(None) => (),
                    Err(HookError::NoSuchMessage) => break,
                    Err(e) => {
                        self.push_hook_err(e, "-ERR not implemented").await?;
                        return Ok(Flow::Continue);
                    }
                }
                n += 1;
            }
            let body = lines.join("\r\n");
            self.push_multi("+OK scan listing follows", body.as_bytes())
                .await?;
            return Ok(Flow::Continue);
        }
        let n = match parse_message_number(arg) {
            Some(n) => n,
            None => {
                self.push("-ERR Syntax: LIST [n]").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.list(n).await {
            Ok(Some(size)) => self.push(&format!("+OK {} {}", n, size)).await?,
            Ok(None) => self.push("-ERR no such message").await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_uidl(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_none() {
            let mut lines = Vec::new();
            let mut n = 1usize;
            loop {
                match self.handler.uidl(n).await {
                    Ok(Some(uid)) => lines.push(format!("{} {}", n, uid)),
                    Ok(None) => (),
                    Err(HookError::NoSuchMessage) => break,
                    Err(e) => {
                        self.push_hook_err(e, "-ERR not implemented").await?;
                        return Ok(Flow::Continue);
                    }
                }
                n += 1;
            }
            let body = lines.join("\r\n");
            self.push_multi("+OK unique-id listing follows", body.as_bytes())
                .await?;
            return Ok(Flow::Continue);
        }
        let n = match parse_message_number(arg) {
            Some(n) => n,
            None => {
                self.push("-ERR Syntax: UIDL [n]").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.uidl(n).await {
            Ok(Some(uid)) => self.push(&format!("+OK {} {}", n, uid)).await?,
            Ok(None) => self.push("-ERR no such message").await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_retr(&mut self, arg: Option<&str>) -> Result<Flow> {
        let n = match parse_message_number(arg) {
            Some(n) => n,
            None => {
                self.push("-ERR Syntax: RETR <n>").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.retr(n).await {
            Ok(body) => self.push_multi("+OK message follows", &body).await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_dele(&mut self, arg: Option<&str>) -> Result<Flow> {
        let n = match parse_message_number(arg) {
            Some(n) => n,
            None => {
                self.push("-ERR Syntax: DELE <n>").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.dele(n).await {
            Ok(()) => self.push("+OK deleted").await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_rset(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: RSET").await?;
            return Ok(Flow::Continue);
        }
        match self.handler.rset().await {
            Ok(()) => self.push("+OK").await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_top(&mut self, arg: Option<&str>) -> Result<Flow> {
        let parsed = arg.and_then(|a| a.split_once(' ')).and_then(|(n, lines)| {
            // The line count may be zero; the message number may not.
            let n = parse_message_number(Some(n))?;
            let lines = lines.parse::<usize>().ok()?;
            Some((n, lines))
        });
        let (n, lines) = match parsed {
            Some(parsed) => parsed,
            None => {
                self.push("-ERR Syntax: TOP <n> <lines>").await?;
                return Ok(Flow::Continue);
            }
        };
        match self.handler.top(n, lines).await {
            Ok(body) => self.push_multi("+OK top of message follows", &body).await?,
            Err(e) => self.push_hook_err(e, "-ERR TOP not implemented").await?,
        }
        Ok(Flow::Continue)
    }

    async fn cmd_noop(&mut self, arg: Option<&str>) -> Result<Flow> {
        if arg.is_some() {
            self.push("-ERR Syntax: NOOP").await?;
            return Ok(Flow::Continue);
        }
        match self.handler.noop().await {
            Ok(()) | Err(HookError::Unimplemented) => self.push("+OK").await?,
            Err(e) => self.push_hook_err(e, "-ERR not implemented").await?,
        }
        Ok(Flow::Continue)
    }
}

fn error_category(e: &anyhow::Error) -> &'static str {
    if e.downcast_ref::<BackendError>().is_some() {
        "backend"
    } else if e.downcast_ref::<std::io::Error>().is_some() {
        "io"
    } else {
        "internal"
    }
}
