use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use popgate::backend::BackendError;
use popgate::pop::Connection;
use popgate::session::{HookError, MailHandler};

struct StubMessage {
    uid: u32,
    size: u32,
    body: Vec<u8>,
    hidden: bool,
}

/// In-memory mailbox standing in for the IMAP-backed session, so the
/// protocol engine can be driven without a live backend.
struct StubHandler {
    messages: Vec<StubMessage>,
    fail_login: bool,
    fail_stat: bool,
    veto_tls: bool,
    retired: Arc<Mutex<Vec<u32>>>,
}

impl StubHandler {
    fn new(messages: Vec<StubMessage>) -> Self {
        Self {
            messages,
            fail_login: false,
            fail_stat: false,
            veto_tls: false,
            retired: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn three_messages() -> Self {
        let msg = |uid, size| StubMessage {
            uid,
            size,
            body: format!("Subject: msg {}\r\n\r\nbody {}\r\n", uid, uid).into_bytes(),
            hidden: false,
        };
        Self::new(vec![msg(11, 100), msg(22, 200), msg(33, 300)])
    }

    fn lookup(&self, n: usize) -> Result<&StubMessage, HookError> {
        if n == 0 || n > self.messages.len() {
            return Err(HookError::NoSuchMessage);
        }
        Ok(&self.messages[n - 1])
    }
}

#[async_trait]
impl MailHandler for StubHandler {
    async fn pass(&mut self, _user: &str, _pass: &str) -> Result<(), HookError> {
        if self.fail_login {
            return Err(HookError::Reply("invalid credentials".into()));
        }
        Ok(())
    }

    async fn stat(&mut self) -> Result<(usize, u64), HookError> {
        if self.fail_stat {
            return Err(HookError::Backend(BackendError::NotAuthenticated));
        }
        let visible = self.messages.iter().filter(|m| !m.hidden);
        Ok(visible.fold((0, 0), |(c, s), m| (c + 1, s + m.size as u64)))
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
        let m = self.lookup(n)?;
        if m.hidden {
            return Err(HookError::NoSuchMessage);
        }
        Ok(m.body.clone())
    }

    async fn dele(&mut self, n: usize) -> Result<(), HookError> {
        if n == 0 || n > self.messages.len() {
            return Err(HookError::NoSuchMessage);
        }
        let m = &mut self.messages[n - 1];
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
        let hidden: Vec<u32> = self
            .messages
            .iter()
            .filter(|m| m.hidden)
            .map(|m| m.uid)
            .collect();
        self.retired.lock().unwrap().extend(hidden);
        Ok(())
    }

    fn accept_tls(&mut self) -> bool {
        !self.veto_tls
    }
}

type Client = BufReader<DuplexStream>;

fn start(handler: StubHandler) -> (Client, tokio::task::JoinHandle<()>) {
    start_with(handler, None)
}

fn start_with(
    handler: StubHandler,
    acceptor: Option<TlsAcceptor>,
) -> (Client, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let conn = Connection::new(server, "testhost".to_string(), acceptor, handler);
    let task = tokio::spawn(async move {
        let _ = conn.run().await;
    });
    (BufReader::new(client), task)
}

/// Loads the self-signed fixture under `tests/certs/` into a matching
/// acceptor/connector pair, the connector trusting exactly that cert.
fn tls_pair() -> (TlsAcceptor, TlsConnector) {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs");
    let mut cert_reader =
        std::io::BufReader::new(std::fs::File::open(format!("{}/test.crt", dir)).unwrap());
    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .unwrap();
    let mut key_reader =
        std::io::BufReader::new(std::fs::File::open(format!("{}/test.key", dir)).unwrap());
    let key = rustls_pemfile::private_key(&mut key_reader).unwrap().unwrap();

    let mut roots = rustls::RootCertStore::empty();
    for cert in &certs {
        roots.add(cert.clone()).unwrap();
    }
    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    (
        TlsAcceptor::from(Arc::new(server)),
        TlsConnector::from(Arc::new(client)),
    )
}

/// Client half of the STLS handshake; call right after the server
/// answered `+OK Begin TLS negotiation`.
async fn upgrade(
    client: Client,
    connector: &TlsConnector,
) -> BufReader<tokio_rustls::client::TlsStream<DuplexStream>> {
    let name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let encrypted = connector.connect(name, client.into_inner()).await.unwrap();
    BufReader::new(encrypted)
}

async fn send<S: AsyncRead + AsyncWrite + Unpin>(client: &mut BufReader<S>, line: &str) {
    client.get_mut().write_all(line.as_bytes()).await.unwrap();
    client.get_mut().write_all(b"\r\n").await.unwrap();
}

async fn recv<S: AsyncRead + Unpin>(client: &mut BufReader<S>) -> String {
    let mut line = String::new();
    let n = client.read_line(&mut line).await.unwrap();
    assert!(n > 0, "unexpected EOF from server");
    assert!(line.ends_with("\r\n"), "unterminated line: {:?}", line);
    line.truncate(line.len() - 2);
    line
}

async fn expect<S: AsyncRead + Unpin>(client: &mut BufReader<S>, want: &str) {
    assert_eq!(recv(client).await, want);
}

/// Reads a multi-line payload up to and excluding the lone terminator.
async fn recv_multi<S: AsyncRead + Unpin>(client: &mut BufReader<S>) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        let line = recv(client).await;
        if line == "." {
            return lines;
        }
        lines.push(line);
    }
}

async fn login(client: &mut Client) {
    expect(client, "+OK testhost popgate 0.1.0").await;
    send(client, "USER alice").await;
    expect(client, "+OK name is a valid mailbox").await;
    send(client, "PASS secret").await;
    expect(client, "+OK remote login successful").await;
}

#[tokio::test]
async fn greeting_and_login_flow() {
    let (mut client, _task) = start(StubHandler::three_messages());
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    // Mailbox commands are refused before authentication.
    send(&mut client, "STAT").await;
    expect(&mut client, "-ERR wrong state for \"STAT\"").await;

    send(&mut client, "USER alice").await;
    expect(&mut client, "+OK name is a valid mailbox").await;
    send(&mut client, "USER bob").await;
    expect(&mut client, "-ERR already supplied username").await;

    send(&mut client, "PASS secret").await;
    expect(&mut client, "+OK remote login successful").await;
    send(&mut client, "STAT").await;
    expect(&mut client, "+OK 3 600").await;
}

#[tokio::test]
async fn failed_login_allows_retry() {
    let mut handler = StubHandler::three_messages();
    handler.fail_login = true;
    let (mut client, _task) = start(handler);
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    send(&mut client, "PASS secret").await;
    expect(&mut client, "-ERR must supply username first").await;

    send(&mut client, "USER alice").await;
    expect(&mut client, "+OK name is a valid mailbox").await;
    send(&mut client, "PASS wrong").await;
    // The refusal is deliberately generic and clears the username.
    expect(&mut client, "-ERR authentication failed").await;

    send(&mut client, "USER alice").await;
    expect(&mut client, "+OK name is a valid mailbox").await;
}

#[tokio::test]
async fn command_parsing_is_strict() {
    let (mut client, _task) = start(StubHandler::three_messages());
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    send(&mut client, "").await;
    expect(&mut client, "-ERR Error: bad syntax").await;

    send(&mut client, "FROB").await;
    expect(&mut client, "-ERR command \"FROB\" not recognized").await;

    // Verbs match exactly; no case folding.
    send(&mut client, "capa").await;
    expect(&mut client, "-ERR command \"capa\" not recognized").await;

    send(&mut client, "RETR 1").await;
    expect(&mut client, "-ERR wrong state for \"RETR\"").await;

    send(&mut client, "STLS").await;
    expect(&mut client, "-ERR TLS not available").await;
}

#[tokio::test]
async fn capa_advertises_capabilities() {
    let (mut client, _task) = start(StubHandler::three_messages());
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    send(&mut client, "CAPA extra").await;
    expect(&mut client, "-ERR Syntax: CAPA").await;

    send(&mut client, "CAPA").await;
    expect(&mut client, "+OK Capability list follows").await;
    // No TLS acceptor and no TOP hook, so neither is advertised.
    assert_eq!(recv_multi(&mut client).await, vec!["USER", "UIDL"]);
}

#[tokio::test]
async fn mailbox_session_end_to_end() {
    let handler = StubHandler::three_messages();
    let retired = handler.retired.clone();
    let (mut client, task) = start(handler);
    login(&mut client).await;

    // The transport upgrade belongs to the authorization phase only.
    send(&mut client, "STLS").await;
    expect(&mut client, "-ERR wrong state for \"STLS\"").await;

    send(&mut client, "LIST").await;
    expect(&mut client, "+OK scan listing follows").await;
    assert_eq!(recv_multi(&mut client).await, vec!["1 100", "2 200", "3 300"]);

    send(&mut client, "DELE 2").await;
    expect(&mut client, "+OK deleted").await;
    send(&mut client, "STAT").await;
    expect(&mut client, "+OK 2 400").await;

    // The deleted slot keeps its number but leaves the listing.
    send(&mut client, "LIST").await;
    expect(&mut client, "+OK scan listing follows").await;
    assert_eq!(recv_multi(&mut client).await, vec!["1 100", "3 300"]);
    send(&mut client, "LIST 2").await;
    expect(&mut client, "-ERR no such message").await;
    send(&mut client, "LIST 3").await;
    expect(&mut client, "+OK 3 300").await;

    send(&mut client, "LIST 0").await;
    expect(&mut client, "-ERR no such message").await;
    send(&mut client, "LIST 4").await;
    expect(&mut client, "-ERR no such message").await;
    send(&mut client, "LIST x").await;
    expect(&mut client, "-ERR Syntax: LIST [n]").await;

    send(&mut client, "DELE 2").await;
    expect(&mut client, "-ERR message already deleted").await;
    send(&mut client, "RETR 2").await;
    expect(&mut client, "-ERR no such message").await;

    send(&mut client, "UIDL").await;
    expect(&mut client, "+OK unique-id listing follows").await;
    assert_eq!(recv_multi(&mut client).await, vec!["1 11", "3 33"]);

    send(&mut client, "RSET").await;
    expect(&mut client, "+OK").await;
    send(&mut client, "STAT").await;
    expect(&mut client, "+OK 3 600").await;

    send(&mut client, "DELE 2").await;
    expect(&mut client, "+OK deleted").await;
    send(&mut client, "QUIT").await;
    expect(&mut client, "+OK Bye").await;

    task.await.unwrap();
    // Only the deletion still pending at QUIT is materialized.
    assert_eq!(*retired.lock().unwrap(), vec![22]);
}

#[tokio::test]
async fn retr_applies_dot_stuffing() {
    let mut handler = StubHandler::three_messages();
    handler.messages[0].body = b"Subject: dots\r\n\r\n.hidden\r\nplain\r\n".to_vec();
    let (mut client, _task) = start(handler);
    login(&mut client).await;

    send(&mut client, "RETR 1").await;
    expect(&mut client, "+OK message follows").await;
    assert_eq!(
        recv_multi(&mut client).await,
        vec!["Subject: dots", "", "..hidden", "plain", ""]
    );

    send(&mut client, "RETR").await;
    expect(&mut client, "-ERR Syntax: RETR <n>").await;
}

#[tokio::test]
async fn top_is_refused_when_not_provided() {
    let (mut client, _task) = start(StubHandler::three_messages());
    login(&mut client).await;

    send(&mut client, "TOP 1 0").await;
    expect(&mut client, "-ERR TOP not implemented").await;
    send(&mut client, "TOP 1").await;
    expect(&mut client, "-ERR Syntax: TOP <n> <lines>").await;
    send(&mut client, "TOP x 5").await;
    expect(&mut client, "-ERR Syntax: TOP <n> <lines>").await;
}

#[tokio::test]
async fn backend_errors_are_contained() {
    let mut handler = StubHandler::three_messages();
    handler.fail_stat = true;
    let (mut client, _task) = start(handler);
    login(&mut client).await;

    send(&mut client, "STAT").await;
    let line = recv(&mut client).await;
    assert!(
        line.starts_with("-ERR Error: (backend)"),
        "unexpected response: {}",
        line
    );

    // The connection survives the failure.
    send(&mut client, "NOOP").await;
    expect(&mut client, "+OK").await;
}

#[tokio::test]
async fn stls_upgrade_requires_fresh_credentials() {
    let (acceptor, connector) = tls_pair();
    let (mut client, _task) = start_with(StubHandler::three_messages(), Some(acceptor));
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    // With an acceptor configured the capability is advertised.
    send(&mut client, "CAPA").await;
    expect(&mut client, "+OK Capability list follows").await;
    assert_eq!(recv_multi(&mut client).await, vec!["USER", "UIDL", "STLS"]);

    send(&mut client, "USER alice").await;
    expect(&mut client, "+OK name is a valid mailbox").await;

    send(&mut client, "STLS").await;
    expect(&mut client, "+OK Begin TLS negotiation").await;
    let mut client = upgrade(client, &connector).await;

    // The upgrade discarded the username supplied in the clear.
    send(&mut client, "PASS secret").await;
    expect(&mut client, "-ERR must supply username first").await;

    send(&mut client, "STLS").await;
    expect(&mut client, "-ERR TLS already active").await;

    send(&mut client, "USER alice").await;
    expect(&mut client, "+OK name is a valid mailbox").await;
    send(&mut client, "PASS secret").await;
    expect(&mut client, "+OK remote login successful").await;
    send(&mut client, "STAT").await;
    expect(&mut client, "+OK 3 600").await;
}

#[tokio::test]
async fn vetoed_upgrade_refuses_everything_but_quit() {
    let (acceptor, connector) = tls_pair();
    let mut handler = StubHandler::three_messages();
    handler.veto_tls = true;
    let (mut client, task) = start_with(handler, Some(acceptor));
    expect(&mut client, "+OK testhost popgate 0.1.0").await;

    send(&mut client, "STLS").await;
    expect(&mut client, "+OK Begin TLS negotiation").await;
    let mut client = upgrade(client, &connector).await;

    // Refused mode: every verb, known or not, gets the security refusal.
    for line in ["USER alice", "STAT", "CAPA", "NOOP", "FROB"] {
        send(&mut client, line).await;
        expect(&mut client, "554 Command refused due to lack of security").await;
    }

    send(&mut client, "QUIT").await;
    expect(&mut client, "+OK Bye").await;
    task.await.unwrap();
}

#[tokio::test]
async fn quit_before_login_says_goodbye() {
    let (mut client, task) = start(StubHandler::three_messages());
    expect(&mut client, "+OK testhost popgate 0.1.0").await;
    send(&mut client, "QUIT").await;
    expect(&mut client, "+OK Bye").await;
    task.await.unwrap();
}
