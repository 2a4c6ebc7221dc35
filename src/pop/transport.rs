//! The engine's read/write layer: a transport that can be swapped from
//! plaintext to TLS in place, without tearing down the logical
//! connection.

use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio_rustls::server::TlsStream;

pub enum Transport<S> {
    Plain(BufStream<S>),
    Tls(BufStream<TlsStream<S>>),
    Closed,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Transport<S> {
    pub fn plain(stream: S) -> Self {
        Transport::Plain(BufStream::new(stream))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    pub async fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read_line(buf).await,
            Transport::Tls(s) => s.read_line(buf).await,
            Transport::Closed => Err(closed()),
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.write_all(data).await,
            Transport::Tls(s) => s.write_all(data).await,
            Transport::Closed => Err(closed()),
        }
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush().await,
            Transport::Tls(s) => s.flush().await,
            Transport::Closed => Err(closed()),
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(s) => s.shutdown().await,
            Transport::Tls(s) => s.shutdown().await,
            Transport::Closed => Ok(()),
        }
    }

    /// Takes the plaintext stream out for the TLS handshake, leaving
    /// `Closed` behind; the caller installs the encrypted stream once
    /// the handshake succeeds. Any buffered plaintext is dropped.
    pub fn take_plain(&mut self) -> Option<S> {
        match std::mem::replace(self, Transport::Closed) {
            Transport::Plain(s) => Some(s.into_inner()),
            other => {
                *self = other;
                None
            }
        }
    }

    pub fn install_tls(&mut self, stream: TlsStream<S>) {
        *self = Transport::Tls(BufStream::new(stream));
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}
