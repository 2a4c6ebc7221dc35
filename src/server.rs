use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::config::{Config, ImapConfig, TlsConfig};
use crate::pop::Connection;
use crate::session::Session;

pub struct Server {
    bind_addr: SocketAddr,
    hostname: String,
    tls: Option<TlsAcceptor>,
    backend: ImapConfig,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let tls = config.pop.tls.map(build_acceptor).transpose()?;
        Ok(Self {
            bind_addr: config.pop.bind_addr,
            hostname: config.pop.hostname,
            tls,
            backend: config.imap,
        })
    }

    pub async fn run(self, mut must_exit: watch::Receiver<bool>) -> Result<()> {
        let tcp = TcpListener::bind(self.bind_addr).await?;
        tracing::info!("POP3 server listening on {:#}", self.bind_addr);

        let mut connections = FuturesUnordered::new();

        while !*must_exit.borrow() {
            let wait_conn_finished = async {
                if connections.is_empty() {
                    futures::future::pending().await
                } else {
                    connections.next().await
                }
            };
            let (socket, remote_addr) = tokio::select! {
                a = tcp.accept() => a?,
                _ = wait_conn_finished => continue,
                _ = must_exit.changed() => continue,
            };
            tracing::info!("POP3: accepted connection from {}", remote_addr);

            let conn = Connection::new(
                socket,
                self.hostname.clone(),
                self.tls.clone(),
                Session::new(self.backend.clone()),
            );
            connections.push(tokio::spawn(async move {
                match conn.run().await {
                    Ok(()) => tracing::info!("closing session for {}", remote_addr),
                    Err(e) => tracing::error!("closing errored session for {}: {}", remote_addr, e),
                }
            }));
        }
        drop(tcp);

        tracing::info!("POP3 server shutting down, draining remaining connections...");
        while connections.next().await.is_some() {}

        Ok(())
    }
}

fn build_acceptor(config: TlsConfig) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut std::io::BufReader::new(std::fs::File::open(
        &config.certs,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &config.key,
    )?))?
    .ok_or_else(|| anyhow!("no private key found in {:?}", config.key))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

pub fn watch_ctrl_c() -> (watch::Receiver<bool>, Arc<watch::Sender<bool>>) {
    let (send_cancel, watch_cancel) = watch::channel(false);
    let send_cancel = Arc::new(send_cancel);
    let send_cancel_2 = send_cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        tracing::info!("Received CTRL+C, shutting down.");
        let _ = send_cancel.send(true);
    });
    (watch_cancel, send_cancel_2)
}
