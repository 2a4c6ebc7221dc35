use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub pop: PopConfig,
    pub imap: ImapConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PopConfig {
    pub bind_addr: SocketAddr,
    /// Name announced in the POP3 greeting.
    pub hostname: String,
    /// Client-facing TLS material; without it, STLS is not advertised.
    pub tls: Option<TlsConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub certs: PathBuf,
    pub key: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub security: ImapSecurity,
    /// Every session works against this single folder.
    #[serde(default = "default_folder")]
    pub folder: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImapSecurity {
    Plain,
    StartTls,
    Tls,
}

impl Default for ImapSecurity {
    fn default() -> Self {
        ImapSecurity::Tls
    }
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    Ok(toml::from_str(&config)?)
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "INBOX".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pop]
            bind_addr = "[::1]:1110"
            hostname = "mail.example.tld"

            [imap]
            host = "imap.example.tld"
            "#,
        )
        .unwrap();
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.imap.security, ImapSecurity::Tls);
        assert_eq!(config.imap.folder, "INBOX");
        assert!(config.pop.tls.is_none());
    }

    #[test]
    fn security_modes_parse() {
        let config: Config = toml::from_str(
            r#"
            [pop]
            bind_addr = "0.0.0.0:110"
            hostname = "h"
            tls = { certs = "/etc/ssl/pop.crt", key = "/etc/ssl/pop.key" }

            [imap]
            host = "imap"
            port = 143
            security = "starttls"
            folder = "Archive"
            "#,
        )
        .unwrap();
        assert_eq!(config.imap.security, ImapSecurity::StartTls);
        assert_eq!(config.imap.folder, "Archive");
        assert!(config.pop.tls.is_some());
    }
}
