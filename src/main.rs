use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use popgate::config::{read_config, Config, ImapConfig, ImapSecurity, PopConfig};
use popgate::server::{watch_ctrl_c, Server};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// A special mode dedicated to developers, NOT INTENDED FOR PRODUCTION
    #[clap(long)]
    dev: bool,

    /// Path to the main configuration file
    #[clap(short, long, env = "POPGATE_CONFIG", default_value = "popgate.toml")]
    config_file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "main=info,popgate=info")
    }

    // Abort on panic (same behavior as in Go)
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = if args.dev {
        dev_config()
    } else {
        read_config(args.config_file)?
    };

    let (exit_signal, _) = watch_ctrl_c();
    Server::new(config)?.run(exit_signal).await
}

fn dev_config() -> Config {
    use std::net::{IpAddr, Ipv6Addr, SocketAddr};
    Config {
        pop: PopConfig {
            bind_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1)), 1110),
            hostname: "localhost".to_string(),
            tls: None,
        },
        imap: ImapConfig {
            host: "localhost".to_string(),
            port: 1143,
            security: ImapSecurity::Plain,
            folder: "INBOX".to_string(),
        },
    }
}
