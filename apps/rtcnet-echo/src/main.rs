mod cli;
mod logging;
mod tls;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rtcnet::{DialConfig, ListenConfig, Listener, NetConn};
use tracing::{debug, info, warn};

use crate::cli::{Cli, Command, DialArgs, ListenArgs};
use crate::logging::LogConfig;

const BUFFER_SIZE: usize = 16 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })?;

    match cli.command {
        Command::Listen(args) => listen(args).await,
        Command::Dial(args) => dial(args).await,
    }
}

async fn listen(args: ListenArgs) -> Result<()> {
    let mut config = ListenConfig::from_env().with_origin_patterns(args.origins);
    if !args.ice_servers.is_empty() {
        config = config.with_ice_servers(args.ice_servers);
    }
    if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
        config = config.with_tls(tls::acceptor(cert, key)?);
    }

    let listener = Listener::bind(&args.addr, config)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!(target: "rtcnet_echo", addr = %listener.local_addr(), "listening");
    println!("listening on {}", listener.local_addr());

    let mut served = 0usize;
    loop {
        if args.max_conns.is_some_and(|max| served >= max) {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    served += 1;
                    tokio::spawn(echo(conn));
                }
                Err(err) if err.is_closed() => break,
                Err(err) => warn!(target: "rtcnet_echo", error = %err, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!(target: "rtcnet_echo", "interrupted");
                break;
            }
        }
    }

    listener.close().await?;
    Ok(())
}

async fn echo(conn: Box<dyn NetConn>) {
    let remote = conn.remote_addr();
    debug!(target: "rtcnet_echo", %remote, "serving connection");
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(target: "rtcnet_echo", %remote, error = %err, "read ended");
                break;
            }
        };
        if let Err(err) = conn.write(&buf[..n]).await {
            warn!(target: "rtcnet_echo", %remote, error = %err, "write failed");
            break;
        }
    }
    if let Err(err) = conn.close().await {
        debug!(target: "rtcnet_echo", %remote, error = %err, "close failed");
    }
}

async fn dial(args: DialArgs) -> Result<()> {
    let mut config = DialConfig::from_env();
    if args.unordered {
        config = config.with_ordered(false);
    }
    if !args.ice_servers.is_empty() {
        config = config.with_ice_servers(args.ice_servers);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(ms));
    }
    if args.tls {
        config = config.with_tls(tls::connector(args.insecure)?);
    }

    let conn: Box<dyn NetConn> = if args.fallback {
        Box::new(rtcnet::dial_fallback(&args.addr, config).await?)
    } else {
        Box::new(rtcnet::dial(&args.addr, config).await?)
    };
    info!(target: "rtcnet_echo", remote = %conn.remote_addr(), "connected");

    let message = args.message.as_bytes();
    let mut written = 0;
    while written < message.len() {
        written += conn.write(&message[written..]).await?;
    }

    let mut reply = vec![0u8; message.len()];
    let mut filled = 0;
    while filled < reply.len() {
        let n = conn.read(&mut reply[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    println!("{}", String::from_utf8_lossy(&reply[..filled]));

    conn.close().await?;
    Ok(())
}
