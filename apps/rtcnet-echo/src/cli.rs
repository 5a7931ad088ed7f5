use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "rtcnet-echo")]
#[command(about = "Echo server and client over WebRTC data channels")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "RTCNET_LOG_LEVEL", global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "RTCNET_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and echo everything back
    Listen(ListenArgs),
    /// Connect, send a message and print the reply
    Dial(DialArgs),
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Address for the signaling websocket
    #[arg(long, default_value = "127.0.0.1:8080", env = "RTCNET_LISTEN_ADDR")]
    pub addr: String,

    /// PEM certificate chain; enables TLS together with --key
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key (PKCS#8)
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// Allowed Origin host patterns, e.g. "*.example.com"
    #[arg(long = "origin")]
    pub origins: Vec<String>,

    /// ICE server URLs; overrides RTCNET_ICE_SERVERS
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Stop after this many connections
    #[arg(long)]
    pub max_conns: Option<usize>,
}

#[derive(Args, Debug)]
pub struct DialArgs {
    /// Listener address, host:port[/path]
    #[arg(long, default_value = "127.0.0.1:8080", env = "RTCNET_DIAL_ADDR")]
    pub addr: String,

    #[arg(long, default_value = "Hello, World!")]
    pub message: String,

    /// Connect with wss://
    #[arg(long)]
    pub tls: bool,

    /// Skip certificate and hostname checks (self-signed listeners)
    #[arg(long, requires = "tls")]
    pub insecure: bool,

    /// Use an unordered data channel
    #[arg(long)]
    pub unordered: bool,

    /// Use the websocket itself instead of negotiating a data channel
    #[arg(long)]
    pub fallback: bool,

    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Overall dial timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}
