//! # hubchat
//!
//! Terminal client for a real-time chat hub. Reads chat lines and slash
//! commands from stdin, prints the chat log and connection banners to stdout,
//! and logs to stderr.
//!
//! ## Commands
//!
//! - `/dadjoke`: ask the hub for a joke
//! - `/count [n]`: stream a countdown from `n` (default 5)
//! - `/cancel`: stop the running countdown
//!
//! Anything else is broadcast to everyone in the room.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use hubchat::config::{Cli, Config};
use hubchat::presentation::Banner;
use hubchat::session::store::LogSubscription;
use hubchat::session::{ChatSession, SessionOptions};
use hubchat::storage::{JsonlStore, MemoryStore, MessageStore};
use hubchat::transport::SignalRTransport;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("hubchat: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("hubchat v{} starting", env!("CARGO_PKG_VERSION"));

    let transport = match SignalRTransport::new(config.signalr_options()) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("hubchat: {e}");
            std::process::exit(1);
        }
    };

    let storage: Arc<dyn MessageStore> = match config.storage_path() {
        Some(path) => {
            info!("Persisting messages to {}", path.display());
            Arc::new(JsonlStore::new(path))
        }
        None => Arc::new(MemoryStore::new()),
    };

    let session = ChatSession::start(
        transport,
        storage,
        SessionOptions {
            endpoint: config.hub.url.clone(),
            user_name: config.user.name.clone(),
        },
    )
    .await;
    info!("Chatting as {} on {}", config.user.name, config.hub.url);

    let log_printer = tokio::spawn(print_log(session.subscribe_log()));
    let banner_printer = tokio::spawn(print_banners(session.signals()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => session.submit(line),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.shutdown().await;
    log_printer.abort();
    banner_printer.abort();
}

/// Print each log entry once, as it is appended.
async fn print_log(mut log: LogSubscription) {
    let mut printed = 0;
    while let Some(snapshot) = log.next().await {
        // A resync after lag can deliver a snapshot that is further ahead.
        for message in snapshot.iter().skip(printed) {
            println!("{message}");
        }
        printed = snapshot.len();
    }
}

async fn print_banners(mut signals: broadcast::Receiver<Banner>) {
    loop {
        match signals.recv().await {
            Ok(banner) => {
                if let Some(text) = banner.text() {
                    println!("*** {text}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
