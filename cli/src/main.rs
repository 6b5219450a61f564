//! broadcast-tail - follow broadcaster channels from a terminal
//!
//! ```bash
//! broadcast-tail --config broadcaster.json team-5 user-9
//! ```
//!
//! Every status and message is printed to stdout as one JSON line; logs go to
//! stderr.

use std::path::PathBuf;
use std::process::ExitCode;

use broadcaster::logging::{self, LogFormat};
use broadcaster::{load_config, Broadcaster};
use clap::Parser;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(name = "broadcast-tail")]
#[command(about = "Print broadcaster statuses and messages as JSON lines", long_about = None)]
struct Cli {
    /// Broadcaster config file (JSON)
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long = "json-logs")]
    json_logs: bool,

    /// Channels to subscribe to
    #[arg(required = true)]
    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let broadcaster = match Broadcaster::initialize(&config).await {
        Ok(broadcaster) => broadcaster,
        Err(e) => {
            tracing::error!("Failed to initialize broadcaster: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut statuses = broadcaster.status_events();
    let mut messages = broadcaster.messages();
    broadcaster.subscribe(cli.channels);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, disposing");
                break;
            }
            status = statuses.recv() => match status {
                Ok(status) => println!("{}", json!({ "type": "status", "status": status })),
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} statuses", n),
                Err(RecvError::Closed) => break,
            },
            batch = messages.recv() => match batch {
                Ok(batch) => {
                    for message in batch {
                        println!("{}", json!({ "type": "message", "message": message }));
                    }
                }
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} message batches", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    broadcaster.dispose().await;
    ExitCode::SUCCESS
}
