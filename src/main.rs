use std::collections::HashMap;
use std::error::Error;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beam::commands::{receive, send};
use beam::utils::{IncomingOffer, UserDecision};
use beam::{Endpoint, ReceiverOutcome, TransferConfig, TransferHooks};
use clap::{Parser, Subcommand};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "beam")]
#[command(about = "Encrypted file and folder transfer on the local network", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or folder
    Send {
        /// Path to the file or folder to send
        path: PathBuf,
        /// Transfer key (generated if not provided)
        #[arg(short, long)]
        key: Option<String>,
        /// Receiver address; skips discovery. Repeatable
        #[arg(long = "to", value_name = "ADDR")]
        to: Vec<SocketAddr>,
        /// Parallel connections per receiver
        #[arg(long, default_value_t = 1)]
        streams: usize,
        /// zlib level, 0 disables compression
        #[arg(long, default_value_t = 1)]
        compression: u32,
        /// Plaintext bytes per chunk
        #[arg(long, default_value_t = beam::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Deliver to every receiver that accepts, not only the first
        #[arg(long)]
        fanout: bool,
    },
    /// Receive files or folders until interrupted
    Receive {
        /// Directory to store received data in
        #[arg(short = 'd', long = "dir", default_value = ".")]
        download_dir: PathBuf,
    },
}

/// How long blocking work, such as a prompt still waiting on stdin, may
/// hold the process after the command finished.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    block_on_with_grace(run(cli.command), SHUTDOWN_GRACE)?
}

/// Runs `future` to completion, then gives blocking tasks `grace` to finish
/// instead of waiting for them indefinitely.
fn block_on_with_grace<F: Future>(future: F, grace: Duration) -> io::Result<F::Output> {
    let runtime = tokio::runtime::Runtime::new()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

async fn run(command: Commands) -> Result<(), Box<dyn Error>> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    match command {
        Commands::Send {
            path,
            key,
            to,
            streams,
            compression,
            chunk_size,
            fanout,
        } => {
            let config = TransferConfig {
                transfer_key: key,
                peers: to,
                stream_count: streams,
                compression_level: compression,
                chunk_size,
                fanout,
                ..TransferConfig::default()
            };
            let key = send::resolve_key(&config)?;
            println!("Transfer key: \x1b[4m\x1b[1m{}\x1b[0m", key);

            let report = send::run(&path, key, config, progress_hooks(), cancel).await?;
            print_summary(&report.outcomes);
            if !report.succeeded() {
                return Err("no receiver completed the transfer".into());
            }
        }
        Commands::Receive { download_dir } => {
            let hooks = TransferHooks {
                decision: Some(Arc::new(prompt_decision())),
                completion: Some(Arc::new(|outcomes: &[ReceiverOutcome]| print_summary(outcomes))),
                ..progress_hooks()
            };
            println!("Waiting for transfers into {}", download_dir.display());
            receive::run(download_dir, TransferConfig::default(), hooks, cancel).await?;
        }
    }

    Ok(())
}

/// One progress bar per peer.
fn progress_hooks() -> TransferHooks {
    let bars = MultiProgress::new();
    let by_peer: Mutex<HashMap<SocketAddr, ProgressBar>> = Mutex::new(HashMap::new());
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {prefix} [{bar:40.black}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar());

    TransferHooks {
        progress: Some(Arc::new(move |endpoint: &Endpoint, transferred: u64, total: Option<u64>| {
            let Ok(mut by_peer) = by_peer.lock() else {
                return;
            };
            let bar = by_peer.entry(endpoint.addr).or_insert_with(|| {
                let bar = match total {
                    Some(total) => bars.add(ProgressBar::new(total)),
                    None => bars.add(ProgressBar::new_spinner()),
                };
                bar.set_style(style.clone());
                bar.set_prefix(endpoint.to_string());
                bar
            });
            bar.set_position(transferred);
            if total == Some(transferred) {
                bar.finish();
            }
        })),
        ..TransferHooks::default()
    }
}

/// Asks on the terminal whether to accept an offer and for its key.
/// Prompts are serialized so concurrent offers do not interleave.
fn prompt_decision() -> impl Fn(&IncomingOffer) -> UserDecision + Send + Sync {
    let terminal = Mutex::new(());
    move |offer| {
        let Ok(_guard) = terminal.lock() else {
            return UserDecision::decline();
        };
        let what = if offer.is_directory {
            "folder".to_string()
        } else {
            format!("file, {}", HumanBytes(offer.size.unwrap_or(0)))
        };
        println!("{} wants to send {:?} ({})", offer.sender, offer.name, what);

        let Some(answer) = read_line("Accept? [y/N] ") else {
            return UserDecision::decline();
        };
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            return UserDecision::decline();
        }
        match read_line("Transfer key: ") {
            Some(key) => UserDecision::accept(key),
            None => UserDecision::decline(),
        }
    }
}

fn read_line(prompt: &str) -> Option<String> {
    print!("{prompt}");
    io::stdout().flush().ok()?;
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

fn print_summary(outcomes: &[ReceiverOutcome]) {
    for outcome in outcomes {
        if outcome.is_success() {
            println!(
                "{}: complete, {} over {} stream(s)",
                outcome.endpoint,
                HumanBytes(outcome.bytes_transferred),
                outcome.stream_count
            );
        } else {
            println!(
                "{}: {} ({})",
                outcome.endpoint, outcome.kind, outcome.detail
            );
        }
    }
    // Give the bars a moment to redraw before the summary scrolls them.
    std::thread::sleep(Duration::from_millis(10));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_unanswered_prompt_does_not_block_exit() {
        let started = Instant::now();
        let answer = block_on_with_grace(
            async {
                // Stands in for a prompt nobody answers.
                tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(10)));
                42
            },
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(answer, 42);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
