//! Command-line front-end for the swarmfetch engine.
//!
//! Deliberately thin: parse arguments, install the tracing subscriber,
//! relay progress events to the terminal, and map the engine's outcome
//! to an exit code. All download logic lives in the library.
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use swarmfetch::{Config, Engine, ProgressEvent, TorrentSource};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "swarmfetch", version, about = "One-shot BitTorrent downloader")]
struct Cli {
    /// Path to a .torrent file, or a magnet link
    source: String,

    /// Directory the content is written into
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Cap on concurrently open peer connections
    #[arg(long)]
    max_peers: Option<usize>,

    /// Port reported to trackers
    #[arg(long)]
    port: Option<u16>,

    /// Suppress the progress line
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let source = match TorrentSource::parse(&cli.source) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("swarmfetch: {e}");
            return ExitCode::from(2);
        }
    };

    let mut cfg = Config::default();
    if let Some(max_peers) = cli.max_peers {
        cfg.max_peers = max_peers;
    }
    if let Some(port) = cli.port {
        cfg.listen_port = port;
    }
    let engine = match Engine::new(cfg) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("swarmfetch: {e}");
            return ExitCode::from(2);
        }
    };

    if !cli.quiet {
        let mut progress = engine.subscribe();
        tokio::spawn(async move {
            loop {
                match progress.recv().await {
                    Ok(ProgressEvent::Snapshot(s)) => {
                        println!(
                            "{}/{} pieces  {:.1}/{:.1} MiB  {} peers  {:.2} Mbit/s  {}s",
                            s.pieces_done,
                            s.pieces_total,
                            s.bytes_done as f64 / (1024.0 * 1024.0),
                            s.bytes_total as f64 / (1024.0 * 1024.0),
                            s.peers_connected,
                            s.download_rate_bps as f64 / 1_000_000.0,
                            s.elapsed_s,
                        );
                    }
                    Ok(ProgressEvent::Completed) => {
                        println!("download complete");
                        break;
                    }
                    Ok(ProgressEvent::Failed { cause }) => {
                        println!("download failed: {cause}");
                        break;
                    }
                    // dropped some snapshots while the terminal was slow
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    match engine.run(source, &cli.output).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("swarmfetch: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
