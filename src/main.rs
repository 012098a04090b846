use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use magnet_swarm::cli::Args;
use magnet_swarm::coordinator::{FixedSelection, Torrent};
use magnet_swarm::magnet_link::MagnetLink;

fn init_logger(level: &str) {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filters)
        .init();
}

async fn run(args: Args) -> Result<()> {
    let magnet = MagnetLink::parse(&args.magnet)?;
    info!(
        "[main] downloading {} ({}) with {} trackers",
        magnet.display_name.as_deref().unwrap_or("<unnamed>"),
        hex::encode(magnet.info_hash),
        magnet.trackers.len()
    );

    let torrent = Torrent::new(
        magnet,
        args.torrent_config(),
        Box::new(FixedSelection(args.file_selection())),
    );

    let shutdown = torrent.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[main] interrupted, shutting down");
            let _ = shutdown.send(());
        }
    });

    torrent.run().await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args.log_level);

    if let Err(error) = run(args).await {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}
