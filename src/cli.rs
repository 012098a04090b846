use clap::Parser;
use std::path::PathBuf;

use crate::config::{ClaimPolicy, DEFAULT_CHUNK_SIZE, TorrentConfig};
use crate::coordinator::FileSelection;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Magnet link to download (magnet:?xt=urn:btih:...)
    pub magnet: String,

    /// Output directory to save the downloaded files
    #[arg(short = 'o', long = "output", default_value = "./downloads")]
    pub output_directory_path: PathBuf,

    /// Index of the single file to download; all files when omitted
    #[arg(short = 'f', long = "file")]
    pub file_index: Option<usize>,

    /// Bytes requested per chunk
    #[arg(
        long = "chunk-size",
        default_value_t = DEFAULT_CHUNK_SIZE,
        value_parser = clap::value_parser!(u32).range(1..=16_384)
    )]
    pub chunk_size: u32,

    /// Only request pieces a peer has announced
    #[arg(long = "strict-availability")]
    pub strict_availability: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn torrent_config(&self) -> TorrentConfig {
        let mut config = TorrentConfig {
            output_dir: self.output_directory_path.clone(),
            claim_policy: if self.strict_availability {
                ClaimPolicy::Strict
            } else {
                ClaimPolicy::Optimistic
            },
            ..TorrentConfig::default()
        };
        config.set_chunk_size(self.chunk_size);
        config
    }

    pub fn file_selection(&self) -> FileSelection {
        match self.file_index {
            Some(index) => FileSelection::Index(index),
            None => FileSelection::All,
        }
    }
}
