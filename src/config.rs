use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024; // 16 KiB per BitTorrent spec
pub const METADATA_BLOCK_SIZE: usize = 16 * 1024;
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

// Slack on top of the largest block for the frame header and bitfields.
const MESSAGE_LENGTH_SLACK: usize = 10_000;

const PEER_ID_PREFIX: &[u8; 8] = b"-MS0100-";

/// Decides which pieces a peer may claim chunks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimPolicy {
    /// Eligible when the peer's bitfield has the piece, or when the piece index
    /// lies beyond the bitfield range the peer has reported so far.
    #[default]
    Optimistic,
    /// Eligible only when the peer's bitfield has the piece.
    Strict,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub loop_delay: Duration,
    pub max_message_length: usize,
}

impl SessionConfig {
    pub fn with_chunk_size(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            max_message_length: max_message_length(chunk_size),
            ..Self::default()
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            loop_delay: Duration::from_millis(10),
            max_message_length: max_message_length(DEFAULT_CHUNK_SIZE),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub response_timeout: Duration,
    pub min_announce_interval: Duration,
    pub retry_interval: Duration,
    pub announce_port: u16,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            min_announce_interval: Duration::from_secs(15),
            retry_interval: Duration::from_secs(60),
            announce_port: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {
    pub chunk_size: u32,
    pub output_dir: PathBuf,
    pub client_peer_id: [u8; 20],
    pub claim_policy: ClaimPolicy,
    pub metadata_channel_capacity: usize,
    pub command_channel_capacity: usize,
    pub session: SessionConfig,
    pub tracker: TrackerConfig,
}

impl TorrentConfig {
    /// Changes the chunk size for both the piece table and the sessions.
    pub fn set_chunk_size(&mut self, chunk_size: u32) {
        self.chunk_size = chunk_size;
        let session = SessionConfig::with_chunk_size(chunk_size);
        self.session.chunk_size = session.chunk_size;
        self.session.max_message_length = session.max_message_length;
    }
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            output_dir: PathBuf::from("./downloads"),
            client_peer_id: generate_peer_id(),
            claim_policy: ClaimPolicy::default(),
            metadata_channel_capacity: 16,
            command_channel_capacity: 64,
            session: SessionConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Frame bound that fits both a PIECE of `chunk_size` and a full
/// ut_metadata data message.
pub fn max_message_length(chunk_size: u32) -> usize {
    (chunk_size as usize).max(METADATA_BLOCK_SIZE) + MESSAGE_LENGTH_SLACK
}

/// Azureus-style peer id: fixed client prefix followed by random digits.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);

    let mut rng = rand::thread_rng();
    for byte in peer_id[8..].iter_mut() {
        *byte = b'0' + rng.gen_range(0..10);
    }
    peer_id
}
