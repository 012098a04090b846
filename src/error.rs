use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Incomplete message: need {needed} bytes, got {available}")]
    IncompleteMessage { needed: usize, available: usize },

    #[error("Message too short: {0} bytes")]
    MessageTooShort(usize),

    #[error("Message length {length} out of bounds (max {max})")]
    MessageTooLong { length: usize, max: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    // Bencode/Metadata errors
    #[error("Invalid bencode format: {0}")]
    InvalidBencode(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field type: {field}, expected {expected}")]
    InvalidFieldType { field: String, expected: String },

    #[error("Metadata does not match the info hash")]
    MetadataHashMismatch,

    #[error("Piece count mismatch: files need {expected} pieces, metadata has {got} hashes")]
    PieceCountMismatch { expected: usize, got: usize },

    // Codec/Protocol errors (can wrap CodecError)
    #[error(transparent)]
    Codec(#[from] CodecError),

    // Peer errors
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Wrong piece: piece {piece_index} expected begin {expected_begin}, got {got_begin}")]
    WrongPiece {
        piece_index: u32,
        expected_begin: u32,
        got_begin: u32,
    },

    #[error("Unexpected block length: expected {expected}, got {got}")]
    UnexpectedBlockLength { expected: usize, got: usize },

    #[error("Piece index {index} out of range (max {max})")]
    PieceIndexOutOfRange { index: usize, max: usize },

    #[error("Metadata size {size} exceeds the limit of {max} bytes")]
    MetadataTooLarge { size: usize, max: usize },

    // Tracker errors
    #[error("Tracker replied with action {got}, expected {expected}")]
    TrackerInvalidAction { expected: u32, got: u32 },

    #[error("Tracker transaction id mismatch: expected {expected}, got {got}")]
    TrackerTransactionMismatch { expected: u32, got: u32 },

    #[error("Tracker response too short: expected at least {expected} bytes, got {got}")]
    TrackerResponseTooShort { expected: usize, got: usize },

    #[error("Tracker rejected request: {0}")]
    TrackerRejected(String),

    #[error("Tracker did not answer in time")]
    TrackerTimeout,

    #[error("Unsupported tracker url: {0}")]
    UnsupportedTracker(String),

    // Input errors
    #[error("Invalid magnet link: {0}")]
    InvalidMagnet(String),

    // Channel/async errors
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = anyhow::Result<T>;

impl AppError {
    pub fn missing_field(field: &str) -> Self {
        AppError::MissingField(field.to_string())
    }

    pub fn invalid_field_type(field: &str, expected: &str) -> Self {
        AppError::InvalidFieldType {
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }

    pub fn invalid_bencode(msg: impl Into<String>) -> Self {
        AppError::InvalidBencode(msg.into())
    }

    pub fn handshake_failed(msg: impl Into<String>) -> Self {
        AppError::HandshakeFailed(msg.into())
    }

    pub fn tracker_rejected(msg: impl Into<String>) -> Self {
        AppError::TrackerRejected(msg.into())
    }

    pub fn invalid_magnet(msg: impl Into<String>) -> Self {
        AppError::InvalidMagnet(msg.into())
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        AppError::ChannelClosed(msg.into())
    }
}
