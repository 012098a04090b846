use crate::coordinator::FileSelection;
use crate::metadata::FileInfo;
use crate::peer_messages::PeerMessage;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Abstraction for TCP connection establishment.
/// Allows testing handshake logic without actual network I/O.
#[async_trait]
pub trait TcpConnector: Send + Sync + std::fmt::Debug {
    /// Connect to a peer address and return a TcpStream.
    async fn connect(&self, addr: String) -> Result<TcpStream>;
}

/// Abstraction for peer-to-peer message I/O after handshake.
/// Handles BitTorrent peer protocol message encoding/decoding.
#[async_trait]
pub trait MessageIO: Send + Sync + std::fmt::Debug {
    /// Write a peer protocol message to the stream.
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()>;

    /// Read the next peer protocol message from the stream.
    /// Returns None if the stream has ended gracefully.
    async fn read_message(&mut self) -> Result<Option<PeerMessage>>;
}

/// A connected datagram socket towards one tracker.
#[async_trait]
pub trait TrackerSocket: Send + Sync + std::fmt::Debug {
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Receives one datagram, returning the number of bytes written into `buf`.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}

#[async_trait]
pub trait UdpSocketFactory: Send + Sync + std::fmt::Debug {
    /// Opens a socket connected to `host` (`name:port`).
    async fn connect(&self, host: &str) -> Result<Arc<dyn TrackerSocket>>;
}

/// Decision point for which files of the torrent get written.
/// Called once, right after the metadata has been ingested.
pub trait FileSelector: Send + Sync {
    fn select(&self, files: &[FileInfo]) -> FileSelection;
}
