use anyhow::Result;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use rand::Rng;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use url::Url;

use crate::config::TrackerConfig;
use crate::error::AppError;
use crate::peer::{COMPACT_PEER_LENGTH, Peer, PeerId};
use crate::traits::{TrackerSocket, UdpSocketFactory};

pub const PROTOCOL_ID: u64 = 0x41727101980;
const CONNECT_REQUEST_LENGTH: usize = 16;
const ANNOUNCE_REQUEST_LENGTH: usize = 98;
const ANNOUNCE_HEADER_LENGTH: usize = 20;
const RESPONSE_BUFFER_SIZE: usize = 2048;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const EVENT_STARTED: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<Peer>,
}

/// One UDP tracker. Holds the connection id between connect and announce.
pub struct TrackerSession {
    host: String,
    info_hash: [u8; 20],
    client_peer_id: PeerId,
    config: TrackerConfig,
    socket_factory: Arc<dyn UdpSocketFactory>,

    socket: Option<Arc<dyn TrackerSocket>>,
    connection_id: Option<u64>,
    interval: Duration,
    seeders: u32,
    leechers: u32,
    peers: Vec<Peer>,
}

impl TrackerSession {
    /// Accepts `udp://host:port[/path]` urls only.
    pub fn new(
        url: &str,
        info_hash: [u8; 20],
        client_peer_id: PeerId,
        config: TrackerConfig,
        socket_factory: Arc<dyn UdpSocketFactory>,
    ) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| AppError::UnsupportedTracker(url.to_string()))?;
        if parsed.scheme() != "udp" {
            return Err(AppError::UnsupportedTracker(url.to_string()).into());
        }

        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port()) else {
            return Err(AppError::UnsupportedTracker(url.to_string()).into());
        };

        let interval = config.min_announce_interval;
        Ok(Self {
            host: format!("{}:{}", host, port),
            info_hash,
            client_peer_id,
            config,
            socket_factory,
            socket: None,
            connection_id: None,
            interval,
            seeders: 0,
            leechers: 0,
            peers: Vec::new(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection_id
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn swarm(&self) -> (u32, u32) {
        (self.seeders, self.leechers)
    }

    /// Announce interval, never shorter than the configured minimum.
    pub fn interval(&self) -> Duration {
        self.interval.max(self.config.min_announce_interval)
    }

    async fn socket(&mut self) -> Result<Arc<dyn TrackerSocket>> {
        if let Some(socket) = &self.socket {
            return Ok(socket.clone());
        }
        let socket = self.socket_factory.connect(&self.host).await?;
        self.socket = Some(socket.clone());
        Ok(socket)
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let socket = self.socket().await?;
        socket.send(request).await?;

        let mut buf = vec![0u8; RESPONSE_BUFFER_SIZE];
        let n = timeout(self.config.response_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| AppError::TrackerTimeout)??;
        buf.truncate(n);
        Ok(buf)
    }

    pub async fn connect(&mut self) -> Result<u64> {
        let transaction_id = rand::thread_rng().r#gen::<u32>();
        let request = build_connect_request(transaction_id)?;

        let response = self.exchange(&request).await?;
        let connection_id = parse_connect_response(&response, transaction_id)?;

        debug!("Tracker {} connected (connection id {:#x})", self.host, connection_id);
        self.connection_id = Some(connection_id);
        Ok(connection_id)
    }

    pub async fn announce(&mut self) -> Result<AnnounceResponse> {
        let connection_id = match self.connection_id {
            Some(id) => id,
            None => self.connect().await?,
        };

        let (transaction_id, key) = {
            let mut rng = rand::thread_rng();
            (rng.r#gen::<u32>(), rng.r#gen::<u32>())
        };

        let request = build_announce_request(
            connection_id,
            transaction_id,
            &self.info_hash,
            &self.client_peer_id,
            key,
            self.config.announce_port,
        )?;

        let response = self.exchange(&request).await?;
        let announce = parse_announce_response(&response, transaction_id)?;

        self.interval = Duration::from_secs(announce.interval as u64);
        self.seeders = announce.seeders;
        self.leechers = announce.leechers;
        self.peers = announce.peers.clone();

        Ok(announce)
    }

    /// Connection ids expire, so every cycle starts with a fresh connect.
    async fn connect_and_announce(&mut self) -> Result<AnnounceResponse> {
        self.connection_id = None;
        self.connect().await?;
        self.announce().await
    }

    /// Announces until shutdown, reporting the full peer list each cycle.
    pub async fn run(mut self, peers_tx: mpsc::Sender<Vec<Peer>>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let result = tokio::select! {
                _ = shutdown_rx.recv() => return,
                result = self.connect_and_announce() => result,
            };

            let wait = match result {
                Ok(announce) => {
                    info!(
                        "Tracker {} announced: {} peers, {} seeders, {} leechers, interval {}s",
                        self.host,
                        announce.peers.len(),
                        announce.seeders,
                        announce.leechers,
                        announce.interval
                    );

                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        sent = peers_tx.send(announce.peers) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    self.interval()
                }
                Err(e) => {
                    warn!("Tracker {} announce failed: {}", self.host, e);
                    // A broken socket is rebuilt on the next cycle.
                    self.socket = None;
                    self.config.retry_interval
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = sleep(wait) => {}
            }
        }
    }
}

pub fn build_connect_request(transaction_id: u32) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(CONNECT_REQUEST_LENGTH);
    buf.write_u64::<BigEndian>(PROTOCOL_ID)?;
    buf.write_u32::<BigEndian>(ACTION_CONNECT)?;
    buf.write_u32::<BigEndian>(transaction_id)?;
    Ok(buf)
}

pub fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    info_hash: &[u8; 20],
    peer_id: &PeerId,
    key: u32,
    port: u16,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(ANNOUNCE_REQUEST_LENGTH);
    buf.write_u64::<BigEndian>(connection_id)?;
    buf.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    buf.write_u32::<BigEndian>(transaction_id)?;
    buf.write_all(info_hash)?;
    buf.write_all(peer_id)?;
    buf.write_u64::<BigEndian>(0)?; // downloaded
    buf.write_u64::<BigEndian>(0)?; // left
    buf.write_u64::<BigEndian>(0)?; // uploaded
    buf.write_u32::<BigEndian>(EVENT_STARTED)?;
    buf.write_u32::<BigEndian>(0)?; // ip: tracker uses the sender address
    buf.write_u32::<BigEndian>(key)?;
    buf.write_i32::<BigEndian>(-1)?; // num_want: as many as possible
    buf.write_u16::<BigEndian>(port)?;
    Ok(buf)
}

// Reads action and transaction id, turning an error reply into TrackerRejected.
fn read_header(buf: &[u8], expected_action: u32, transaction_id: u32) -> Result<Cursor<&[u8]>> {
    if buf.len() < 8 {
        return Err(AppError::TrackerResponseTooShort {
            expected: 8,
            got: buf.len(),
        }
        .into());
    }

    let mut reader = Cursor::new(buf);
    let action = reader.read_u32::<BigEndian>()?;
    let got_transaction_id = reader.read_u32::<BigEndian>()?;

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&buf[8..]).to_string();
        return Err(AppError::tracker_rejected(message).into());
    }
    if action != expected_action {
        return Err(AppError::TrackerInvalidAction {
            expected: expected_action,
            got: action,
        }
        .into());
    }
    if got_transaction_id != transaction_id {
        return Err(AppError::TrackerTransactionMismatch {
            expected: transaction_id,
            got: got_transaction_id,
        }
        .into());
    }

    Ok(reader)
}

pub fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64> {
    let mut reader = read_header(buf, ACTION_CONNECT, transaction_id)?;
    if buf.len() < CONNECT_REQUEST_LENGTH {
        return Err(AppError::TrackerResponseTooShort {
            expected: CONNECT_REQUEST_LENGTH,
            got: buf.len(),
        }
        .into());
    }
    Ok(reader.read_u64::<BigEndian>()?)
}

/// Peers follow the 20-byte header as 6-byte entries until the buffer ends
/// or an all-zero address shows up.
pub fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<AnnounceResponse> {
    let mut reader = read_header(buf, ACTION_ANNOUNCE, transaction_id)?;
    if buf.len() < ANNOUNCE_HEADER_LENGTH {
        return Err(AppError::TrackerResponseTooShort {
            expected: ANNOUNCE_HEADER_LENGTH,
            got: buf.len(),
        }
        .into());
    }

    let interval = reader.read_u32::<BigEndian>()?;
    let leechers = reader.read_u32::<BigEndian>()?;
    let seeders = reader.read_u32::<BigEndian>()?;

    let mut peers = Vec::new();
    for entry in buf[ANNOUNCE_HEADER_LENGTH..].chunks_exact(COMPACT_PEER_LENGTH) {
        if entry[..4] == [0, 0, 0, 0] {
            break;
        }
        peers.push(Peer::from_compact(entry)?);
    }

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}
