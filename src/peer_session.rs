use anyhow::{Result, anyhow};
use log::debug;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, timeout};

use crate::chunk::ChunkClaim;
use crate::config::{MAX_METADATA_SIZE, METADATA_BLOCK_SIZE, SessionConfig};
use crate::coordinator::CoordinatorHandle;
use crate::error::AppError;
use crate::io::TcpMessageIO;
use crate::peer::{Peer, PeerAddr, PeerId};
use crate::peer_messages::{
    HANDSHAKE_LENGTH, InterestedMessage, LOCAL_UT_METADATA_ID, MetadataResponse,
    PeerHandshakeMessage, PeerMessage, PieceMessage, RequestMessage, create_extension_handshake,
    create_metadata_request, parse_extension_handshake, parse_metadata_message,
};
use crate::traits::{MessageIO, TcpConnector};

/// Pieces a peer has announced through BITFIELD and HAVE.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerBitfield {
    bits: Vec<bool>,
}

impl PeerBitfield {
    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    /// Number of piece indices the peer has reported on, set or not.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        self.bits[index] = true;
    }

    /// Lays a full BITFIELD over what HAVE messages already reported.
    pub fn overlay(&mut self, bits: &[bool]) {
        if bits.len() > self.bits.len() {
            self.bits.resize(bits.len(), false);
        }
        for (slot, bit) in self.bits.iter_mut().zip(bits) {
            *slot |= *bit;
        }
    }
}

/// Collects ut_metadata fragments keyed by their piece index.
#[derive(Debug, Default)]
pub struct MetadataAssembly {
    pub ut_metadata: Option<u8>,
    pub total_size: Option<usize>,
    fragments: BTreeMap<usize, Vec<u8>>,
    received: usize,
    delivered: bool,
}

impl MetadataAssembly {
    pub fn is_started(&self) -> bool {
        self.ut_metadata.is_some() && self.total_size.is_some()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn num_fragments(&self) -> usize {
        self.total_size
            .map(|size| size.div_ceil(METADATA_BLOCK_SIZE))
            .unwrap_or(0)
    }

    /// Stores a fragment. Returns the assembled metadata once the received
    /// byte count reaches the advertised size.
    pub fn add_fragment(&mut self, piece: usize, data: Vec<u8>) -> Option<Vec<u8>> {
        let total_size = self.total_size?;
        if self.delivered || piece >= self.num_fragments() || self.fragments.contains_key(&piece) {
            return None;
        }

        self.received += data.len();
        self.fragments.insert(piece, data);

        if self.received < total_size {
            return None;
        }

        let mut metadata: Vec<u8> = self.fragments.values().flatten().copied().collect();
        metadata.truncate(total_size);
        self.delivered = true;
        self.fragments.clear();
        Some(metadata)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Handshaked,
}

/// One TCP connection to a remote peer. Claims chunks through the
/// coordinator and never touches the piece table itself.
pub struct PeerSession {
    peer: Peer,
    info_hash: [u8; 20],
    client_peer_id: PeerId,
    config: SessionConfig,
    tcp_connector: Arc<dyn TcpConnector>,
    coordinator: CoordinatorHandle,
    shutdown_rx: broadcast::Receiver<()>,
    metadata_ready: watch::Receiver<bool>,

    state: SessionState,
    choked: bool,
    bitfield: PeerBitfield,
    claimed: Option<ChunkClaim>,
    // Set on UNCHOKE, HAVE, BITFIELD, chunk completion and metadata readiness.
    wants_chunk: bool,
    metadata_loaded: bool,
    metadata_watch_closed: bool,
    metadata: MetadataAssembly,
}

impl PeerSession {
    pub fn new(
        peer: Peer,
        info_hash: [u8; 20],
        client_peer_id: PeerId,
        config: SessionConfig,
        tcp_connector: Arc<dyn TcpConnector>,
        coordinator: CoordinatorHandle,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let metadata_ready = coordinator.subscribe_metadata_ready();
        let metadata_loaded = *metadata_ready.borrow();

        Self {
            peer,
            info_hash,
            client_peer_id,
            config,
            tcp_connector,
            coordinator,
            shutdown_rx,
            metadata_ready,
            state: SessionState::Disconnected,
            choked: true,
            bitfield: PeerBitfield::default(),
            claimed: None,
            wants_chunk: false,
            metadata_loaded,
            metadata_watch_closed: false,
            metadata: MetadataAssembly::default(),
        }
    }

    pub fn addr(&self) -> PeerAddr {
        self.peer.get_addr()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn bitfield(&self) -> &PeerBitfield {
        &self.bitfield
    }

    pub fn claimed(&self) -> Option<ChunkClaim> {
        self.claimed
    }

    /// Connects, handshakes and runs the message loop until the session
    /// closes, then tells the coordinator the address is free again.
    pub async fn run(mut self) {
        let addr = self.addr();

        let result = match self.connect_and_handshake().await {
            Ok(io) => self.run_with_io(io).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => debug!("Peer Session for Peer {} closed", addr),
            Err(e) => debug!("Peer Session for Peer {} closed with error: {}", addr, e),
        }

        self.state = SessionState::Disconnected;
        if let Err(e) = self.coordinator.session_ended(addr.clone()).await {
            debug!("Peer Session for Peer {} could not report its end: {}", addr, e);
        }
    }

    async fn connect_and_handshake(&mut self) -> Result<Box<dyn MessageIO>> {
        let addr = self.addr();
        let mut stream = self.tcp_connector.connect(addr.clone()).await?;
        self.state = SessionState::Connected;
        debug!("Peer Session connected to Peer {}", addr);

        let handshake =
            PeerHandshakeMessage::new_with_extensions(self.info_hash, self.client_peer_id, true);

        timeout(self.config.read_timeout, stream.write_all(&handshake.to_bytes()))
            .await
            .map_err(|_| AppError::handshake_failed("timed out writing the handshake"))??;

        let mut reply = [0u8; HANDSHAKE_LENGTH];
        timeout(self.config.read_timeout, stream.read_exact(&mut reply))
            .await
            .map_err(|_| AppError::handshake_failed("timed out waiting for the reply"))??;

        let reply = validate_handshake(&reply, &self.info_hash)?;
        debug!(
            "Peer Session handshaked with Peer {} (peer id {}, extensions: {})",
            addr,
            hex::encode(reply.peer_id()),
            reply.supports_extensions()
        );

        Ok(Box::new(TcpMessageIO::from_stream(
            stream,
            self.config.max_message_length,
        )))
    }

    /// Runs the post-handshake protocol over `io`. Any chunk still claimed
    /// when the loop ends is released back to the coordinator.
    pub async fn run_with_io(&mut self, mut io: Box<dyn MessageIO>) -> Result<()> {
        self.state = SessionState::Handshaked;

        let result = self.message_loop(io.as_mut()).await;

        if let Some(claim) = self.claimed.take() {
            debug!(
                "Peer Session releasing chunk {} of piece {} from Peer {}",
                claim.chunk_index,
                claim.piece_index,
                self.addr()
            );
            if let Err(e) = self.coordinator.release(claim).await {
                debug!("Peer Session could not release chunk: {}", e);
            }
        }

        result
    }

    /// Highest piece count a single BITFIELD frame can describe.
    fn max_announced_pieces(&self) -> usize {
        self.config.max_message_length.saturating_mul(8)
    }

    fn can_request(&self) -> bool {
        self.state == SessionState::Handshaked && !self.choked && self.metadata_loaded
    }

    async fn message_loop(&mut self, io: &mut dyn MessageIO) -> Result<()> {
        io.write_message(&create_extension_handshake()?).await?;
        io.write_message(&PeerMessage::Interested(InterestedMessage {}))
            .await?;

        loop {
            if self.claimed.is_none() && self.wants_chunk && self.can_request() {
                self.wants_chunk = false;
                self.request_chunk(io).await?;
            }

            let read = tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    debug!("Peer Session for Peer {} received shutdown", self.addr());
                    return Ok(());
                }

                changed = self.metadata_ready.changed(), if !self.metadata_loaded && !self.metadata_watch_closed => {
                    match changed {
                        Ok(()) => {
                            if *self.metadata_ready.borrow_and_update() {
                                self.metadata_loaded = true;
                                self.wants_chunk = true;
                            }
                        }
                        Err(_) => self.metadata_watch_closed = true,
                    }
                    continue;
                }

                read = timeout(self.config.read_timeout, io.read_message()) => read,
            };

            match read {
                Err(_elapsed) => {
                    if let Some(claim) = self.claimed {
                        return Err(anyhow!(
                            "timed out waiting for chunk {} of piece {}",
                            claim.chunk_index,
                            claim.piece_index
                        ));
                    }
                    io.write_message(&PeerMessage::KeepAlive).await?;
                }
                Ok(Err(e)) => return Err(e),
                Ok(Ok(None)) => return Err(AppError::PeerDisconnected.into()),
                Ok(Ok(Some(message))) => self.handle_message(io, message).await?,
            }

            sleep(self.config.loop_delay).await;
        }
    }

    async fn request_chunk(&mut self, io: &mut dyn MessageIO) -> Result<()> {
        let Some(claim) = self.coordinator.claim(self.bitfield.clone()).await? else {
            debug!("Peer Session found no chunk to claim for Peer {}", self.addr());
            return Ok(());
        };

        self.claimed = Some(claim);
        debug!(
            "Peer Session requesting chunk {} of piece {} (begin {}, length {}) from Peer {}",
            claim.chunk_index,
            claim.piece_index,
            claim.begin,
            claim.length,
            self.addr()
        );

        io.write_message(&PeerMessage::Request(RequestMessage {
            piece_index: claim.piece_index as u32,
            begin: claim.begin,
            length: claim.length,
        }))
        .await
    }

    async fn handle_message(&mut self, io: &mut dyn MessageIO, message: PeerMessage) -> Result<()> {
        let addr = self.addr();

        match message {
            PeerMessage::KeepAlive => {
                debug!("Peer Session received KeepAlive from Peer {}", addr);
            }
            PeerMessage::Choke(_) => {
                debug!("Peer Session received Choke from Peer {}", addr);
                self.choked = true;
                if let Some(claim) = self.claimed.take() {
                    self.coordinator.release(claim).await?;
                }
            }
            PeerMessage::Unchoke(_) => {
                debug!("Peer Session received Unchoke from Peer {}", addr);
                self.choked = false;
                self.wants_chunk = true;
            }
            PeerMessage::Interested(_) | PeerMessage::NotInterested(_) => {
                debug!("Peer Session ignoring interest change from Peer {}", addr);
            }
            PeerMessage::Have(have) => {
                let index = have.piece_index as usize;
                let max = self.max_announced_pieces();
                if index >= max {
                    return Err(AppError::PieceIndexOutOfRange { index, max }.into());
                }
                self.bitfield.set(index);
                self.wants_chunk = true;
            }
            PeerMessage::Bitfield(bitfield) => {
                debug!("Peer Session received {:?} from Peer {}", bitfield, addr);
                self.bitfield.overlay(&bitfield.bitfield);
                self.wants_chunk = true;
            }
            PeerMessage::Piece(piece) => self.handle_piece(piece).await?,
            other @ (PeerMessage::Request(_) | PeerMessage::Cancel(_) | PeerMessage::Port(_)) => {
                debug!("Peer Session ignoring {:?} from Peer {}", other, addr);
            }
            PeerMessage::Extended {
                extension_id,
                payload,
            } => self.handle_extended(io, extension_id, &payload).await?,
        }

        Ok(())
    }

    async fn handle_piece(&mut self, piece: PieceMessage) -> Result<()> {
        let Some(claim) = self.claimed else {
            debug!(
                "Peer Session dropping unsolicited {:?} from Peer {}",
                piece,
                self.addr()
            );
            return Ok(());
        };

        if piece.piece_index as usize != claim.piece_index || piece.begin != claim.begin {
            self.claimed = None;
            self.coordinator.release(claim).await?;
            return Err(AppError::WrongPiece {
                piece_index: piece.piece_index,
                expected_begin: claim.begin,
                got_begin: piece.begin,
            }
            .into());
        }

        if piece.block.len() != claim.length as usize {
            self.claimed = None;
            self.coordinator.release(claim).await?;
            return Err(AppError::UnexpectedBlockLength {
                expected: claim.length as usize,
                got: piece.block.len(),
            }
            .into());
        }

        self.claimed = None;
        self.coordinator.deliver(claim, piece.block).await?;
        self.wants_chunk = true;
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        io: &mut dyn MessageIO,
        extension_id: u8,
        payload: &[u8],
    ) -> Result<()> {
        let addr = self.addr();

        if extension_id == 0 {
            let handshake = parse_extension_handshake(payload)?;
            debug!(
                "Peer Session received extension handshake from Peer {}: {:?}",
                addr, handshake
            );

            let (Some(ut_metadata), Some(size)) = (handshake.ut_metadata, handshake.metadata_size)
            else {
                return Ok(());
            };
            if self.metadata_loaded || self.metadata.is_started() {
                return Ok(());
            }
            check_metadata_size(size)?;

            self.metadata.ut_metadata = Some(ut_metadata);
            self.metadata.total_size = Some(size);

            for piece in 0..self.metadata.num_fragments() {
                io.write_message(&create_metadata_request(ut_metadata, piece)?)
                    .await?;
            }
            return Ok(());
        }

        if extension_id != LOCAL_UT_METADATA_ID {
            debug!(
                "Peer Session ignoring extension {} from Peer {}",
                extension_id, addr
            );
            return Ok(());
        }

        match parse_metadata_message(payload)? {
            MetadataResponse::Data {
                piece,
                total_size,
                data,
            } => {
                if self.metadata.total_size.is_none() {
                    check_metadata_size(total_size)?;
                    self.metadata.total_size = Some(total_size);
                }
                debug!(
                    "Peer Session received metadata piece {} ({} bytes) from Peer {}",
                    piece,
                    data.len(),
                    addr
                );
                if let Some(metadata) = self.metadata.add_fragment(piece, data) {
                    debug!(
                        "Peer Session assembled {} bytes of metadata from Peer {}",
                        metadata.len(),
                        addr
                    );
                    self.coordinator.deliver_metadata(metadata).await?;
                }
            }
            MetadataResponse::Reject { piece } => {
                debug!(
                    "Peer Session metadata piece {} rejected by Peer {}",
                    piece, addr
                );
            }
            MetadataResponse::Request { piece } => {
                debug!(
                    "Peer Session ignoring metadata request for piece {} from Peer {}",
                    piece, addr
                );
            }
        }

        Ok(())
    }
}

fn check_metadata_size(size: usize) -> Result<()> {
    if size > MAX_METADATA_SIZE {
        return Err(AppError::MetadataTooLarge {
            size,
            max: MAX_METADATA_SIZE,
        }
        .into());
    }
    Ok(())
}

/// Checks a 68-byte handshake reply against the info hash we asked for.
pub fn validate_handshake(bytes: &[u8], info_hash: &[u8; 20]) -> Result<PeerHandshakeMessage> {
    let reply = PeerHandshakeMessage::from_bytes(bytes)?;
    if &reply.info_hash() != info_hash {
        return Err(AppError::handshake_failed(format!(
            "info hash mismatch: expected {}, got {}",
            hex::encode(info_hash),
            hex::encode(reply.info_hash())
        ))
        .into());
    }
    Ok(reply)
}
