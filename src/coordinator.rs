use anyhow::{Result, anyhow};
use log::{debug, error, info, warn};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::chunk::ChunkClaim;
use crate::config::{ClaimPolicy, TorrentConfig};
use crate::error::AppError;
use crate::file_sink::FileSink;
use crate::magnet_link::MagnetLink;
use crate::metadata::{FileInfo, TorrentInfo, is_safe_component};
use crate::peer::{Peer, PeerAddr};
use crate::peer_session::{PeerBitfield, PeerSession};
use crate::piece::{Piece, layout_pieces};
use crate::tcp_connector::RealTcpConnector;
use crate::tracker_session::TrackerSession;
use crate::traits::{FileSelector, TcpConnector, UdpSocketFactory};
use crate::udp_socket::DefaultUdpSocketFactory;

const PEER_CHANNEL_SIZE: usize = 32;

/// Which files of the torrent get written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSelection {
    All,
    /// A single file by its index in the metadata. Out of range means all.
    Index(usize),
}

/// Selector that always returns the same decision, used by the CLI.
#[derive(Debug, Clone, Copy)]
pub struct FixedSelection(pub FileSelection);

impl FileSelector for FixedSelection {
    fn select(&self, files: &[FileInfo]) -> FileSelection {
        match self.0 {
            FileSelection::Index(index) if index < files.len() => FileSelection::Index(index),
            FileSelection::Index(index) => {
                warn!(
                    "[Torrent] file index {} out of range ({} files), downloading all",
                    index,
                    files.len()
                );
                FileSelection::All
            }
            FileSelection::All => FileSelection::All,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed_chunks: usize,
    pub total_chunks: usize,
    pub verified_pieces: usize,
    pub downloadable_pieces: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.verified_pieces == self.downloadable_pieces
    }
}

/// Requests a session sends into the coordinator loop.
#[derive(Debug)]
pub enum SessionCommand {
    Claim {
        bitfield: PeerBitfield,
        reply: oneshot::Sender<Option<ChunkClaim>>,
    },
    Deliver {
        claim: ChunkClaim,
        data: Vec<u8>,
    },
    Release {
        claim: ChunkClaim,
    },
    Ended {
        addr: PeerAddr,
    },
}

/// The side of the coordinator that sessions hold.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    metadata_tx: mpsc::Sender<Vec<u8>>,
    command_tx: mpsc::Sender<SessionCommand>,
    metadata_ready: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    pub fn new(
        metadata_tx: mpsc::Sender<Vec<u8>>,
        command_tx: mpsc::Sender<SessionCommand>,
        metadata_ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            metadata_tx,
            command_tx,
            metadata_ready,
        }
    }

    pub fn subscribe_metadata_ready(&self) -> watch::Receiver<bool> {
        self.metadata_ready.clone()
    }

    pub async fn deliver_metadata(&self, metadata: Vec<u8>) -> Result<()> {
        self.metadata_tx
            .send(metadata)
            .await
            .map_err(|_| AppError::channel_closed("metadata"))?;
        Ok(())
    }

    pub async fn claim(&self, bitfield: PeerBitfield) -> Result<Option<ChunkClaim>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Claim { bitfield, reply }).await?;
        let claim = rx.await.map_err(|_| AppError::channel_closed("claim reply"))?;
        Ok(claim)
    }

    pub async fn deliver(&self, claim: ChunkClaim, data: Vec<u8>) -> Result<()> {
        self.send(SessionCommand::Deliver { claim, data }).await
    }

    pub async fn release(&self, claim: ChunkClaim) -> Result<()> {
        self.send(SessionCommand::Release { claim }).await
    }

    pub async fn session_ended(&self, addr: PeerAddr) -> Result<()> {
        self.send(SessionCommand::Ended { addr }).await
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| AppError::channel_closed("session command"))?;
        Ok(())
    }
}

struct Receivers {
    metadata_rx: mpsc::Receiver<Vec<u8>>,
    command_rx: mpsc::Receiver<SessionCommand>,
    peers_rx: mpsc::Receiver<Vec<Peer>>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// Owns the piece table and the output files. Every mutation of chunk
/// state happens inside `run`, one command at a time.
pub struct Torrent {
    magnet: MagnetLink,
    config: TorrentConfig,
    selector: Box<dyn FileSelector>,
    tcp_connector: Arc<dyn TcpConnector>,
    socket_factory: Arc<dyn UdpSocketFactory>,

    info: Option<TorrentInfo>,
    pieces: Vec<Piece>,
    files: Vec<FileSink>,
    sessions: HashSet<PeerAddr>,
    trackers: Vec<JoinHandle<()>>,

    metadata_tx: mpsc::Sender<Vec<u8>>,
    command_tx: mpsc::Sender<SessionCommand>,
    peers_tx: mpsc::Sender<Vec<Peer>>,
    metadata_ready_tx: watch::Sender<bool>,
    progress_tx: watch::Sender<Progress>,
    shutdown_tx: broadcast::Sender<()>,
    receivers: Option<Receivers>,
}

impl Torrent {
    pub fn new(magnet: MagnetLink, config: TorrentConfig, selector: Box<dyn FileSelector>) -> Self {
        let tcp_connector = Arc::new(RealTcpConnector::new(config.session.connect_timeout));
        Self::with_transports(
            magnet,
            config,
            selector,
            tcp_connector,
            Arc::new(DefaultUdpSocketFactory),
        )
    }

    pub fn with_transports(
        magnet: MagnetLink,
        config: TorrentConfig,
        selector: Box<dyn FileSelector>,
        tcp_connector: Arc<dyn TcpConnector>,
        socket_factory: Arc<dyn UdpSocketFactory>,
    ) -> Self {
        let (metadata_tx, metadata_rx) = mpsc::channel(config.metadata_channel_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity.max(1));
        let (peers_tx, peers_rx) = mpsc::channel(PEER_CHANNEL_SIZE);
        let (metadata_ready_tx, _) = watch::channel(false);
        let (progress_tx, _) = watch::channel(Progress::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Self {
            magnet,
            config,
            selector,
            tcp_connector,
            socket_factory,
            info: None,
            pieces: Vec::new(),
            files: Vec::new(),
            sessions: HashSet::new(),
            trackers: Vec::new(),
            metadata_tx,
            command_tx,
            peers_tx,
            metadata_ready_tx,
            progress_tx,
            shutdown_tx,
            receivers: Some(Receivers {
                metadata_rx,
                command_rx,
                peers_rx,
                shutdown_rx,
            }),
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle::new(
            self.metadata_tx.clone(),
            self.command_tx.clone(),
            self.metadata_ready_tx.subscribe(),
        )
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn progress(&self) -> watch::Receiver<Progress> {
        self.progress_tx.subscribe()
    }

    /// Feeds peer addresses into the loop the same way tracker announces do.
    pub fn peer_sender(&self) -> mpsc::Sender<Vec<Peer>> {
        self.peers_tx.clone()
    }

    pub fn info(&self) -> Option<&TorrentInfo> {
        self.info.as_ref()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn pieces_mut(&mut self) -> &mut [Piece] {
        &mut self.pieces
    }

    pub fn files(&self) -> &[FileSink] {
        &self.files
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Runs until every selected piece is verified or shutdown is signalled.
    /// Only torrent-fatal errors are returned.
    pub async fn run(mut self) -> Result<()> {
        let Receivers {
            mut metadata_rx,
            mut command_rx,
            mut peers_rx,
            mut shutdown_rx,
        } = self
            .receivers
            .take()
            .ok_or_else(|| anyhow!("torrent is already running"))?;

        self.start_trackers();

        let result = loop {
            tokio::select! {
                Some(metadata) = metadata_rx.recv() => {
                    if let Err(e) = self.handle_metadata(metadata).await {
                        error!("[Torrent] metadata rejected: {}", e);
                        break Err(e);
                    }
                    if self.is_complete() {
                        break Ok(());
                    }
                }

                Some(command) = command_rx.recv() => {
                    match self.handle_command(command).await {
                        Ok(true) => break Ok(()),
                        Ok(false) => {}
                        Err(e) => {
                            error!("[Torrent] write failed: {}", e);
                            break Err(e);
                        }
                    }
                }

                Some(peers) = peers_rx.recv() => {
                    self.spawn_sessions(peers);
                }

                _ = shutdown_rx.recv() => {
                    info!("[Torrent] shutdown requested");
                    break Ok(());
                }
            }
        };

        self.shutdown().await?;
        result
    }

    fn start_trackers(&mut self) {
        let peer_id = self.config.client_peer_id;

        for url in &self.magnet.trackers {
            let tracker = match TrackerSession::new(
                url,
                self.magnet.info_hash,
                peer_id,
                self.config.tracker.clone(),
                self.socket_factory.clone(),
            ) {
                Ok(tracker) => tracker,
                Err(e) => {
                    warn!("[Torrent] skipping tracker {}: {}", url, e);
                    continue;
                }
            };

            let peers_tx = self.peers_tx.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.trackers
                .push(tokio::spawn(tracker.run(peers_tx, shutdown_rx)));
        }

        if self.trackers.is_empty() {
            warn!("[Torrent] no usable UDP tracker in the magnet link");
        }
    }

    fn spawn_sessions(&mut self, peers: Vec<Peer>) {
        for peer in peers {
            let addr = peer.get_addr();
            if !self.sessions.insert(addr.clone()) {
                continue;
            }

            debug!("[Torrent] starting session for Peer {}", addr);
            let session = PeerSession::new(
                peer,
                self.magnet.info_hash,
                self.config.client_peer_id,
                self.config.session.clone(),
                self.tcp_connector.clone(),
                self.handle(),
                self.shutdown_tx.subscribe(),
            );
            tokio::spawn(session.run());
        }
    }

    /// Checks an assembled metadata blob against the info hash and ingests
    /// it. Later deliveries are ignored once metadata is loaded.
    pub async fn handle_metadata(&mut self, metadata: Vec<u8>) -> Result<()> {
        if self.info.is_some() {
            debug!("[Torrent] metadata already loaded, ignoring {} bytes", metadata.len());
            return Ok(());
        }

        let digest: [u8; 20] = Sha1::digest(&metadata).into();
        if digest != self.magnet.info_hash {
            warn!(
                "[Torrent] {}: got {}, ignoring delivery",
                AppError::MetadataHashMismatch,
                hex::encode(digest)
            );
            return Ok(());
        }

        let info = TorrentInfo::from_bytes(&metadata)?;
        self.ingest_metadata(info).await
    }

    /// Builds the file and piece tables, asks the selector which files to
    /// write and tells the sessions they may start claiming chunks.
    pub async fn ingest_metadata(&mut self, info: TorrentInfo) -> Result<()> {
        if self.info.is_some() {
            return Ok(());
        }

        let root = self.output_root(&info);
        let mut files: Vec<FileSink> = info
            .files
            .iter()
            .map(|f| FileSink::new(root.join(f.relative_path()), f.length))
            .collect();

        let pieces = layout_pieces(
            info.piece_length,
            &info.piece_hashes,
            &mut files,
            self.config.chunk_size,
        )?;

        self.files = files;
        self.pieces = pieces;

        let selection = self.selector.select(&info.files);
        self.apply_selection(selection);

        info!(
            "[Torrent] metadata loaded: {:?}, {} files, {} pieces of {} bytes, selection {:?}",
            info.name,
            info.files.len(),
            self.pieces.len(),
            info.piece_length,
            selection
        );

        self.info = Some(info);
        self.metadata_ready_tx.send_replace(true);
        self.publish_progress();
        Ok(())
    }

    fn output_root(&self, info: &TorrentInfo) -> PathBuf {
        let name = self
            .magnet
            .display_name
            .as_deref()
            .filter(|name| is_safe_component(name))
            .or(Some(info.name.as_str()).filter(|name| is_safe_component(name)))
            .map(str::to_string)
            .unwrap_or_else(|| hex::encode(self.magnet.info_hash));

        self.config.output_dir.join(name)
    }

    /// Marks the selected files and every piece overlapping them downloadable.
    pub fn apply_selection(&mut self, selection: FileSelection) {
        let selected = |index: usize| match selection {
            FileSelection::All => true,
            FileSelection::Index(i) if i < self.files.len() => i == index,
            FileSelection::Index(_) => true,
        };

        let flags: Vec<bool> = (0..self.files.len()).map(selected).collect();
        for (file, flag) in self.files.iter_mut().zip(&flags) {
            file.downloadable = *flag;
        }

        for piece in &mut self.pieces {
            piece.downloadable = piece.boundaries.iter().any(|b| flags[b.file_index]);
        }
    }

    /// Scans pieces in index order and hands out the first Ready chunk the
    /// peer is eligible for.
    pub fn claim_chunk(&mut self, bitfield: &PeerBitfield) -> Option<ChunkClaim> {
        let policy = self.config.claim_policy;

        self.pieces
            .iter_mut()
            .filter(|piece| piece.downloadable && !piece.is_verified())
            .filter(|piece| is_eligible(policy, bitfield, piece.index))
            .find_map(Piece::get_next_chunk)
    }

    /// Stores a delivered chunk and verifies its piece once complete.
    /// Returns true when every selected piece is verified.
    pub async fn deliver_chunk(&mut self, claim: ChunkClaim, data: Vec<u8>) -> Result<bool> {
        let Some(piece) = self.pieces.get_mut(claim.piece_index) else {
            warn!("[Torrent] delivery for unknown piece {}", claim.piece_index);
            return Ok(false);
        };

        if let Err(e) = piece.complete_chunk(&claim, data) {
            debug!("[Torrent] rejecting delivery: {}", e);
            piece.release_chunk(claim.chunk_index);
            return Ok(false);
        }

        let (completed, total, verified) = piece.chunks_count(&mut self.files).await?;
        if verified {
            info!("[Torrent] piece {} verified", piece.index);
            self.publish_progress();
        } else if completed == 0 && total > 0 {
            warn!("[Torrent] piece {} failed verification, re-requesting", piece.index);
        }

        Ok(self.is_complete())
    }

    pub fn release_chunk(&mut self, claim: ChunkClaim) {
        if let Some(piece) = self.pieces.get_mut(claim.piece_index) {
            piece.release_chunk(claim.chunk_index);
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Result<bool> {
        match command {
            SessionCommand::Claim { bitfield, reply } => {
                let claim = self.claim_chunk(&bitfield);
                if reply.send(claim).is_err() {
                    // Requester is gone; the chunk must not stay InProgress.
                    if let Some(claim) = claim {
                        self.release_chunk(claim);
                    }
                }
                Ok(false)
            }
            SessionCommand::Deliver { claim, data } => self.deliver_chunk(claim, data).await,
            SessionCommand::Release { claim } => {
                self.release_chunk(claim);
                Ok(false)
            }
            SessionCommand::Ended { addr } => {
                self.sessions.remove(&addr);
                debug!(
                    "[Torrent] session for Peer {} ended, {} active",
                    addr,
                    self.sessions.len()
                );
                Ok(false)
            }
        }
    }

    pub fn current_progress(&self) -> Progress {
        let downloadable = self.pieces.iter().filter(|p| p.downloadable);

        let mut progress = Progress::default();
        for piece in downloadable {
            progress.downloadable_pieces += 1;
            progress.total_chunks += piece.chunks().len();
            progress.completed_chunks += piece.completed_chunks();
            if piece.is_verified() {
                progress.verified_pieces += 1;
            }
        }
        progress
    }

    fn publish_progress(&self) {
        let progress = self.current_progress();
        info!(
            "[Progress] {}/{} chunks, {}/{} pieces verified",
            progress.completed_chunks,
            progress.total_chunks,
            progress.verified_pieces,
            progress.downloadable_pieces
        );
        self.progress_tx.send_replace(progress);
    }

    pub fn is_complete(&self) -> bool {
        self.info.is_some() && self.current_progress().is_complete()
    }

    async fn shutdown(&mut self) -> Result<()> {
        // No receivers left is fine: every session already ended.
        let _ = self.shutdown_tx.send(());

        for tracker in self.trackers.drain(..) {
            if let Err(e) = tracker.await {
                debug!("[Torrent] tracker task ended abnormally: {}", e);
            }
        }

        for file in &mut self.files {
            file.close().await?;
        }

        if self.is_complete() {
            info!("[Torrent] download complete");
        }
        Ok(())
    }
}

fn is_eligible(policy: ClaimPolicy, bitfield: &PeerBitfield, index: usize) -> bool {
    match policy {
        ClaimPolicy::Strict => bitfield.has(index),
        ClaimPolicy::Optimistic => bitfield.has(index) || index >= bitfield.len(),
    }
}
