use anyhow::{Result, anyhow};
use log::debug;
use sha1::{Digest, Sha1};

use crate::chunk::{Chunk, ChunkClaim, ChunkStatus};
use crate::error::AppError;
use crate::file_sink::FileSink;

/// Maps `[piece_start, piece_end)` of a piece onto `[file_start, file_end)` of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub file_index: usize,
    pub file_start: u64,
    pub file_end: u64,
    pub piece_start: u64,
    pub piece_end: u64,
}

#[derive(Debug)]
pub struct Piece {
    pub index: usize,
    pub length: u64,
    pub hash: [u8; 20],
    pub boundaries: Vec<Boundary>,
    pub downloadable: bool,

    // Room left for boundaries while files are being tiled.
    bytes_remaining: u64,
    chunks: Vec<Chunk>,
    verified: bool,
}

impl Piece {
    pub fn new(index: usize, length: u64, hash: [u8; 20]) -> Self {
        Self {
            index,
            length,
            hash,
            boundaries: Vec::new(),
            downloadable: false,
            bytes_remaining: length,
            chunks: Vec::new(),
            verified: false,
        }
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Takes as much of the file's remaining bytes as this piece still has
    /// room for and returns what is left for the next piece.
    pub fn add_boundary(&mut self, file_index: usize, file_length: u64, file_remaining: u64) -> u64 {
        let taken = file_remaining.min(self.bytes_remaining);
        if taken == 0 {
            return file_remaining;
        }

        let file_start = file_length - file_remaining;
        let piece_start = self.length - self.bytes_remaining;

        self.boundaries.push(Boundary {
            file_index,
            file_start,
            file_end: file_start + taken,
            piece_start,
            piece_end: piece_start + taken,
        });
        self.bytes_remaining -= taken;

        file_remaining - taken
    }

    /// Shrinks the piece to the bytes its boundaries cover (only the last
    /// piece of a torrent is short) and splits it into chunks.
    pub fn derive_chunks(&mut self, chunk_size: u32) -> Result<()> {
        if chunk_size == 0 {
            return Err(anyhow!("chunk size must be positive"));
        }

        self.length -= self.bytes_remaining;
        self.bytes_remaining = 0;

        let chunk_size = chunk_size as u64;
        let count = self.length.div_ceil(chunk_size);

        self.chunks = (0..count)
            .map(|i| {
                let begin = i * chunk_size;
                let length = chunk_size.min(self.length - begin);
                Chunk::new(self.index, i as usize, begin as u32, length as u32)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(())
    }

    /// First Ready chunk in index order, marked InProgress before returning.
    pub fn get_next_chunk(&mut self) -> Option<ChunkClaim> {
        if !self.downloadable || self.verified {
            return None;
        }
        self.chunks.iter_mut().find_map(Chunk::try_claim)
    }

    /// Stores a delivered block for a chunk that is currently handed out.
    pub fn complete_chunk(&mut self, claim: &ChunkClaim, data: Vec<u8>) -> Result<()> {
        let chunk = self
            .chunks
            .get_mut(claim.chunk_index)
            .ok_or_else(|| anyhow!("piece {} has no chunk {}", self.index, claim.chunk_index))?;

        if chunk.status() != ChunkStatus::InProgress {
            return Err(anyhow!(
                "chunk {} of piece {} is {:?}, not in progress",
                claim.chunk_index,
                self.index,
                chunk.status()
            ));
        }
        if chunk.begin != claim.begin {
            return Err(AppError::WrongPiece {
                piece_index: self.index as u32,
                expected_begin: chunk.begin,
                got_begin: claim.begin,
            }
            .into());
        }

        chunk.complete(data)
    }

    /// Puts a handed-out chunk back to Ready. Done chunks are left alone.
    pub fn release_chunk(&mut self, chunk_index: usize) {
        if let Some(chunk) = self.chunks.get_mut(chunk_index) {
            if chunk.status() == ChunkStatus::InProgress {
                chunk.reset();
            }
        }
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status() == ChunkStatus::Done)
            .count()
    }

    /// Returns (completed, total, verified), verifying once every chunk is Done.
    pub async fn chunks_count(&mut self, files: &mut [FileSink]) -> Result<(usize, usize, bool)> {
        let total = self.chunks.len();
        if !self.verified && self.completed_chunks() == total {
            self.verify(files).await?;
        }
        Ok((self.completed_chunks(), total, self.verified))
    }

    /// Hashes the assembled chunks and, on a match, writes every boundary
    /// range to its file. A mismatch resets all chunks to Ready.
    /// Calling it again on a verified piece does nothing and returns true.
    pub async fn verify(&mut self, files: &mut [FileSink]) -> Result<bool> {
        if self.verified {
            return Ok(true);
        }
        if self.completed_chunks() != self.chunks.len() {
            return Ok(false);
        }

        let mut buffer = Vec::with_capacity(self.length as usize);
        for chunk in &self.chunks {
            buffer.extend_from_slice(chunk.data());
        }

        let digest: [u8; 20] = Sha1::digest(&buffer).into();
        if digest != self.hash {
            debug!(
                "[Piece] piece {} hash mismatch (expected {}, got {}), resetting {} chunks",
                self.index,
                hex::encode(self.hash),
                hex::encode(digest),
                self.chunks.len()
            );
            self.chunks.iter_mut().for_each(Chunk::reset);
            return Ok(false);
        }

        self.verified = true;

        for boundary in &self.boundaries {
            let file = files
                .get_mut(boundary.file_index)
                .ok_or_else(|| anyhow!("piece {} maps to missing file {}", self.index, boundary.file_index))?;
            let range = boundary.piece_start as usize..boundary.piece_end as usize;
            file.write_at(boundary.file_start, &buffer[range]).await?;
        }

        self.chunks.iter_mut().for_each(Chunk::discard_data);
        Ok(true)
    }
}

/// Tiles files in declaration order over consecutive pieces of
/// `piece_length` bytes, records each file's piece range, then assigns the
/// hashes and derives chunks.
pub fn layout_pieces(
    piece_length: u64,
    hashes: &[[u8; 20]],
    files: &mut [FileSink],
    chunk_size: u32,
) -> Result<Vec<Piece>> {
    let mut pieces: Vec<Piece> = Vec::new();
    let mut current: Option<Piece> = None;

    for (file_index, file) in files.iter_mut().enumerate() {
        let file_length = file.length;
        let mut remaining = file_length;
        file.first_piece = pieces.len();

        while remaining > 0 {
            let next_index = pieces.len();
            let piece = current.get_or_insert_with(|| Piece::new(next_index, piece_length, [0u8; 20]));
            remaining = piece.add_boundary(file_index, file_length, remaining);

            if piece.bytes_remaining() == 0 {
                pieces.extend(current.take());
            }
        }

        file.last_piece = match (&current, file_length) {
            (_, 0) => file.first_piece,
            (Some(open), _) => open.index,
            (None, _) => pieces.len().saturating_sub(1),
        };
    }

    if let Some(last) = current.take() {
        pieces.push(last);
    }

    if pieces.len() != hashes.len() {
        return Err(AppError::PieceCountMismatch {
            expected: pieces.len(),
            got: hashes.len(),
        }
        .into());
    }

    for (piece, hash) in pieces.iter_mut().zip(hashes) {
        piece.hash = *hash;
        piece.derive_chunks(chunk_size)?;
    }

    Ok(pieces)
}
