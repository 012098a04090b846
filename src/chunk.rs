use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Ready,
    InProgress,
    Done,
}

/// A sub-piece transfer unit. `length` never changes after construction.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub piece_index: usize,
    pub begin: u32,
    pub length: u32,
    status: ChunkStatus,
    data: Vec<u8>,
}

/// Handed to a session that won a chunk; enough to build the REQUEST and
/// to validate the matching PIECE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkClaim {
    pub piece_index: usize,
    pub chunk_index: usize,
    pub begin: u32,
    pub length: u32,
}

impl Chunk {
    pub fn new(piece_index: usize, index: usize, begin: u32, length: u32) -> Result<Self> {
        if length == 0 {
            return Err(anyhow!(
                "chunk {} of piece {} has zero length",
                index,
                piece_index
            ));
        }

        Ok(Self {
            index,
            piece_index,
            begin,
            length,
            status: ChunkStatus::Ready,
            data: Vec::new(),
        })
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Ready -> InProgress. Returns the claim, or None if the chunk is taken.
    pub fn try_claim(&mut self) -> Option<ChunkClaim> {
        if self.status != ChunkStatus::Ready {
            return None;
        }
        self.status = ChunkStatus::InProgress;
        Some(self.claim())
    }

    pub fn claim(&self) -> ChunkClaim {
        ChunkClaim {
            piece_index: self.piece_index,
            chunk_index: self.index,
            begin: self.begin,
            length: self.length,
        }
    }

    /// Stores the block and marks the chunk Done. The block must be exactly `length` bytes.
    pub fn complete(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() != self.length as usize {
            return Err(anyhow!(
                "chunk {} of piece {} expects {} bytes, got {}",
                self.index,
                self.piece_index,
                self.length,
                data.len()
            ));
        }
        self.data = data;
        self.status = ChunkStatus::Done;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.status = ChunkStatus::Ready;
        self.data = Vec::new();
    }

    /// Drops the buffer once the owning piece is on disk; status stays Done.
    pub fn discard_data(&mut self) {
        self.data = Vec::new();
    }
}
