use crate::encoding::{PeerMessageDecoder, PeerMessageEncoder};
use crate::peer_messages::PeerMessage;
use crate::traits::MessageIO;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Production implementation of MessageIO using TCP streams with framing codecs
pub struct TcpMessageIO {
    reader: FramedRead<OwnedReadHalf, PeerMessageDecoder>,
    writer: FramedWrite<OwnedWriteHalf, PeerMessageEncoder>,
}

impl TcpMessageIO {
    /// Wraps a stream whose handshake has already been exchanged.
    pub fn from_stream(stream: TcpStream, max_message_length: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, max_message_length)
    }

    pub fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf, max_message_length: usize) -> Self {
        Self {
            reader: FramedRead::new(reader, PeerMessageDecoder::new(max_message_length)),
            writer: FramedWrite::new(writer, PeerMessageEncoder::new()),
        }
    }
}

impl std::fmt::Debug for TcpMessageIO {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpMessageIO").finish()
    }
}

#[async_trait]
impl MessageIO for TcpMessageIO {
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()> {
        self.writer.send(msg.clone()).await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<PeerMessage>> {
        match self.reader.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}
