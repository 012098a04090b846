use anyhow::{Result, anyhow};
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Cursor;

use crate::encoding::{BencodeTypes, Decoder, Encoder};
use crate::error::{AppError, CodecError};

pub const HANDSHAKE_LENGTH: usize = 68;
const PROTOCOL_NAME: &[u8; 19] = b"BitTorrent protocol";

/// Extended message id reserved for the extension handshake.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;
/// Id we advertise for ut_metadata; peers address metadata replies to it.
pub const LOCAL_UT_METADATA_ID: u8 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    KeepAlive,
    Choke(ChokeMessage),
    Unchoke(UnchokeMessage),
    Interested(InterestedMessage),
    NotInterested(NotInterestedMessage),
    Have(HaveMessage),
    Bitfield(BitfieldMessage),
    Request(RequestMessage),
    Piece(PieceMessage),
    Cancel(CancelMessage),
    Port(PortMessage),
    Extended { extension_id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    pub fn from_bytes(src: &[u8]) -> Result<(usize, Self)> {
        if src.len() < 4 {
            return Err(CodecError::MessageTooShort(src.len()).into());
        }

        let length = Self::get_length(src)?;

        // Handle Keep-Alive message (length = 0)
        if length == 0 {
            return Ok((4, Self::KeepAlive));
        }

        let total_size = 4 + length;
        if src.len() < total_size {
            return Err(CodecError::IncompleteMessage {
                needed: total_size,
                available: src.len(),
            }
            .into());
        }

        let frame = &src[..total_size];
        let message_type = frame[4];

        let message = match message_type {
            0 => Self::Choke(ChokeMessage {}),
            1 => Self::Unchoke(UnchokeMessage {}),
            2 => Self::Interested(InterestedMessage {}),
            3 => Self::NotInterested(NotInterestedMessage {}),
            4 => Self::Have(HaveMessage::from_bytes(frame)?),
            5 => Self::Bitfield(BitfieldMessage::from_bytes(&frame[5..])),
            6 => Self::Request(RequestMessage::from_bytes(frame)?),
            7 => Self::Piece(PieceMessage::from_bytes(frame)?),
            8 => Self::Cancel(CancelMessage::from_bytes(frame)?),
            9 => Self::Port(PortMessage::from_bytes(frame)?),
            20 => {
                if frame.len() < 6 {
                    return Err(
                        CodecError::InvalidFormat("extended message without id".into()).into(),
                    );
                }
                Self::Extended {
                    extension_id: frame[5],
                    payload: frame[6..].to_vec(),
                }
            }
            other => return Err(CodecError::UnknownMessageType(other).into()),
        };

        Ok((total_size, message))
    }

    fn get_length(bytes: &[u8]) -> Result<usize> {
        let length = &bytes[0..4];
        let length = u32::from_be_bytes(length.try_into()?);
        Ok(length as usize)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::KeepAlive => Ok(vec![0, 0, 0, 0]),
            Self::Choke(_) => Ok(signal_frame(0).to_vec()),
            Self::Unchoke(_) => Ok(signal_frame(1).to_vec()),
            Self::Interested(message) => Ok(message.to_bytes().to_vec()),
            Self::NotInterested(_) => Ok(signal_frame(3).to_vec()),
            Self::Have(message) => Ok(message.to_bytes().to_vec()),
            Self::Bitfield(message) => Ok(message.to_bytes()),
            Self::Request(message) => Ok(message.to_bytes().to_vec()),
            Self::Piece(message) => Ok(message.to_bytes()),
            Self::Cancel(message) => Ok(message.to_bytes().to_vec()),
            Self::Port(message) => Ok(message.to_bytes().to_vec()),
            Self::Extended {
                extension_id,
                payload,
            } => {
                let len = u32::try_from(2 + payload.len())
                    .map_err(|_| anyhow!("extended payload of {} bytes", payload.len()))?;
                let mut bytes = Vec::with_capacity(4 + len as usize);
                bytes.extend_from_slice(&len.to_be_bytes());
                bytes.push(20);
                bytes.push(*extension_id);
                bytes.extend_from_slice(payload);
                Ok(bytes)
            }
        }
    }
}

// Frame for the payload-less messages (choke, unchoke, interested, not interested).
fn signal_frame(message_id: u8) -> [u8; 5] {
    let mut bytes = [0u8; 5];
    bytes[0..4].copy_from_slice(&1u32.to_be_bytes());
    bytes[4] = message_id;
    bytes
}

fn expect_frame_length(frame: &[u8], expected: usize, name: &str) -> Result<()> {
    if frame.len() != expected {
        return Err(CodecError::InvalidFormat(format!(
            "{} message must be {} bytes, got {}",
            name,
            expected,
            frame.len()
        ))
        .into());
    }
    Ok(())
}

/// Raw availability bits as sent by the peer, MSB first.
/// The bit count is `8 * payload length`; the peer pads the final byte.
#[derive(Clone, PartialEq)]
pub struct BitfieldMessage {
    pub bitfield: Vec<bool>,
}

impl BitfieldMessage {
    pub fn from_bytes(payload: &[u8]) -> Self {
        let bitfield = (0..payload.len() * 8)
            .map(|i| (payload[i / 8] >> (7 - (i % 8))) & 1 == 1)
            .collect();

        Self { bitfield }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.get(index).copied().unwrap_or(false)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let num_bytes = self.bitfield.len().div_ceil(8);
        let mut bytes = vec![0u8; num_bytes];

        for (i, &has_piece) in self.bitfield.iter().enumerate() {
            if has_piece {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }

        let message_length = 1 + bytes.len();
        let mut result = Vec::with_capacity(4 + message_length);
        result.extend_from_slice(&(message_length as u32).to_be_bytes());
        result.push(5);
        result.extend_from_slice(&bytes);
        result
    }
}

impl Debug for BitfieldMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let available = self.bitfield.iter().filter(|&&b| b).count();
        write!(
            f,
            "BitfieldMessage {{ available: {}/{} }}",
            available,
            self.bitfield.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChokeMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct UnchokeMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct NotInterestedMessage {}

#[derive(Debug, Clone, PartialEq)]
pub struct InterestedMessage {}

impl InterestedMessage {
    pub fn to_bytes(&self) -> [u8; 5] {
        signal_frame(2)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaveMessage {
    pub piece_index: u32,
}

impl HaveMessage {
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        expect_frame_length(frame, 9, "have")?;
        let mut cursor = Cursor::new(&frame[5..]);
        let piece_index = cursor.read_u32::<BigEndian>()?;

        Ok(HaveMessage { piece_index })
    }

    pub fn to_bytes(&self) -> [u8; 9] {
        let mut bytes = [0u8; 9];
        bytes[0..4].copy_from_slice(&5u32.to_be_bytes());
        bytes[4] = 4;
        bytes[5..9].copy_from_slice(&self.piece_index.to_be_bytes());
        bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl RequestMessage {
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        expect_frame_length(frame, 17, "request")?;
        let (piece_index, begin, length) = read_block_triplet(frame)?;

        Ok(Self {
            piece_index,
            begin,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; 17] {
        block_triplet_frame(6, self.piece_index, self.begin, self.length)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

impl CancelMessage {
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        expect_frame_length(frame, 17, "cancel")?;
        let (piece_index, begin, length) = read_block_triplet(frame)?;

        Ok(Self {
            piece_index,
            begin,
            length,
        })
    }

    pub fn to_bytes(&self) -> [u8; 17] {
        block_triplet_frame(8, self.piece_index, self.begin, self.length)
    }
}

fn read_block_triplet(frame: &[u8]) -> Result<(u32, u32, u32)> {
    let mut cursor = Cursor::new(&frame[5..17]);
    let piece_index = cursor.read_u32::<BigEndian>()?;
    let begin = cursor.read_u32::<BigEndian>()?;
    let length = cursor.read_u32::<BigEndian>()?;
    Ok((piece_index, begin, length))
}

fn block_triplet_frame(message_id: u8, piece_index: u32, begin: u32, length: u32) -> [u8; 17] {
    let mut bytes = [0u8; 17];
    bytes[0..4].copy_from_slice(&13u32.to_be_bytes());
    bytes[4] = message_id;
    bytes[5..9].copy_from_slice(&piece_index.to_be_bytes());
    bytes[9..13].copy_from_slice(&begin.to_be_bytes());
    bytes[13..17].copy_from_slice(&length.to_be_bytes());
    bytes
}

#[derive(Clone, PartialEq)]
pub struct PieceMessage {
    pub piece_index: u32,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl PieceMessage {
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        if frame.len() < 13 {
            return Err(CodecError::InvalidFormat(format!(
                "piece message too short: {} bytes (need at least 13)",
                frame.len()
            ))
            .into());
        }
        let mut cursor = Cursor::new(&frame[5..13]);
        let piece_index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;

        Ok(PieceMessage {
            piece_index,
            begin,
            block: frame[13..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let message_length = 1 + 4 + 4 + self.block.len(); // msg_id + piece_index + begin + block
        let mut bytes = Vec::with_capacity(4 + message_length);
        bytes.extend_from_slice(&(message_length as u32).to_be_bytes());
        bytes.push(7);
        bytes.extend_from_slice(&self.piece_index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.block);
        bytes
    }
}

impl Debug for PieceMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PieceMessage {{ piece_index: {}, begin: {}, len: {} }}",
            self.piece_index,
            self.begin,
            self.block.len()
        )
    }
}

/// DHT listen port announced by the peer. Parsed and ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct PortMessage {
    pub port: u16,
}

impl PortMessage {
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        expect_frame_length(frame, 7, "port")?;
        let port = u16::from_be_bytes([frame[5], frame[6]]);
        Ok(Self { port })
    }

    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0u8; 7];
        bytes[0..4].copy_from_slice(&3u32.to_be_bytes());
        bytes[4] = 9;
        bytes[5..7].copy_from_slice(&self.port.to_be_bytes());
        bytes
    }
}

/// Message during the handshake with a Peer.
/// Not framed like the other messages; always exactly 68 bytes.
pub struct PeerHandshakeMessage {
    info_hash: [u8; 20], // NOT the hexadecimal string, but the actual bytes
    peer_id: [u8; 20],
    reserved: [u8; 8],
}

impl PeerHandshakeMessage {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self::new_with_extensions(info_hash, peer_id, false)
    }

    pub fn new_with_extensions(
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        enable_extensions: bool,
    ) -> Self {
        let mut reserved = [0u8; 8];
        if enable_extensions {
            // Bit 20 from the right (byte 5, 0x10) advertises the extension protocol
            reserved[5] |= 0x10;
        }
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HANDSHAKE_LENGTH);
        bytes.push(PROTOCOL_NAME.len() as u8);
        bytes.extend_from_slice(PROTOCOL_NAME);
        bytes.extend_from_slice(&self.reserved);
        bytes.extend_from_slice(&self.info_hash);
        bytes.extend_from_slice(&self.peer_id);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HANDSHAKE_LENGTH {
            return Err(AppError::handshake_failed(format!(
                "expected {} bytes, got {}",
                HANDSHAKE_LENGTH,
                bytes.len()
            ))
            .into());
        }

        if bytes[0] as usize != PROTOCOL_NAME.len() || &bytes[1..20] != PROTOCOL_NAME {
            return Err(AppError::handshake_failed("unknown protocol name").into());
        }

        Ok(Self {
            reserved: bytes[20..28].try_into()?,
            info_hash: bytes[28..48].try_into()?,
            peer_id: bytes[48..68].try_into()?,
        })
    }
}

impl Debug for PeerHandshakeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info_hash = hex::encode(self.info_hash);
        let peer_id = hex::encode(self.peer_id);
        write!(
            f,
            "PeerHandshakeMessage {{ info_hash: {:?}, peer_id: {:?} }}",
            info_hash, peer_id
        )
    }
}

/// Fields of a peer's extension handshake we care about.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionHandshake {
    pub ut_metadata: Option<u8>,
    pub metadata_size: Option<usize>,
}

/// Create extension handshake message advertising ut_metadata.
/// Payload: `d1:md11:ut_metadatai1eee`
pub fn create_extension_handshake() -> Result<PeerMessage> {
    let m_dict = BTreeMap::from([(
        "ut_metadata".to_string(),
        BencodeTypes::Integer(LOCAL_UT_METADATA_ID as i64),
    )]);
    let dict = BTreeMap::from([("m".to_string(), BencodeTypes::Dictionary(m_dict))]);

    let payload = Encoder {}.from_bencode_types(BencodeTypes::Dictionary(dict))?;

    Ok(PeerMessage::Extended {
        extension_id: EXTENSION_HANDSHAKE_ID,
        payload,
    })
}

pub fn parse_extension_handshake(payload: &[u8]) -> Result<ExtensionHandshake> {
    let (_n, bencode) = Decoder {}.from_bytes(payload)?;

    let dict = bencode
        .as_dictionary()
        .ok_or_else(|| AppError::invalid_field_type("extension handshake", "dictionary"))?;

    let ut_metadata = dict
        .get("m")
        .and_then(BencodeTypes::as_dictionary)
        .and_then(|m| m.get("ut_metadata"))
        .and_then(BencodeTypes::as_integer)
        .and_then(|id| u8::try_from(id).ok())
        .filter(|id| *id != 0);

    let metadata_size = dict
        .get("metadata_size")
        .and_then(BencodeTypes::as_integer)
        .and_then(|size| usize::try_from(size).ok())
        .filter(|size| *size > 0);

    Ok(ExtensionHandshake {
        ut_metadata,
        metadata_size,
    })
}

/// Create metadata request message.
/// Payload: `d8:msg_typei0e5:piecei<N>ee`
pub fn create_metadata_request(peer_ut_metadata_id: u8, piece: usize) -> Result<PeerMessage> {
    let dict = BTreeMap::from([
        ("msg_type".to_string(), BencodeTypes::Integer(0)),
        ("piece".to_string(), BencodeTypes::Integer(piece as i64)),
    ]);

    let payload = Encoder {}.from_bencode_types(BencodeTypes::Dictionary(dict))?;

    Ok(PeerMessage::Extended {
        extension_id: peer_ut_metadata_id,
        payload,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataResponse {
    Request { piece: usize },
    Data {
        piece: usize,
        total_size: usize,
        data: Vec<u8>,
    },
    Reject { piece: usize },
}

/// Parse a ut_metadata message. For data messages the raw fragment
/// follows the bencoded dictionary.
pub fn parse_metadata_message(payload: &[u8]) -> Result<MetadataResponse> {
    let (bytes_read, bencode) = Decoder {}.from_bytes(payload)?;

    let dict = bencode
        .as_dictionary()
        .ok_or_else(|| AppError::invalid_field_type("ut_metadata message", "dictionary"))?;

    let msg_type = dict
        .get("msg_type")
        .and_then(BencodeTypes::as_integer)
        .ok_or_else(|| AppError::missing_field("msg_type"))?;

    let piece = dict
        .get("piece")
        .and_then(BencodeTypes::as_integer)
        .and_then(|p| usize::try_from(p).ok())
        .ok_or_else(|| AppError::missing_field("piece"))?;

    match msg_type {
        0 => Ok(MetadataResponse::Request { piece }),
        1 => {
            let total_size = dict
                .get("total_size")
                .and_then(BencodeTypes::as_integer)
                .and_then(|s| usize::try_from(s).ok())
                .ok_or_else(|| AppError::missing_field("total_size"))?;

            Ok(MetadataResponse::Data {
                piece,
                total_size,
                data: payload[bytes_read..].to_vec(),
            })
        }
        2 => Ok(MetadataResponse::Reject { piece }),
        other => Err(AppError::invalid_field_type(
            "msg_type",
            &format!("0, 1 or 2 (got {})", other),
        )
        .into()),
    }
}
