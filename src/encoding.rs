use anyhow::{Result, anyhow};
use bytes::Buf;
use std::collections::BTreeMap;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder as TokioDecoder, Encoder as TokioEncoder};

use crate::error::{AppError, CodecError};
use crate::peer_messages::PeerMessage;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeTypes {
    Bytes(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeTypes>),
    Dictionary(BTreeMap<String, BencodeTypes>),
}

impl BencodeTypes {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeTypes]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<String, BencodeTypes>> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }
}

impl From<&str> for BencodeTypes {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

#[derive(Debug, PartialEq, Eq, Default)]
pub struct Encoder {}

impl Encoder {
    #[allow(clippy::wrong_self_convention)]
    pub fn from_bencode_types(&self, input: BencodeTypes) -> Result<Vec<u8>> {
        let mut raw = Vec::new();
        self.encode_into(&input, &mut raw);
        Ok(raw)
    }

    fn encode_into(&self, input: &BencodeTypes, raw: &mut Vec<u8>) {
        match input {
            BencodeTypes::Bytes(b) => {
                raw.extend_from_slice(format!("{}:", b.len()).as_bytes());
                raw.extend_from_slice(b);
            }
            BencodeTypes::Integer(i) => {
                raw.extend_from_slice(format!("i{}e", i).as_bytes());
            }
            BencodeTypes::List(l) => {
                raw.push(b'l');
                for item in l {
                    self.encode_into(item, raw);
                }
                raw.push(b'e');
            }
            BencodeTypes::Dictionary(d) => {
                // BTreeMap iteration keeps keys in the sorted order bencode requires.
                raw.push(b'd');
                for (key, value) in d {
                    raw.extend_from_slice(format!("{}:", key.len()).as_bytes());
                    raw.extend_from_slice(key.as_bytes());
                    self.encode_into(value, raw);
                }
                raw.push(b'e');
            }
        }
    }
}

// Lists and dictionaries nested deeper than this are rejected.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, PartialEq, Eq, Default)]
pub struct Decoder {}

impl Decoder {
    // Returns the number of bytes read and the decoded type.
    // Trailing bytes after the first complete value are left untouched.
    #[allow(clippy::wrong_self_convention)]
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<(usize, BencodeTypes)> {
        self.decode_value(bytes, 0)
    }

    fn decode_value(&self, bytes: &[u8], depth: usize) -> Result<(usize, BencodeTypes)> {
        match bytes.first() {
            Some(b'i') => {
                let (n, val) = self.decode_integer(bytes)?;
                Ok((n, BencodeTypes::Integer(val)))
            }
            Some(b'l' | b'd') if depth >= MAX_NESTING_DEPTH => {
                Err(AppError::invalid_bencode("nesting too deep").into())
            }
            Some(b'l') => {
                let (n, val) = self.decode_list(bytes, depth + 1)?;
                Ok((n, BencodeTypes::List(val)))
            }
            Some(b'd') => {
                let (n, val) = self.decode_dictionary(bytes, depth + 1)?;
                Ok((n, BencodeTypes::Dictionary(val)))
            }
            Some(b) if b.is_ascii_digit() => {
                let (n, val) = self.decode_string(bytes)?;
                Ok((n, BencodeTypes::Bytes(val)))
            }
            Some(b) => Err(AppError::invalid_bencode(format!(
                "unexpected byte '{}'",
                b.escape_ascii()
            ))
            .into()),
            None => Err(AppError::invalid_bencode("unexpected end of data").into()),
        }
    }

    fn decode_string(&self, bytes: &[u8]) -> Result<(usize, Vec<u8>)> {
        let colon = bytes
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| AppError::invalid_bencode("the provided data is not a string"))?;

        let len_digits = &bytes[..colon];
        if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
            return Err(AppError::invalid_bencode("the provided data is not a string").into());
        }
        let len: usize = std::str::from_utf8(len_digits)?.parse()?;

        let start = colon + 1; // ignore the colon in the string
        let end = start
            .checked_add(len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                AppError::invalid_bencode(format!(
                    "string of {} bytes exceeds the {} available",
                    len,
                    bytes.len() - start
                ))
            })?;

        Ok((end, bytes[start..end].to_vec()))
    }

    fn decode_integer(&self, bytes: &[u8]) -> Result<(usize, i64)> {
        let end = bytes
            .iter()
            .position(|&b| b == b'e')
            .ok_or_else(|| AppError::invalid_bencode("the provided data is not a integer"))?;

        let digits = std::str::from_utf8(&bytes[1..end])?;
        let number = digits
            .parse::<i64>()
            .map_err(|e| anyhow!(AppError::invalid_bencode(format!("bad integer '{}': {}", digits, e))))?;

        Ok((end + 1, number)) // the 'e' is part of the value
    }

    fn decode_list(&self, bytes: &[u8], depth: usize) -> Result<(usize, Vec<BencodeTypes>)> {
        let mut curr_idx = 1; // ignore the 'l' in the provided bytes
        let mut result = Vec::new();

        loop {
            match bytes.get(curr_idx) {
                Some(b'e') => return Ok((curr_idx + 1, result)),
                Some(_) => {
                    let (n, val) = self.decode_value(&bytes[curr_idx..], depth)?;
                    result.push(val);
                    curr_idx += n;
                }
                None => return Err(AppError::invalid_bencode("unterminated list").into()),
            }
        }
    }

    fn decode_dictionary(
        &self,
        bytes: &[u8],
        depth: usize,
    ) -> Result<(usize, BTreeMap<String, BencodeTypes>)> {
        let mut curr_idx = 1; // ignore the 'd' in the provided bytes
        let mut dict = BTreeMap::new();

        loop {
            match bytes.get(curr_idx) {
                Some(b'e') => return Ok((curr_idx + 1, dict)),
                Some(_) => {
                    let (n, key) = self.decode_string(&bytes[curr_idx..])?;
                    curr_idx += n;

                    let (n, val) = self.decode_value(&bytes[curr_idx..], depth)?;
                    curr_idx += n;

                    dict.insert(String::from_utf8_lossy(&key).into_owned(), val);
                }
                None => return Err(AppError::invalid_bencode("unterminated dictionary").into()),
            }
        }
    }
}

/// Frames peer wire messages and rejects length prefixes at or above `max_length`.
pub struct PeerMessageDecoder {
    max_length: usize,
}

impl PeerMessageDecoder {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl TokioDecoder for PeerMessageDecoder {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() >= 4 {
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length >= self.max_length {
                return Err(CodecError::MessageTooLong {
                    length,
                    max: self.max_length,
                }
                .into());
            }
            src.reserve((4 + length).saturating_sub(src.len()));
        }

        match PeerMessage::from_bytes(src.as_ref()) {
            Ok((n, message)) => {
                src.advance(n);
                Ok(Some(message))
            }
            Err(e) => {
                if let Some(codec_err) = e.downcast_ref::<CodecError>() {
                    match codec_err {
                        CodecError::IncompleteMessage { .. } | CodecError::MessageTooShort(_) => {
                            Ok(None)
                        }
                        _ => Err(e),
                    }
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[derive(Default)]
pub struct PeerMessageEncoder {}

impl PeerMessageEncoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl TokioEncoder<PeerMessage> for PeerMessageEncoder {
    type Error = anyhow::Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item
            .to_bytes()
            .map_err(|e| anyhow!("error converting message to bytes: {}", e))?;

        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
