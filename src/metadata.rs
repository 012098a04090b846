use anyhow::Result;
use log::debug;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::encoding::{BencodeTypes, Decoder};
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub length: u64,
    /// Path components relative to the torrent directory.
    pub path: Vec<String>,
}

impl FileInfo {
    /// Joins the path components, dropping empty, `.` and `..` entries.
    pub fn relative_path(&self) -> PathBuf {
        let components: Vec<&str> = self
            .path
            .iter()
            .map(String::as_str)
            .filter(|c| is_safe_component(c))
            .collect();

        if components.is_empty() {
            return PathBuf::from("unnamed");
        }
        components.iter().collect()
    }
}

pub fn is_safe_component(component: &str) -> bool {
    !component.is_empty()
        && component != "."
        && component != ".."
        && !component.contains('/')
        && !component.contains('\\')
}

/// The decoded info dictionary of a torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentInfo {
    pub name: String,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<FileInfo>,
}

impl TorrentInfo {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_n, value) = Decoder {}.from_bytes(bytes)?;
        let dict = value
            .as_dictionary()
            .ok_or_else(|| AppError::invalid_field_type("info", "dictionary"))?;

        Self::from_dictionary(dict)
    }

    pub fn from_dictionary(dict: &BTreeMap<String, BencodeTypes>) -> Result<Self> {
        let name = dict
            .get("name")
            .ok_or_else(|| AppError::missing_field("name"))?
            .as_str()
            .ok_or_else(|| AppError::invalid_field_type("name", "utf-8 string"))?
            .to_string();

        let piece_length = dict
            .get("piece length")
            .ok_or_else(|| AppError::missing_field("piece length"))?
            .as_integer()
            .ok_or_else(|| AppError::invalid_field_type("piece length", "integer"))?;
        // Chunk offsets inside a piece travel as u32 on the wire.
        if piece_length <= 0 || piece_length > u32::MAX as i64 {
            return Err(
                AppError::invalid_field_type("piece length", "positive 32-bit integer").into(),
            );
        }

        let pieces = dict
            .get("pieces")
            .ok_or_else(|| AppError::missing_field("pieces"))?
            .as_bytes()
            .ok_or_else(|| AppError::invalid_field_type("pieces", "byte string"))?;
        if pieces.len() % 20 != 0 {
            return Err(
                AppError::invalid_field_type("pieces", "a multiple of 20 bytes").into(),
            );
        }

        let piece_hashes = pieces
            .chunks_exact(20)
            .map(|hash| {
                let mut out = [0u8; 20];
                out.copy_from_slice(hash);
                out
            })
            .collect();

        let files = match (dict.get("length"), dict.get("files")) {
            (Some(length), _) => vec![FileInfo {
                length: parse_length(length, "length")?,
                path: vec![name.clone()],
            }],
            (None, Some(files)) => parse_files(files)?,
            (None, None) => return Err(AppError::missing_field("length or files").into()),
        };

        debug!(
            "[TorrentInfo] name: {:?}, piece length: {}, files: {}",
            name,
            piece_length,
            files.len()
        );

        Ok(Self {
            name,
            piece_length: piece_length as u64,
            piece_hashes,
            files,
        })
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }
}

fn parse_length(value: &BencodeTypes, field: &str) -> Result<u64> {
    let length = value
        .as_integer()
        .ok_or_else(|| AppError::invalid_field_type(field, "integer"))?;
    u64::try_from(length)
        .map_err(|_| anyhow::Error::from(AppError::invalid_field_type(field, "non-negative integer")))
}

fn parse_files(value: &BencodeTypes) -> Result<Vec<FileInfo>> {
    let entries = value
        .as_list()
        .ok_or_else(|| AppError::invalid_field_type("files", "list"))?;

    entries
        .iter()
        .map(|entry| {
            let entry = entry
                .as_dictionary()
                .ok_or_else(|| AppError::invalid_field_type("files", "list of dictionaries"))?;

            let length = parse_length(
                entry
                    .get("length")
                    .ok_or_else(|| AppError::missing_field("files.length"))?,
                "files.length",
            )?;

            let path = entry
                .get("path")
                .ok_or_else(|| AppError::missing_field("files.path"))?
                .as_list()
                .ok_or_else(|| AppError::invalid_field_type("files.path", "list"))?
                .iter()
                .map(|c| {
                    c.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| {
                            anyhow::Error::from(AppError::invalid_field_type(
                                "files.path",
                                "list of strings",
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(FileInfo { length, path })
        })
        .collect()
}
