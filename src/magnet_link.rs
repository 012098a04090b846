use anyhow::Result;
use url::Url;

use crate::error::AppError;

/// Represents a parsed magnet link for BitTorrent downloads
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parse a magnet URI string into a MagnetLink structure
    ///
    /// Format: magnet:?xt=urn:btih:<info_hash>&dn=<name>&tr=<tracker_url>
    ///
    /// Only hex-encoded info hashes (40 characters) are supported.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| AppError::invalid_magnet(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(AppError::invalid_magnet("must start with 'magnet:?'").into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => info_hash = Some(Self::parse_info_hash(&value)?),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| AppError::invalid_magnet("missing required 'xt' parameter"))?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
        })
    }

    fn parse_info_hash(xt: &str) -> Result<[u8; 20]> {
        let hex_hash = xt
            .strip_prefix("urn:btih:")
            .ok_or_else(|| AppError::invalid_magnet("'xt' must start with 'urn:btih:'"))?;

        if hex_hash.len() != 40 {
            return Err(AppError::invalid_magnet(format!(
                "expected 40 hex characters in the info hash, got {}",
                hex_hash.len()
            ))
            .into());
        }

        let mut hash = [0u8; 20];
        hex::decode_to_slice(hex_hash, &mut hash)
            .map_err(|_| AppError::invalid_magnet("info hash must be valid hex"))?;
        Ok(hash)
    }
}
