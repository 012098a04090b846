#![allow(dead_code)]

pub mod fakes;

use magnet_swarm::config::{SessionConfig, TorrentConfig};
use magnet_swarm::coordinator::{CoordinatorHandle, SessionCommand};
use magnet_swarm::encoding::{BencodeTypes, Encoder};
use magnet_swarm::magnet_link::MagnetLink;
use magnet_swarm::peer::Peer;
use magnet_swarm::peer_messages::{EXTENSION_HANDSHAKE_ID, LOCAL_UT_METADATA_ID, PeerMessage};
use magnet_swarm::peer_session::PeerSession;
use magnet_swarm::traits::MessageIO;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use fakes::{RefusingTcpConnector, TrackerScript};

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// Deterministic content so failures are easy to spot in a hex dump.
pub fn content(length: usize) -> Vec<u8> {
    (0..length).map(|i| (i % 251) as u8).collect()
}

/// Bencodes an info dictionary whose piece hashes match `content`.
/// A single entry in `files` produces the single-file layout.
pub fn build_metadata(name: &str, piece_length: u64, files: &[(&str, u64)], content: &[u8]) -> Vec<u8> {
    let pieces: Vec<u8> = content
        .chunks(piece_length as usize)
        .flat_map(|piece| sha1(piece))
        .collect();

    let mut dict = BTreeMap::from([
        ("name".to_string(), BencodeTypes::from(name)),
        (
            "piece length".to_string(),
            BencodeTypes::Integer(piece_length as i64),
        ),
        ("pieces".to_string(), BencodeTypes::Bytes(pieces)),
    ]);

    if let [(_, length)] = files {
        dict.insert("length".to_string(), BencodeTypes::Integer(*length as i64));
    } else {
        let entries = files
            .iter()
            .map(|(path, length)| {
                BencodeTypes::Dictionary(BTreeMap::from([
                    ("length".to_string(), BencodeTypes::Integer(*length as i64)),
                    (
                        "path".to_string(),
                        BencodeTypes::List(vec![BencodeTypes::from(*path)]),
                    ),
                ]))
            })
            .collect();
        dict.insert("files".to_string(), BencodeTypes::List(entries));
    }

    Encoder {}
        .from_bencode_types(BencodeTypes::Dictionary(dict))
        .unwrap()
}

pub fn magnet(info_hash: [u8; 20], display_name: Option<&str>, trackers: &[&str]) -> MagnetLink {
    MagnetLink {
        info_hash,
        display_name: display_name.map(str::to_string),
        trackers: trackers.iter().map(|t| t.to_string()).collect(),
    }
}

pub fn test_config(output_dir: &Path, chunk_size: u32) -> TorrentConfig {
    let mut config = TorrentConfig {
        output_dir: output_dir.to_path_buf(),
        ..TorrentConfig::default()
    };
    config.set_chunk_size(chunk_size);
    config.session.read_timeout = Duration::from_secs(2);
    config.session.connect_timeout = Duration::from_secs(2);
    config.session.loop_delay = Duration::from_millis(1);
    config
}

pub struct HandleParts {
    pub handle: CoordinatorHandle,
    pub metadata_rx: mpsc::Receiver<Vec<u8>>,
    pub command_rx: mpsc::Receiver<SessionCommand>,
    pub metadata_ready_tx: watch::Sender<bool>,
}

/// A coordinator handle whose other ends stay with the test.
pub fn make_handle(metadata_ready: bool) -> HandleParts {
    let (metadata_tx, metadata_rx) = mpsc::channel(8);
    let (command_tx, command_rx) = mpsc::channel(8);
    let (metadata_ready_tx, metadata_ready_rx) = watch::channel(metadata_ready);

    HandleParts {
        handle: CoordinatorHandle::new(metadata_tx, command_tx, metadata_ready_rx),
        metadata_rx,
        command_rx,
        metadata_ready_tx,
    }
}

pub fn make_session(
    info_hash: [u8; 20],
    handle: CoordinatorHandle,
    shutdown_rx: broadcast::Receiver<()>,
) -> PeerSession {
    let config = SessionConfig {
        chunk_size: 400,
        read_timeout: Duration::from_secs(2),
        loop_delay: Duration::from_millis(1),
        ..SessionConfig::default()
    };

    PeerSession::new(
        Peer::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881),
        info_hash,
        [7u8; 20],
        config,
        Arc::new(RefusingTcpConnector),
        handle,
        shutdown_rx,
    )
}

/// A remote peer's extension handshake advertising ut_metadata.
pub fn peer_extension_handshake(ut_metadata: i64, metadata_size: usize) -> PeerMessage {
    let dict = BTreeMap::from([
        (
            "m".to_string(),
            BencodeTypes::Dictionary(BTreeMap::from([(
                "ut_metadata".to_string(),
                BencodeTypes::Integer(ut_metadata),
            )])),
        ),
        (
            "metadata_size".to_string(),
            BencodeTypes::Integer(metadata_size as i64),
        ),
    ]);

    PeerMessage::Extended {
        extension_id: EXTENSION_HANDSHAKE_ID,
        payload: Encoder {}
            .from_bencode_types(BencodeTypes::Dictionary(dict))
            .unwrap(),
    }
}

/// A ut_metadata data message carrying one fragment.
pub fn metadata_data(piece: usize, total_size: usize, data: &[u8]) -> PeerMessage {
    let dict = BTreeMap::from([
        ("msg_type".to_string(), BencodeTypes::Integer(1)),
        ("piece".to_string(), BencodeTypes::Integer(piece as i64)),
        (
            "total_size".to_string(),
            BencodeTypes::Integer(total_size as i64),
        ),
    ]);

    let mut payload = Encoder {}
        .from_bencode_types(BencodeTypes::Dictionary(dict))
        .unwrap();
    payload.extend_from_slice(data);

    PeerMessage::Extended {
        extension_id: LOCAL_UT_METADATA_ID,
        payload,
    }
}

/// Reads the next message a session wrote, failing the test after a second.
pub async fn next_message<IO: MessageIO>(io: &mut IO) -> PeerMessage {
    tokio::time::timeout(Duration::from_secs(1), io.read_message())
        .await
        .expect("timed out waiting for a message")
        .expect("read failed")
        .expect("stream ended")
}

fn transaction_id(request: &[u8]) -> [u8; 4] {
    let mut id = [0u8; 4];
    id.copy_from_slice(&request[12..16]);
    id
}

/// Answers a connect request, echoing its transaction id.
pub fn tracker_connect_reply(connection_id: u64) -> TrackerScript {
    Box::new(move |request: &[u8]| {
        let mut reply = Vec::with_capacity(16);
        reply.extend_from_slice(&0u32.to_be_bytes());
        reply.extend_from_slice(&transaction_id(request));
        reply.extend_from_slice(&connection_id.to_be_bytes());
        Some(reply)
    })
}

/// Answers an announce request, echoing its transaction id.
pub fn tracker_announce_reply(interval: u32, peers: Vec<([u8; 4], u16)>) -> TrackerScript {
    Box::new(move |request: &[u8]| {
        let mut reply = Vec::new();
        reply.extend_from_slice(&1u32.to_be_bytes());
        reply.extend_from_slice(&transaction_id(request));
        reply.extend_from_slice(&interval.to_be_bytes());
        reply.extend_from_slice(&3u32.to_be_bytes()); // leechers
        reply.extend_from_slice(&7u32.to_be_bytes()); // seeders
        for (ip, port) in &peers {
            reply.extend_from_slice(ip);
            reply.extend_from_slice(&port.to_be_bytes());
        }
        Some(reply)
    })
}

/// Replies with a fixed datagram regardless of the request.
pub fn tracker_fixed_reply(reply: Vec<u8>) -> TrackerScript {
    Box::new(move |_request: &[u8]| Some(reply.clone()))
}

/// Leaves the request unanswered.
pub fn tracker_silence() -> TrackerScript {
    Box::new(|_request: &[u8]| None)
}
