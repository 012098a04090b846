pub mod chunk;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod encoding;
pub mod error;
pub mod file_sink;
pub mod io;
pub mod magnet_link;
pub mod metadata;
pub mod peer;
pub mod peer_messages;
pub mod peer_session;
pub mod piece;
pub mod tcp_connector;
pub mod tracker_session;
pub mod traits;
pub mod udp_socket;
