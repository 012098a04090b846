use crate::error::AppError;
use crate::traits::TcpConnector;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Dials peers over TCP, giving up after `connect_timeout`.
#[derive(Debug)]
pub struct RealTcpConnector {
    connect_timeout: Duration,
}

impl RealTcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl TcpConnector for RealTcpConnector {
    async fn connect(&self, addr: String) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(AppError::ConnectTimeout(addr).into()),
        }
    }
}
