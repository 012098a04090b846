use crate::traits::{TrackerSocket, UdpSocketFactory};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub struct UdpTrackerSocket {
    socket: UdpSocket,
}

#[async_trait]
impl TrackerSocket for UdpTrackerSocket {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send(buf).await?)
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.recv(buf).await?)
    }
}

#[derive(Debug, Clone)]
pub struct DefaultUdpSocketFactory;

#[async_trait]
impl UdpSocketFactory for DefaultUdpSocketFactory {
    /// Binds an ephemeral local port and connects it to the tracker host.
    async fn connect(&self, host: &str) -> Result<Arc<dyn TrackerSocket>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(host).await?;
        Ok(Arc::new(UdpTrackerSocket { socket }))
    }
}
