use anyhow::{Result, anyhow};
use async_trait::async_trait;
use magnet_swarm::peer_messages::PeerMessage;
use magnet_swarm::traits::{MessageIO, TcpConnector, TrackerSocket, UdpSocketFactory};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};

/// Fake MessageIO for testing using in-memory channels.
/// Provides real async message passing without network I/O.
#[derive(Debug)]
pub struct FakeMessageIO {
    /// Channel for receiving messages (simulates reading from network)
    read_rx: mpsc::UnboundedReceiver<PeerMessage>,
    /// Channel for sending messages (simulates writing to network)
    write_tx: mpsc::UnboundedSender<PeerMessage>,
}

impl FakeMessageIO {
    /// Create a pair of FakeMessageIO instances connected to each other.
    /// Messages written to one can be read from the other, and vice versa.
    pub fn pair() -> (Self, Self) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let fake1 = Self {
            read_rx: rx1,
            write_tx: tx2,
        };

        let fake2 = Self {
            read_rx: rx2,
            write_tx: tx1,
        };

        (fake1, fake2)
    }
}

#[async_trait]
impl MessageIO for FakeMessageIO {
    async fn write_message(&mut self, msg: &PeerMessage) -> Result<()> {
        self.write_tx
            .send(msg.clone())
            .map_err(|_| anyhow!("Channel closed"))?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<PeerMessage>> {
        match self.read_rx.recv().await {
            Some(msg) => Ok(Some(msg)),
            None => Ok(None), // Channel closed, stream ended
        }
    }
}

/// Connector for tests that must never reach the network.
#[derive(Debug)]
pub struct RefusingTcpConnector;

#[async_trait]
impl TcpConnector for RefusingTcpConnector {
    async fn connect(&self, addr: String) -> Result<TcpStream> {
        Err(anyhow!("connection to {} refused", addr))
    }
}

/// Builds a tracker reply from the request it answers.
pub type TrackerScript = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Tracker socket that answers each request with the next scripted reply.
/// A script returning None leaves the request unanswered.
pub struct FakeTrackerSocket {
    scripts: Mutex<VecDeque<TrackerScript>>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
    notify: Notify,
}

impl std::fmt::Debug for FakeTrackerSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTrackerSocket").finish()
    }
}

impl FakeTrackerSocket {
    pub fn new(scripts: Vec<TrackerScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrackerSocket for FakeTrackerSocket {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.sent.lock().unwrap().push(buf.to_vec());

        let script = self.scripts.lock().unwrap().pop_front();
        if let Some(reply) = script.and_then(|script| script(buf)) {
            self.pending.lock().unwrap().push_back(reply);
            self.notify.notify_one();
        }
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let reply = self.pending.lock().unwrap().pop_front();
            if let Some(reply) = reply {
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                return Ok(n);
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug)]
pub struct FakeUdpSocketFactory {
    socket: Arc<FakeTrackerSocket>,
    hosts: Mutex<Vec<String>>,
}

impl FakeUdpSocketFactory {
    pub fn new(socket: Arc<FakeTrackerSocket>) -> Arc<Self> {
        Arc::new(Self {
            socket,
            hosts: Mutex::new(Vec::new()),
        })
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

#[async_trait]
impl UdpSocketFactory for FakeUdpSocketFactory {
    async fn connect(&self, host: &str) -> Result<Arc<dyn TrackerSocket>> {
        self.hosts.lock().unwrap().push(host.to_string());
        Ok(self.socket.clone())
    }
}
