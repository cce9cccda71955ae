//! Datagram transports the dispatch loop runs over.
//!
//! Reliability, ordering and congestion control belong to the reliable-UDP layer
//! underneath; these adapters only move whole envelopes.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
    /// No datagram within the recv deadline; the session keeps running.
    #[error("recv timeout")]
    Timeout,
    #[error("transport closed")]
    Closed,
}

/// Ordered datagram channel to one client.
#[async_trait]
pub trait ControlTransport: Send {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram. Must be cancel-safe: the dispatch loop drops
    /// the future when a timer or termination fires first.
    async fn recv(&mut self) -> Result<Vec<u8>, TransportError>;
}

/// Plain UDP transport bound to a single client address.
#[derive(Debug)]
pub struct UdpControlTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    max_size: usize,
}

impl UdpControlTransport {
    pub async fn bind(
        local: SocketAddr,
        peer: SocketAddr,
        max_size: usize,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        Self::from_socket(socket, peer, max_size).await
    }

    pub async fn from_socket(
        socket: UdpSocket,
        peer: SocketAddr,
        max_size: usize,
    ) -> Result<Self, TransportError> {
        socket.connect(peer).await?;
        Ok(Self {
            socket,
            peer,
            max_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl ControlTransport for UdpControlTransport {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        self.socket.send(datagram).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; self.max_size];
        let len = self.socket.recv(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }
}

/// Wrapper that enforces a per-datagram recv deadline.
#[derive(Debug)]
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T> ControlTransport for TimeoutTransport<T>
where
    T: ControlTransport,
{
    async fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        self.inner.send(datagram).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// In-memory transport pair, handy for tests and local loopback setups.
#[derive(Debug)]
pub struct PipeTransport {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl PipeTransport {
    pub fn pair(capacity: usize) -> (PipeTransport, PipeTransport) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            PipeTransport {
                sender: a_tx,
                receiver: b_rx,
            },
            PipeTransport {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
impl ControlTransport for PipeTransport {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        self.sender
            .send(datagram.to_vec())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        self.receiver.recv().await.ok_or(TransportError::Closed)
    }
}
