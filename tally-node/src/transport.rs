use async_trait::async_trait;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outbound half of a participant connection as seen by the registry
#[async_trait]
pub trait ParticipantLink: Send {
    /// Write one already-encoded message
    async fn send(&mut self, text: &str) -> io::Result<()>;

    /// Close the link. Any reader blocked on the other half is released.
    async fn close(&mut self);

    /// Human readable peer description for logs
    fn describe(&self) -> String;
}

/// TCP write half plus a token that stops the matching read loop
pub struct TcpLink {
    writer: OwnedWriteHalf,
    peer: String,
    closed: CancellationToken,
}

impl TcpLink {
    pub fn new(writer: OwnedWriteHalf, closed: CancellationToken) -> Self {
        let peer = writer
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            writer,
            peer,
            closed,
        }
    }
}

#[async_trait]
impl ParticipantLink for TcpLink {
    async fn send(&mut self, text: &str) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "link closed"));
        }
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await
    }

    async fn close(&mut self) {
        self.closed.cancel();
        if let Err(e) = self.writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown of participant stream failed");
        }
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

/// In-process link backed by an unbounded channel
#[derive(Debug)]
pub struct ChannelLink {
    name: String,
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl ChannelLink {
    /// Create a link and the receiver that observes everything sent on it
    pub fn pair(name: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                tx: Some(tx),
            },
            rx,
        )
    }
}

#[async_trait]
impl ParticipantLink for ChannelLink {
    async fn send(&mut self, text: &str) -> io::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(text.to_string())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver dropped")),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "link closed")),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
