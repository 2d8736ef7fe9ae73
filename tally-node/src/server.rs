use crate::codec::CountCodec;
use crate::coordinator::Coordinator;
use crate::error::{Result, TallyError};
use crate::transport::TcpLink;
use futures::StreamExt;
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use tally_common::{Message, WireFormat};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodecError};
use tracing::{debug, error, info, warn};

/// TCP front end of the coordinator
pub struct CoordinatorServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    format: WireFormat,
    max_participants: usize,
}

impl CoordinatorServer {
    /// Bind the listener. Failure here is a setup failure.
    pub async fn bind(
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        format: WireFormat,
        max_participants: u32,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TallyError::setup(format!("bind {}", addr), e))?;

        info!(listen_addr = %addr, max_participants, "Coordinator listening for participants");

        Ok(Self {
            listener,
            coordinator,
            format,
            max_participants: max_participants as usize,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept participants until shutdown, then close every link and join
    /// every connection task.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.coordinator.shutdown_token();
        let permits = Arc::new(Semaphore::new(self.max_participants));
        let mut connections = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer_addr = %peer_addr, "Accepted participant connection");
                    connections.spawn(handle_connection(
                        stream,
                        peer_addr,
                        self.coordinator.clone(),
                        self.format,
                        permit,
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    // Brief pause before retrying accept
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
            }

            while let Some(finished) = connections.try_join_next() {
                if let Err(e) = finished {
                    warn!(error = %e, "Connection task failed");
                }
            }
        }

        info!(
            connections = connections.len(),
            "Shutting down coordinator, closing participant links"
        );
        self.coordinator.registry().close_all().await;

        while let Some(finished) = connections.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "Connection task failed");
            }
        }

        info!("All participant connections closed");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    coordinator: Arc<Coordinator>,
    format: WireFormat,
    _permit: OwnedSemaphorePermit,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    let closed = coordinator.shutdown_token().child_token();
    let key = coordinator
        .register(Box::new(TcpLink::new(writer, closed.clone())))
        .await;
    let mut frames = FramedRead::new(reader, CountCodec::new(format));

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = frames.next() => match frame {
                Some(Ok(text)) => match Message::parse(&text) {
                    Ok(message) => {
                        coordinator.handle_message(key, message).await;
                    }
                    Err(e) => {
                        counter!("tally_messages_discarded_total", 1);
                        debug!(participant = key, error = %e, "Discarding malformed message");
                    }
                },
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    counter!("tally_messages_discarded_total", 1);
                    debug!(participant = key, "Discarding oversized message");
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    debug!(participant = key, error = %e, "Participant read failed");
                    break;
                }
                None => {
                    debug!(participant = key, "Participant closed the connection");
                    break;
                }
            },
        }
    }

    coordinator.disconnect(key).await;
}
