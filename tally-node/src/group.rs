use crate::error::{Result, TallyError};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tally_common::{Message, WireFormat, MAX_MESSAGE_LEN};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

/// Pause before the single retry of a send the kernel refused for lack of
/// buffer space
const NO_BUFFER_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Raw `ENOBUFS` as the platform's socket layer reports it
#[cfg(any(target_os = "linux", target_os = "android"))]
const ENOBUFS: i32 = 105;
#[cfg(any(target_os = "solaris", target_os = "illumos"))]
const ENOBUFS: i32 = 132;
#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "solaris",
        target_os = "illumos"
    ))
))]
const ENOBUFS: i32 = 55;
/// `WSAENOBUFS`
#[cfg(windows)]
const ENOBUFS: i32 = 10055;

/// Send and receive side of a datagram group
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Send one message to every member, this one included
    async fn send_message(&self, message: Message) -> io::Result<()>;

    /// Wait for the next datagram
    async fn recv_text(&self) -> io::Result<String>;

    /// Human readable group description for logs
    fn describe(&self) -> String;
}

/// Multicast group membership shared by datagram peers and monitors.
///
/// Every member sends to and receives from the same group and port,
/// including its own datagrams.
pub struct GroupSocket {
    socket: UdpSocket,
    group: SocketAddrV4,
    format: WireFormat,
}

impl GroupSocket {
    /// Bind the group port and join the group. Failure here is a setup
    /// failure.
    pub fn join(group: SocketAddrV4, send_buffer_bytes: usize, format: WireFormat) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| TallyError::setup("create datagram socket", e))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| TallyError::setup("set SO_REUSEADDR", e))?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket
            .set_reuse_port(true)
            .map_err(|e| TallyError::setup("set SO_REUSEPORT", e))?;

        if let Err(e) = socket.set_send_buffer_size(send_buffer_bytes) {
            warn!(requested = send_buffer_bytes, error = %e, "Could not enlarge send buffer");
        }

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, group.port());
        socket
            .bind(&SocketAddr::V4(bind_addr).into())
            .map_err(|e| TallyError::setup(format!("bind {}", bind_addr), e))?;
        socket
            .join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TallyError::setup(format!("join group {}", group.ip()), e))?;
        socket
            .set_multicast_loop_v4(true)
            .map_err(|e| TallyError::setup("enable multicast loopback", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TallyError::setup("set non-blocking", e))?;

        let socket = UdpSocket::from_std(socket.into())
            .map_err(|e| TallyError::setup("register datagram socket", e))?;

        info!(group = %group, format = %format, "Joined multicast group");
        Ok(Self {
            socket,
            group,
            format,
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    /// Leave the group. Dropping the socket leaves it as well.
    pub fn leave(&self) {
        if let Err(e) = self
            .socket
            .leave_multicast_v4(*self.group.ip(), Ipv4Addr::UNSPECIFIED)
        {
            debug!(error = %e, "Failed to leave multicast group");
        }
    }
}

#[async_trait]
impl GroupTransport for GroupSocket {
    /// Send one message to the group, retrying once if the send buffer is
    /// full
    async fn send_message(&self, message: Message) -> io::Result<()> {
        let text = message.encode(self.format);
        let (socket, bytes, group) = (&self.socket, text.as_bytes(), self.group);
        send_with_retry(NO_BUFFER_RETRY_DELAY, move || socket.send_to(bytes, group)).await
    }

    async fn recv_text(&self) -> io::Result<String> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        trace!(from = %from, len, "Datagram received");
        Ok(String::from_utf8_lossy(&buf[..len]).into_owned())
    }

    fn describe(&self) -> String {
        self.group.to_string()
    }
}

/// Run `send`, and run it once more after `delay` if the kernel refused it
/// for lack of buffer space. The second attempt's result is final.
async fn send_with_retry<F, Fut>(delay: Duration, mut send: F) -> io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<usize>>,
{
    match send().await {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(ENOBUFS) => {
            debug!("Send buffer full, retrying once");
            tokio::time::sleep(delay).await;
            send().await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// In-process group where every member sees every message, in send order
#[derive(Clone)]
pub struct LoopbackGroup {
    tx: broadcast::Sender<String>,
    format: WireFormat,
}

impl LoopbackGroup {
    pub fn new(format: WireFormat) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx, format }
    }

    /// A new member that receives everything sent from now on
    pub fn member(&self) -> LoopbackMember {
        LoopbackMember {
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            format: self.format,
        }
    }
}

pub struct LoopbackMember {
    tx: broadcast::Sender<String>,
    rx: Mutex<broadcast::Receiver<String>>,
    format: WireFormat,
}

#[async_trait]
impl GroupTransport for LoopbackMember {
    async fn send_message(&self, message: Message) -> io::Result<()> {
        // Nobody listening is not an error for a datagram group
        let _ = self.tx.send(message.encode(self.format));
        Ok(())
    }

    async fn recv_text(&self) -> io::Result<String> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(text) => return Ok(text),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Loopback member lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(io::Error::new(io::ErrorKind::NotConnected, "group closed"))
                }
            }
        }
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

/// Split one datagram into messages. Several line-format messages may share
/// a datagram; each one parses independently.
pub fn parse_datagram(text: &str) -> Vec<std::result::Result<Message, tally_common::WireError>> {
    text.split('\n')
        .filter(|part| !part.trim().is_empty())
        .map(Message::parse)
        .collect()
}
