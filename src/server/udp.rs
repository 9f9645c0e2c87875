//! UDP listener.
//!
//! Datagram queries are handed to the dispatcher one task per message so a
//! slow upstream exchange never blocks the receive loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::{error, info};

use super::MAX_DNS_PACKET_SIZE;
use crate::dispatcher::{Dispatcher, ResponseWriter};

/// UDP DNS server.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
}

impl UdpServer {
    /// Bind the UDP listener.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    /// Receive datagrams forever, dispatching each in its own task.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
        info!(addr = %self.socket.local_addr()?, "UDP DNS server listening");

        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    error!(error = %err, "UDP recv error");
                    continue;
                }
            };

            let request = match Message::from_vec(&buf[..len]) {
                Ok(msg) => msg,
                Err(_) => continue, // malformed, drop silently
            };

            let socket = Arc::clone(&self.socket);
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let mut writer = UdpResponseWriter { socket, peer };
                dispatcher.handle(&mut writer, &request).await;
            });
        }
    }
}

struct UdpResponseWriter {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

#[async_trait]
impl ResponseWriter for UdpResponseWriter {
    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let payload = msg
            .to_vec()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.socket.send_to(&payload, self.peer).await.map(|_| ())
    }
}
