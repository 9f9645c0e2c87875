//! TCP listener.
//!
//! DNS over TCP prefixes each message with a two-byte big-endian length.
//! Each connection is owned by one task and its queries are served
//! sequentially until EOF.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::dispatcher::{Dispatcher, ResponseWriter};

/// TCP DNS server.
pub struct TcpServer {
    listener: TcpListener,
}

impl TcpServer {
    /// Bind the TCP listener.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Accept connections forever, serving each in its own task.
    pub async fn run(self, dispatcher: Arc<Dispatcher>) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "TCP DNS server listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        if let Err(err) = serve_stream(stream, Some(peer), dispatcher).await {
                            debug!(peer = %peer, error = %err, "TCP connection closed with error");
                        }
                    });
                }
                Err(err) => error!(error = %err, "TCP accept error"),
            }
        }
    }
}

/// Serve length-prefixed DNS messages from a stream until EOF. Shared with
/// the DoT listener, which layers the same framing inside TLS.
pub(crate) async fn serve_stream<S>(
    mut stream: S,
    peer: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let mut len_buf = [0u8; 2];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        let request = match Message::from_vec(&payload) {
            Ok(msg) => msg,
            Err(_) => continue, // malformed, drop silently
        };

        let mut writer = StreamResponseWriter { stream: &mut stream, peer };
        dispatcher.handle(&mut writer, &request).await;
    }
}

struct StreamResponseWriter<'a, S> {
    stream: &'a mut S,
    peer: Option<SocketAddr>,
}

#[async_trait]
impl<S> ResponseWriter for StreamResponseWriter<'_, S>
where
    S: AsyncWrite + Unpin + Send,
{
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    async fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let payload = msg
            .to_vec()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        if payload.len() > usize::from(u16::MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "DNS message exceeds TCP frame size limit",
            ));
        }
        self.stream.write_u16(payload.len() as u16).await?;
        self.stream.write_all(&payload).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_server_binds_to_available_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(TcpServer::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_server_binds_to_specific_port() {
        let addr: SocketAddr = "127.0.0.1:15355".parse().unwrap();
        assert!(TcpServer::bind(addr).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_server_fails_on_port_conflict() {
        let addr: SocketAddr = "127.0.0.1:15356".parse().unwrap();
        let _first = TcpServer::bind(addr).await.unwrap();
        assert!(TcpServer::bind(addr).await.is_err());
    }

    #[test]
    fn dns_length_prefix_encoding() {
        let msg_len: u16 = 256;
        let bytes = msg_len.to_be_bytes();

        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x00);
        assert_eq!(u16::from_be_bytes(bytes), msg_len);
    }

    #[test]
    fn dns_length_prefix_decoding() {
        let buf = [0x00, 0x20, 0x00, 0x00];
        let msg_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;

        assert_eq!(msg_len, 32);
    }
}
