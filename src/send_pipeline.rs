use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for sending a datagram on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// A send error is returned rather than swallowed: the engine treats it as a
///  terminal transmission failure of the request that owns the packet.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        self.send_to(packet_buf, to).await?;
        Ok(())
    }
}

/// Thin wrapper tying a send socket to the connection's remote address. The
///  completion of `send_packet` is the send-completion notification: once it
///  returns, the network layer no longer references the buffer.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    remote_addr: SocketAddr,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, remote_addr: SocketAddr) -> SendPipeline {
        SendPipeline { socket, remote_addr }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub async fn send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        self.socket.do_send_packet(self.remote_addr, packet_buf).await
    }
}
