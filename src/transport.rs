//! Packet handlers: the socket side of an SMB session.
//!
//! Every message is prefixed with a 4-byte session service header: a type
//! byte (0x00 = session message), a length extension byte and a 16-bit
//! big-endian length. The handler reads one framed message into a packet
//! from the packet pool and writes framed replies back.
//!
//! RFC 1002 Section 4.3.1, MS-CIFS Section 2.1.1.2

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::ServerError;
use crate::smb::packet::SmbPacket;
use crate::smb::packet_pool::PacketPool;
use crate::smb::{NETBIOS_HEADER_LEN, SESSION_MESSAGE};

/// Largest peek used by `available_bytes`, and so the most it reports.
const PEEK_LEN: usize = 4096;

/// Transport a packet handler runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Native SMB over TCP, port 445.
    TcpCifs,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::TcpCifs => "TCP/IP SMB",
        }
    }
}

/// Reads and writes framed SMB packets for one session.
pub trait PacketHandler: Send {
    fn protocol(&self) -> Protocol;

    fn protocol_name(&self) -> &'static str {
        self.protocol().name()
    }

    /// NetBIOS name of the client, when the transport knows it.
    fn client_name(&self) -> Option<&str>;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn packet_pool(&self) -> &Arc<PacketPool>;

    /// Bytes that can be read without waiting. This is a lower bound: the
    /// TCP handler peeks at most `PEEK_LEN` bytes.
    fn available_bytes(&mut self) -> impl Future<Output = Result<usize, ServerError>> + Send;

    /// Read the next framed message into a pooled packet. The packet holds the
    /// session header followed by the message.
    fn read_packet(&mut self) -> impl Future<Output = Result<SmbPacket, ServerError>> + Send;

    /// Write the session header plus `len` message bytes. With `write_raw`
    /// the first four bytes of the buffer are sent as they are.
    fn send_packet(
        &mut self,
        pkt: &mut SmbPacket,
        len: usize,
        write_raw: bool,
    ) -> impl Future<Output = Result<(), ServerError>> + Send;

    fn write_packet_len(
        &mut self,
        pkt: &mut SmbPacket,
        len: usize,
    ) -> impl Future<Output = Result<(), ServerError>> + Send {
        self.send_packet(pkt, len, false)
    }

    /// Write a packet using its own SMB length.
    fn write_packet(
        &mut self,
        pkt: &mut SmbPacket,
    ) -> impl Future<Output = Result<(), ServerError>> + Send {
        let len = pkt.length();
        self.send_packet(pkt, len, false)
    }

    fn close_handler(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Packet handler for SMB directly over a TCP socket.
pub struct TcpPacketHandler {
    stream: TcpStream,
    pool: Arc<PacketPool>,
    remote: Option<SocketAddr>,
    client_name: Option<String>,
}

impl TcpPacketHandler {
    pub fn new(stream: TcpStream, pool: Arc<PacketPool>) -> Self {
        let remote = stream.peer_addr().ok();
        TcpPacketHandler {
            stream,
            pool,
            remote,
            client_name: None,
        }
    }

    pub fn set_client_name(&mut self, name: impl Into<String>) {
        self.client_name = Some(name.into());
    }

    async fn read_header(&mut self) -> Result<[u8; NETBIOS_HEADER_LEN], ServerError> {
        let mut hdr = [0u8; NETBIOS_HEADER_LEN];
        let mut got = 0;
        while got < NETBIOS_HEADER_LEN {
            let n = self.stream.read(&mut hdr[got..]).await?;
            if n == 0 {
                return Err(if got == 0 {
                    ServerError::ConnectionClosed
                } else {
                    ServerError::InvalidHeader(got)
                });
            }
            got += n;
        }
        Ok(hdr)
    }

    async fn read_body(&mut self, pkt: &mut SmbPacket, end: usize) -> Result<(), ServerError> {
        let mut off = NETBIOS_HEADER_LEN;
        while off < end {
            let n = self.stream.read(&mut pkt.buffer_mut()[off..end]).await?;
            if n == 0 {
                return Err(ServerError::ConnectionClosed);
            }
            off += n;
        }
        Ok(())
    }
}

impl PacketHandler for TcpPacketHandler {
    fn protocol(&self) -> Protocol {
        Protocol::TcpCifs
    }

    fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn packet_pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    async fn available_bytes(&mut self) -> Result<usize, ServerError> {
        let mut scratch = [0u8; PEEK_LEN];
        match tokio::time::timeout(Duration::ZERO, self.stream.peek(&mut scratch)).await {
            Ok(res) => Ok(res?),
            Err(_) => Ok(0),
        }
    }

    async fn read_packet(&mut self) -> Result<SmbPacket, ServerError> {
        let hdr = self.read_header().await?;

        let len = ((hdr[1] as usize) << 16) | u16::from_be_bytes([hdr[2], hdr[3]]) as usize;
        let end = len + NETBIOS_HEADER_LEN;

        let mut pkt = self.pool.allocate_packet(end).await?;
        pkt.buffer_mut()[..NETBIOS_HEADER_LEN].copy_from_slice(&hdr);

        if let Err(e) = self.read_body(&mut pkt, end).await {
            self.pool.release_packet(pkt);
            return Err(e);
        }
        pkt.set_received_length(end);

        debug!(msg_type = hdr[0], len, buf_len = pkt.buffer_len(), "Read packet");
        Ok(pkt)
    }

    async fn send_packet(
        &mut self,
        pkt: &mut SmbPacket,
        len: usize,
        write_raw: bool,
    ) -> Result<(), ServerError> {
        let end = len + NETBIOS_HEADER_LEN;
        if end > pkt.buffer_len() {
            return Err(ServerError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Write length {} exceeds buffer {}", len, pkt.buffer_len()),
            )));
        }

        if !write_raw {
            let mut hdr = (len as u32).to_be_bytes();
            hdr[0] = SESSION_MESSAGE;
            pkt.buffer_mut()[..NETBIOS_HEADER_LEN].copy_from_slice(&hdr);
        }

        self.stream.write_all(&pkt.buffer()[..end]).await?;
        self.stream.flush().await?;

        debug!(len, raw = write_raw, "Wrote packet");
        Ok(())
    }

    async fn close_handler(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ByteBufferPool;
    use crate::memory::PooledBuffer;
    use tokio::net::TcpListener;

    fn pool() -> Arc<PacketPool> {
        let mut pool = PacketPool::new(Arc::new(ByteBufferPool::new(&[(64, 2), (1024, 2)])));
        pool.set_allocate_wait(Duration::from_millis(20));
        Arc::new(pool)
    }

    /// Accept one connection and wrap it; returns the handler and the client.
    async fn pair(pool: Arc<PacketPool>) -> (TcpPacketHandler, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (TcpPacketHandler::new(server, pool), client)
    }

    #[tokio::test]
    async fn test_read_packet() {
        let (mut handler, mut client) = pair(pool()).await;
        client.write_all(&[0, 0, 0, 5, b'H', b'E', b'L', b'L', b'O']).await.unwrap();

        let pkt = handler.read_packet().await.unwrap();
        assert_eq!(pkt.received_length(), 9);
        assert_eq!(&pkt.buffer()[4..9], b"HELLO");
        assert!(pkt.is_pooled());
        assert_eq!(handler.protocol_name(), "TCP/IP SMB");
        assert!(handler.remote_address().is_some());
    }

    #[tokio::test]
    async fn test_read_packet_arrives_in_pieces() {
        let (mut handler, mut client) = pair(pool()).await;
        let writer = tokio::spawn(async move {
            client.write_all(&[0, 0]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(&[0, 3, b'a']).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"bc").await.unwrap();
            client
        });

        let pkt = handler.read_packet().await.unwrap();
        assert_eq!(pkt.received_length(), 7);
        assert_eq!(&pkt.buffer()[4..7], b"abc");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_before_header_is_connection_closed() {
        let (mut handler, client) = pair(pool()).await;
        drop(client);
        assert!(matches!(
            handler.read_packet().await,
            Err(ServerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_short_header_is_invalid() {
        let (mut handler, mut client) = pair(pool()).await;
        client.write_all(&[0, 0]).await.unwrap();
        client.shutdown().await.unwrap();
        assert!(matches!(
            handler.read_packet().await,
            Err(ServerError::InvalidHeader(2))
        ));
    }

    #[tokio::test]
    async fn test_short_body_releases_packet() {
        let pool = pool();
        let (mut handler, mut client) = pair(Arc::clone(&pool)).await;
        client.write_all(&[0, 0, 0, 20, b'x']).await.unwrap();
        client.shutdown().await.unwrap();

        assert!(matches!(
            handler.read_packet().await,
            Err(ServerError::ConnectionClosed)
        ));
        assert_eq!(pool.buffer_pool().available_buffers(24), 2);
    }

    #[tokio::test]
    async fn test_length_extension_byte() {
        let mut pool = PacketPool::new(Arc::new(ByteBufferPool::new(&[(64, 1)])));
        pool.set_allow_oversized_allocations(false);
        let (mut handler, mut client) = pair(Arc::new(pool)).await;

        // 0x10000 + 4 bytes is larger than every size class
        client.write_all(&[0, 1, 0, 0]).await.unwrap();
        assert!(matches!(
            handler.read_packet().await,
            Err(ServerError::NoPooledMemory(0x10004))
        ));
    }

    #[tokio::test]
    async fn test_write_packet_frames_length() {
        let (mut handler, mut client) = pair(pool()).await;
        let mut pkt = SmbPacket::new(PooledBuffer::unpooled(64));
        pkt.buffer_mut()[..4].fill(0xEE);
        pkt.buffer_mut()[4..10].copy_from_slice(b"REPLY!");

        handler.write_packet_len(&mut pkt, 6).await.unwrap();

        let mut got = [0u8; 10];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..4], &[0, 0, 0, 6]);
        assert_eq!(&got[4..], b"REPLY!");
    }

    #[tokio::test]
    async fn test_write_raw_keeps_header() {
        let (mut handler, mut client) = pair(pool()).await;
        let mut pkt = SmbPacket::new(PooledBuffer::unpooled(16));
        pkt.buffer_mut()[..6].copy_from_slice(&[0x85, 0, 0, 2, 1, 2]);

        handler.send_packet(&mut pkt, 2, true).await.unwrap();

        let mut got = [0u8; 6];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0x85, 0, 0, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_write_past_buffer_fails() {
        let (mut handler, _client) = pair(pool()).await;
        let mut pkt = SmbPacket::new(PooledBuffer::unpooled(16));
        assert!(matches!(
            handler.write_packet_len(&mut pkt, 13).await,
            Err(ServerError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_available_bytes() {
        let (mut handler, mut client) = pair(pool()).await;
        assert_eq!(handler.available_bytes().await.unwrap(), 0);

        client.write_all(b"abc").await.unwrap();
        let mut avail = 0;
        for _ in 0..50 {
            avail = handler.available_bytes().await.unwrap();
            if avail > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(avail, 3);

        // Peeking does not consume
        let mut buf = [0u8; 3];
        handler.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_available_bytes_is_capped() {
        let (mut handler, mut client) = pair(pool()).await;
        client.write_all(&vec![0x42u8; PEEK_LEN + 100]).await.unwrap();

        let mut avail = 0;
        for _ in 0..50 {
            avail = handler.available_bytes().await.unwrap();
            if avail == PEEK_LEN {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(avail, PEEK_LEN);
    }

    #[tokio::test]
    async fn test_close_handler_shuts_down_write_side() {
        let (mut handler, mut client) = pair(pool()).await;
        handler.close_handler().await;
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
