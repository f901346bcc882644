//! Packet pool: wraps buffers from the byte buffer pool as SMB packets.
//!
//! Requests that do not fit the largest size class may still be served by an
//! unpooled, exact-size buffer when over-sized allocations are enabled.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ServerError;
use crate::memory::{ByteBufferPool, PooledBuffer};
use crate::smb::packet::SmbPacket;
use crate::smb::{NETBIOS_HEADER_LEN, SMB_HEADER_LEN};

/// How long an allocation waits for a pooled buffer.
pub const ALLOCATE_WAIT: Duration = Duration::from_millis(250);

/// Default ceiling for over-sized allocations (128K).
pub const DEFAULT_MAX_OVERSIZED: usize = 128 * 1024;

pub struct PacketPool {
    buffers: Arc<ByteBufferPool>,
    wait: Duration,
    allow_oversized: bool,
    max_oversized: usize,
}

impl PacketPool {
    pub fn new(buffers: Arc<ByteBufferPool>) -> Self {
        PacketPool {
            buffers,
            wait: ALLOCATE_WAIT,
            allow_oversized: true,
            max_oversized: DEFAULT_MAX_OVERSIZED,
        }
    }

    /// Allocate a packet with a buffer of at least `size` bytes.
    pub async fn allocate_packet(&self, size: usize) -> Result<SmbPacket, ServerError> {
        let buf = if size <= self.buffers.largest_size() {
            self.buffers.allocate_buffer(size, self.wait).await
        } else if self.allow_oversized && size <= self.max_oversized {
            debug!(size, "Allocating an over-sized packet");
            Some(PooledBuffer::unpooled(size))
        } else {
            None
        };

        match buf {
            Some(buf) => Ok(SmbPacket::new(buf)),
            None => {
                warn!(size, pool = %self.buffers, "Packet allocate failed");
                Err(ServerError::NoPooledMemory(size))
            }
        }
    }

    /// Allocate a reply packet for `req`, copy `copy_len` bytes of header
    /// (default: the SMB header) from the request, and attach the reply as the
    /// request's associated packet.
    pub async fn allocate_associated<'a>(
        &self,
        size: usize,
        req: &'a mut SmbPacket,
        copy_len: Option<usize>,
    ) -> Result<&'a mut SmbPacket, ServerError> {
        let mut resp = self.allocate_packet(size).await?;

        let len = copy_len.unwrap_or(SMB_HEADER_LEN);
        let end = (NETBIOS_HEADER_LEN + len)
            .min(req.buffer_len())
            .min(resp.buffer_len());
        resp.buffer_mut()[NETBIOS_HEADER_LEN..end]
            .copy_from_slice(&req.buffer()[NETBIOS_HEADER_LEN..end]);

        debug!(size, req_size = req.buffer_len(), "Associated reply packet");
        Ok(req.set_associated(resp))
    }

    /// Return a packet, and its associated packet, to the pool.
    ///
    /// Pooled buffers go back to their size class; over-sized buffers are
    /// freed.
    pub fn release_packet(&self, mut pkt: SmbPacket) {
        match pkt.take_associated() {
            Some(assoc) => debug!(
                size = pkt.buffer_len(),
                assoc_size = assoc.buffer_len(),
                assoc_pooled = assoc.is_pooled(),
                "Packet released with associated packet"
            ),
            None => debug!(size = pkt.buffer_len(), pooled = pkt.is_pooled(), "Packet released"),
        }
    }

    pub fn smallest_size(&self) -> usize {
        self.buffers.smallest_size()
    }

    pub fn largest_size(&self) -> usize {
        self.buffers.largest_size()
    }

    pub fn allows_oversized_allocations(&self) -> bool {
        self.allow_oversized
    }

    pub fn set_allow_oversized_allocations(&mut self, ena: bool) {
        self.allow_oversized = ena;
    }

    pub fn maximum_oversized_allocation(&self) -> usize {
        self.max_oversized
    }

    pub fn set_maximum_oversized_allocation(&mut self, size: usize) {
        self.max_oversized = size;
    }

    pub fn set_allocate_wait(&mut self, wait: Duration) {
        self.wait = wait;
    }

    pub fn buffer_pool(&self) -> &ByteBufferPool {
        &self.buffers
    }
}

impl std::fmt::Display for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.buffers)
    }
}
