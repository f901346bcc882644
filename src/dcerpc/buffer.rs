//! DCE/RPC PDU buffers.
//!
//! Inbound PDUs are read in place from the packet that carried them through
//! [`DceReader`]. Outbound PDUs are built in an owned [`DceBuffer`], which
//! then sits on a pipe file until the client has read all of it.

use std::fmt;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::dcerpc::{
    PduType, DATA_REPRESENTATION, DCE_DATA, FLG_ONLY_FRAG, HDR_CALL_ID, HDR_FLAGS, HDR_FRAG_LEN,
    HDR_OPNUM, HDR_PDU_TYPE, OPERATION_DATA, RPC_VERSION_MAJOR, RPC_VERSION_MINOR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DceBufferError {
    /// A read ran past the end of the PDU.
    EndOfBuffer { offset: usize, len: usize },
    /// The destination is too small for the copy.
    NoSpace { needed: usize, available: usize },
    /// The PDU no longer fits the 16-bit fragment length.
    TooLong { len: usize },
}

impl fmt::Display for DceBufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfBuffer { offset, len } => {
                write!(f, "End of DCE buffer, offset={} len={}", offset, len)
            }
            Self::NoSpace { needed, available } => {
                write!(f, "No space for DCE data, need {} have {}", needed, available)
            }
            Self::TooLong { len } => {
                write!(f, "DCE PDU too long for one fragment, len={}", len)
            }
        }
    }
}

impl std::error::Error for DceBufferError {}

/// Interface or transfer syntax identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub major: u16,
    pub minor: u16,
}

/// Length of an encoded syntax identifier.
pub const SYNTAX_ID_LEN: usize = 20;

/// Zero-copy reader over one inbound PDU.
#[derive(Debug, Clone)]
pub struct DceReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DceReader<'a> {
    /// Wrap `buf`, which must hold at least the common header. Reading
    /// starts just after it.
    pub fn new(buf: &'a [u8]) -> Result<Self, DceBufferError> {
        if buf.len() < DCE_DATA {
            return Err(DceBufferError::EndOfBuffer {
                offset: 0,
                len: DCE_DATA,
            });
        }
        Ok(DceReader { buf, pos: DCE_DATA })
    }

    pub fn pdu_type(&self) -> u8 {
        self.buf[HDR_PDU_TYPE]
    }

    pub fn flags(&self) -> u8 {
        self.buf[HDR_FLAGS]
    }

    pub fn fragment_length(&self) -> u16 {
        u16::from_le_bytes([self.buf[HDR_FRAG_LEN], self.buf[HDR_FRAG_LEN + 1]])
    }

    pub fn call_id(&self) -> u32 {
        let b = &self.buf[HDR_CALL_ID..HDR_CALL_ID + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Operation number of a REQUEST PDU.
    pub fn opnum(&self) -> Result<u16, DceBufferError> {
        let b = self.bytes_at(HDR_OPNUM, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Stub data of a REQUEST PDU, bounded by the fragment length.
    pub fn operation_data(&self) -> &'a [u8] {
        let end = (self.fragment_length() as usize).min(self.buf.len());
        self.buf.get(OPERATION_DATA..end).unwrap_or(&[])
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Move the read position up to a multiple of `n` from the PDU start.
    pub fn align(&mut self, n: usize) {
        self.pos = self.pos.div_ceil(n) * n;
    }

    fn bytes_at(&self, offset: usize, len: usize) -> Result<&'a [u8], DceBufferError> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or(DceBufferError::EndOfBuffer { offset, len })
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], DceBufferError> {
        let b = self.bytes_at(self.pos, len)?;
        self.pos += len;
        Ok(b)
    }

    pub fn get_u8(&mut self) -> Result<u8, DceBufferError> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, DceBufferError> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, DceBufferError> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, DceBufferError> {
        let b = self.get_bytes(16)?;
        let mut raw = [0u8; 16];
        raw.copy_from_slice(b);
        Ok(Uuid::from_bytes_le(raw))
    }

    pub fn get_syntax(&mut self) -> Result<SyntaxId, DceBufferError> {
        Ok(SyntaxId {
            uuid: self.get_uuid()?,
            major: self.get_u16()?,
            minor: self.get_u16()?,
        })
    }
}

/// Owned outbound PDU with a read position for draining it to the client.
#[derive(Debug, Clone, Default)]
pub struct DceBuffer {
    buf: BytesMut,
    rd_pos: usize,
}

impl DceBuffer {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(cap: usize) -> Self {
        DceBuffer {
            buf: BytesMut::with_capacity(cap),
            rd_pos: 0,
        }
    }

    fn put_header(&mut self, pdu_type: PduType, call_id: u32) {
        self.buf.put_u8(RPC_VERSION_MAJOR);
        self.buf.put_u8(RPC_VERSION_MINOR);
        self.buf.put_u8(pdu_type as u8);
        self.buf.put_u8(FLG_ONLY_FRAG);
        self.buf.put_slice(&DATA_REPRESENTATION);
        self.buf.put_u16_le(0); // fragment length, patched later
        self.buf.put_u16_le(0); // auth length
        self.buf.put_u32_le(call_id);
    }

    /// Start a BIND_ACK PDU.
    pub fn put_bind_ack_header(&mut self, call_id: u32) {
        self.put_header(PduType::BindAck, call_id);
    }

    /// Start a RESPONSE PDU. Stub data follows at `OPERATION_DATA`.
    pub fn put_response_header(&mut self, call_id: u32, alloc_hint: u32) {
        self.put_header(PduType::Response, call_id);
        self.buf.put_u32_le(alloc_hint);
        self.buf.put_u16_le(0); // context id
        self.buf.put_u8(0); // cancel count
        self.buf.put_u8(0);
    }

    pub fn pdu_type(&self) -> u8 {
        self.buf.get(HDR_PDU_TYPE).copied().unwrap_or(0)
    }

    pub fn flags(&self) -> u8 {
        self.buf.get(HDR_FLAGS).copied().unwrap_or(0)
    }

    pub fn set_flags(&mut self, flags: u8) {
        if let Some(b) = self.buf.get_mut(HDR_FLAGS) {
            *b = flags;
        }
    }

    pub fn fragment_length(&self) -> u16 {
        self.buf
            .get(HDR_FRAG_LEN..HDR_FRAG_LEN + 2)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn set_frag_len(&mut self, len: u16) {
        if let Some(b) = self.buf.get_mut(HDR_FRAG_LEN..HDR_FRAG_LEN + 2) {
            b.copy_from_slice(&len.to_le_bytes());
        }
    }

    /// Set the fragment length to the length of the PDU built so far.
    pub fn update_frag_len(&mut self) -> Result<(), DceBufferError> {
        let len = u16::try_from(self.buf.len())
            .map_err(|_| DceBufferError::TooLong { len: self.buf.len() })?;
        self.set_frag_len(len);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// ASCII string, optionally null terminated.
    pub fn put_ascii_string(&mut self, s: &str, nul: bool) {
        self.buf.put_slice(s.as_bytes());
        if nul {
            self.buf.put_u8(0);
        }
    }

    pub fn put_uuid(&mut self, uuid: &Uuid) {
        self.buf.put_slice(&uuid.to_bytes_le());
    }

    pub fn put_syntax(&mut self, syntax: &SyntaxId) {
        self.put_uuid(&syntax.uuid);
        self.buf.put_u16_le(syntax.major);
        self.buf.put_u16_le(syntax.minor);
    }

    /// Zero pad up to a multiple of `n` from the PDU start.
    pub fn align(&mut self, n: usize) {
        let target = self.buf.len().div_ceil(n) * n;
        self.buf.resize(target, 0);
    }

    /// Total PDU length.
    pub fn length(&self) -> usize {
        self.buf.len()
    }

    /// Bytes not yet copied out.
    pub fn available_length(&self) -> usize {
        self.buf.len() - self.rd_pos
    }

    /// Bytes already copied out.
    pub fn read_position(&self) -> usize {
        self.rd_pos
    }

    pub fn is_drained(&self) -> bool {
        self.rd_pos >= self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Copy `len` unread bytes to the front of `dest` and advance past them.
    pub fn copy_data(&mut self, dest: &mut [u8], len: usize) -> Result<usize, DceBufferError> {
        if len > self.available_length() {
            return Err(DceBufferError::EndOfBuffer {
                offset: self.rd_pos,
                len,
            });
        }
        if len > dest.len() {
            return Err(DceBufferError::NoSpace {
                needed: len,
                available: dest.len(),
            });
        }
        dest[..len].copy_from_slice(&self.buf[self.rd_pos..self.rd_pos + len]);
        self.rd_pos += len;
        Ok(len)
    }
}
