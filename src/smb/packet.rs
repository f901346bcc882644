//! SMB1 packet over a pooled buffer.
//!
//! The buffer holds the 4-byte session header followed by the SMB header,
//! parameter words and data bytes. Responses are normally built in place over
//! the request; a larger reply buffer can be attached as the associated packet.
//! MS-CIFS Section 2.2.3

use crate::memory::PooledBuffer;
use crate::smb::status::SmbStatus;
use crate::smb::{
    FLG2_LONGERRORCODE, FLG_RESPONSE, MAX_BYTE_COUNT, NETBIOS_HEADER_LEN, NO_ANDX_COMMAND,
    PARAM_WORDS_OFFSET, SMB_MAGIC, WORD_COUNT_OFFSET,
};

// Field offsets within the buffer (session header included).
const OFF_COMMAND: usize = 8;
const OFF_STATUS: usize = 9;
const OFF_FLAGS: usize = 13;
const OFF_FLAGS2: usize = 14;
const OFF_TID: usize = 28;
const OFF_PID: usize = 30;
const OFF_UID: usize = 32;
const OFF_MID: usize = 34;

/// Smallest packet that can carry an SMB header, word count and byte count.
pub const MIN_SMB_PACKET_LEN: usize = PARAM_WORDS_OFFSET + 2;

#[derive(Debug)]
pub struct SmbPacket {
    buf: PooledBuffer,
    received_len: usize,
    associated: Option<Box<SmbPacket>>,
}

impl SmbPacket {
    pub fn new(buf: PooledBuffer) -> Self {
        SmbPacket {
            buf,
            received_len: 0,
            associated: None,
        }
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_pooled(&self) -> bool {
        self.buf.is_pooled()
    }

    /// Bytes received into the buffer, session header included.
    pub fn received_length(&self) -> usize {
        self.received_len
    }

    pub fn set_received_length(&mut self, len: usize) {
        self.received_len = len;
    }

    // ---- Associated reply packet ----

    pub fn has_associated(&self) -> bool {
        self.associated.is_some()
    }

    pub fn associated(&self) -> Option<&SmbPacket> {
        self.associated.as_deref()
    }

    /// Attach a reply packet, releasing any previous one.
    pub fn set_associated(&mut self, pkt: SmbPacket) -> &mut SmbPacket {
        self.associated.insert(Box::new(pkt))
    }

    pub fn take_associated(&mut self) -> Option<SmbPacket> {
        self.associated.take().map(|b| *b)
    }

    // ---- Raw field access ----

    fn get_u16(&self, off: usize) -> u16 {
        self.buf
            .get(off..off + 2)
            .map_or(0, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        self.buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn get_u32(&self, off: usize) -> u32 {
        self.buf
            .get(off..off + 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Bytes `[off, off + len)` of the received data, if all were received.
    pub fn received_slice(&self, off: usize, len: usize) -> Option<&[u8]> {
        let end = off.checked_add(len)?;
        if end > self.received_len {
            return None;
        }
        self.buf.get(off..end)
    }

    // ---- SMB header ----

    /// True if the received data holds a well formed SMB1 header.
    pub fn is_smb(&self) -> bool {
        self.received_len >= MIN_SMB_PACKET_LEN
            && self.buf[NETBIOS_HEADER_LEN..NETBIOS_HEADER_LEN + 4] == SMB_MAGIC
    }

    /// Write the SMB magic, command and zeroed header fields.
    pub fn init_header(&mut self, command: u8) {
        self.buf[NETBIOS_HEADER_LEN..WORD_COUNT_OFFSET].fill(0);
        self.buf[NETBIOS_HEADER_LEN..NETBIOS_HEADER_LEN + 4].copy_from_slice(&SMB_MAGIC);
        self.buf[OFF_COMMAND] = command;
    }

    pub fn command(&self) -> u8 {
        self.buf.get(OFF_COMMAND).copied().unwrap_or(0)
    }

    pub fn set_command(&mut self, cmd: u8) {
        self.buf[OFF_COMMAND] = cmd;
    }

    pub fn flags(&self) -> u8 {
        self.buf.get(OFF_FLAGS).copied().unwrap_or(0)
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.buf[OFF_FLAGS] = flags;
    }

    pub fn flags2(&self) -> u16 {
        self.get_u16(OFF_FLAGS2)
    }

    pub fn set_flags2(&mut self, flags2: u16) {
        self.put_u16(OFF_FLAGS2, flags2);
    }

    pub fn tree_id(&self) -> u16 {
        self.get_u16(OFF_TID)
    }

    pub fn set_tree_id(&mut self, tid: u16) {
        self.put_u16(OFF_TID, tid);
    }

    pub fn process_id(&self) -> u16 {
        self.get_u16(OFF_PID)
    }

    pub fn user_id(&self) -> u16 {
        self.get_u16(OFF_UID)
    }

    pub fn set_user_id(&mut self, uid: u16) {
        self.put_u16(OFF_UID, uid);
    }

    pub fn multiplex_id(&self) -> u16 {
        self.get_u16(OFF_MID)
    }

    /// 32-bit status field.
    pub fn long_error_code(&self) -> u32 {
        self.get_u32(OFF_STATUS)
    }

    pub fn set_long_error_code(&mut self, status: u32) {
        self.put_u32(OFF_STATUS, status);
    }

    /// DOS form of the status field: class, reserved, 16-bit code.
    pub fn error_class(&self) -> u8 {
        self.buf.get(OFF_STATUS).copied().unwrap_or(0)
    }

    pub fn error_code(&self) -> u16 {
        self.get_u16(OFF_STATUS + 2)
    }

    pub fn set_error(&mut self, class: u8, code: u16) {
        self.buf[OFF_STATUS] = class;
        self.buf[OFF_STATUS + 1] = 0;
        self.put_u16(OFF_STATUS + 2, code);
    }

    pub fn is_response(&self) -> bool {
        self.flags() & FLG_RESPONSE != 0
    }

    // ---- Parameter words and data bytes ----

    pub fn parameter_count(&self) -> usize {
        self.buf.get(WORD_COUNT_OFFSET).copied().unwrap_or(0) as usize
    }

    pub fn set_parameter_count(&mut self, count: usize) {
        self.buf[WORD_COUNT_OFFSET] = count as u8;
    }

    pub fn parameter(&self, idx: usize) -> u16 {
        self.get_u16(PARAM_WORDS_OFFSET + idx * 2)
    }

    pub fn set_parameter(&mut self, idx: usize, v: u16) {
        self.put_u16(PARAM_WORDS_OFFSET + idx * 2, v);
    }

    /// Two consecutive parameter words as a 32-bit value.
    pub fn parameter_long(&self, idx: usize) -> u32 {
        self.get_u32(PARAM_WORDS_OFFSET + idx * 2)
    }

    pub fn set_parameter_long(&mut self, idx: usize, v: u32) {
        self.put_u32(PARAM_WORDS_OFFSET + idx * 2, v);
    }

    /// Set the AndX command byte; the reserved byte after it is cleared.
    pub fn set_andx_command(&mut self, cmd: u8) {
        self.buf[PARAM_WORDS_OFFSET] = cmd;
        self.buf[PARAM_WORDS_OFFSET + 1] = 0;
    }

    fn byte_count_offset(&self) -> usize {
        PARAM_WORDS_OFFSET + self.parameter_count() * 2
    }

    pub fn byte_count(&self) -> usize {
        self.get_u16(self.byte_count_offset()) as usize
    }

    /// Callers keep `count` within `MAX_BYTE_COUNT`.
    pub fn set_byte_count(&mut self, count: usize) {
        debug_assert!(count <= MAX_BYTE_COUNT, "byte count {} overflows", count);
        let off = self.byte_count_offset();
        self.put_u16(off, count as u16);
    }

    /// Buffer offset of the first data byte.
    pub fn byte_offset(&self) -> usize {
        self.byte_count_offset() + 2
    }

    /// SMB message length, session header excluded.
    pub fn length(&self) -> usize {
        self.byte_offset() + self.byte_count() - NETBIOS_HEADER_LEN
    }

    /// Check the request carries at least `min_words` parameter words and
    /// `min_bytes` data bytes, all within the received data.
    pub fn check_packet_is_valid(&self, min_words: usize, min_bytes: usize) -> bool {
        if !self.is_smb() || self.parameter_count() < min_words {
            return false;
        }
        if self.byte_offset() > self.received_len {
            return false;
        }
        let bytes = self.byte_count();
        bytes >= min_bytes && self.byte_offset() + bytes <= self.received_len
    }

    // ---- Responses ----

    /// Mark the packet as a response carrying `status`.
    pub fn set_response_status(&mut self, status: SmbStatus) {
        self.set_flags(self.flags() | FLG_RESPONSE);
        if status.is_nt() {
            self.set_flags2(self.flags2() | FLG2_LONGERRORCODE);
            self.set_long_error_code(status.nt_status());
        } else {
            self.set_flags2(self.flags2() & !FLG2_LONGERRORCODE);
            self.set_error(status.error_class(), status.error_code());
        }
    }

    /// Turn the packet into an empty error response. Any associated reply
    /// packet is released.
    pub fn set_error_response(&mut self, status: SmbStatus) {
        self.associated = None;
        self.set_parameter_count(0);
        self.set_byte_count(0);
        self.set_response_status(status);
    }

    /// Zero parameter words `[from, to)`.
    pub fn clear_parameters(&mut self, from: usize, to: usize) {
        for idx in from..to {
            self.set_parameter(idx, 0);
        }
    }

    /// Start an AndX response with `words` parameter words, all zeroed.
    pub fn init_andx_response(&mut self, words: usize) {
        self.set_parameter_count(words);
        self.clear_parameters(0, words);
        self.set_andx_command(NO_ANDX_COMMAND);
    }
}
