//! SMB1 Transaction requests on named pipes.
//!
//! A primary Transaction carries setup words, a parameter block and a data
//! block. When the client's data does not fit one packet the remainder
//! arrives in TransactionSecondary packets, each placing its blocks at a
//! displacement into the full buffers. MS-CIFS 2.2.4.33, 2.2.4.34

use crate::smb::packet::SmbPacket;
use crate::smb::status::SmbStatus;
use crate::smb::{
    longword_align, utf16le_to_string, word_align, FLG2_UNICODE, MAX_BYTE_COUNT,
    NETBIOS_HEADER_LEN, PARAM_WORDS_OFFSET,
};

// Primary request parameter words.
pub const TRANS_TOTAL_PARAM: usize = 0;
pub const TRANS_TOTAL_DATA: usize = 1;
pub const TRANS_MAX_PARAM: usize = 2;
pub const TRANS_MAX_DATA: usize = 3;
pub const TRANS_PARAM_COUNT: usize = 9;
pub const TRANS_PARAM_OFFSET: usize = 10;
pub const TRANS_DATA_COUNT: usize = 11;
pub const TRANS_DATA_OFFSET: usize = 12;
pub const TRANS_SETUP_COUNT: usize = 13;
pub const TRANS_SETUP_FUNCTION: usize = 14;
pub const TRANS_SETUP_FID: usize = 15;

/// Parameter words in a primary Transaction request with two setup words.
pub const TRANS_REQUEST_WORDS: usize = 16;

// Secondary request parameter words.
const SEC_TOTAL_PARAM: usize = 0;
const SEC_TOTAL_DATA: usize = 1;
const SEC_PARAM_COUNT: usize = 2;
const SEC_PARAM_OFFSET: usize = 3;
const SEC_PARAM_DISP: usize = 4;
const SEC_DATA_COUNT: usize = 5;
const SEC_DATA_OFFSET: usize = 6;
const SEC_DATA_DISP: usize = 7;

/// Parameter words in a TransactionSecondary request.
pub const TRANS_SECONDARY_WORDS: usize = 8;

/// Parameter words in a Transaction response without setup words.
pub const TRANS_REPLY_WORDS: usize = 10;

/// Named pipe subcommands (setup word 0). MS-CIFS 2.2.5
pub const TRANSACT_NM_PIPE: u16 = 0x0026;
pub const SET_NM_PHAND_STATE: u16 = 0x0001;

const TRANS_REPLY_BYTES: usize = PARAM_WORDS_OFFSET + TRANS_REPLY_WORDS * 2 + 2;

/// Buffer offset of the data block in a Transaction response.
pub fn transact_reply_data_offset() -> usize {
    longword_align(TRANS_REPLY_BYTES)
}

/// Most data one Transaction response can carry. The byte count also covers
/// the pad in front of the data block.
pub fn max_transact_reply_data() -> usize {
    MAX_BYTE_COUNT - (transact_reply_data_offset() - TRANS_REPLY_BYTES)
}

/// Format `pkt` as a Transaction response carrying `data_len` data bytes and
/// no parameters. Returns the buffer offset at which the data goes.
pub fn init_transact_reply(
    pkt: &mut SmbPacket,
    total_data: usize,
    data_len: usize,
) -> Result<usize, SmbStatus> {
    if data_len > max_transact_reply_data() || total_data > u16::MAX as usize {
        return Err(SmbStatus::SrvNoResources);
    }
    pkt.set_parameter_count(TRANS_REPLY_WORDS);
    pkt.clear_parameters(0, TRANS_REPLY_WORDS);

    let pos = transact_reply_data_offset();
    let smb_off = (pos - NETBIOS_HEADER_LEN) as u16;

    pkt.set_parameter(1, total_data as u16);
    pkt.set_parameter(4, smb_off);
    pkt.set_parameter(6, data_len as u16);
    pkt.set_parameter(7, smb_off);

    let byte_off = pkt.byte_offset();
    pkt.set_byte_count(pos + data_len - byte_off);
    Ok(pos)
}

/// Transaction name: null terminated, Unicode when flags2 says so.
fn transaction_name(pkt: &SmbPacket) -> String {
    let unicode = pkt.flags2() & FLG2_UNICODE != 0;
    let mut pos = pkt.byte_offset();
    let end = (pos + pkt.byte_count()).min(pkt.received_length());
    if unicode {
        pos = word_align(pos);
    }
    let bytes = pkt.buffer().get(pos..end).unwrap_or(&[]);
    if unicode {
        let len = bytes
            .chunks_exact(2)
            .position(|c| c == [0, 0])
            .map_or(bytes.len() & !1, |n| n * 2);
        utf16le_to_string(&bytes[..len])
    } else {
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..len]).into_owned()
    }
}

/// A Transaction request reassembled into owned parameter and data blocks.
#[derive(Debug, Clone)]
pub struct TransactBuffer {
    name: String,
    tree_id: u16,
    function: u16,
    fid: u16,
    max_param: usize,
    max_data: usize,
    total_param: usize,
    total_data: usize,
    params: Vec<u8>,
    data: Vec<u8>,
    params_received: usize,
    data_received: usize,
}

impl TransactBuffer {
    /// Build from a primary Transaction request. The caller has already
    /// checked the word count.
    pub fn from_packet(pkt: &SmbPacket) -> Result<Self, SmbStatus> {
        if pkt.parameter(TRANS_SETUP_COUNT) & 0xFF < 2 {
            return Err(SmbStatus::SrvUnrecognizedCommand);
        }

        let total_param = pkt.parameter(TRANS_TOTAL_PARAM) as usize;
        let total_data = pkt.parameter(TRANS_TOTAL_DATA) as usize;

        let mut tbuf = TransactBuffer {
            name: transaction_name(pkt),
            tree_id: pkt.tree_id(),
            function: pkt.parameter(TRANS_SETUP_FUNCTION),
            fid: pkt.parameter(TRANS_SETUP_FID),
            max_param: pkt.parameter(TRANS_MAX_PARAM) as usize,
            max_data: pkt.parameter(TRANS_MAX_DATA) as usize,
            total_param,
            total_data,
            params: vec![0u8; total_param],
            data: vec![0u8; total_data],
            params_received: 0,
            data_received: 0,
        };

        tbuf.place_params(
            pkt,
            pkt.parameter(TRANS_PARAM_COUNT) as usize,
            pkt.parameter(TRANS_PARAM_OFFSET) as usize,
            0,
        )?;
        tbuf.place_data(
            pkt,
            pkt.parameter(TRANS_DATA_COUNT) as usize,
            pkt.parameter(TRANS_DATA_OFFSET) as usize,
            0,
        )?;
        Ok(tbuf)
    }

    /// Add the blocks carried by a TransactionSecondary request.
    pub fn append_secondary(&mut self, pkt: &SmbPacket) -> Result<(), SmbStatus> {
        // The client may shrink the totals in a secondary request.
        let total_param = pkt.parameter(SEC_TOTAL_PARAM) as usize;
        let total_data = pkt.parameter(SEC_TOTAL_DATA) as usize;
        if total_param < self.total_param {
            self.total_param = total_param;
            self.params.truncate(total_param);
        }
        if total_data < self.total_data {
            self.total_data = total_data;
            self.data.truncate(total_data);
        }

        self.place_params(
            pkt,
            pkt.parameter(SEC_PARAM_COUNT) as usize,
            pkt.parameter(SEC_PARAM_OFFSET) as usize,
            pkt.parameter(SEC_PARAM_DISP) as usize,
        )?;
        self.place_data(
            pkt,
            pkt.parameter(SEC_DATA_COUNT) as usize,
            pkt.parameter(SEC_DATA_OFFSET) as usize,
            pkt.parameter(SEC_DATA_DISP) as usize,
        )
    }

    fn place_params(
        &mut self,
        pkt: &SmbPacket,
        count: usize,
        offset: usize,
        disp: usize,
    ) -> Result<(), SmbStatus> {
        copy_block(pkt, &mut self.params, count, offset, disp)?;
        self.params_received += count;
        Ok(())
    }

    fn place_data(
        &mut self,
        pkt: &SmbPacket,
        count: usize,
        offset: usize,
        disp: usize,
    ) -> Result<(), SmbStatus> {
        copy_block(pkt, &mut self.data, count, offset, disp)?;
        self.data_received += count;
        Ok(())
    }

    /// All parameter and data bytes have arrived.
    pub fn is_complete(&self) -> bool {
        self.params_received >= self.total_param && self.data_received >= self.total_data
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree_id(&self) -> u16 {
        self.tree_id
    }

    pub fn function(&self) -> u16 {
        self.function
    }

    pub fn fid(&self) -> u16 {
        self.fid
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn max_param_count(&self) -> usize {
        self.max_param
    }

    /// Most data bytes the client accepts in the response.
    pub fn return_data_limit(&self) -> usize {
        self.max_data
    }
}

/// Copy `count` received bytes at SMB offset `offset` into `dest[disp..]`.
fn copy_block(
    pkt: &SmbPacket,
    dest: &mut [u8],
    count: usize,
    offset: usize,
    disp: usize,
) -> Result<(), SmbStatus> {
    if count == 0 {
        return Ok(());
    }
    let src = pkt
        .received_slice(offset + NETBIOS_HEADER_LEN, count)
        .ok_or(SmbStatus::SrvUnrecognizedCommand)?;
    let slot = disp
        .checked_add(count)
        .and_then(|end| dest.get_mut(disp..end))
        .ok_or(SmbStatus::SrvUnrecognizedCommand)?;
    slot.copy_from_slice(src);
    Ok(())
}
