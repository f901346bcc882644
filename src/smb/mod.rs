//! SMB1 (CIFS) packet layout, command codes and status values.
//!
//! Only the commands that reach the IPC$ share are modelled.
//! Reference: [MS-CIFS] (Common Internet File System Protocol)

pub mod packet;
pub mod packet_pool;
pub mod status;
pub mod transact;

use crate::smb::status::SmbStatus;

/// Length of the NetBIOS session service header in front of every packet.
pub const NETBIOS_HEADER_LEN: usize = 4;

/// Length of the SMB header that follows the session header.
pub const SMB_HEADER_LEN: usize = 32;

/// Offset of the word count byte within a packet buffer.
pub const WORD_COUNT_OFFSET: usize = NETBIOS_HEADER_LEN + SMB_HEADER_LEN;

/// Offset of the first parameter word within a packet buffer.
pub const PARAM_WORDS_OFFSET: usize = WORD_COUNT_OFFSET + 1;

/// SMB1 protocol magic: 0xFF 'S' 'M' 'B'
pub const SMB_MAGIC: [u8; 4] = [0xFF, b'S', b'M', b'B'];

/// NetBIOS session message types.
pub const SESSION_MESSAGE: u8 = 0x00;
pub const SESSION_KEEPALIVE: u8 = 0x85;

/// Flags: packet is a response
pub const FLG_RESPONSE: u8 = 0x80;
/// Flags2: 32-bit NT status codes
pub const FLG2_LONGERRORCODE: u16 = 0x4000;
/// Flags2: strings are UTF-16LE
pub const FLG2_UNICODE: u16 = 0x8000;

/// Buffer format marker preceding a data block in Read/Write.
pub const DATA_BLOCK: u8 = 0x01;
/// Buffer format marker preceding a file name in Open.
pub const ASCII_STRING: u8 = 0x04;

/// The byte count field is 16 bits.
pub const MAX_BYTE_COUNT: usize = u16::MAX as usize;

/// AndX command value meaning "no further command".
pub const NO_ANDX_COMMAND: u8 = 0xFF;

/// SMB1 command codes handled on the IPC$ share.
/// MS-CIFS Section 2.2.2.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmbCommand {
    OpenFile = 0x02,
    CloseFile = 0x04,
    ReadFile = 0x0A,
    WriteFile = 0x0B,
    Transaction = 0x25,
    TransactionSecondary = 0x26,
    OpenAndX = 0x2D,
    ReadAndX = 0x2E,
    WriteAndX = 0x2F,
    NtCreateAndX = 0xA2,
}

impl SmbCommand {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x02 => Some(Self::OpenFile),
            0x04 => Some(Self::CloseFile),
            0x0A => Some(Self::ReadFile),
            0x0B => Some(Self::WriteFile),
            0x25 => Some(Self::Transaction),
            0x26 => Some(Self::TransactionSecondary),
            0x2D => Some(Self::OpenAndX),
            0x2E => Some(Self::ReadAndX),
            0x2F => Some(Self::WriteAndX),
            0xA2 => Some(Self::NtCreateAndX),
            _ => None,
        }
    }
}

/// What a handler wants done with the packet it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Send the response (the associated packet if one was allocated).
    Send,
    /// Nothing goes back for this request.
    Silent,
}

/// Result of an IPC$ command handler. Errors become error responses.
pub type HandlerResult = Result<Reply, SmbStatus>;

/// Round up to a 4-byte boundary.
pub fn longword_align(pos: usize) -> usize {
    (pos + 3) & !3
}

/// Round up to a 2-byte boundary.
pub fn word_align(pos: usize) -> usize {
    (pos + 1) & !1
}

/// Decode a UTF-16LE byte slice into a Rust String.
pub fn utf16le_to_string(data: &[u8]) -> String {
    let u16s: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&u16s).trim_end_matches('\0').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(longword_align(59), 60);
        assert_eq!(longword_align(60), 60);
        assert_eq!(longword_align(63), 64);
        assert_eq!(word_align(87), 88);
        assert_eq!(word_align(88), 88);
    }

    #[test]
    fn test_command_codes() {
        assert_eq!(SmbCommand::from_u8(0x2F), Some(SmbCommand::WriteAndX));
        assert_eq!(SmbCommand::from_u8(0xA2), Some(SmbCommand::NtCreateAndX));
        assert_eq!(SmbCommand::from_u8(0x2D), Some(SmbCommand::OpenAndX));
        assert_eq!(SmbCommand::from_u8(0x02), Some(SmbCommand::OpenFile));
        assert_eq!(SmbCommand::from_u8(0x72), None);
    }

    #[test]
    fn test_utf16le_decode() {
        let raw: Vec<u8> = "\\srvsvc\0"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        assert_eq!(utf16le_to_string(&raw), "\\srvsvc");
    }
}
