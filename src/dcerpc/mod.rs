//! DCE/RPC connection-oriented PDUs carried over SMB named pipes.
//!
//! All multi-byte header fields are little-endian (NDR data representation
//! 0x10). Reference: DCE 1.1 RPC, Chapter 12; [MS-RPCE] 2.2.2

pub mod buffer;
pub mod handler;
pub mod pipe;

// Common header field offsets.
pub const HDR_VER_MAJOR: usize = 0;
pub const HDR_VER_MINOR: usize = 1;
pub const HDR_PDU_TYPE: usize = 2;
pub const HDR_FLAGS: usize = 3;
pub const HDR_DATA_REP: usize = 4;
pub const HDR_FRAG_LEN: usize = 8;
pub const HDR_AUTH_LEN: usize = 10;
pub const HDR_CALL_ID: usize = 12;

// REQUEST / RESPONSE header field offsets.
pub const HDR_ALLOC_HINT: usize = 16;
pub const HDR_CONTEXT_ID: usize = 20;
pub const HDR_OPNUM: usize = 22;

/// Length of the common header; PDU specific data starts here.
pub const DCE_DATA: usize = 16;
/// Start of the stub data in REQUEST and RESPONSE PDUs.
pub const OPERATION_DATA: usize = 24;

pub const RPC_VERSION_MAJOR: u8 = 5;
pub const RPC_VERSION_MINOR: u8 = 0;

/// Little-endian integers, ASCII characters, IEEE floats.
pub const DATA_REPRESENTATION: [u8; 4] = [0x10, 0x00, 0x00, 0x00];

// Header flags
pub const FLG_FIRST_FRAG: u8 = 0x01;
pub const FLG_LAST_FRAG: u8 = 0x02;
pub const FLG_ONLY_FRAG: u8 = FLG_FIRST_FRAG | FLG_LAST_FRAG;

/// Association group returned in every BIND_ACK.
pub const BIND_ACK_GROUP_ID: u32 = 0x53F0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduType {
    Request = 0,
    Ping = 1,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    Shutdown = 17,
    Cancel = 18,
    Orphaned = 19,
}

impl PduType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Ping),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            11 => Some(Self::Bind),
            12 => Some(Self::BindAck),
            13 => Some(Self::BindNak),
            14 => Some(Self::AlterContext),
            15 => Some(Self::AlterContextResp),
            17 => Some(Self::Shutdown),
            18 => Some(Self::Cancel),
            19 => Some(Self::Orphaned),
            _ => None,
        }
    }
}
