//! SMB1 status codes.
//!
//! DOS and server class errors go out as an error class byte plus a 16-bit
//! code; NT class errors go out as a 32-bit NT status with the long error code
//! flag set. Reference: [MS-CIFS] 2.2.2.4, [MS-ERREF] 2.3

/// Error class for the DOS form of a status.
pub const ERR_SUCCESS: u8 = 0x00;
pub const ERR_DOS: u8 = 0x01;
pub const ERR_SRV: u8 = 0x02;

/// Status values produced by the IPC$ handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmbStatus {
    Success,
    /// More data is buffered; the client keeps reading.
    BufferOverflow,
    DosFileNotFound,
    DosTooManyOpenFiles,
    DosInvalidHandle,
    DosInvalidData,
    DosInvalidDrive,
    SrvNoAccessRights,
    SrvInvalidTid,
    SrvUnrecognizedCommand,
    SrvNoResources,
    SrvNotSupported,
    NtInvalidParameter,
    NtAccessDenied,
    NtObjectNotFound,
    NtTooManyOpenedFiles,
}

impl SmbStatus {
    /// True for statuses that are sent in NT form.
    pub fn is_nt(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::BufferOverflow
                | Self::NtInvalidParameter
                | Self::NtAccessDenied
                | Self::NtObjectNotFound
                | Self::NtTooManyOpenedFiles
        )
    }

    /// Error class byte of the DOS form.
    pub fn error_class(&self) -> u8 {
        match self {
            Self::DosFileNotFound
            | Self::DosTooManyOpenFiles
            | Self::DosInvalidHandle
            | Self::DosInvalidData
            | Self::DosInvalidDrive => ERR_DOS,
            Self::SrvNoAccessRights
            | Self::SrvInvalidTid
            | Self::SrvUnrecognizedCommand
            | Self::SrvNoResources
            | Self::SrvNotSupported => ERR_SRV,
            _ => ERR_SUCCESS,
        }
    }

    /// Error code of the DOS form.
    pub fn error_code(&self) -> u16 {
        match self {
            Self::DosFileNotFound => 0x0002,
            Self::DosTooManyOpenFiles => 0x0004,
            Self::DosInvalidHandle => 0x0006,
            Self::DosInvalidData => 0x000D,
            Self::DosInvalidDrive => 0x000F,
            Self::SrvNoAccessRights => 0x0004,
            Self::SrvInvalidTid => 0x0005,
            Self::SrvUnrecognizedCommand => 0x0016,
            Self::SrvNoResources => 0x0059,
            Self::SrvNotSupported => 0xFFFF,
            _ => 0,
        }
    }

    /// 32-bit NT status. Only meaningful where `is_nt()` holds.
    pub fn nt_status(&self) -> u32 {
        match self {
            Self::BufferOverflow => 0x8000_0005,
            Self::NtInvalidParameter => 0xC000_000D,
            Self::NtAccessDenied => 0xC000_0022,
            Self::NtObjectNotFound => 0xC000_0034,
            Self::NtTooManyOpenedFiles => 0xC000_011F,
            _ => 0x0000_0000,
        }
    }

    /// Success and buffer overflow are not failures.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::Success | Self::BufferOverflow)
    }
}
