#![forbid(unsafe_code)]

//! CIFS (SMB1) packet layer for the IPC$ share: pooled packet buffers, TCP
//! session framing, per-session virtual circuits and DCE/RPC over named pipes.

pub mod circuit;
pub mod config;
pub mod dcerpc;
pub mod error;
pub mod ipc;
pub mod memory;
pub mod server;
pub mod smb;
pub mod transport;
