//! Named pipes on the IPC$ share and the handlers behind them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dcerpc::buffer::{DceBuffer, DceReader};
use crate::smb::status::SmbStatus;

/// Well known DCE/RPC pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeType {
    Srvsvc,
    Samr,
    Winreg,
    Wkssvc,
    Netlogon,
    Lsarpc,
    Spoolss,
    Netdfs,
    Svcctl,
    Eventlog,
}

impl PipeType {
    pub const ALL: [PipeType; 10] = [
        PipeType::Srvsvc,
        PipeType::Samr,
        PipeType::Winreg,
        PipeType::Wkssvc,
        PipeType::Netlogon,
        PipeType::Lsarpc,
        PipeType::Spoolss,
        PipeType::Netdfs,
        PipeType::Svcctl,
        PipeType::Eventlog,
    ];

    /// Name the client opens.
    pub fn client_name(&self) -> &'static str {
        match self {
            PipeType::Srvsvc => "\\PIPE\\srvsvc",
            PipeType::Samr => "\\PIPE\\samr",
            PipeType::Winreg => "\\PIPE\\winreg",
            PipeType::Wkssvc => "\\PIPE\\wkssvc",
            PipeType::Netlogon => "\\PIPE\\NETLOGON",
            PipeType::Lsarpc => "\\PIPE\\lsarpc",
            PipeType::Spoolss => "\\PIPE\\spoolss",
            PipeType::Netdfs => "\\PIPE\\netdfs",
            PipeType::Svcctl => "\\PIPE\\svcctl",
            PipeType::Eventlog => "\\PIPE\\EVENTLOG",
        }
    }

    /// Secondary address returned in a BIND_ACK.
    pub fn server_pipe_name(&self) -> &'static str {
        match self {
            PipeType::Srvsvc | PipeType::Wkssvc | PipeType::Eventlog => "\\PIPE\\ntsvcs",
            PipeType::Samr | PipeType::Netlogon | PipeType::Lsarpc => "\\PIPE\\lsass",
            PipeType::Winreg => "\\PIPE\\winreg",
            PipeType::Spoolss => "\\PIPE\\spoolss",
            PipeType::Netdfs => "\\PIPE\\netdfs",
            PipeType::Svcctl => "\\PIPE\\svcctl",
        }
    }

    /// Match a client pipe name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.client_name().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for PipeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.client_name())
    }
}

/// Handles REQUEST PDUs for one pipe type.
///
/// A handler answers by building a RESPONSE (or FAULT) PDU and leaving it on
/// the pipe with [`PipeFile::set_buffered_data`].
pub trait PipeRequestHandler: Send + Sync {
    fn process_request(
        &self,
        opnum: u16,
        request: &DceReader<'_>,
        pipe: &mut PipeFile,
    ) -> Result<(), SmbStatus>;
}

/// Request handlers by pipe type.
#[derive(Default, Clone)]
pub struct PipeHandlerRegistry {
    handlers: HashMap<PipeType, Arc<dyn PipeRequestHandler>>,
}

impl PipeHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pipe_type: PipeType, handler: Arc<dyn PipeRequestHandler>) {
        self.handlers.insert(pipe_type, handler);
    }

    pub fn handler_for(&self, pipe_type: PipeType) -> Option<Arc<dyn PipeRequestHandler>> {
        self.handlers.get(&pipe_type).cloned()
    }

    pub fn registered_pipes(&self) -> Vec<PipeType> {
        PipeType::ALL
            .iter()
            .copied()
            .filter(|p| self.handlers.contains_key(p))
            .collect()
    }
}

impl fmt::Debug for PipeHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeHandlerRegistry")
            .field("pipes", &self.registered_pipes())
            .finish()
    }
}

/// An open named pipe.
pub struct PipeFile {
    pipe_type: PipeType,
    handler: Option<Arc<dyn PipeRequestHandler>>,
    max_tx_frag: u16,
    max_rx_frag: u16,
    pipe_state: u16,
    buffered: Option<DceBuffer>,
}

impl PipeFile {
    pub fn new(pipe_type: PipeType, handler: Option<Arc<dyn PipeRequestHandler>>) -> Self {
        PipeFile {
            pipe_type,
            handler,
            max_tx_frag: 0,
            max_rx_frag: 0,
            pipe_state: 0,
            buffered: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.pipe_type.client_name()
    }

    pub fn pipe_type(&self) -> PipeType {
        self.pipe_type
    }

    pub fn request_handler(&self) -> Option<&Arc<dyn PipeRequestHandler>> {
        self.handler.as_ref()
    }

    /// Fragment sizes negotiated by BIND.
    pub fn set_max_fragment_sizes(&mut self, tx: u16, rx: u16) {
        self.max_tx_frag = tx;
        self.max_rx_frag = rx;
    }

    pub fn max_transmit_fragment(&self) -> u16 {
        self.max_tx_frag
    }

    pub fn max_receive_fragment(&self) -> u16 {
        self.max_rx_frag
    }

    pub fn pipe_state(&self) -> u16 {
        self.pipe_state
    }

    pub fn set_pipe_state(&mut self, state: u16) {
        self.pipe_state = state;
    }

    pub fn has_buffered_data(&self) -> bool {
        self.buffered.is_some()
    }

    pub fn buffered_data(&self) -> Option<&DceBuffer> {
        self.buffered.as_ref()
    }

    pub fn buffered_data_mut(&mut self) -> Option<&mut DceBuffer> {
        self.buffered.as_mut()
    }

    /// Queue a reply PDU, replacing any reply not yet read.
    pub fn set_buffered_data(&mut self, buf: DceBuffer) {
        self.buffered = Some(buf);
    }

    pub fn clear_buffered_data(&mut self) {
        self.buffered = None;
    }

    pub fn close_file(&mut self) {
        self.buffered = None;
    }
}

impl fmt::Debug for PipeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeFile")
            .field("pipe", &self.pipe_type)
            .field("handler", &self.handler.is_some())
            .field("max_tx_frag", &self.max_tx_frag)
            .field("max_rx_frag", &self.max_rx_frag)
            .field(
                "buffered",
                &self.buffered.as_ref().map(|b| b.available_length()),
            )
            .finish()
    }
}
