//! SMB server: shared state, per-connection sessions and the request loop.
//!
//! Each TCP connection runs as an independent async task with its own
//! session. Requests on a session are handled strictly one at a time: read a
//! packet, dispatch it, write the response, release the packet.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::circuit::{VirtualCircuit, VirtualCircuitList};
use crate::config::Config;
use crate::dcerpc::pipe::PipeHandlerRegistry;
use crate::error::{error_to_status, ServerError};
use crate::ipc;
use crate::memory::ByteBufferPool;
use crate::smb::packet::SmbPacket;
use crate::smb::packet_pool::PacketPool;
use crate::smb::status::SmbStatus;
use crate::smb::{Reply, SESSION_KEEPALIVE};
use crate::transport::PacketHandler;

// ---- Public types ----

/// Shared server state (one per server process).
pub struct ServerState {
    pub config: Config,
    pool: Arc<PacketPool>,
    pipe_handlers: Arc<PipeHandlerRegistry>,
    next_session_id: AtomicU64,
}

impl ServerState {
    pub fn new(config: Config, pipe_handlers: PipeHandlerRegistry) -> Self {
        let buffers = ByteBufferPool::new(&config.pool.classes());
        let mut pool = PacketPool::new(Arc::new(buffers));
        pool.set_allocate_wait(Duration::from_millis(config.pool.allocate_wait_ms));
        pool.set_allow_oversized_allocations(config.pool.allow_oversized);
        pool.set_maximum_oversized_allocation(config.pool.max_oversized);

        ServerState {
            config,
            pool: Arc::new(pool),
            pipe_handlers: Arc::new(pipe_handlers),
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn packet_pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    /// Create the session for a newly accepted connection.
    pub fn new_session(&self, remote: Option<SocketAddr>) -> SmbSession {
        SmbSession::new(
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            remote,
            Arc::clone(&self.pool),
            Arc::clone(&self.pipe_handlers),
            self.config.max_virtual_circuits,
        )
    }
}

/// Per-connection session state.
pub struct SmbSession {
    id: u64,
    remote: Option<SocketAddr>,
    pool: Arc<PacketPool>,
    pipe_handlers: Arc<PipeHandlerRegistry>,
    circuits: VirtualCircuitList,
}

impl SmbSession {
    pub fn new(
        id: u64,
        remote: Option<SocketAddr>,
        pool: Arc<PacketPool>,
        pipe_handlers: Arc<PipeHandlerRegistry>,
        max_circuits: usize,
    ) -> Self {
        SmbSession {
            id,
            remote,
            pool,
            pipe_handlers,
            circuits: VirtualCircuitList::new(max_circuits),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn packet_pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn pipe_handlers(&self) -> &PipeHandlerRegistry {
        &self.pipe_handlers
    }

    pub fn circuits(&self) -> &VirtualCircuitList {
        &self.circuits
    }

    /// Register a logged on circuit, returning its UID.
    pub async fn add_circuit(&self, vc: VirtualCircuit) -> Option<u16> {
        let uid = self.circuits.add_circuit(vc).await;
        match uid {
            Some(uid) => info!(session = self.id, uid, "Virtual circuit added"),
            None => warn!(
                session = self.id,
                max = self.circuits.max_circuits(),
                "Virtual circuit limit reached"
            ),
        }
        uid
    }

    pub async fn find_circuit(&self, uid: u16) -> Option<Arc<VirtualCircuit>> {
        self.circuits.find_circuit(uid).await
    }

    pub async fn remove_circuit(&self, uid: u16) {
        self.circuits.remove_circuit(uid, self).await;
    }

    /// Packet to build the reply to `req` in: the request itself when its
    /// buffer can hold `required` bytes, otherwise a larger associated packet
    /// from the pool.
    pub async fn reply_packet<'a>(
        &self,
        req: &'a mut SmbPacket,
        required: usize,
    ) -> Result<&'a mut SmbPacket, SmbStatus> {
        if req.buffer_len() >= required {
            return Ok(req);
        }
        self.pool
            .allocate_associated(required, req, None)
            .await
            .map_err(|e| {
                warn!(session = self.id, required, error = %e, "Reply allocation failed");
                error_to_status(&e)
            })
    }

    /// Close every circuit.
    pub async fn close_session(&self) {
        self.circuits.clear_circuit_list(self).await;
    }
}

// ---- Connection entrypoint ----

/// Handle a single client connection.
///
/// Reads packets in a loop, dispatches each to the IPC$ handlers and writes
/// the response. Exits on connection close or fatal error; the session's
/// circuits are closed either way.
#[instrument(
    name = "session",
    skip_all,
    fields(id = sess.id(), proto = handler.protocol_name())
)]
pub async fn handle_connection<H: PacketHandler>(
    mut handler: H,
    sess: &SmbSession,
) -> Result<(), ServerError> {
    debug!(remote = ?handler.remote_address(), "session started");
    let result = request_loop(&mut handler, sess).await;
    sess.close_session().await;
    handler.close_handler().await;
    result
}

async fn request_loop<H: PacketHandler>(
    handler: &mut H,
    sess: &SmbSession,
) -> Result<(), ServerError> {
    let pool = Arc::clone(sess.packet_pool());

    loop {
        let mut pkt = match handler.read_packet().await {
            Ok(p) => p,
            Err(ServerError::ConnectionClosed) => {
                debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if pkt.buffer()[0] == SESSION_KEEPALIVE {
            pool.release_packet(pkt);
            continue;
        }

        if !pkt.is_smb() {
            warn!(len = pkt.received_length(), "Not an SMB packet, closing session");
            pool.release_packet(pkt);
            return Ok(());
        }

        debug!(
            command = pkt.command(),
            uid = pkt.user_id(),
            tid = pkt.tree_id(),
            mid = pkt.multiplex_id(),
            "Received request"
        );

        let reply = match ipc::process_ipc_request(sess, &mut pkt).await {
            Ok(reply) => reply,
            Err(status) => {
                debug!(command = pkt.command(), ?status, "Error response");
                pkt.set_error_response(status);
                Reply::Send
            }
        };

        if reply == Reply::Send {
            let sent = match pkt.take_associated() {
                Some(mut resp) => {
                    let sent = handler.write_packet(&mut resp).await;
                    pool.release_packet(resp);
                    sent
                }
                None => handler.write_packet(&mut pkt).await,
            };
            if let Err(e) = sent {
                pool.release_packet(pkt);
                return Err(e);
            }
        }

        pool.release_packet(pkt);
    }
}
