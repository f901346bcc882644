//! Virtual circuits, tree connections and open pipe files.
//!
//! A session carries one or more virtual circuits, each identified by a UID
//! allocated here. A circuit owns the tree connections made under it, and a
//! tree connection owns the pipe files opened on it, keyed by FID.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::dcerpc::pipe::PipeFile;
use crate::server::SmbSession;
use crate::smb::status::SmbStatus;
use crate::smb::transact::TransactBuffer;

/// Default number of virtual circuits per session.
pub const DEFAULT_CIRCUITS: usize = 4;
/// Upper bound on virtual circuits per session.
pub const MAX_CIRCUITS: usize = 16;

/// Default number of files open at once on one tree connection.
pub const DEFAULT_MAX_FILES: usize = 256;

// UIDs that are never handed out.
const UID_RESERVED_LOW: u16 = 0;
const UID_RESERVED_HIGH: u16 = 0xFFFF;

/// A tree connection to the IPC$ share.
#[derive(Debug)]
pub struct TreeConnection {
    tid: u16,
    share_name: String,
    files: HashMap<u16, PipeFile>,
    next_fid: u16,
    max_files: usize,
}

impl TreeConnection {
    pub fn new(tid: u16, share_name: impl Into<String>) -> Self {
        Self::with_file_limit(tid, share_name, DEFAULT_MAX_FILES)
    }

    pub fn with_file_limit(tid: u16, share_name: impl Into<String>, max_files: usize) -> Self {
        TreeConnection {
            tid,
            share_name: share_name.into(),
            files: HashMap::new(),
            next_fid: 1,
            max_files,
        }
    }

    pub fn tree_id(&self) -> u16 {
        self.tid
    }

    pub fn share_name(&self) -> &str {
        &self.share_name
    }

    /// Add an open file and return its FID.
    pub fn add_file(&mut self, file: PipeFile) -> Result<u16, SmbStatus> {
        if self.files.len() >= self.max_files {
            return Err(SmbStatus::DosTooManyOpenFiles);
        }
        let mut fid = self.next_fid;
        while fid == 0 || self.files.contains_key(&fid) {
            fid = fid.wrapping_add(1);
        }
        self.next_fid = fid.wrapping_add(1);
        self.files.insert(fid, file);
        Ok(fid)
    }

    pub fn find_file(&self, fid: u16) -> Option<&PipeFile> {
        self.files.get(&fid)
    }

    pub fn find_file_mut(&mut self, fid: u16) -> Option<&mut PipeFile> {
        self.files.get_mut(&fid)
    }

    /// Close and remove a file.
    pub fn remove_file(&mut self, fid: u16) -> Option<PipeFile> {
        let mut file = self.files.remove(&fid)?;
        file.close_file();
        Some(file)
    }

    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Close every open file.
    pub fn close_files(&mut self) {
        for (fid, mut file) in self.files.drain() {
            debug!(tid = self.tid, fid, pipe = file.name(), "Closing pipe file");
            file.close_file();
        }
    }
}

/// Per-circuit state, guarded by the circuit lock.
#[derive(Debug, Default)]
pub struct CircuitState {
    trees: HashMap<u16, TreeConnection>,
    next_tid: u16,
    pending: Option<TransactBuffer>,
}

impl CircuitState {
    /// Add a tree connection and return its TID.
    pub fn add_connection(&mut self, share_name: &str) -> u16 {
        let mut tid = self.next_tid;
        while tid == 0 || tid == 0xFFFF || self.trees.contains_key(&tid) {
            tid = tid.wrapping_add(1);
        }
        self.next_tid = tid.wrapping_add(1);
        self.trees.insert(tid, TreeConnection::new(tid, share_name));
        tid
    }

    /// Add a tree connection built by the caller, replacing any with its TID.
    pub fn insert_connection(&mut self, tree: TreeConnection) {
        if let Some(mut old) = self.trees.insert(tree.tree_id(), tree) {
            old.close_files();
        }
    }

    pub fn find_connection(&self, tid: u16) -> Option<&TreeConnection> {
        self.trees.get(&tid)
    }

    pub fn find_connection_mut(&mut self, tid: u16) -> Option<&mut TreeConnection> {
        self.trees.get_mut(&tid)
    }

    /// Disconnect a tree, closing its files.
    pub fn remove_connection(&mut self, tid: u16) -> bool {
        match self.trees.remove(&tid) {
            Some(mut tree) => {
                tree.close_files();
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.trees.len()
    }

    /// Park a transaction that is waiting for secondary requests.
    pub fn set_pending_transaction(&mut self, tbuf: TransactBuffer) {
        self.pending = Some(tbuf);
    }

    pub fn pending_transaction_mut(&mut self) -> Option<&mut TransactBuffer> {
        self.pending.as_mut()
    }

    pub fn take_pending_transaction(&mut self) -> Option<TransactBuffer> {
        self.pending.take()
    }

    fn close(&mut self) {
        for tree in self.trees.values_mut() {
            tree.close_files();
        }
        self.trees.clear();
        self.pending = None;
    }
}

/// A logged on virtual circuit.
#[derive(Debug)]
pub struct VirtualCircuit {
    uid: u16,
    vc_num: u16,
    user_name: String,
    state: Mutex<CircuitState>,
}

impl VirtualCircuit {
    pub fn new(vc_num: u16, user_name: impl Into<String>) -> Self {
        VirtualCircuit {
            uid: UID_RESERVED_HIGH,
            vc_num,
            user_name: user_name.into(),
            state: Mutex::new(CircuitState::default()),
        }
    }

    /// UID allocated by the circuit list.
    pub fn uid(&self) -> u16 {
        self.uid
    }

    pub fn vc_number(&self) -> u16 {
        self.vc_num
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub async fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().await
    }

    /// Release the circuit's tree connections, pipe files and any parked
    /// transaction.
    pub async fn close(&self, sess: &SmbSession) {
        let mut state = self.state.lock().await;
        debug!(
            session = sess.id(),
            uid = self.uid,
            trees = state.connection_count(),
            "Closing virtual circuit"
        );
        state.close();
    }
}

#[derive(Debug)]
struct CircuitTable {
    circuits: Option<HashMap<u16, Arc<VirtualCircuit>>>,
    next_uid: u16,
}

/// The virtual circuits of one session, keyed by UID.
#[derive(Debug)]
pub struct VirtualCircuitList {
    table: Mutex<CircuitTable>,
    max_circuits: usize,
}

impl VirtualCircuitList {
    /// `max_circuits` is clamped to `1..=MAX_CIRCUITS`.
    pub fn new(max_circuits: usize) -> Self {
        VirtualCircuitList {
            table: Mutex::new(CircuitTable {
                circuits: None,
                next_uid: 1,
            }),
            max_circuits: max_circuits.clamp(1, MAX_CIRCUITS),
        }
    }

    pub fn max_circuits(&self) -> usize {
        self.max_circuits
    }

    /// Add a circuit, returning its newly allocated UID, or `None` when the
    /// list is full.
    pub async fn add_circuit(&self, mut vc: VirtualCircuit) -> Option<u16> {
        let mut guard = self.table.lock().await;
        let table = &mut *guard;
        let circuits = table.circuits.get_or_insert_with(HashMap::new);
        if circuits.len() >= self.max_circuits {
            return None;
        }

        let mut uid = table.next_uid;
        while uid == UID_RESERVED_LOW || uid == UID_RESERVED_HIGH || circuits.contains_key(&uid) {
            uid = uid.wrapping_add(1);
        }
        table.next_uid = uid.wrapping_add(1);

        vc.uid = uid;
        circuits.insert(uid, Arc::new(vc));
        Some(uid)
    }

    pub async fn find_circuit(&self, uid: u16) -> Option<Arc<VirtualCircuit>> {
        let table = self.table.lock().await;
        table.circuits.as_ref()?.get(&uid).cloned()
    }

    /// Close and remove a circuit. Does nothing if the UID is not in use.
    pub async fn remove_circuit(&self, uid: u16, sess: &SmbSession) {
        let mut table = self.table.lock().await;
        let Some(circuits) = table.circuits.as_mut() else {
            return;
        };
        if let Some(vc) = circuits.get(&uid).cloned() {
            vc.close(sess).await;
            circuits.remove(&uid);
        }
    }

    pub async fn enumerate_uids(&self) -> Vec<u16> {
        let table = self.table.lock().await;
        let mut uids: Vec<u16> = table
            .circuits
            .as_ref()
            .map(|c| c.keys().copied().collect())
            .unwrap_or_default();
        uids.sort_unstable();
        uids
    }

    pub async fn circuit_count(&self) -> usize {
        let table = self.table.lock().await;
        table.circuits.as_ref().map_or(0, |c| c.len())
    }

    /// Close every circuit and empty the list.
    pub async fn clear_circuit_list(&self, sess: &SmbSession) {
        let mut table = self.table.lock().await;
        if let Some(circuits) = table.circuits.as_mut() {
            for (_, vc) in circuits.drain() {
                vc.close(sess).await;
            }
        }
    }
}

impl Default for VirtualCircuitList {
    fn default() -> Self {
        Self::new(DEFAULT_CIRCUITS)
    }
}
