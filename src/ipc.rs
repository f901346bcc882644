//! IPC$ share command handling.
//!
//! Only the commands a client uses to talk to named pipes are accepted:
//! NTCreateAndX, OpenAndX or Open to open a pipe, Close, the Read and Write
//! families and Transaction (with its secondaries). Pipe traffic itself is DCE/RPC and is
//! passed on to [`crate::dcerpc::handler`].
//! MS-CIFS Section 3.3.5

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::circuit::CircuitState;
use crate::dcerpc::handler::{
    process_dce_rpc_read, process_pipe_write, process_transact_buffer, process_transact_nmpipe,
};
use crate::dcerpc::pipe::{PipeFile, PipeType};
use crate::server::SmbSession;
use crate::smb::packet::SmbPacket;
use crate::smb::status::SmbStatus;
use crate::smb::transact::{
    init_transact_reply, transact_reply_data_offset, TransactBuffer, SET_NM_PHAND_STATE,
    TRANSACT_NM_PIPE, TRANS_REQUEST_WORDS, TRANS_SECONDARY_WORDS,
};
use crate::smb::{
    utf16le_to_string, word_align, HandlerResult, Reply, SmbCommand, ASCII_STRING, FLG2_UNICODE,
    NO_ANDX_COMMAND, PARAM_WORDS_OFFSET,
};

// Minimum parameter words per request.
const CLOSE_WORDS: usize = 3;
const READ_WORDS: usize = 5;
const READ_ANDX_WORDS: usize = 10;
const WRITE_WORDS: usize = 5;
const WRITE_ANDX_WORDS: usize = 12;
const NT_CREATE_WORDS: usize = 24;
const NT_CREATE_RESPONSE_WORDS: usize = 34;
const OPEN_WORDS: usize = 2;
const OPEN_RESPONSE_WORDS: usize = 7;
const OPEN_ANDX_WORDS: usize = 15;
const OPEN_ANDX_RESPONSE_WORDS: usize = 15;

/// First NTCreateAndX parameter after the AndX header and reserved byte.
const NT_CREATE_PARAMS: usize = PARAM_WORDS_OFFSET + 5;

/// Buffer length needed for an NTCreateAndX response.
const NT_CREATE_RESPONSE_LEN: usize = PARAM_WORDS_OFFSET + NT_CREATE_RESPONSE_WORDS * 2 + 2;

// NTCreateAndX response values for a pipe.
const FILE_OPENED: u32 = 0x0001;
const FILE_ATTRIBUTE_NORMAL: u32 = 0x0080;
const PIPE_ALLOCATION_SIZE: u64 = 4096;
const FILE_TYPE_MESSAGE_MODE_PIPE: u16 = 0x0002;
const PIPE_INSTANCES: u8 = 0xFF;
const PIPE_STATE_BITS: u8 = 0x05;

// Open / OpenAndX response values for a pipe.
const ACCESS_READ_WRITE: u16 = 0x0002;
const OPEN_RESULT_OPENED: u16 = 0x0001;
const PIPE_STATUS: u16 = u16::from_le_bytes([PIPE_INSTANCES, PIPE_STATE_BITS]);

/// Pipe names may arrive with or without this prefix.
const PIPE_PREFIX: &str = "\\PIPE";

/// Parsed NTCreateAndX request.
/// MS-CIFS 2.2.4.64.1
#[derive(Debug)]
pub struct NtCreateRequest {
    pub flags: u32,
    pub root_fid: u32,
    pub desired_access: u32,
    pub allocation_size: u64,
    pub file_attributes: u32,
    pub share_access: u32,
    pub create_disposition: u32,
    pub create_options: u32,
    pub impersonation_level: u32,
    pub security_flags: u8,
    pub name: String,
}

impl NtCreateRequest {
    pub fn parse(pkt: &SmbPacket) -> Option<Self> {
        let end = PARAM_WORDS_OFFSET + NT_CREATE_WORDS * 2;
        let mut prm = pkt.received_slice(NT_CREATE_PARAMS, end - NT_CREATE_PARAMS)?;

        let name_len = prm.get_u16_le() as usize;
        let flags = prm.get_u32_le();
        let root_fid = prm.get_u32_le();
        let desired_access = prm.get_u32_le();
        let allocation_size = prm.get_u64_le();
        let file_attributes = prm.get_u32_le();
        let share_access = prm.get_u32_le();
        let create_disposition = prm.get_u32_le();
        let create_options = prm.get_u32_le();
        let impersonation_level = prm.get_u32_le();
        let security_flags = prm.get_u8();

        let name = if pkt.flags2() & FLG2_UNICODE != 0 {
            read_name(pkt, word_align(pkt.byte_offset()), name_len)?
        } else {
            read_name(pkt, pkt.byte_offset(), name_len)?
        };

        Some(NtCreateRequest {
            flags,
            root_fid,
            desired_access,
            allocation_size,
            file_attributes,
            share_access,
            create_disposition,
            create_options,
            impersonation_level,
            security_flags,
            name,
        })
    }

    /// Full pipe name, `\PIPE` prefix included.
    pub fn pipe_name(&self) -> String {
        full_pipe_name(&self.name)
    }
}

fn full_pipe_name(name: &str) -> String {
    let has_prefix = name
        .get(..PIPE_PREFIX.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(PIPE_PREFIX));
    if has_prefix {
        name.to_string()
    } else {
        format!("{}{}", PIPE_PREFIX, name)
    }
}

/// File name of `len` bytes at `pos`, UTF-16LE when flags2 says so.
fn read_name(pkt: &SmbPacket, pos: usize, len: usize) -> Option<String> {
    let raw = pkt.received_slice(pos, len)?;
    if pkt.flags2() & FLG2_UNICODE != 0 {
        Some(utf16le_to_string(raw))
    } else {
        Some(
            String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_string(),
        )
    }
}

/// File name carried in the data bytes of an Open or OpenAndX request.
/// MS-CIFS 2.2.4.3.1, 2.2.4.41.1
fn open_file_name(pkt: &SmbPacket) -> Option<String> {
    let mut pos = pkt.byte_offset();
    let end = pos + pkt.byte_count();
    if pkt.command() == SmbCommand::OpenFile as u8 {
        if *pkt.received_slice(pos, 1)?.first()? != ASCII_STRING {
            return None;
        }
        pos += 1;
    }
    if pkt.flags2() & FLG2_UNICODE != 0 {
        pos = word_align(pos);
    }
    read_name(pkt, pos, end.checked_sub(pos)?)
}

/// Dispatch a request on the IPC$ share.
pub async fn process_ipc_request(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    let cmd = pkt.command();
    debug!(
        cmd,
        uid = pkt.user_id(),
        tid = pkt.tree_id(),
        mid = pkt.multiplex_id(),
        "IPC$ request"
    );

    let Some(command) = SmbCommand::from_u8(cmd) else {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    };

    match command {
        SmbCommand::NtCreateAndX => proc_nt_create_andx(sess, pkt).await,
        SmbCommand::OpenAndX => proc_open_file(sess, pkt, true).await,
        SmbCommand::OpenFile => proc_open_file(sess, pkt, false).await,
        SmbCommand::CloseFile => proc_close_file(sess, pkt).await,
        SmbCommand::ReadFile => {
            check_valid(pkt, READ_WORDS)?;
            process_dce_rpc_read(sess, pkt).await
        }
        SmbCommand::ReadAndX => {
            check_valid(pkt, READ_ANDX_WORDS)?;
            process_dce_rpc_read(sess, pkt).await
        }
        SmbCommand::WriteFile => {
            check_valid(pkt, WRITE_WORDS)?;
            process_pipe_write(sess, pkt).await
        }
        SmbCommand::WriteAndX => {
            check_valid(pkt, WRITE_ANDX_WORDS)?;
            process_pipe_write(sess, pkt).await
        }
        SmbCommand::Transaction => proc_transaction(sess, pkt).await,
        SmbCommand::TransactionSecondary => proc_transaction_secondary(sess, pkt).await,
    }
}

fn check_valid(pkt: &SmbPacket, words: usize) -> Result<(), SmbStatus> {
    if pkt.check_packet_is_valid(words, 0) {
        Ok(())
    } else {
        Err(SmbStatus::SrvUnrecognizedCommand)
    }
}

/// Open a named pipe.
async fn proc_nt_create_andx(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    check_valid(pkt, NT_CREATE_WORDS)?;

    let tid = pkt.tree_id();
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::NtInvalidParameter)?;
    let mut state = vc.lock().await;
    if state.find_connection(tid).is_none() {
        return Err(SmbStatus::NtInvalidParameter);
    }

    let req = NtCreateRequest::parse(pkt).ok_or(SmbStatus::NtInvalidParameter)?;
    let pipe_name = req.pipe_name();

    debug!(
        tid,
        name = %pipe_name,
        flags = req.flags,
        access = req.desired_access,
        disposition = req.create_disposition,
        "NTCreateAndX"
    );

    let pipe_type = PipeType::from_name(&pipe_name).ok_or(SmbStatus::NtObjectNotFound)?;
    let handler = sess
        .pipe_handlers()
        .handler_for(pipe_type)
        .ok_or(SmbStatus::NtAccessDenied)?;

    let resp = sess.reply_packet(pkt, NT_CREATE_RESPONSE_LEN).await?;

    let fid = state
        .find_connection_mut(tid)
        .ok_or(SmbStatus::NtInvalidParameter)?
        .add_file(PipeFile::new(pipe_type, Some(handler)))
        .map_err(|_| SmbStatus::NtTooManyOpenedFiles)?;

    resp.set_parameter_count(NT_CREATE_RESPONSE_WORDS);
    {
        let end = PARAM_WORDS_OFFSET + NT_CREATE_RESPONSE_WORDS * 2;
        let mut out = &mut resp.buffer_mut()[PARAM_WORDS_OFFSET + 4..end];
        out.put_u8(0); // oplock level
        out.put_u16_le(fid);
        out.put_u32_le(FILE_OPENED);
        out.put_u64_le(0); // creation time
        out.put_u64_le(0); // last access time
        out.put_u64_le(0); // last write time
        out.put_u64_le(0); // change time
        out.put_u32_le(FILE_ATTRIBUTE_NORMAL);
        out.put_u64_le(PIPE_ALLOCATION_SIZE);
        out.put_u64_le(0); // end of file
        out.put_u16_le(FILE_TYPE_MESSAGE_MODE_PIPE);
        out.put_u8(PIPE_INSTANCES);
        out.put_u8(PIPE_STATE_BITS);
        out.put_u8(0); // directory
    }
    resp.set_byte_count(0);
    resp.set_andx_command(NO_ANDX_COMMAND);
    let len = resp.length() as u16;
    resp.set_parameter(1, len);
    resp.set_response_status(SmbStatus::Success);

    debug!(tid, fid, pipe = %pipe_type, "Pipe opened");
    Ok(Reply::Send)
}

/// Open a named pipe with OpenAndX or the older Open request.
///
/// Errors come back in DOS form: unknown pipe is file-not-found and a pipe
/// with no request handler is no-access.
async fn proc_open_file(sess: &SmbSession, pkt: &mut SmbPacket, andx: bool) -> HandlerResult {
    let (words, resp_words) = if andx {
        (OPEN_ANDX_WORDS, OPEN_ANDX_RESPONSE_WORDS)
    } else {
        (OPEN_WORDS, OPEN_RESPONSE_WORDS)
    };
    check_valid(pkt, words)?;

    let tid = pkt.tree_id();
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::SrvInvalidTid)?;
    let mut state = vc.lock().await;
    if state.find_connection(tid).is_none() {
        return Err(SmbStatus::SrvInvalidTid);
    }

    let name = open_file_name(pkt).ok_or(SmbStatus::DosInvalidData)?;
    let pipe_name = full_pipe_name(&name);
    debug!(tid, name = %pipe_name, andx, "Open pipe");

    let pipe_type = PipeType::from_name(&pipe_name).ok_or(SmbStatus::DosFileNotFound)?;
    let handler = sess
        .pipe_handlers()
        .handler_for(pipe_type)
        .ok_or(SmbStatus::SrvNoAccessRights)?;

    let resp_len = PARAM_WORDS_OFFSET + resp_words * 2 + 2;
    let resp = sess.reply_packet(pkt, resp_len).await?;

    let fid = state
        .find_connection_mut(tid)
        .ok_or(SmbStatus::SrvInvalidTid)?
        .add_file(PipeFile::new(pipe_type, Some(handler)))
        .map_err(|_| SmbStatus::DosTooManyOpenFiles)?;

    if andx {
        resp.init_andx_response(OPEN_ANDX_RESPONSE_WORDS);
        resp.set_parameter(2, fid);
        resp.set_parameter(8, ACCESS_READ_WRITE);
        resp.set_parameter(9, FILE_TYPE_MESSAGE_MODE_PIPE);
        resp.set_parameter(10, PIPE_STATUS);
        resp.set_parameter(11, OPEN_RESULT_OPENED);
        resp.set_byte_count(0);
        let len = resp.length() as u16;
        resp.set_parameter(1, len);
    } else {
        resp.set_parameter_count(OPEN_RESPONSE_WORDS);
        resp.clear_parameters(0, OPEN_RESPONSE_WORDS);
        resp.set_parameter(0, fid);
        resp.set_parameter(6, ACCESS_READ_WRITE);
        resp.set_byte_count(0);
    }
    resp.set_response_status(SmbStatus::Success);

    debug!(tid, fid, pipe = %pipe_type, "Pipe opened");
    Ok(Reply::Send)
}

/// Close a pipe file.
async fn proc_close_file(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    check_valid(pkt, CLOSE_WORDS)?;

    let tid = pkt.tree_id();
    let fid = pkt.parameter(0);
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    state
        .find_connection_mut(tid)
        .ok_or(SmbStatus::DosInvalidDrive)?
        .remove_file(fid)
        .ok_or(SmbStatus::DosInvalidHandle)?;

    debug!(tid, fid, "Pipe closed");

    pkt.set_parameter_count(0);
    pkt.set_byte_count(0);
    pkt.set_response_status(SmbStatus::Success);
    Ok(Reply::Send)
}

/// Primary Transaction request. A request whose blocks did not all fit is
/// parked on the circuit until its secondaries arrive.
async fn proc_transaction(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    check_valid(pkt, TRANS_REQUEST_WORDS)?;
    let tbuf = TransactBuffer::from_packet(pkt)?;

    debug!(
        name = tbuf.name(),
        function = tbuf.function(),
        fid = tbuf.fid(),
        complete = tbuf.is_complete(),
        "IPC$ transaction"
    );

    if tbuf.is_complete() && tbuf.function() == TRANSACT_NM_PIPE {
        return process_transact_nmpipe(sess, pkt).await;
    }

    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    if !tbuf.is_complete() {
        state.set_pending_transaction(tbuf);

        // Interim response, the client sends the rest
        pkt.set_parameter_count(0);
        pkt.set_byte_count(0);
        pkt.set_response_status(SmbStatus::Success);
        return Ok(Reply::Send);
    }

    proc_transaction_buffer(sess, &mut state, &tbuf, pkt).await
}

/// TransactionSecondary request adding to the parked transaction.
async fn proc_transaction_secondary(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    check_valid(pkt, TRANS_SECONDARY_WORDS)?;

    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    let appended = state
        .pending_transaction_mut()
        .ok_or(SmbStatus::SrvUnrecognizedCommand)?
        .append_secondary(pkt);
    if let Err(status) = appended {
        state.take_pending_transaction();
        return Err(status);
    }

    if !state.pending_transaction_mut().is_some_and(|t| t.is_complete()) {
        return Ok(Reply::Silent);
    }
    let Some(tbuf) = state.take_pending_transaction() else {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    };

    debug!(
        name = tbuf.name(),
        function = tbuf.function(),
        fid = tbuf.fid(),
        len = tbuf.data().len(),
        "IPC$ transaction complete"
    );
    proc_transaction_buffer(sess, &mut state, &tbuf, pkt).await
}

async fn proc_transaction_buffer(
    sess: &SmbSession,
    state: &mut CircuitState,
    tbuf: &TransactBuffer,
    pkt: &mut SmbPacket,
) -> HandlerResult {
    match tbuf.function() {
        TRANSACT_NM_PIPE => process_transact_buffer(sess, state, tbuf, pkt).await,
        SET_NM_PHAND_STATE => proc_set_named_pipe_handle_state(sess, state, tbuf, pkt).await,
        _ => Err(SmbStatus::SrvUnrecognizedCommand),
    }
}

/// Store the pipe state word on the pipe file.
async fn proc_set_named_pipe_handle_state(
    sess: &SmbSession,
    state: &mut CircuitState,
    tbuf: &TransactBuffer,
    pkt: &mut SmbPacket,
) -> HandlerResult {
    let fid = tbuf.fid();
    let pipe = state
        .find_connection_mut(tbuf.tree_id())
        .ok_or(SmbStatus::DosInvalidDrive)?
        .find_file_mut(fid)
        .ok_or(SmbStatus::DosInvalidHandle)?;

    let mut prm = tbuf.params();
    if prm.remaining() < 2 {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }
    let pipe_state = prm.get_u16_le();

    debug!(pipe = pipe.name(), fid, pipe_state, "SetNmPHandState");
    pipe.set_pipe_state(pipe_state);

    let resp = sess.reply_packet(pkt, transact_reply_data_offset()).await?;
    resp.set_command(SmbCommand::Transaction as u8);
    init_transact_reply(resp, 0, 0);
    resp.set_response_status(SmbStatus::Success);
    Ok(Reply::Send)
}
