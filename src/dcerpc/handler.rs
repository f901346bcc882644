//! DCE/RPC over SMB named pipes.
//!
//! PDUs reach a pipe three ways: inside a TransactNmPipe transaction, inside
//! a transaction reassembled from secondary requests, or as a plain Write /
//! WriteAndX. Each is decoded and run through [`process_dce_buffer`], which
//! leaves any reply PDU buffered on the pipe. Transactions return that reply
//! in the response; writes leave it for the client to fetch with Read /
//! ReadAndX.

use tracing::{debug, warn};

use crate::circuit::CircuitState;
use crate::dcerpc::buffer::{DceBuffer, DceReader};
use crate::dcerpc::pipe::PipeFile;
use crate::dcerpc::{PduType, BIND_ACK_GROUP_ID, FLG_ONLY_FRAG};
use crate::server::SmbSession;
use crate::smb::packet::SmbPacket;
use crate::smb::status::SmbStatus;
use crate::smb::transact::{
    init_transact_reply, max_transact_reply_data, transact_reply_data_offset, TransactBuffer,
    TRANS_DATA_COUNT, TRANS_DATA_OFFSET, TRANS_MAX_DATA, TRANS_SETUP_FID,
};
use crate::smb::{
    longword_align, HandlerResult, Reply, SmbCommand, DATA_BLOCK, MAX_BYTE_COUNT,
    NETBIOS_HEADER_LEN, PARAM_WORDS_OFFSET,
};

// Read / ReadAndX response word counts.
const READ_RESPONSE_WORDS: usize = 5;
const READ_ANDX_RESPONSE_WORDS: usize = 12;

// Write / WriteAndX response word counts.
const WRITE_RESPONSE_WORDS: usize = 1;
const WRITE_ANDX_RESPONSE_WORDS: usize = 6;

// Offset of the BIND abstract syntax, after the fixed fields and the first
// presentation context header.
const BIND_CONTEXT_ELEMS: usize = 24;

fn find_pipe(state: &mut CircuitState, tid: u16, fid: u16) -> Result<&mut PipeFile, SmbStatus> {
    state
        .find_connection_mut(tid)
        .ok_or(SmbStatus::DosInvalidDrive)?
        .find_file_mut(fid)
        .ok_or(SmbStatus::DosInvalidHandle)
}

/// Run one inbound PDU against a pipe.
pub fn process_dce_buffer(
    sess: &SmbSession,
    dce: &DceReader<'_>,
    pipe: &mut PipeFile,
) -> Result<(), SmbStatus> {
    let pdu_type = dce.pdu_type();
    debug!(
        session = sess.id(),
        pipe = pipe.name(),
        pdu_type,
        call_id = dce.call_id(),
        frag_len = dce.fragment_length(),
        "DCE/RPC PDU"
    );

    match PduType::from_u8(pdu_type) {
        Some(PduType::Bind) => proc_dce_bind(sess, dce, pipe),
        Some(PduType::Request) => proc_dce_request(sess, dce, pipe),
        _ => Err(SmbStatus::SrvNoAccessRights),
    }
}

/// Accept a BIND and queue the BIND_ACK.
pub fn proc_dce_bind(
    sess: &SmbSession,
    dce: &DceReader<'_>,
    pipe: &mut PipeFile,
) -> Result<(), SmbStatus> {
    let mut rdr = dce.clone();
    let not_supported = |_| SmbStatus::SrvNotSupported;

    let max_tx = rdr.get_u16().map_err(not_supported)?;
    let max_rx = rdr.get_u16().map_err(not_supported)?;
    let group = rdr.get_u32().map_err(not_supported)?;

    rdr.set_position(BIND_CONTEXT_ELEMS);
    let ctx_elems = rdr.get_u8().map_err(not_supported)?;
    rdr.align(4);
    let pres_ctx = rdr.get_u8().map_err(not_supported)?;
    rdr.align(2);
    let trans_count = rdr.get_u8().map_err(not_supported)?;
    rdr.align(2);

    let abstract_syntax = rdr.get_syntax().map_err(not_supported)?;
    let transfer_syntax = rdr.get_syntax().map_err(not_supported)?;

    debug!(
        session = sess.id(),
        pipe = pipe.name(),
        max_tx,
        max_rx,
        group,
        ctx_elems,
        pres_ctx,
        trans_count,
        abstract_syntax = %abstract_syntax.uuid,
        transfer_syntax = %transfer_syntax.uuid,
        "DCE/RPC bind"
    );

    pipe.set_max_fragment_sizes(max_tx, max_rx);

    let srv_name = pipe.pipe_type().server_pipe_name();
    let mut ack = DceBuffer::new();
    ack.put_bind_ack_header(dce.call_id());
    ack.put_u16(max_tx);
    ack.put_u16(max_rx);
    ack.put_u32(BIND_ACK_GROUP_ID);
    ack.put_u16((srv_name.len() + 1) as u16);
    ack.put_ascii_string(srv_name, true);
    ack.align(4);
    ack.put_u32(1); // result count
    ack.put_u16(0); // result: acceptance
    ack.put_u16(0); // reason
    ack.put_syntax(&transfer_syntax);
    ack.update_frag_len().map_err(not_supported)?;

    pipe.set_buffered_data(ack);
    Ok(())
}

/// Hand a REQUEST to the pipe's request handler.
pub fn proc_dce_request(
    sess: &SmbSession,
    dce: &DceReader<'_>,
    pipe: &mut PipeFile,
) -> Result<(), SmbStatus> {
    let opnum = dce.opnum().map_err(|_| SmbStatus::SrvNotSupported)?;
    debug!(
        session = sess.id(),
        pipe = pipe.name(),
        opnum,
        call_id = dce.call_id(),
        "DCE/RPC request"
    );

    let handler = pipe
        .request_handler()
        .cloned()
        .ok_or(SmbStatus::SrvNoAccessRights)?;
    handler.process_request(opnum, dce, pipe)
}

/// Return the unread part of the pipe's buffered reply in a Transaction
/// response.
///
/// The reply goes out as a single fragment. When more than `max_data` bytes
/// are unread only `max_data` bytes are returned with a buffer overflow
/// status and the rest stays on the pipe for the client to read.
async fn send_transact_reply(
    sess: &SmbSession,
    pkt: &mut SmbPacket,
    pipe: &mut PipeFile,
    max_data: usize,
) -> HandlerResult {
    let Some(tx) = pipe.buffered_data_mut() else {
        return Ok(Reply::Silent);
    };

    // The header is fixed once the client has read any of the reply
    if tx.read_position() == 0 {
        tx.set_flags(FLG_ONLY_FRAG);
        if let Err(e) = tx.update_frag_len() {
            warn!(error = %e, "Dropping DCE/RPC reply");
            pipe.clear_buffered_data();
            return Err(SmbStatus::SrvNotSupported);
        }
    }

    let total = tx.length();
    let avail = tx.available_length();
    let limit = max_data.min(max_transact_reply_data());
    let (len, status) = if avail > limit {
        (limit, SmbStatus::BufferOverflow)
    } else {
        (avail, SmbStatus::Success)
    };

    debug!(pdu_type = tx.pdu_type(), len, avail, total, ?status, "DCE/RPC reply");

    let resp = sess
        .reply_packet(pkt, transact_reply_data_offset() + len)
        .await?;
    resp.set_command(SmbCommand::Transaction as u8);
    let pos = init_transact_reply(resp, len, len)?;
    tx.copy_data(&mut resp.buffer_mut()[pos..pos + len], len)
        .map_err(|_| SmbStatus::SrvNotSupported)?;
    resp.set_response_status(status);

    if status == SmbStatus::Success {
        pipe.clear_buffered_data();
    }
    Ok(Reply::Send)
}

/// TransactNmPipe carried whole in one Transaction request.
pub async fn process_transact_nmpipe(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    let fid = pkt.parameter(TRANS_SETUP_FID);
    let pipe = find_pipe(&mut state, pkt.tree_id(), fid)?;
    let max_data = pkt.parameter(TRANS_MAX_DATA) as usize;

    {
        let off = pkt.parameter(TRANS_DATA_OFFSET) as usize + NETBIOS_HEADER_LEN;
        let len = pkt.parameter(TRANS_DATA_COUNT) as usize;
        let data = pkt
            .received_slice(off, len)
            .ok_or(SmbStatus::SrvNotSupported)?;
        let dce = DceReader::new(data).map_err(|_| SmbStatus::SrvNotSupported)?;

        debug!(pipe = pipe.name(), fid, pdu_type = dce.pdu_type(), "TransactNmPipe");
        process_dce_buffer(sess, &dce, pipe)?;
    }

    send_transact_reply(sess, pkt, pipe, max_data).await
}

/// TransactNmPipe reassembled from a Transaction and its secondaries. The
/// caller holds the circuit lock the transaction was parked under.
pub async fn process_transact_buffer(
    sess: &SmbSession,
    state: &mut CircuitState,
    tbuf: &TransactBuffer,
    pkt: &mut SmbPacket,
) -> HandlerResult {
    if tbuf.data().is_empty() {
        return Err(SmbStatus::SrvUnrecognizedCommand);
    }

    let pipe = find_pipe(state, tbuf.tree_id(), tbuf.fid())?;
    let dce = DceReader::new(tbuf.data()).map_err(|_| SmbStatus::SrvNotSupported)?;

    debug!(
        pipe = pipe.name(),
        fid = tbuf.fid(),
        pdu_type = dce.pdu_type(),
        "TransactNmPipe (reassembled)"
    );
    process_dce_buffer(sess, &dce, pipe)?;

    send_transact_reply(sess, pkt, pipe, tbuf.return_data_limit()).await
}

/// Write / WriteAndX of a PDU to a pipe.
pub async fn process_pipe_write(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    let is_write = pkt.command() == SmbCommand::WriteFile as u8;
    let fid = if is_write {
        pkt.parameter(0)
    } else {
        pkt.parameter(2)
    };
    let pipe = find_pipe(&mut state, pkt.tree_id(), fid)?;

    let (pos, len) = if is_write {
        let pos = pkt.byte_offset();
        let hdr = pkt.received_slice(pos, 3).ok_or(SmbStatus::DosInvalidData)?;
        if hdr[0] != DATA_BLOCK {
            return Err(SmbStatus::DosInvalidData);
        }
        (pos + 3, u16::from_le_bytes([hdr[1], hdr[2]]) as usize)
    } else {
        (
            pkt.parameter(11) as usize + NETBIOS_HEADER_LEN,
            pkt.parameter(10) as usize,
        )
    };

    {
        let data = pkt
            .received_slice(pos, len)
            .ok_or(SmbStatus::DosInvalidData)?;
        let dce = DceReader::new(data).map_err(|_| SmbStatus::SrvNotSupported)?;

        debug!(pipe = pipe.name(), fid, len, pdu_type = dce.pdu_type(), "Pipe write");
        process_dce_buffer(sess, &dce, pipe)?;
    }

    let buffered = pipe.buffered_data().map_or(0, |b| b.length());

    if is_write {
        pkt.set_parameter_count(WRITE_RESPONSE_WORDS);
        pkt.set_parameter(0, len as u16);
    } else {
        pkt.init_andx_response(WRITE_ANDX_RESPONSE_WORDS);
        pkt.set_parameter(2, len as u16);
        pkt.set_parameter(3, buffered.min(u16::MAX as usize) as u16);
    }
    pkt.set_byte_count(0);
    pkt.set_response_status(SmbStatus::Success);
    Ok(Reply::Send)
}

/// Read / ReadAndX of buffered reply data from a pipe.
pub async fn process_dce_rpc_read(sess: &SmbSession, pkt: &mut SmbPacket) -> HandlerResult {
    let vc = sess
        .find_circuit(pkt.user_id())
        .await
        .ok_or(SmbStatus::DosInvalidDrive)?;
    let mut state = vc.lock().await;

    let is_read = pkt.command() == SmbCommand::ReadFile as u8;
    let (fid, want) = if is_read {
        (pkt.parameter(0), pkt.parameter(1) as usize)
    } else {
        (pkt.parameter(2), pkt.parameter(5) as usize)
    };
    let pipe = find_pipe(&mut state, pkt.tree_id(), fid)?;

    // Data position is fixed by the response word count.
    let words = if is_read {
        READ_RESPONSE_WORDS
    } else {
        READ_ANDX_RESPONSE_WORDS
    };
    let byte_off = PARAM_WORDS_OFFSET + words * 2 + 2;
    let data_pos = if is_read {
        byte_off + 3
    } else {
        longword_align(byte_off)
    };

    let avail = pipe.buffered_data().map_or(0, |b| b.available_length());
    let len = want.min(avail).min(MAX_BYTE_COUNT - (data_pos - byte_off));

    debug!(pipe = pipe.name(), fid, want, avail, "Pipe read");

    let resp = sess.reply_packet(pkt, data_pos + len).await?;

    if is_read {
        resp.set_parameter_count(READ_RESPONSE_WORDS);
        resp.clear_parameters(0, READ_RESPONSE_WORDS);
        resp.set_parameter(0, len as u16);
        if len > 0 {
            resp.set_byte_count(len + 3);
            let hdr = data_pos - 3;
            resp.buffer_mut()[hdr] = DATA_BLOCK;
            resp.buffer_mut()[hdr + 1..data_pos].copy_from_slice(&(len as u16).to_le_bytes());
        } else {
            resp.set_byte_count(0);
        }
    } else {
        resp.init_andx_response(READ_ANDX_RESPONSE_WORDS);
        if len > 0 {
            resp.set_parameter(5, len as u16);
            resp.set_parameter(6, (data_pos - NETBIOS_HEADER_LEN) as u16);
            resp.set_byte_count(data_pos + len - byte_off);
        } else {
            resp.set_byte_count(0);
        }
    }

    if len > 0 {
        if let Some(buf) = pipe.buffered_data_mut() {
            buf.copy_data(&mut resp.buffer_mut()[data_pos..data_pos + len], len)
                .map_err(|_| SmbStatus::SrvNotSupported)?;
            if buf.is_drained() {
                pipe.clear_buffered_data();
            }
        }
    }

    resp.set_response_status(SmbStatus::Success);
    Ok(Reply::Send)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcerpc::buffer::SyntaxId;
    use crate::dcerpc::pipe::PipeType;
    use crate::dcerpc::OPERATION_DATA;
    use crate::smb::status::ERR_DOS;
    use crate::smb::NO_ANDX_COMMAND;
    use crate::test_support::{self, PipeSetup};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    fn u1() -> Uuid {
        Uuid::parse_str("4b324fc8-1670-01d3-1278-5a47bf6ee188").unwrap()
    }

    fn u2() -> Uuid {
        Uuid::parse_str("8a885d04-1ceb-11c9-9fe8-08002b104860").unwrap()
    }

    async fn pipe_buffered_len(setup: &PipeSetup) -> Option<usize> {
        let vc = setup.sess.find_circuit(setup.uid).await.unwrap();
        let mut state = vc.lock().await;
        let pipe = find_pipe(&mut state, setup.tid, setup.fid).unwrap();
        pipe.buffered_data().map(|b| b.available_length())
    }

    #[tokio::test]
    async fn test_bind_via_transact_echoes_transfer_syntax() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let bind = test_support::bind_pdu(3, 4280, 4280, u1(), u2());
        let mut pkt =
            test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &bind, 4280);

        let reply = process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();
        assert_eq!(reply, Reply::Send);

        let resp = pkt.associated().unwrap_or(&pkt);
        assert_eq!(resp.long_error_code(), 0);
        let pos = transact_reply_data_offset();
        let len = resp.parameter(6) as usize;
        let ack = &resp.buffer()[pos..pos + len];

        assert_eq!(ack[2], PduType::BindAck as u8);
        assert_eq!(ack[3], FLG_ONLY_FRAG);
        assert_eq!(u16::from_le_bytes([ack[8], ack[9]]) as usize, len);
        assert_eq!(&ack[12..16], &3u32.to_le_bytes());
        assert_eq!(u16::from_le_bytes([ack[16], ack[17]]), 4280);
        assert_eq!(u16::from_le_bytes([ack[18], ack[19]]), 4280);
        assert_eq!(&ack[20..24], &BIND_ACK_GROUP_ID.to_le_bytes());

        // "\PIPE\ntsvcs" plus terminator, then pad to 40
        assert_eq!(u16::from_le_bytes([ack[24], ack[25]]), 13);
        assert_eq!(&ack[26..38], b"\\PIPE\\ntsvcs");
        assert_eq!(&ack[40..44], &1u32.to_le_bytes());

        let mut rdr = DceReader::new(ack).unwrap();
        rdr.set_position(48);
        assert_eq!(
            rdr.get_syntax().unwrap(),
            SyntaxId {
                uuid: u2(),
                major: 2,
                minor: 0
            }
        );
        assert_eq!(len, 68);

        assert_eq!(pipe_buffered_len(&setup).await, None);
    }

    #[tokio::test]
    async fn test_bind_records_fragment_sizes() {
        let setup = test_support::open_pipe(PipeType::Winreg).await;
        let bind = test_support::bind_pdu(1, 1024, 2048, u1(), u2());
        let mut pkt = test_support::write_andx(setup.uid, setup.tid, setup.fid, &bind);

        process_pipe_write(&setup.sess, &mut pkt).await.unwrap();

        let vc = setup.sess.find_circuit(setup.uid).await.unwrap();
        let mut state = vc.lock().await;
        let pipe = find_pipe(&mut state, setup.tid, setup.fid).unwrap();
        assert_eq!(pipe.max_transmit_fragment(), 1024);
        assert_eq!(pipe.max_receive_fragment(), 2048);
        assert!(pipe.has_buffered_data());
    }

    #[tokio::test]
    async fn test_reply_larger_than_max_data_overflows() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let stub = vec![0x5Au8; 300];
        let req = test_support::request_pdu(7, 15, &stub);
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &req, 100);

        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();

        let resp = pkt.associated().unwrap_or(&pkt);
        assert_eq!(resp.long_error_code(), SmbStatus::BufferOverflow.nt_status());
        assert_eq!(resp.parameter(6), 100);
        let pos = transact_reply_data_offset();
        let data = &resp.buffer()[pos..pos + 100];
        assert_eq!(data[2], PduType::Response as u8);
        assert_eq!(
            u16::from_le_bytes([data[8], data[9]]) as usize,
            OPERATION_DATA + 300
        );

        // Rest stays on the pipe until read
        assert_eq!(
            pipe_buffered_len(&setup).await,
            Some(OPERATION_DATA + 300 - 100)
        );

        let mut rd = test_support::read_andx(setup.uid, setup.tid, setup.fid, 4096);
        process_dce_rpc_read(&setup.sess, &mut rd).await.unwrap();
        let resp = rd.associated().unwrap_or(&rd);
        assert_eq!(resp.parameter(5) as usize, OPERATION_DATA + 200);
        let off = resp.parameter(6) as usize + NETBIOS_HEADER_LEN;
        assert!(resp.buffer()[off..off + 200].iter().all(|&b| b == 0x5A));
        assert_eq!(pipe_buffered_len(&setup).await, None);
    }

    #[tokio::test]
    async fn test_reply_fits_in_request_buffer() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(7, 0, b"");
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &req, 1024);
        assert!(pkt.buffer_len() >= transact_reply_data_offset() + OPERATION_DATA);

        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();
        assert!(!pkt.has_associated());
        assert_eq!(pkt.parameter(6) as usize, OPERATION_DATA);
        assert!(pkt.is_response());
    }

    #[tokio::test]
    async fn test_small_request_gets_associated_reply() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(3, test_support::OPNUM_BIG_REPLY, b"");
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &req, 4096);
        let req_len = pkt.buffer_len();

        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();

        let resp = pkt.associated().unwrap();
        let len = resp.parameter(6) as usize;
        assert_eq!(len, OPERATION_DATA + test_support::BIG_REPLY_LEN);
        assert!(req_len < transact_reply_data_offset() + len);
        assert!(resp.is_pooled());
        assert_eq!(resp.multiplex_id(), pkt.multiplex_id());
        assert_eq!(resp.user_id(), setup.uid);
        assert_eq!(resp.long_error_code(), 0);
    }

    #[tokio::test]
    async fn test_request_without_handler_is_rejected() {
        let setup = test_support::open_pipe_without_handler(PipeType::Samr).await;
        let req = test_support::request_pdu(1, 0, b"");
        let mut pkt = test_support::write_file(setup.uid, setup.tid, setup.fid, &req);
        assert_eq!(
            process_pipe_write(&setup.sess, &mut pkt).await.unwrap_err(),
            SmbStatus::SrvNoAccessRights
        );
    }

    #[tokio::test]
    async fn test_unsupported_pdu_type_is_rejected() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let mut pdu = test_support::request_pdu(1, 0, b"");
        pdu[2] = PduType::AlterContext as u8;
        let mut pkt = test_support::write_file(setup.uid, setup.tid, setup.fid, &pdu);
        assert_eq!(
            process_pipe_write(&setup.sess, &mut pkt).await.unwrap_err(),
            SmbStatus::SrvNoAccessRights
        );
    }

    #[tokio::test]
    async fn test_write_unknown_fid_is_invalid_handle() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(1, 0, b"");
        let mut pkt = test_support::write_andx(setup.uid, setup.tid, setup.fid + 1, &req);
        let status = process_pipe_write(&setup.sess, &mut pkt).await.unwrap_err();
        assert_eq!(status, SmbStatus::DosInvalidHandle);

        pkt.set_error_response(status);
        assert_eq!(pkt.error_class(), ERR_DOS);
        assert_eq!(pkt.error_code(), 6);
    }

    #[tokio::test]
    async fn test_unknown_tree_is_invalid_drive() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let mut pkt = test_support::read_file(setup.uid, setup.tid + 1, setup.fid, 100);
        assert_eq!(
            process_dce_rpc_read(&setup.sess, &mut pkt).await.unwrap_err(),
            SmbStatus::DosInvalidDrive
        );
    }

    #[tokio::test]
    async fn test_write_bad_data_block_is_invalid_data() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(1, 0, b"");
        let mut pkt = test_support::write_file(setup.uid, setup.tid, setup.fid, &req);
        let pos = pkt.byte_offset();
        pkt.buffer_mut()[pos] = 0x05;
        assert_eq!(
            process_pipe_write(&setup.sess, &mut pkt).await.unwrap_err(),
            SmbStatus::DosInvalidData
        );
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(4, 2, b"hello");
        let mut pkt = test_support::write_file(setup.uid, setup.tid, setup.fid, &req);

        process_pipe_write(&setup.sess, &mut pkt).await.unwrap();
        assert_eq!(pkt.parameter_count(), 1);
        assert_eq!(pkt.parameter(0) as usize, req.len());

        let mut rd = test_support::read_file(setup.uid, setup.tid, setup.fid, 10);
        process_dce_rpc_read(&setup.sess, &mut rd).await.unwrap();
        let resp = rd.associated().unwrap_or(&rd);
        assert_eq!(resp.parameter_count(), 5);
        assert_eq!(resp.parameter(0), 10);
        assert_eq!(resp.byte_count(), 13);
        let off = resp.byte_offset();
        assert_eq!(resp.buffer()[off], DATA_BLOCK);
        assert_eq!(&resp.buffer()[off + 1..off + 3], &10u16.to_le_bytes());
        assert_eq!(resp.buffer()[off + 3 + 2], PduType::Response as u8);

        // 29 byte reply, 19 left after the first read
        assert_eq!(pipe_buffered_len(&setup).await, Some(19));
    }

    #[tokio::test]
    async fn test_write_andx_reports_buffered_length() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(4, 2, b"hello");
        let mut pkt = test_support::write_andx(setup.uid, setup.tid, setup.fid, &req);

        process_pipe_write(&setup.sess, &mut pkt).await.unwrap();
        assert_eq!(pkt.parameter_count(), 6);
        assert_eq!(pkt.parameter(0) & 0xFF, NO_ANDX_COMMAND as u16);
        assert_eq!(pkt.parameter(2) as usize, req.len());
        assert_eq!(pkt.parameter(3) as usize, OPERATION_DATA + 5);
    }

    #[tokio::test]
    async fn test_read_with_nothing_buffered() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let mut rd = test_support::read_andx(setup.uid, setup.tid, setup.fid, 100);
        process_dce_rpc_read(&setup.sess, &mut rd).await.unwrap();
        let resp = rd.associated().unwrap_or(&rd);
        assert_eq!(resp.parameter_count(), 12);
        assert_eq!(resp.parameter(5), 0);
        assert_eq!(resp.byte_count(), 0);
        assert_eq!(resp.long_error_code(), 0);
    }

    #[tokio::test]
    async fn test_transact_without_reply_is_silent() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(1, test_support::OPNUM_NO_REPLY, b"");
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &req, 1024);
        assert_eq!(
            process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap(),
            Reply::Silent
        );
    }

    #[tokio::test]
    async fn test_transact_returns_rest_of_partly_read_reply() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(4, 2, b"hello");
        let mut wr = test_support::write_file(setup.uid, setup.tid, setup.fid, &req);
        process_pipe_write(&setup.sess, &mut wr).await.unwrap();

        let mut rd = test_support::read_file(setup.uid, setup.tid, setup.fid, 10);
        process_dce_rpc_read(&setup.sess, &mut rd).await.unwrap();
        let mut whole = {
            let resp = rd.associated().unwrap_or(&rd);
            let off = resp.byte_offset() + 3;
            resp.buffer()[off..off + 10].to_vec()
        };

        // Queues nothing new, the transaction picks up the unread 19 bytes
        let noop = test_support::request_pdu(5, test_support::OPNUM_NO_REPLY, b"");
        let mut pkt =
            test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &noop, 1024);
        assert_eq!(
            process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap(),
            Reply::Send
        );

        let resp = pkt.associated().unwrap_or(&pkt);
        assert_eq!(resp.long_error_code(), 0);
        assert_eq!(resp.parameter(6), 19);
        let pos = transact_reply_data_offset();
        whole.extend_from_slice(&resp.buffer()[pos..pos + 19]);

        assert_eq!(whole[2], PduType::Response as u8);
        assert_eq!(u16::from_le_bytes([whole[8], whole[9]]), 29);
        assert_eq!(&whole[OPERATION_DATA..], b"hello");
        assert_eq!(pipe_buffered_len(&setup).await, None);
    }

    #[tokio::test]
    async fn test_partly_read_reply_still_overflows() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let req = test_support::request_pdu(4, 2, b"hello");
        let mut wr = test_support::write_andx(setup.uid, setup.tid, setup.fid, &req);
        process_pipe_write(&setup.sess, &mut wr).await.unwrap();

        let mut rd = test_support::read_andx(setup.uid, setup.tid, setup.fid, 10);
        process_dce_rpc_read(&setup.sess, &mut rd).await.unwrap();

        let noop = test_support::request_pdu(5, test_support::OPNUM_NO_REPLY, b"");
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &noop, 8);
        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();

        let resp = pkt.associated().unwrap_or(&pkt);
        assert_eq!(resp.long_error_code(), SmbStatus::BufferOverflow.nt_status());
        assert_eq!(resp.parameter(6), 8);
        assert_eq!(pipe_buffered_len(&setup).await, Some(11));
    }

    async fn buffer_reply(setup: &PipeSetup, len: usize) {
        let vc = setup.sess.find_circuit(setup.uid).await.unwrap();
        let mut state = vc.lock().await;
        let pipe = find_pipe(&mut state, setup.tid, setup.fid).unwrap();
        let mut reply = DceBuffer::with_capacity(len);
        reply.put_response_header(9, 0);
        reply.put_bytes(&vec![0x11; len - OPERATION_DATA]);
        pipe.set_buffered_data(reply);
    }

    #[tokio::test]
    async fn test_reply_limited_by_transaction_byte_count() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        buffer_reply(&setup, u16::MAX as usize).await;

        let noop = test_support::request_pdu(9, test_support::OPNUM_NO_REPLY, b"");
        let mut pkt =
            test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &noop, u16::MAX);
        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();

        let resp = pkt.associated().unwrap();
        assert_eq!(resp.long_error_code(), SmbStatus::BufferOverflow.nt_status());
        assert_eq!(resp.parameter(6) as usize, max_transact_reply_data());
        assert_eq!(resp.byte_count(), MAX_BYTE_COUNT);
        assert_eq!(pipe_buffered_len(&setup).await, Some(1));
    }

    #[tokio::test]
    async fn test_reply_too_long_for_one_fragment_is_dropped() {
        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        buffer_reply(&setup, u16::MAX as usize + 1).await;

        let noop = test_support::request_pdu(9, test_support::OPNUM_NO_REPLY, b"");
        let mut pkt =
            test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &noop, u16::MAX);
        assert_eq!(
            process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap_err(),
            SmbStatus::SrvNotSupported
        );
        assert_eq!(pipe_buffered_len(&setup).await, None);
    }

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_debug_output_selected_by_log_target() {
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new("cifs_ipc::dcerpc=debug"))
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let setup = test_support::open_pipe(PipeType::Srvsvc).await;
        let bind = test_support::bind_pdu(3, 4280, 4280, u1(), u2());
        let mut pkt =
            test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &bind, 4280);
        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();

        // Needs an associated packet, whose allocation logs under the pool's target
        let req = test_support::request_pdu(4, test_support::OPNUM_BIG_REPLY, b"");
        let mut pkt = test_support::transact_nmpipe(setup.uid, setup.tid, setup.fid, &req, 4096);
        process_transact_nmpipe(&setup.sess, &mut pkt).await.unwrap();
        assert!(pkt.has_associated());

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("cifs_ipc::dcerpc::handler"));
        assert!(out.contains("DCE/RPC bind"));
        assert!(out.contains("DCE/RPC request"));
        assert!(!out.contains("Associated reply packet"));
    }
}
