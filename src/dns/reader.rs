//! Reader
//!
//! Frames and parses inbound bytes into DNS responses, demultiplexing
//! each to its query. Frames already sitting in the inbound buffer are
//! handed to `process_answer` before a read error observed on the same
//! tick is acted on, so completed responses aren't discarded just
//! because a later read on the same connection failed.

use crate::dns::channel::{handle_conn_error, ChannelState};
use crate::dns::clock::Timeval;
use crate::dns::connection::ConnectionId;
use crate::dns::errors::{CoreError, Status};
use crate::dns::response;

pub(crate) fn read_conn(state: &mut ChannelState, conn_id: ConnectionId, now: Timeval) {
    let pending_error = read_conn_packets(state, conn_id);
    read_answers(state, conn_id, now);
    if let Some(status) = pending_error {
        handle_conn_error(state, conn_id, now, true, status);
    }
}

/// Reads as many frames as are currently available off the connection's
/// socket into its inbound buffer. Returns the status to apply once
/// buffered frames have been drained, or `None` if the loop ended
/// normally (`WOULDBLOCK` or no more data expected this tick).
fn read_conn_packets(state: &mut ChannelState, conn_id: ConnectionId) -> Option<Status> {
    loop {
        let mut buf = [0u8; 65535];
        let (read_result, using_tcp) = {
            let transport = state.pool.transport();
            let conn = state.pool.get(conn_id)?;
            (transport.read(&conn.handle, &mut buf), conn.using_tcp)
        };

        let n = match read_result {
            Ok(n) => n,
            Err(CoreError::WouldBlock) => return None,
            // Any non-WOULDBLOCK read error is reported as CONNREFUSED
            // regardless of its underlying kind.
            Err(_) => return Some(Status::ConnRefused),
        };

        if let Some(conn) = state.pool.get_mut(conn_id) {
            if using_tcp {
                conn.inbound.extend_from_slice(&buf[..n]);
            } else {
                // UDP: reserve+backfill a two-byte length placeholder so
                // one datagram becomes exactly one length-prefixed frame,
                // matching the framing read_answers expects for TCP too.
                conn.inbound.extend_from_slice(&(n as u16).to_be_bytes());
                conn.inbound.extend_from_slice(&buf[..n]);
            }
        }

        let more_may_be_pending = !using_tcp || n == buf.len();
        if state.options.external_sock_funcs || !more_may_be_pending {
            return None;
        }
    }
}

/// Drains complete length-prefixed frames out of the connection's
/// inbound buffer, handing each to `process_answer`.
fn read_answers(state: &mut ChannelState, conn_id: ConnectionId, now: Timeval) {
    loop {
        let frame = {
            let Some(conn) = state.pool.get_mut(conn_id) else { return };
            if conn.inbound.len() < 2 {
                return;
            }
            let len = u16::from_be_bytes([conn.inbound[0], conn.inbound[1]]) as usize;
            if conn.inbound.len() < 2 + len {
                return;
            }
            let frame: Vec<u8> = conn.inbound[2..2 + len].to_vec();
            conn.inbound.drain(0..2 + len);
            frame
        };

        let status = response::process_answer(state, &frame, conn_id, now);
        if status != Status::Success {
            handle_conn_error(state, conn_id, now, true, status);
            return;
        }
    }
}
