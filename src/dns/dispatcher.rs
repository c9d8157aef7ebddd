//! Dispatcher (`send_query`)
//!
//! Given a query and `now`, attempts to place it on some server's
//! connection. On success the query is attached with a freshly computed
//! deadline.

use crate::dns::channel::{end_query, handle_conn_error, requeue_query, ChannelState};
use crate::dns::clock::{timeadd, Timeval};
use crate::dns::connection::ConnectionId;
use crate::dns::errors::{CoreError, Status};
use crate::dns::query::QueryId;
use crate::dns::registry::ServerId;

pub(crate) fn send_query(state: &mut ChannelState, id: QueryId, now: Timeval) -> Status {
    let mode = state.options.selection_mode();
    let server_retry_chance = state.options.server_retry_chance;
    let random = state.random.clone();

    let server_id = match state.registry.select(mode, now, random.as_ref(), server_retry_chance) {
        Some(s) => s,
        None => {
            end_query(state, id, now, Status::NoServer, None);
            return Status::NoServer;
        }
    };

    let using_tcp = match state.queries.get(id) {
        Some(q) => q.using_tcp,
        None => return Status::Cancelled,
    };

    let addr = match state.registry.get(server_id) {
        Some(s) => s.addr,
        None => return Status::NoServer,
    };

    let conn_id = match state.pool.fetch(server_id, using_tcp) {
        Some(c) => c,
        None => match state.pool.open(server_id, addr, using_tcp) {
            Ok(c) => c,
            Err(status) if matches!(status, Status::ConnRefused | Status::BadFamily) => {
                state
                    .registry
                    .increment_failures(server_id, now, state.options.server_retry_delay_ms);
                return requeue_query(state, id, now, status, true, None);
            }
            Err(status) => {
                end_query(state, id, now, status, None);
                return status;
            }
        },
    };

    // Attach a DNS cookie to the outbound record.
    {
        let query = state.queries.get_mut(id).unwrap();
        let conn = state.pool.get(conn_id).unwrap();
        if let Err(status) = state.cookie_engine.apply(&mut query.outbound, conn, now) {
            end_query(state, id, now, status, None);
            return status;
        }
    }

    // Serialize into the connection's outbound buffer.
    let write_result = {
        let query = state.queries.get_mut(id).unwrap();
        let conn = state.pool.get_mut(conn_id).unwrap();
        state.codec.write_tcp_framed(&mut query.outbound, &mut conn.outbound)
    };
    if let Err(status) = write_result {
        end_query(state, id, now, status, None);
        return status;
    }

    let (conn_using_tcp, connected, tfo_initial_pending) = {
        let conn = state.pool.get(conn_id).unwrap();
        (conn.using_tcp, conn.connected, conn.tfo_initial_pending)
    };

    // A TCP connection mid-handshake with no TFO support defers the
    // physical write until the socket becomes writable.
    if conn_using_tcp && !connected && !tfo_initial_pending {
        attach_and_schedule(state, id, server_id, conn_id, now);
        return Status::Success;
    }

    // Host wants to batch writes rather than flush inline.
    if conn_using_tcp && state.observers.notify_pending_write_cb.is_some() {
        state.notify_pending_write = true;
        if let Some(cb) = state.observers.notify_pending_write_cb.as_mut() {
            cb();
        }
        attach_and_schedule(state, id, server_id, conn_id, now);
        return Status::Success;
    }

    // Flush now.
    let bytes = {
        let conn = state.pool.get_mut(conn_id).unwrap();
        std::mem::take(&mut conn.outbound)
    };
    let flush_result = {
        let transport = state.pool.transport();
        let conn = state.pool.get(conn_id).unwrap();
        transport.flush(&conn.handle, &bytes)
    };

    match flush_result {
        Ok(n) if n >= bytes.len() => {
            attach_and_schedule(state, id, server_id, conn_id, now);
            Status::Success
        }
        Ok(n) => {
            if let Some(conn) = state.pool.get_mut(conn_id) {
                conn.outbound = bytes[n..].to_vec();
            }
            attach_and_schedule(state, id, server_id, conn_id, now);
            Status::Success
        }
        Err(CoreError::WouldBlock) => {
            if let Some(conn) = state.pool.get_mut(conn_id) {
                conn.outbound = bytes;
            }
            attach_and_schedule(state, id, server_id, conn_id, now);
            Status::Success
        }
        Err(CoreError::NoMem) => {
            end_query(state, id, now, Status::NoMem, None);
            Status::NoMem
        }
        Err(e) => {
            let status = e.to_status();
            if matches!(status, Status::ConnRefused | Status::BadFamily) {
                handle_conn_error(state, conn_id, now, true, status);
                match requeue_query(state, id, now, status, false, None) {
                    Status::Timeout => Status::ConnRefused,
                    other => other,
                }
            } else {
                state
                    .registry
                    .increment_failures(server_id, now, state.options.server_retry_delay_ms);
                requeue_query(state, id, now, status, false, None)
            }
        }
    }
}

/// Computes the deadline for a just-dispatched attempt: the smoothed
/// per-server base timeout, doubled once per full round through the
/// server set, clamped to `maxtimeout_ms`, then jittered down by up to
/// half on rounds after the first.
pub(crate) fn calc_query_timeout(
    state: &ChannelState,
    server_id: ServerId,
    query_id: QueryId,
    now: Timeval,
) -> u64 {
    let server = state.registry.get(server_id).expect("server must exist");
    let base = state.metrics.server_timeout(server, now);

    let try_count = state.queries.get(query_id).map(|q| q.try_count).unwrap_or(0);
    let num_servers = state.registry.len().max(1) as u32;
    let rounds = try_count / num_servers;

    let mut tp = base.checked_shl(rounds).unwrap_or(u64::MAX);
    if state.options.maxtimeout_ms > 0 && tp > state.options.maxtimeout_ms {
        tp = state.options.maxtimeout_ms;
    }
    if rounds > 0 {
        let r = state.random.u16();
        let delta = (r as f64 / 65535.0) * 0.5;
        let reduction = (tp as f64 * delta).floor() as u64;
        tp = tp.saturating_sub(reduction);
    }
    if tp < base {
        tp = base;
    }
    tp
}

/// Computes the deadline, detaches any prior attachment, then attaches
/// the query to its (possibly new) connection and timeout index.
fn attach_and_schedule(
    state: &mut ChannelState,
    id: QueryId,
    server_id: ServerId,
    conn_id: ConnectionId,
    now: Timeval,
) {
    let timeout_ms = calc_query_timeout(state, server_id, id, now);
    let deadline = timeadd(now, timeout_ms);

    if let Some(prev_conn) = state.queries.detach(id) {
        if let Some(c) = state.pool.get_mut(prev_conn) {
            c.queries_to_conn.retain(|q| *q != id);
        }
    }

    if let Some(q) = state.queries.get_mut(id) {
        q.ts = now;
    }
    state.queries.attach(id, conn_id, server_id, deadline);

    if let Some(conn) = state.pool.get_mut(conn_id) {
        conn.queries_to_conn.push(id);
        conn.total_queries += 1;
    }
}
