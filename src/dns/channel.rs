//! Channel: the process-wide resolver context
//!
//! Owns the Server Registry, Query Table, connection pool, RNG state,
//! configuration, and the mutual-exclusion lock serializing every public
//! entry point. The Timeout Processor, Event Tick, Requeue, and
//! End-of-query operations live here since they form a mutually-recursive
//! unit coordinated under one lock.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::dns::cache::QueryCache;
use crate::dns::clock::{Clock, Timeval};
use crate::dns::codec::DnsCodec;
use crate::dns::connection::{ConnectionId, ConnectionPool};
use crate::dns::cookie::CookieEngine;
use crate::dns::dispatcher;
use crate::dns::errors::Status;
use crate::dns::metrics::Metrics;
use crate::dns::protocol::DnsPacket;
use crate::dns::query::{CallbackArg, CompletionCallback, QueryId, QueryTable};
use crate::dns::random::Random;
use crate::dns::reader;
use crate::dns::registry::{SelectionMode, ServerRegistry};
use crate::dns::transport::Transport;

/// The configuration surface the core exposes. Constructed
/// programmatically (`Default` plus builder setters) — parsing it from a
/// file or CLI is an explicit Non-goal.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub rotate: bool,
    pub tries: u32,
    pub server_retry_chance: u32,
    pub server_retry_delay_ms: u64,
    pub maxtimeout_ms: u64,
    pub udp_max_queries: u64,
    pub flag_igntc: bool,
    pub flag_nocheckresp: bool,
    pub flag_dns0x20: bool,
    /// The host owns its own I/O polling and has disabled the Reader's
    /// read-until-empty looping.
    pub external_sock_funcs: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        ChannelOptions {
            rotate: false,
            tries: 3,
            server_retry_chance: 10,
            server_retry_delay_ms: 5_000,
            maxtimeout_ms: 0,
            udp_max_queries: 0,
            flag_igntc: false,
            flag_nocheckresp: false,
            flag_dns0x20: false,
            external_sock_funcs: false,
        }
    }
}

impl ChannelOptions {
    pub fn with_rotate(mut self, rotate: bool) -> Self {
        self.rotate = rotate;
        self
    }
    pub fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }
    pub fn with_server_retry_chance(mut self, chance: u32) -> Self {
        self.server_retry_chance = chance;
        self
    }
    pub fn with_server_retry_delay_ms(mut self, delay: u64) -> Self {
        self.server_retry_delay_ms = delay;
        self
    }
    pub fn with_maxtimeout_ms(mut self, maxtimeout: u64) -> Self {
        self.maxtimeout_ms = maxtimeout;
        self
    }
    pub fn with_udp_max_queries(mut self, max: u64) -> Self {
        self.udp_max_queries = max;
        self
    }
    pub fn with_flag_igntc(mut self, v: bool) -> Self {
        self.flag_igntc = v;
        self
    }
    pub fn with_flag_nocheckresp(mut self, v: bool) -> Self {
        self.flag_nocheckresp = v;
        self
    }
    pub fn with_flag_dns0x20(mut self, v: bool) -> Self {
        self.flag_dns0x20 = v;
        self
    }
    pub fn with_external_sock_funcs(mut self, v: bool) -> Self {
        self.external_sock_funcs = v;
        self
    }

    pub fn selection_mode(&self) -> SelectionMode {
        if self.rotate {
            SelectionMode::Rotate
        } else {
            SelectionMode::Failover
        }
    }
}

/// Optional host-supplied observers. All are best-effort notifications
/// independent of logging — the core logs these same transitions
/// regardless of whether a callback is registered.
#[derive(Default)]
pub struct Observers {
    pub server_state_cb: Option<Box<dyn FnMut(&str, bool, bool) + Send>>,
    pub notify_pending_write_cb: Option<Box<dyn FnMut() + Send>>,
    pub queue_empty_cb: Option<Box<dyn FnMut() + Send>>,
}

/// Everything the channel lock protects. Split from `Channel` so every
/// free function in `dispatcher`/`reader`/`response` can take `&mut
/// ChannelState` without re-acquiring the lock recursively.
pub struct ChannelState {
    pub registry: ServerRegistry,
    pub queries: QueryTable,
    pub pool: ConnectionPool,
    pub codec: Box<dyn DnsCodec>,
    pub cookie_engine: Box<dyn CookieEngine>,
    pub cache: Box<dyn QueryCache>,
    pub metrics: Box<dyn Metrics>,
    pub random: Arc<dyn Random>,
    pub options: ChannelOptions,
    pub observers: Observers,
    pub notify_pending_write: bool,
}

pub struct Channel {
    clock: Clock,
    state: parking_lot::Mutex<ChannelState>,
}

impl Channel {
    pub fn new(
        transport: Box<dyn Transport>,
        codec: Box<dyn DnsCodec>,
        cookie_engine: Box<dyn CookieEngine>,
        cache: Box<dyn QueryCache>,
        metrics: Box<dyn Metrics>,
        random: Arc<dyn Random>,
        options: ChannelOptions,
    ) -> Channel {
        let udp_max_queries = options.udp_max_queries;
        Channel {
            clock: Clock::new(),
            state: parking_lot::Mutex::new(ChannelState {
                registry: ServerRegistry::new(),
                queries: QueryTable::new(),
                pool: ConnectionPool::new(transport, udp_max_queries),
                codec,
                cookie_engine,
                cache,
                metrics,
                random,
                options,
                observers: Observers::default(),
                notify_pending_write: false,
            }),
        }
    }

    pub fn register_server(&self, addr: SocketAddr) {
        self.state.lock().registry.register(addr);
    }

    pub fn set_observers(&self, observers: Observers) {
        self.state.lock().observers = observers;
    }

    pub fn now(&self) -> Timeval {
        self.clock.now()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queries.len()
    }

    /// Host-facing submission API. Inserts the query and immediately
    /// dispatches it; the one entry point needed to drive queries into
    /// the core.
    pub fn submit(
        &self,
        qid: u16,
        outbound: DnsPacket,
        using_tcp: bool,
        no_retries: bool,
        callback: CompletionCallback,
        callback_arg: CallbackArg,
    ) -> QueryId {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let id = state.queries.insert(qid, outbound, using_tcp, no_retries, callback, callback_arg, now);
        dispatcher::send_query(&mut state, id, now);
        id
    }

    /// Public entry point for one event-loop tick: drains readable
    /// connections, processes timeouts, then flushes writable
    /// connections.
    pub fn tick(&self, readable: &[ConnectionId], writable: &[ConnectionId]) {
        let mut state = self.state.lock();
        let now = self.clock.now();

        for &conn_id in readable {
            reader::read_conn(&mut state, conn_id, now);
        }

        process_timeouts(&mut state, now);

        for &conn_id in writable {
            flush_writable(&mut state, conn_id, now);
        }

        state.pool.cleanup_idle();
    }

    /// Test-only escape hatch for exercising `response::process_answer`
    /// (and other free functions taking `&mut ChannelState`) directly
    /// against a `Channel` built through the normal public API, without
    /// threading a real readable-fd through `tick`.
    #[cfg(test)]
    pub(crate) fn with_state_for_test<F: FnOnce(&mut ChannelState)>(&self, f: F) {
        let mut state = self.state.lock();
        f(&mut state);
    }

    /// Flushes any connection with a registered pending-write
    /// notification, used by hosts that batch writes rather than flush
    /// inline from `submit`.
    pub fn process_pending_write(&self) {
        let mut state = self.state.lock();
        if !state.notify_pending_write {
            return;
        }
        // Clear before flushing so a reentrant submission during the
        // flush may re-arm it.
        state.notify_pending_write = false;

        let now = self.clock.now();
        let tcp_conns: Vec<ConnectionId> = state.pool.all_ids();
        for conn_id in tcp_conns {
            let is_tcp = state.pool.get(conn_id).map(|c| c.using_tcp).unwrap_or(false);
            if is_tcp {
                flush_writable(&mut state, conn_id, now);
            }
        }
    }
}

fn flush_writable(state: &mut ChannelState, conn_id: ConnectionId, now: Timeval) {
    let Some(conn) = state.pool.get_mut(conn_id) else { return };
    if !conn.tfo_initial_pending {
        conn.connected = true;
    }
    if conn.outbound.is_empty() {
        return;
    }

    let bytes = std::mem::take(&mut conn.outbound);
    let transport = state.pool.transport();
    match transport.flush(&conn.handle, &bytes) {
        Ok(n) if n >= bytes.len() => {}
        Ok(n) => {
            // Partial write: keep the remainder queued.
            if let Some(conn) = state.pool.get_mut(conn_id) {
                conn.outbound = bytes[n..].to_vec();
            }
        }
        Err(crate::dns::errors::CoreError::WouldBlock) => {
            if let Some(conn) = state.pool.get_mut(conn_id) {
                conn.outbound = bytes;
            }
        }
        Err(e) => {
            handle_conn_error(state, conn_id, now, true, e.to_status());
        }
    }
}

/// Timeout Processor. Re-examines the head of the timeout-ordered index
/// on every iteration rather than caching it, since requeuing mutates
/// the set.
pub(crate) fn process_timeouts(state: &mut ChannelState, now: Timeval) {
    while let Some(id) = state.queries.peek_timed_out(now) {
        let server = state.queries.get(id).and_then(|q| q.server);
        let using_tcp = state.queries.get(id).map(|q| q.using_tcp).unwrap_or(false);

        if let Some(q) = state.queries.get_mut(id) {
            q.timeouts_observed += 1;
        }
        if let Some(server) = server {
            state.registry.increment_failures(server, now, state.options.server_retry_delay_ms);
            notify_server_state(state, server, false, using_tcp);
        }

        requeue_query(state, id, now, Status::Timeout, true, None);
    }
}

pub(crate) fn notify_server_state(state: &mut ChannelState, server: crate::dns::registry::ServerId, success: bool, using_tcp: bool) {
    let addr = state.registry.get(server).map(|s| s.addr.to_string());
    if let Some(addr) = addr {
        log::debug!("server {} state -> success={} tcp={}", addr, success, using_tcp);
        if let Some(cb) = state.observers.server_state_cb.as_mut() {
            cb(&addr, success, using_tcp);
        }
    }
}

/// Requeues a query: detach from its current connection, mark the error
/// (if any), bump the try count, then either re-dispatch or finalize it
/// once retries are exhausted. A no-op on the indices if the query was
/// not attached, since `detach` is itself idempotent.
pub(crate) fn requeue_query(
    state: &mut ChannelState,
    id: QueryId,
    now: Timeval,
    status: Status,
    inc_try: bool,
    dnsrec: Option<DnsPacket>,
) -> Status {
    detach_from_connection(state, id);

    let Some(query) = state.queries.get_mut(id) else {
        return status;
    };

    if status != Status::Success {
        query.mark_error(status);
    }
    if inc_try {
        query.try_count += 1;
    }

    let num_servers = state.registry.len().max(1) as u32;
    let max_tries = num_servers * state.options.tries;
    let no_retries = query.no_retries;
    let try_count = query.try_count;

    if try_count < max_tries && !no_retries {
        return dispatcher::send_query(state, id, now);
    }

    let final_status = state
        .queries
        .get(id)
        .and_then(|q| q.error_status)
        .unwrap_or(Status::Timeout);
    end_query(state, id, now, final_status, dnsrec);
    Status::Timeout
}

/// Finalizes a query: records metrics, detaches it, removes it from the
/// table, and invokes its completion callback. `now` is the real clock
/// sample from the calling tick, passed through to `Metrics::record` so
/// it can measure the query's actual round-trip (`now - query.ts`)
/// rather than its timeout window.
pub(crate) fn end_query(state: &mut ChannelState, id: QueryId, now: Timeval, status: Status, dnsrec: Option<DnsPacket>) {
    let server = state.queries.get(id).and_then(|q| q.server);
    let server_snapshot = server.and_then(|s| state.registry.get(s)).cloned();

    if let Some(q) = state.queries.get(id) {
        state.metrics.record(q, server_snapshot.as_ref(), now, status, dnsrec.as_ref());
    }

    detach_from_connection(state, id);
    if let Some((mut query, _)) = state.queries.remove(id) {
        let timeouts = query.timeouts_observed;
        (query.callback)(query.callback_arg.clone(), status, timeouts, dnsrec);
    }

    if state.queries.is_empty() {
        if let Some(cb) = state.observers.queue_empty_cb.as_mut() {
            cb();
        }
    }
}

pub(crate) fn detach_from_connection(state: &mut ChannelState, id: QueryId) {
    if let Some(conn_id) = state.queries.detach(id) {
        if let Some(conn) = state.pool.get_mut(conn_id) {
            conn.queries_to_conn.retain(|q| *q != id);
        }
    }
}

/// Requeues every query attached to `conn_id`, then closes it (a closed
/// connection never survives to be fetched again). `critical` mirrors
/// whether the failure is fatal to the connection; it is always `true`
/// at present call sites but kept as a parameter to match the shape of
/// the underlying `handle_conn_error(critical, status)` operation.
/// `now` must be the real clock sample from the calling tick — it is
/// threaded into `requeue_query`'s re-dispatch, which anchors each
/// requeued query's fresh deadline off it.
pub(crate) fn handle_conn_error(state: &mut ChannelState, conn_id: ConnectionId, now: Timeval, critical: bool, status: Status) {
    let in_flight = state
        .pool
        .get(conn_id)
        .map(|c| c.queries_to_conn.clone())
        .unwrap_or_default();

    for qid in in_flight {
        requeue_query(state, qid, now, status, false, None);
    }

    if critical {
        state.pool.close(conn_id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::TtlQueryCache;
    use crate::dns::codec::StdDnsCodec;
    use crate::dns::cookie::Rfc7873CookieEngine;
    use crate::dns::metrics::EwmaMetrics;
    use crate::dns::protocol::{DnsQuestion, QueryType};
    use crate::dns::random::test_support::ScriptedRandom;
    use crate::dns::transport::test_support::StubTransport;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_channel() -> Channel {
        let random: Arc<dyn Random> = Arc::new(ScriptedRandom::new(vec![0]));
        Channel::new(
            Box::new(StubTransport::new()),
            Box::new(StdDnsCodec),
            Box::new(Rfc7873CookieEngine::new(random.clone())),
            Box::new(TtlQueryCache::new()),
            Box::new(EwmaMetrics::default()),
            random,
            ChannelOptions::default().with_tries(2),
        )
    }

    fn a_query() -> DnsPacket {
        let mut p = DnsPacket::new();
        p.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));
        p
    }

    #[test]
    fn submit_dispatches_and_attaches_query() {
        let channel = test_channel();
        channel.register_server("127.0.0.1:53".parse().unwrap());

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        channel.submit(
            0x1234,
            a_query(),
            false,
            false,
            Box::new(move |_, _, _, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(()),
        );

        assert_eq!(channel.queue_len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn no_server_ends_query_immediately() {
        let channel = test_channel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        channel.submit(
            1,
            a_query(),
            false,
            false,
            Box::new(move |_, status, _, _| {
                assert_eq!(status, Status::NoServer);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(()),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(channel.queue_len(), 0);
    }
}
