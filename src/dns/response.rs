//! Response Handler (`process_answer`)
//!
//! Validates and classifies an inbound response, drives the UDP→TCP and
//! EDNS→non-EDNS rewrite paths, and either terminates or requeues the
//! matching query. Must never close the connection itself — a returned
//! status other than `Success` is the caller's (Reader's) signal to do
//! so.

use crate::dns::channel::{detach_from_connection, end_query, notify_server_state, requeue_query, ChannelState};
use crate::dns::clock::Timeval;
use crate::dns::connection::ConnectionId;
use crate::dns::dispatcher;
use crate::dns::errors::Status;
use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::dns::query::QueryId;

pub(crate) fn process_answer(
    state: &mut ChannelState,
    bytes: &[u8],
    conn_id: ConnectionId,
    now: Timeval,
) -> Status {
    if bytes.is_empty() {
        return Status::Success;
    }

    let parsed = match state.codec.parse(bytes) {
        Ok(p) => p,
        Err(_) => return Status::BadResp,
    };

    let Some(id) = state.queries.find_by_qid(parsed.header.id) else {
        return Status::Success;
    };

    if !same_questions(state, id, &parsed, conn_id) {
        return Status::Success;
    }

    let using_tcp = state.queries.get(id).map(|q| q.using_tcp).unwrap_or(false);
    {
        let query = state.queries.get(id).unwrap();
        let conn = state.pool.get(conn_id).unwrap();
        if state
            .cookie_engine
            .validate(query, &parsed, conn, now)
            .is_err()
        {
            return Status::Success;
        }
    }

    // We have an answer — detach from the in-flight list but keep the
    // qid index entry alive (queries are removed wholesale only by
    // `end_query`/`requeue_query`'s eventual finalize path).
    detach_from_connection(state, id);

    let server = state.queries.get(id).and_then(|q| q.server);

    // FORMERR with an EDNS downgrade available.
    if parsed.header.rescode == ResultCode::FORMERR
        && state
            .queries
            .get(id)
            .map(|q| q.outbound.has_opt_rr())
            .unwrap_or(false)
        && !parsed.has_opt_rr()
    {
        let removed = state
            .queries
            .get_mut(id)
            .map(|q| q.outbound.remove_opt_rr())
            .unwrap_or(false);

        if removed {
            dispatcher::send_query(state, id, now);
        } else {
            end_query(state, id, now, Status::Formerr, None);
        }
        return Status::Success;
    }

    // Truncated UDP response, upgrade to TCP and resend.
    let conn_using_tcp = state.pool.get(conn_id).map(|c| c.using_tcp).unwrap_or(false);
    if parsed.header.truncated_message && !conn_using_tcp && !state.options.flag_igntc {
        if let Some(q) = state.queries.get_mut(id) {
            q.using_tcp = true;
        }
        dispatcher::send_query(state, id, now);
        return Status::Success;
    }

    // Rejected rcodes trigger a requeue, not connection teardown.
    if !state.options.flag_nocheckresp
        && matches!(
            parsed.header.rescode,
            ResultCode::SERVFAIL | ResultCode::NOTIMP | ResultCode::REFUSED
        )
    {
        let status = Status::from_rcode(parsed.header.rescode);
        if let Some(server) = server {
            state
                .registry
                .increment_failures(server, now, state.options.server_retry_delay_ms);
            notify_server_state(state, server, false, using_tcp);
        }
        requeue_query(state, id, now, status, true, Some(parsed));
        return Status::Success;
    }

    // Accept.
    let qname = state
        .queries
        .get(id)
        .and_then(|q| q.outbound.questions.first())
        .map(|q| q.name.clone());
    let qtype = state
        .queries
        .get(id)
        .and_then(|q| q.outbound.questions.first())
        .map(|q| q.qtype);

    if let (Some(qname), Some(qtype)) = (qname, qtype) {
        state.cache.insert(now, &qname, qtype, parsed.clone());
    }

    if let Some(server) = server {
        state.registry.set_good(server);
        notify_server_state(state, server, true, using_tcp);
    }

    end_query(state, id, now, Status::Success, Some(parsed));
    Status::Success
}

/// Question-equality check. Counts must match; for each question
/// `(name, type)`, type must match exactly and name comparison is
/// case-sensitive iff `FLAG_DNS0x20` is set AND the query was not
/// upgraded to TCP.
fn same_questions(state: &ChannelState, id: QueryId, parsed: &DnsPacket, conn_id: ConnectionId) -> bool {
    let Some(query) = state.queries.get(id) else {
        return false;
    };

    if query.outbound.questions.len() != parsed.questions.len() {
        return false;
    }

    let conn_is_tcp = state.pool.get(conn_id).map(|c| c.using_tcp).unwrap_or(false);
    let case_sensitive = state.options.flag_dns0x20 && !conn_is_tcp;

    query
        .outbound
        .questions
        .iter()
        .zip(parsed.questions.iter())
        .all(|(sent, got)| {
            if sent.qtype != got.qtype {
                return false;
            }
            if case_sensitive {
                sent.name == got.name
            } else {
                sent.name.eq_ignore_ascii_case(&got.name)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::TtlQueryCache;
    use crate::dns::channel::{Channel, ChannelOptions};
    use crate::dns::codec::StdDnsCodec;
    use crate::dns::cookie::Rfc7873CookieEngine;
    use crate::dns::metrics::EwmaMetrics;
    use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};
    use crate::dns::random::test_support::ScriptedRandom;
    use crate::dns::transport::test_support::StubTransport;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_channel(tries: u32) -> Channel {
        let random: Arc<dyn crate::dns::random::Random> = Arc::new(ScriptedRandom::new(vec![0]));
        Channel::new(
            Box::new(StubTransport::new()),
            Box::new(StdDnsCodec),
            Box::new(Rfc7873CookieEngine::new(random.clone())),
            Box::new(TtlQueryCache::new()),
            Box::new(EwmaMetrics::default()),
            random,
            ChannelOptions::default().with_tries(tries),
        )
    }

    fn a_query() -> DnsPacket {
        let mut p = DnsPacket::new();
        p.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));
        p
    }

    fn noerror_response(qid: u16) -> DnsPacket {
        let mut p = DnsPacket::new();
        p.header.id = qid;
        p.header.response = true;
        p.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));
        p.answers.push(crate::dns::protocol::DnsRecord::A {
            domain: "example.com".into(),
            addr: std::net::Ipv4Addr::new(93, 184, 216, 34),
            ttl: crate::dns::protocol::TransientTtl(300),
        });
        p
    }

    #[test]
    fn s1_udp_happy_path_completes_with_success() {
        let channel = test_channel(2);
        channel.register_server("127.0.0.1:53".parse().unwrap());

        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        channel.submit(
            0x1234,
            a_query(),
            false,
            false,
            Box::new(move |_, status, timeouts, _| {
                statuses2.lock().unwrap().push((status, timeouts));
            }),
            Arc::new(()),
        );

        let conn_id = ConnectionId(0);
        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x1234);
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], conn_id, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        let calls = statuses.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Status::Success, 0));
        assert_eq!(channel.queue_len(), 0);
    }

    #[test]
    fn s2_truncated_udp_response_upgrades_to_tcp_and_completes() {
        let channel = test_channel(2);
        channel.register_server("127.0.0.1:53".parse().unwrap());

        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        channel.submit(
            0x2222,
            a_query(),
            false,
            false,
            Box::new(move |_, status, timeouts, _| {
                statuses2.lock().unwrap().push((status, timeouts));
            }),
            Arc::new(()),
        );

        // First attempt is over UDP on connection 0.
        let udp_conn = ConnectionId(0);
        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x2222);
            resp.header.truncated_message = true;
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], udp_conn, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        // No callback yet; the query was resent, this time over a freshly
        // opened TCP connection to the same (only) server.
        assert!(statuses.lock().unwrap().is_empty());
        assert_eq!(channel.queue_len(), 1);

        let tcp_conn = ConnectionId(1);
        channel.with_state_for_test(|state| {
            assert!(state.pool.get(tcp_conn).unwrap().using_tcp);
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x2222);
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], tcp_conn, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        let calls = statuses.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Status::Success, 0));
        assert_eq!(channel.queue_len(), 0);
    }

    #[test]
    fn s3_formerr_strips_opt_rr_and_resends() {
        let channel = test_channel(2);
        channel.register_server("127.0.0.1:53".parse().unwrap());

        let mut outbound = a_query();
        outbound.resources.push(crate::dns::protocol::DnsRecord::Opt {
            packet_len: 4096,
            flags: 0,
            data: String::new(),
        });
        assert!(outbound.has_opt_rr());

        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        channel.submit(
            0x3333,
            outbound,
            false,
            false,
            Box::new(move |_, status, timeouts, _| {
                statuses2.lock().unwrap().push((status, timeouts));
            }),
            Arc::new(()),
        );

        let conn_id = ConnectionId(0);
        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x3333);
            resp.header.rescode = crate::dns::protocol::ResultCode::FORMERR;
            resp.answers.clear();
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], conn_id, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        // No callback yet; the OPT RR was stripped and the query resent
        // on the same (reused) UDP connection.
        assert!(statuses.lock().unwrap().is_empty());
        channel.with_state_for_test(|state| {
            let id = state.queries.find_by_qid(0x3333).unwrap();
            assert!(!state.queries.get(id).unwrap().outbound.has_opt_rr());
        });

        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x3333);
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], conn_id, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        let calls = statuses.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Status::Success, 0));
    }

    #[test]
    fn s4_server_failover_resorts_behind_healthy_servers() {
        let random: Arc<dyn crate::dns::random::Random> = Arc::new(ScriptedRandom::new(vec![0]));
        let channel = Channel::new(
            Box::new(StubTransport::new()),
            Box::new(StdDnsCodec),
            Box::new(Rfc7873CookieEngine::new(random.clone())),
            Box::new(TtlQueryCache::new()),
            Box::new(EwmaMetrics::default()),
            random,
            ChannelOptions::default().with_tries(1).with_server_retry_chance(0),
        );
        channel.register_server("127.0.0.1:5401".parse().unwrap());
        channel.register_server("127.0.0.1:5402".parse().unwrap());
        channel.register_server("127.0.0.1:5403".parse().unwrap());

        // All three queries are submitted while server A is still ranked
        // first, so all three land on its shared UDP connection.
        let conn_a = ConnectionId(0);
        let qids = [0x40u16, 0x41, 0x42];
        for qid in qids {
            channel.submit(qid, a_query(), false, false, Box::new(|_, _, _, _| {}), Arc::new(()));
        }
        channel.with_state_for_test(|state| {
            assert_eq!(state.pool.get(conn_a).unwrap().queries_to_conn.len(), 3);
        });

        // Each of the three queries independently gets a SERVFAIL back
        // from server A.
        for qid in qids {
            channel.with_state_for_test(|state| {
                let mut framed = Vec::new();
                let mut resp = noerror_response(qid);
                resp.header.rescode = crate::dns::protocol::ResultCode::SERVFAIL;
                resp.answers.clear();
                let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
                let status = process_answer(state, &framed[2..], conn_a, Timeval::new(0, 0));
                assert_eq!(status, Status::Success);
            });
        }

        channel.with_state_for_test(|state| {
            let sorted_addrs: Vec<std::net::SocketAddr> =
                state.registry.iter_sorted().map(|s| s.addr).collect();
            assert_eq!(
                sorted_addrs,
                vec![
                    "127.0.0.1:5402".parse().unwrap(),
                    "127.0.0.1:5403".parse().unwrap(),
                    "127.0.0.1:5401".parse().unwrap(),
                ]
            );

            let server_a = state
                .registry
                .iter_sorted()
                .find(|s| s.addr == "127.0.0.1:5401".parse().unwrap())
                .unwrap();
            assert_eq!(server_a.consec_failures, 3);

            // server_retry_chance=0: A is never rehabilitated ahead of B
            // and C regardless of the roll.
            let rng = ScriptedRandom::new(vec![0]);
            let chosen = state
                .registry
                .select(crate::dns::registry::SelectionMode::Failover, Timeval::new(0, 0), &rng, 0)
                .unwrap();
            assert_eq!(state.registry.get(chosen).unwrap().addr, "127.0.0.1:5402".parse().unwrap());
        });
    }

    #[test]
    fn s5_timeout_exhaustion_ends_with_timeout_after_four_attempts() {
        let channel = test_channel(2);
        channel.register_server("127.0.0.1:5501".parse().unwrap());
        channel.register_server("127.0.0.1:5502".parse().unwrap());

        let statuses = Arc::new(std::sync::Mutex::new(Vec::new()));
        let statuses2 = statuses.clone();
        channel.submit(
            0x5555,
            a_query(),
            false,
            false,
            Box::new(move |_, status, timeouts, _| {
                statuses2.lock().unwrap().push((status, timeouts));
            }),
            Arc::new(()),
        );

        // Two servers x two tries each = four dispatches before exhaustion.
        // Each call to the timeout processor picks up the single
        // currently-overdue attempt and resends it, so four well-separated
        // "now" samples drive exactly four timeouts.
        for round in 1..=4u64 {
            channel.with_state_for_test(|state| {
                crate::dns::channel::process_timeouts(state, Timeval::new(round * 1_000_000, 0));
            });
        }

        let calls = statuses.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (Status::Timeout, 4));
        assert_eq!(channel.queue_len(), 0);
    }

    #[test]
    fn s6_case_mismatch_under_0x20_drops_response() {
        let random: Arc<dyn crate::dns::random::Random> = Arc::new(ScriptedRandom::new(vec![0]));
        let channel = Channel::new(
            Box::new(StubTransport::new()),
            Box::new(StdDnsCodec),
            Box::new(Rfc7873CookieEngine::new(random.clone())),
            Box::new(TtlQueryCache::new()),
            Box::new(EwmaMetrics::default()),
            random,
            ChannelOptions::default().with_tries(1).with_flag_dns0x20(true),
        );
        channel.register_server("127.0.0.1:53".parse().unwrap());

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let mut mixed_case = DnsPacket::new();
        mixed_case.questions.push(DnsQuestion::new("ExAmPlE.CoM".into(), QueryType::A));

        channel.submit(
            0x9,
            mixed_case,
            false,
            false,
            Box::new(move |_, _, _, _| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(()),
        );

        let conn_id = ConnectionId(0);
        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0x9);
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], conn_id, Timeval::new(0, 0));
            // Dropped as a mismatch, not an error: the caller keeps the
            // connection open and the query stays outstanding.
            assert_eq!(status, Status::Success);
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(channel.queue_len(), 1);
    }

    #[test]
    fn unknown_qid_is_dropped_without_touching_the_table() {
        let channel = test_channel(2);
        channel.register_server("127.0.0.1:53".parse().unwrap());
        let conn_id = ConnectionId(0);

        channel.with_state_for_test(|state| {
            let mut framed = Vec::new();
            let mut resp = noerror_response(0xFFFF);
            let _ = state.codec.write_tcp_framed(&mut resp, &mut framed);
            let status = process_answer(state, &framed[2..], conn_id, Timeval::new(0, 0));
            assert_eq!(status, Status::Success);
        });

        assert_eq!(channel.queue_len(), 0);
    }
}
