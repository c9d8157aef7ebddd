//! DNS Cookie collaborator (RFC 7873)
//!
//! Attaches an 8-byte client cookie to outbound OPT RRs and validates
//! that a response echoes it back. Trimmed to the client-side
//! apply/validate contract this core needs — no server-cookie
//! generation, which is an authoritative-server concern out of scope
//! here.

use crate::dns::clock::Timeval;
use crate::dns::connection::Connection;
use crate::dns::errors::Status;
use crate::dns::protocol::DnsRecord;
use crate::dns::query::Query;
use crate::dns::random::Random;

const OPT_CODE_COOKIE: u16 = 10;

/// `apply`/`validate`. `apply` mutates the outbound OPT RR (creating one
/// if absent is the Dispatcher's job — `apply` only attaches cookie data
/// to an OPT RR that's already present); `validate` inspects a parsed
/// response against the query's outbound cookie.
pub trait CookieEngine: Send + Sync {
    fn apply(&self, outbound: &mut crate::dns::protocol::DnsPacket, conn: &Connection, now: Timeval) -> Result<(), Status>;
    fn validate(
        &self,
        query: &Query,
        response: &crate::dns::protocol::DnsPacket,
        conn: &Connection,
        now: Timeval,
    ) -> Result<(), Status>;
}

fn find_cookie_option(data: &[u8]) -> Option<&[u8]> {
    let mut pos = 0;
    while pos + 4 <= data.len() {
        let code = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let start = pos + 4;
        if start + len > data.len() {
            return None;
        }
        if code == OPT_CODE_COOKIE {
            return Some(&data[start..start + len]);
        }
        pos = start + len;
    }
    None
}

fn opt_rr_mut(packet: &mut crate::dns::protocol::DnsPacket) -> Option<&mut DnsRecord> {
    packet
        .resources
        .iter_mut()
        .find(|rec| matches!(rec, DnsRecord::Opt { .. }))
}

pub struct Rfc7873CookieEngine {
    random: std::sync::Arc<dyn Random>,
}

impl Rfc7873CookieEngine {
    pub fn new(random: std::sync::Arc<dyn Random>) -> Rfc7873CookieEngine {
        Rfc7873CookieEngine { random }
    }
}

impl CookieEngine for Rfc7873CookieEngine {
    fn apply(&self, outbound: &mut crate::dns::protocol::DnsPacket, _conn: &Connection, _now: Timeval) -> Result<(), Status> {
        let mut client_cookie = [0u8; 8];
        self.random.bytes(&mut client_cookie);

        if let Some(DnsRecord::Opt { data, .. }) = opt_rr_mut(outbound) {
            let mut option = Vec::with_capacity(12);
            option.extend_from_slice(&OPT_CODE_COOKIE.to_be_bytes());
            option.extend_from_slice(&8u16.to_be_bytes());
            option.extend_from_slice(&client_cookie);
            data.extend_from_slice(&option);
        }
        Ok(())
    }

    fn validate(
        &self,
        query: &Query,
        response: &crate::dns::protocol::DnsPacket,
        _conn: &Connection,
        _now: Timeval,
    ) -> Result<(), Status> {
        let sent = query
            .outbound
            .resources
            .iter()
            .find_map(|rec| match rec {
                DnsRecord::Opt { data, .. } => find_cookie_option(data),
                _ => None,
            });

        let Some(sent_client_cookie) = sent.map(|c| &c[..8.min(c.len())]) else {
            // We never attached a cookie; nothing to validate.
            return Ok(());
        };

        let received = response.resources.iter().find_map(|rec| match rec {
            DnsRecord::Opt { data, .. } => find_cookie_option(data),
            _ => None,
        });

        match received {
            None => {
                // Missing server echo is not itself a failure; servers
                // may not support cookies.
                Ok(())
            }
            Some(echoed) if echoed.len() >= 8 && &echoed[..8] == sent_client_cookie => Ok(()),
            Some(_) => {
                log::debug!("dropping response with mismatched dns cookie echo");
                Err(Status::BadResp)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::connection::ConnectionId;
    use crate::dns::protocol::{DnsPacket, DnsRecord};
    use crate::dns::random::test_support::ScriptedRandom;
    use crate::dns::registry::ServerId;
    use crate::dns::transport::ConnHandle;

    fn opt_packet() -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.resources.push(DnsRecord::Opt {
            packet_len: 4096,
            flags: 0,
            data: Vec::new(),
        });
        packet
    }

    fn fake_conn() -> Connection {
        Connection {
            id: ConnectionId(0),
            server: ServerId(0),
            handle: ConnHandle::Udp(std::net::UdpSocket::bind("127.0.0.1:0").unwrap()),
            using_tcp: false,
            connected: true,
            tfo_initial_pending: false,
            total_queries: 0,
            inbound: Vec::new(),
            outbound: Vec::new(),
            queries_to_conn: Vec::new(),
        }
    }

    fn fake_query(outbound: DnsPacket) -> Query {
        Query {
            id: crate::dns::query::QueryId(0),
            qid: 1,
            outbound,
            using_tcp: false,
            try_count: 0,
            timeouts_observed: 0,
            ts: Timeval::new(0, 0),
            timeout: Timeval::new(0, 0),
            conn: None,
            server: None,
            no_retries: false,
            error_status: None,
            callback: Box::new(|_, _, _, _| {}),
            callback_arg: std::sync::Arc::new(()),
        }
    }

    #[test]
    fn apply_then_validate_matching_echo_succeeds() {
        let rng: std::sync::Arc<dyn Random> = std::sync::Arc::new(ScriptedRandom::new(vec![0xAB, 0xCD]));
        let engine = Rfc7873CookieEngine::new(rng);

        let conn = fake_conn();
        let mut outbound = opt_packet();
        engine.apply(&mut outbound, &conn, Timeval::new(0, 0)).unwrap();

        let sent_cookie = match &outbound.resources[0] {
            DnsRecord::Opt { data, .. } => find_cookie_option(data).unwrap().to_vec(),
            _ => unreachable!(),
        };

        let mut response = opt_packet();
        if let DnsRecord::Opt { data, .. } = &mut response.resources[0] {
            data.extend_from_slice(&OPT_CODE_COOKIE.to_be_bytes());
            data.extend_from_slice(&(sent_cookie.len() as u16).to_be_bytes());
            data.extend_from_slice(&sent_cookie);
        }

        let query = fake_query(outbound);
        assert!(engine
            .validate(&query, &response, &conn, Timeval::new(0, 0))
            .is_ok());
    }

    #[test]
    fn mismatched_echo_is_rejected() {
        let rng: std::sync::Arc<dyn Random> = std::sync::Arc::new(ScriptedRandom::new(vec![0xAB]));
        let engine = Rfc7873CookieEngine::new(rng);

        let conn = fake_conn();
        let mut outbound = opt_packet();
        engine.apply(&mut outbound, &conn, Timeval::new(0, 0)).unwrap();

        let mut response = opt_packet();
        if let DnsRecord::Opt { data, .. } = &mut response.resources[0] {
            data.extend_from_slice(&OPT_CODE_COOKIE.to_be_bytes());
            data.extend_from_slice(&8u16.to_be_bytes());
            data.extend_from_slice(&[0u8; 8]);
        }

        let query = fake_query(outbound);
        assert_eq!(
            engine
                .validate(&query, &response, &conn, Timeval::new(0, 0))
                .unwrap_err(),
            Status::BadResp
        );
    }

    #[test]
    fn missing_server_echo_is_not_an_error() {
        let rng: std::sync::Arc<dyn Random> = std::sync::Arc::new(ScriptedRandom::new(vec![1]));
        let engine = Rfc7873CookieEngine::new(rng);

        let conn = fake_conn();
        let mut outbound = opt_packet();
        engine.apply(&mut outbound, &conn, Timeval::new(0, 0)).unwrap();

        let response = opt_packet();
        let query = fake_query(outbound);
        assert!(engine
            .validate(&query, &response, &conn, Timeval::new(0, 0))
            .is_ok());
    }
}
