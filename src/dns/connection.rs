//! Connection pool
//!
//! Per-server UDP/TCP connection set and per-connection I/O buffers. A
//! server gets at most one dedicated TCP connection; UDP connections
//! are kept in a small per-server list and retired once
//! `udp_max_queries` queries have traversed them.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crate::dns::errors::{CoreError, Status};
use crate::dns::query::QueryId;
use crate::dns::registry::ServerId;
use crate::dns::transport::{ConnHandle, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

pub struct Connection {
    pub id: ConnectionId,
    pub server: ServerId,
    pub handle: ConnHandle,
    pub using_tcp: bool,
    /// Set once the transport has confirmed a completed handshake; a
    /// freshly TFO-initiated TCP connection starts `false` and is marked
    /// connected by the first successful write-readiness tick.
    pub connected: bool,
    pub tfo_initial_pending: bool,
    pub total_queries: u64,
    pub inbound: Vec<u8>,
    pub outbound: Vec<u8>,
    /// FIFO order of attached Query Table ids.
    pub queries_to_conn: Vec<QueryId>,
}

impl Connection {
    pub fn has_pending_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.queries_to_conn.is_empty() && self.outbound.is_empty()
    }
}

pub struct ConnectionPool {
    transport: Box<dyn Transport>,
    connections: std::collections::HashMap<ConnectionId, Connection>,
    udp_by_server: std::collections::HashMap<ServerId, VecDeque<ConnectionId>>,
    tcp_by_server: std::collections::HashMap<ServerId, ConnectionId>,
    next_id: usize,
    udp_max_queries: u64,
}

impl ConnectionPool {
    pub fn new(transport: Box<dyn Transport>, udp_max_queries: u64) -> ConnectionPool {
        ConnectionPool {
            transport,
            connections: std::collections::HashMap::new(),
            udp_by_server: std::collections::HashMap::new(),
            tcp_by_server: std::collections::HashMap::new(),
            next_id: 0,
            udp_max_queries,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// `fetch(server, using_tcp)`.
    pub fn fetch(&self, server: ServerId, using_tcp: bool) -> Option<ConnectionId> {
        if using_tcp {
            return self.tcp_by_server.get(&server).copied();
        }

        let front = *self.udp_by_server.get(&server)?.front()?;
        let conn = &self.connections[&front];
        if self.udp_max_queries == 0 || conn.total_queries < self.udp_max_queries {
            Some(front)
        } else {
            None
        }
    }

    /// `open(server, using_tcp)`. On success the new connection is
    /// prepended to the server's connection list.
    pub fn open(
        &mut self,
        server: ServerId,
        addr: SocketAddr,
        using_tcp: bool,
    ) -> Result<ConnectionId, Status> {
        let handle = self.transport.open(addr, using_tcp).map_err(|e| match e {
            CoreError::WouldBlock => {
                debug_assert!(false, "open must not return WouldBlock");
                Status::ConnRefused
            }
            other => other.to_status(),
        })?;

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let conn = Connection {
            id,
            server,
            using_tcp,
            connected: !using_tcp,
            tfo_initial_pending: using_tcp,
            total_queries: 0,
            inbound: Vec::new(),
            outbound: Vec::new(),
            queries_to_conn: Vec::new(),
            handle,
        };
        self.connections.insert(id, conn);

        if using_tcp {
            if let Some(old) = self.tcp_by_server.insert(server, id) {
                self.close(old, Status::Cancelled);
            }
        } else {
            self.udp_by_server.entry(server).or_default().push_front(id);
        }

        log::debug!(
            "opened {} connection to server for {:?}",
            if using_tcp { "tcp" } else { "udp" },
            server
        );
        Ok(id)
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn close(&mut self, id: ConnectionId, status: Status) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.transport.close(&conn.handle, status);

        if conn.using_tcp {
            if self.tcp_by_server.get(&conn.server) == Some(&id) {
                self.tcp_by_server.remove(&conn.server);
            }
        } else if let Some(list) = self.udp_by_server.get_mut(&conn.server) {
            list.retain(|c| *c != id);
        }

        log::debug!("closed connection {:?} (status {:?})", id, status);
        Some(conn)
    }

    /// Connection cleanup pass: close connections with no in-flight
    /// queries and no buffered outbound bytes.
    pub fn cleanup_idle(&mut self) {
        let idle: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_idle())
            .map(|c| c.id)
            .collect();

        for id in idle {
            self.close(id, Status::Success);
        }
    }

    pub fn all_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::transport::test_support::StubTransport;

    fn addr() -> SocketAddr {
        "127.0.0.1:53".parse().unwrap()
    }

    #[test]
    fn open_prepends_udp_connection() {
        let mut pool = ConnectionPool::new(Box::new(StubTransport::new()), 0);
        let server = ServerId(0);
        let first = pool.open(server, addr(), false).unwrap();
        let second = pool.open(server, addr(), false).unwrap();

        assert_eq!(pool.fetch(server, false), Some(second));
        assert_ne!(first, second);
    }

    #[test]
    fn fetch_respects_udp_max_queries() {
        let mut pool = ConnectionPool::new(Box::new(StubTransport::new()), 2);
        let server = ServerId(0);
        let conn_id = pool.open(server, addr(), false).unwrap();
        pool.get_mut(conn_id).unwrap().total_queries = 2;

        assert_eq!(pool.fetch(server, false), None);
    }

    #[test]
    fn tcp_fetch_returns_dedicated_connection() {
        let mut pool = ConnectionPool::new(Box::new(StubTransport::new()), 0);
        let server = ServerId(0);
        let conn_id = pool.open(server, addr(), true).unwrap();
        assert_eq!(pool.fetch(server, true), Some(conn_id));
    }

    #[test]
    fn cleanup_closes_only_idle_connections() {
        let mut pool = ConnectionPool::new(Box::new(StubTransport::new()), 0);
        let server = ServerId(0);
        let busy = pool.open(server, addr(), false).unwrap();
        let idle = pool.open(server, addr(), true).unwrap();
        pool.get_mut(busy).unwrap().queries_to_conn.push(QueryId(0));

        pool.cleanup_idle();

        assert!(pool.get(busy).is_some());
        assert!(pool.get(idle).is_none());
    }
}
