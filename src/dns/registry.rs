//! Server registry: a ranked, sorted set of upstream servers
//!
//! Servers are kept in a sequence ordered by `(consec_failures ASC,
//! priority_index ASC)` so the least-failed, highest-priority server is
//! always first. Any mutation of `consec_failures` forces reinsertion
//! (re-sort).

use std::net::SocketAddr;

use crate::dns::clock::Timeval;
use crate::dns::random::Random;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub usize);

/// One upstream DNS endpoint and its failure-tracking state.
#[derive(Debug, Clone)]
pub struct Server {
    pub id: ServerId,
    pub addr: SocketAddr,
    /// Tie-breaker for the sort order; assigned at registration time in
    /// the order servers were added and never mutated afterward.
    pub priority_index: u32,
    pub consec_failures: u32,
    /// `None` means "no penalty outstanding" (zero = no penalty).
    pub next_retry_time: Option<Timeval>,
}

impl Server {
    fn sort_key(&self) -> (u32, u32) {
        (self.consec_failures, self.priority_index)
    }
}

/// Policy used by `ServerRegistry::select`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Pick uniformly at random among all registered servers.
    Rotate,
    /// Prefer the least-failed server, occasionally probing a failed one.
    /// This is the default.
    Failover,
}

/// Observable state transitions a `ServerRegistry` mutation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOutcome {
    Failure,
    Success,
}

pub struct ServerRegistry {
    servers: std::collections::HashMap<ServerId, Server>,
    /// Kept sorted by `Server::sort_key` at all times outside of a single
    /// in-progress mutation; `resort` restores the invariant.
    order: Vec<ServerId>,
    next_id: usize,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> ServerRegistry {
        ServerRegistry {
            servers: std::collections::HashMap::new(),
            order: Vec::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, addr: SocketAddr) -> ServerId {
        let id = ServerId(self.next_id);
        self.next_id += 1;

        let server = Server {
            id,
            addr,
            priority_index: self.order.len() as u32,
            consec_failures: 0,
            next_retry_time: None,
        };

        self.servers.insert(id, server);
        self.order.push(id);
        self.resort();
        id
    }

    pub fn get(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Servers in sorted `(consec_failures, priority_index)` order.
    pub fn iter_sorted(&self) -> impl Iterator<Item = &Server> {
        self.order.iter().map(move |id| &self.servers[id])
    }

    pub fn first(&self) -> Option<ServerId> {
        self.order.first().copied()
    }

    pub fn last(&self) -> Option<ServerId> {
        self.order.last().copied()
    }

    fn resort(&mut self) {
        let servers = &self.servers;
        self.order.sort_by_key(|id| servers[id].sort_key());
    }

    /// `increment_failures`: bump the counter, reinsert, and arm a
    /// retry-after timestamp. Returns the observer event the caller
    /// should forward to any registered `server_state_cb`.
    pub fn increment_failures(
        &mut self,
        id: ServerId,
        now: Timeval,
        retry_delay_millis: u64,
    ) -> ServerOutcome {
        if let Some(server) = self.servers.get_mut(&id) {
            server.consec_failures += 1;
            server.next_retry_time = Some(crate::dns::clock::timeadd(now, retry_delay_millis));
            log::debug!(
                "server {} failure count now {}",
                server.addr,
                server.consec_failures
            );
        }
        self.resort();
        ServerOutcome::Failure
    }

    /// `set_good`: clear the failure counter and any outstanding penalty
    /// if the server wasn't already healthy.
    pub fn set_good(&mut self, id: ServerId) -> ServerOutcome {
        if let Some(server) = self.servers.get_mut(&id) {
            if server.consec_failures > 0 {
                server.consec_failures = 0;
                log::debug!("server {} recovered", server.addr);
            }
            server.next_retry_time = None;
        }
        self.resort();
        ServerOutcome::Success
    }

    /// Select a server to dispatch to.
    pub fn select(
        &self,
        mode: SelectionMode,
        now: Timeval,
        random: &dyn Random,
        server_retry_chance: u32,
    ) -> Option<ServerId> {
        if self.order.is_empty() {
            return None;
        }

        match mode {
            SelectionMode::Rotate => {
                let idx = random.u16() as usize % self.order.len();
                Some(self.order[idx])
            }
            SelectionMode::Failover => {
                let first = *self.order.first()?;
                let last = *self.order.last()?;

                if self.servers[&last].consec_failures == 0 {
                    // Every server is healthy.
                    return Some(first);
                }

                if server_retry_chance > 0 {
                    let r = random.u16();
                    if (r as u32) % server_retry_chance == 0 {
                        if let Some(candidate) = self.order.iter().find(|id| {
                            let s = &self.servers[id];
                            s.consec_failures > 0
                                && s.next_retry_time.map(|t| now >= t).unwrap_or(true)
                        }) {
                            return Some(*candidate);
                        }
                    }
                }

                Some(first)
            }
        }
    }
}
