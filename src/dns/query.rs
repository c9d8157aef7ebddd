//! Query table
//!
//! All live queries, indexed by transaction ID, by connection, and by
//! timeout deadline. The three views are kept over a single owning map
//! so mutations can't let one index drift from another.

use crate::dns::clock::Timeval;
use crate::dns::connection::ConnectionId;
use crate::dns::errors::Status;
use crate::dns::protocol::DnsPacket;
use crate::dns::registry::ServerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub usize);

/// Opaque argument threaded back to the caller's completion callback.
pub type CallbackArg = std::sync::Arc<dyn std::any::Any + Send + Sync>;

pub type CompletionCallback =
    Box<dyn FnMut(CallbackArg, Status, u32, Option<DnsPacket>) + Send>;

pub struct Query {
    pub id: QueryId,
    /// 16-bit DNS transaction ID; unique across the table at any moment.
    /// The submitter is responsible for choosing a free one.
    pub qid: u16,
    pub outbound: DnsPacket,
    pub using_tcp: bool,
    pub try_count: u32,
    pub timeouts_observed: u32,
    pub ts: Timeval,
    pub timeout: Timeval,
    pub conn: Option<ConnectionId>,
    pub server: Option<ServerId>,
    pub no_retries: bool,
    /// Sticky best-error-so-far, surfaced if retries are exhausted.
    pub error_status: Option<Status>,
    pub callback: CompletionCallback,
    pub callback_arg: CallbackArg,
}

impl Query {
    pub fn mark_error(&mut self, status: Status) {
        if status != Status::Success {
            self.error_status = Some(status);
        }
    }
}

/// Sorted sequence ordered by absolute deadline ascending (the
/// timeout-ordered index). Ties broken by `QueryId` so ordering stays a
/// total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimeoutKey(Timeval, QueryId);

pub struct QueryTable {
    queries: std::collections::HashMap<QueryId, Query>,
    by_qid: std::collections::HashMap<u16, QueryId>,
    by_timeout: std::collections::BTreeSet<TimeoutKey>,
    next_id: usize,
}

impl Default for QueryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryTable {
    pub fn new() -> QueryTable {
        QueryTable {
            queries: std::collections::HashMap::new(),
            by_qid: std::collections::HashMap::new(),
            by_timeout: std::collections::BTreeSet::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Query> {
        self.queries.get_mut(&id)
    }

    pub fn find_by_qid(&self, qid: u16) -> Option<QueryId> {
        self.by_qid.get(&qid).copied()
    }

    /// `insert`: assigns a fresh id, tracks it by qid.
    pub fn insert(
        &mut self,
        qid: u16,
        outbound: DnsPacket,
        using_tcp: bool,
        no_retries: bool,
        callback: CompletionCallback,
        callback_arg: CallbackArg,
        now: Timeval,
    ) -> QueryId {
        let id = QueryId(self.next_id);
        self.next_id += 1;

        let query = Query {
            id,
            qid,
            outbound,
            using_tcp,
            try_count: 0,
            timeouts_observed: 0,
            ts: now,
            timeout: now,
            conn: None,
            server: None,
            no_retries,
            error_status: None,
            callback,
            callback_arg,
        };

        self.queries.insert(id, query);
        self.by_qid.insert(qid, id);
        id
    }

    /// `attach`: appends to the connection's in-flight list and the
    /// timeout-ordered set.
    pub fn attach(
        &mut self,
        id: QueryId,
        conn: ConnectionId,
        server: ServerId,
        deadline: Timeval,
    ) {
        if let Some(q) = self.queries.get_mut(&id) {
            q.conn = Some(conn);
            q.server = Some(server);
            q.timeout = deadline;
            self.by_timeout.insert(TimeoutKey(deadline, id));
        }
    }

    /// `detach`: removes both links; clears `query.conn`. Returns the
    /// connection it had been attached to, if any, so the caller can
    /// also unlink it from `conn.queries_to_conn`.
    pub fn detach(&mut self, id: QueryId) -> Option<ConnectionId> {
        let q = self.queries.get_mut(&id)?;
        let conn = q.conn.take();
        let deadline = q.timeout;
        self.by_timeout.remove(&TimeoutKey(deadline, id));
        conn
    }

    /// `remove`: detach + remove from the qid index + the owning map.
    pub fn remove(&mut self, id: QueryId) -> Option<(Query, Option<ConnectionId>)> {
        let conn = self.detach(id);
        let query = self.queries.remove(&id)?;
        self.by_qid.remove(&query.qid);
        Some((query, conn))
    }

    /// The id of the query whose deadline is earliest, if it is `<= now`.
    /// Re-examined fresh on every call (never cache the head), since a
    /// requeue may mutate the set mid-scan.
    pub fn peek_timed_out(&self, now: Timeval) -> Option<QueryId> {
        let TimeoutKey(deadline, id) = *self.by_timeout.iter().next()?;
        if crate::dns::clock::timedout(now, deadline) {
            Some(id)
        } else {
            None
        }
    }

    #[cfg(test)]
    pub(crate) fn timeouts_sorted(&self) -> Vec<Timeval> {
        self.by_timeout.iter().map(|k| k.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::DnsPacket;

    fn noop_callback() -> CompletionCallback {
        Box::new(|_, _, _, _| {})
    }

    fn insert_query(table: &mut QueryTable, qid: u16, now: Timeval) -> QueryId {
        table.insert(
            qid,
            DnsPacket::new(),
            false,
            false,
            noop_callback(),
            std::sync::Arc::new(()),
            now,
        )
    }

    #[test]
    fn attach_and_detach_keep_timeout_order() {
        let mut table = QueryTable::new();
        let a = insert_query(&mut table, 1, Timeval::new(0, 0));
        let b = insert_query(&mut table, 2, Timeval::new(0, 0));

        table.attach(a, ConnectionId(0), ServerId(0), Timeval::new(5, 0));
        table.attach(b, ConnectionId(0), ServerId(0), Timeval::new(2, 0));

        assert_eq!(
            table.timeouts_sorted(),
            vec![Timeval::new(2, 0), Timeval::new(5, 0)]
        );

        table.detach(b);
        assert_eq!(table.timeouts_sorted(), vec![Timeval::new(5, 0)]);
    }

    #[test]
    fn qid_lookup_round_trips() {
        let mut table = QueryTable::new();
        let a = insert_query(&mut table, 0x1234, Timeval::new(0, 0));
        assert_eq!(table.find_by_qid(0x1234), Some(a));

        table.remove(a);
        assert_eq!(table.find_by_qid(0x1234), None);
    }

    #[test]
    fn peek_timed_out_respects_deadline() {
        let mut table = QueryTable::new();
        let a = insert_query(&mut table, 1, Timeval::new(0, 0));
        table.attach(a, ConnectionId(0), ServerId(0), Timeval::new(10, 0));

        assert_eq!(table.peek_timed_out(Timeval::new(5, 0)), None);
        assert_eq!(table.peek_timed_out(Timeval::new(10, 0)), Some(a));
    }

    #[test]
    fn detach_of_unattached_query_is_a_no_op() {
        let mut table = QueryTable::new();
        let a = insert_query(&mut table, 1, Timeval::new(0, 0));
        assert_eq!(table.detach(a), None);
        assert!(table.timeouts_sorted().is_empty());
    }
}
