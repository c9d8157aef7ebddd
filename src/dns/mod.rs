//! Query-processing core of a stub DNS resolver
//!
//! # Module structure
//!
//! * `clock` — monotonic timestamps and timeout arithmetic.
//! * `errors` — the `Status` outcome vocabulary and the internal
//!   `CoreError` collaborators raise.
//! * `protocol` / `buffer` — DNS wire format: packets, records, and the
//!   byte buffers they are parsed from and serialized into.
//! * `registry` — the ranked, sorted set of upstream servers.
//! * `connection` — the UDP/TCP connection pool.
//! * `query` — the query table, indexed by transaction id, connection,
//!   and timeout deadline.
//! * `dispatcher` — places a query on a connection (`send_query`).
//! * `reader` — frames and parses inbound bytes off a connection.
//! * `response` — validates and classifies a parsed response
//!   (`process_answer`).
//! * `channel` — the process-wide context: owns the registry, query
//!   table, and connection pool behind one lock; hosts the timeout
//!   processor, event tick, requeue, and end-of-query operations.
//! * `codec`, `transport`, `cache`, `cookie`, `metrics`, `random` — the
//!   external collaborator traits plus their one production
//!   implementation each.

pub mod buffer;
pub mod cache;
pub mod channel;
pub mod clock;
pub mod codec;
pub mod connection;
pub mod cookie;
pub mod dispatcher;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod query;
pub mod random;
pub mod reader;
pub mod registry;
pub mod response;
pub mod transport;
