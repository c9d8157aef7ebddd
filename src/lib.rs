//! Query-processing core of an asynchronous stub DNS resolver.
//!
//! Owns the lifecycle of an outstanding query from dispatch through an
//! upstream server to completion, error, or retry exhaustion, multiplexing
//! many concurrent queries over a pool of UDP/TCP connections to a ranked
//! set of servers. See [`dns::channel::Channel`] for the entry point.

pub mod dns;
