//! Metrics collaborator
//!
//! Per-server smoothed RTT feeding `calc_query_timeout`, plus
//! completion counters exported under the same series names this
//! crate's Prometheus-based operational dashboards already expect.

use lazy_static::lazy_static;
use prometheus::{register_histogram, register_int_counter_vec, Histogram, IntCounterVec};

use crate::dns::clock::Timeval;
use crate::dns::errors::Status;
use crate::dns::protocol::DnsPacket;
use crate::dns::query::Query;
use crate::dns::registry::{Server, ServerId};

lazy_static! {
    static ref UPSTREAM_QUERY_DURATION_MS: Histogram = register_histogram!(
        "dns_upstream_query_duration_ms",
        "Upstream DNS query round-trip time in milliseconds"
    )
    .unwrap();
    static ref UPSTREAM_QUERY_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dns_upstream_query_total",
        "Total upstream DNS queries by outcome status",
        &["status"]
    )
    .unwrap();
}

/// `server_timeout`/`record`. `record`'s `now` is the real clock sample
/// taken at completion time, used to measure the query's actual
/// round-trip against `query.ts` (its first send time) rather than its
/// timeout window.
pub trait Metrics: Send + Sync {
    fn server_timeout(&self, server: &Server, now: Timeval) -> u64;
    fn record(&self, query: &Query, server: Option<&Server>, now: Timeval, status: Status, response: Option<&DnsPacket>);
}

/// Exponentially-weighted moving average of per-server RTT, combined
/// with process-wide Prometheus counters.
pub struct EwmaMetrics {
    rtt_by_server: parking_lot::RwLock<std::collections::HashMap<ServerId, f64>>,
    base_timeout_ms: u64,
    min_timeout_ms: u64,
    max_timeout_ms: u64,
    alpha: f64,
}

impl Default for EwmaMetrics {
    fn default() -> Self {
        EwmaMetrics::new(2_000, 200, 30_000, 0.3)
    }
}

impl EwmaMetrics {
    pub fn new(base_timeout_ms: u64, min_timeout_ms: u64, max_timeout_ms: u64, alpha: f64) -> EwmaMetrics {
        EwmaMetrics {
            rtt_by_server: parking_lot::RwLock::new(std::collections::HashMap::new()),
            base_timeout_ms,
            min_timeout_ms,
            max_timeout_ms,
            alpha,
        }
    }

    fn observe_rtt(&self, server: ServerId, rtt_ms: f64) {
        let mut table = self.rtt_by_server.write();
        let entry = table.entry(server).or_insert(self.base_timeout_ms as f64);
        *entry = self.alpha * rtt_ms + (1.0 - self.alpha) * *entry;
    }
}

impl Metrics for EwmaMetrics {
    /// Returns the base timeout `calc_query_timeout` doubles per retry
    /// round: twice the current smoothed RTT for the server, clamped to
    /// `[min_timeout_ms, max_timeout_ms]`, or `base_timeout_ms` if no
    /// sample has been observed yet.
    fn server_timeout(&self, server: &Server, _now: Timeval) -> u64 {
        let estimate = self
            .rtt_by_server
            .read()
            .get(&server.id)
            .copied()
            .unwrap_or(self.base_timeout_ms as f64);

        let timeout = (estimate * 2.0) as u64;
        timeout.clamp(self.min_timeout_ms, self.max_timeout_ms)
    }

    fn record(&self, query: &Query, server: Option<&Server>, now: Timeval, status: Status, _response: Option<&DnsPacket>) {
        let elapsed_ms = {
            let ts = query.ts;
            let secs = now.secs.saturating_sub(ts.secs) as f64 * 1000.0;
            let micros = now.micros as f64 - ts.micros as f64;
            (secs + micros / 1000.0).max(0.0)
        };

        UPSTREAM_QUERY_DURATION_MS.observe(elapsed_ms);
        UPSTREAM_QUERY_TOTAL
            .with_label_values(&[status_label(status)])
            .inc();

        if status.is_success() {
            if let Some(server) = server {
                self.observe_rtt(server.id, elapsed_ms);
            }
        }

        log::debug!("query {:?} finished with status {:?} in {:.1}ms", query.qid, status, elapsed_ms);
    }
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Success => "success",
        Status::NoMem => "nomem",
        Status::NoServer => "no_server",
        Status::ConnRefused => "conn_refused",
        Status::BadFamily => "bad_family",
        Status::BadResp => "bad_resp",
        Status::Servfail => "servfail",
        Status::Notimp => "notimp",
        Status::Refused => "refused",
        Status::Formerr => "formerr",
        Status::Timeout => "timeout",
        Status::Cancelled => "cancelled",
    }
}
