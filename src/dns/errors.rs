//! Error taxonomy for the query-processing core
//!
//! `Status` is the outcome vocabulary threaded through the dispatcher,
//! reader, response handler and the query's completion callback — it is
//! the only error type callers of the core ever observe. `CoreError` is
//! the narrower set of failures collaborator implementations (codec,
//! transport, cache) raise internally; the core immediately folds those
//! down to the nearest `Status` at the point where a collaborator call
//! returns (see the mapping table in `dispatcher`/`reader`).

use derive_more::{Display, Error, From};

/// Outcome of a query attempt or of the query as a whole.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    NoMem,
    NoServer,
    ConnRefused,
    BadFamily,
    BadResp,
    Servfail,
    Notimp,
    Refused,
    Formerr,
    Timeout,
    Cancelled,
}

impl Status {
    pub fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }

    /// Maps a rejected/negative rcode from a response to the matching
    /// sticky `Status`. Only called for rcodes the caller has already
    /// confirmed are in `{SERVFAIL, NOTIMP, REFUSED}`.
    pub fn from_rcode(rcode: crate::dns::protocol::ResultCode) -> Status {
        use crate::dns::protocol::ResultCode;
        match rcode {
            ResultCode::SERVFAIL => Status::Servfail,
            ResultCode::NOTIMP => Status::Notimp,
            ResultCode::REFUSED => Status::Refused,
            _ => Status::Servfail,
        }
    }
}

/// Failures surfaced by collaborator implementations (codec parsing,
/// transport I/O, cache/cookie operations) before they are mapped to a
/// `Status` by the calling core component.
#[derive(Debug, Display, From, Error)]
pub enum CoreError {
    Io(std::io::Error),
    Protocol(crate::dns::protocol::ProtocolError),
    Buffer(crate::dns::buffer::BufferError),
    #[display(fmt = "connection would block")]
    WouldBlock,
    #[display(fmt = "no connection available")]
    NoConnection,
    #[display(fmt = "connection pool exhausted")]
    NoMem,
}

impl CoreError {
    /// Narrow an I/O-layer failure down to a `Status`. `WouldBlock` must
    /// never reach here — callers are required to special-case it before
    /// mapping.
    pub fn to_status(&self) -> Status {
        match self {
            CoreError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused => Status::ConnRefused,
                std::io::ErrorKind::AddrNotAvailable => Status::BadFamily,
                _ => Status::ConnRefused,
            },
            CoreError::Protocol(_) | CoreError::Buffer(_) => Status::BadResp,
            CoreError::NoConnection => Status::ConnRefused,
            CoreError::NoMem => Status::NoMem,
            CoreError::WouldBlock => {
                debug_assert!(false, "WouldBlock must be handled before status mapping");
                Status::ConnRefused
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::ResultCode;

    #[test]
    fn rcode_mapping() {
        assert_eq!(Status::from_rcode(ResultCode::SERVFAIL), Status::Servfail);
        assert_eq!(Status::from_rcode(ResultCode::NOTIMP), Status::Notimp);
        assert_eq!(Status::from_rcode(ResultCode::REFUSED), Status::Refused);
    }

    #[test]
    fn connection_refused_maps_to_conn_refused() {
        let err = CoreError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(err.to_status(), Status::ConnRefused);
    }
}
