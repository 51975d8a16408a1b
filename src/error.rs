//! Crate-level error type.
//!
//! Filters report failures through [`Error`] alongside whatever response they
//! chose to emit, so every variant renders a description that is safe to hand
//! back to a client as a response body.

use std::io;

use crate::connect::relay::RelayError;

/// Errors produced by filters, the CONNECT interceptor, and the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Dialing the origin failed.
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The request target could not be used (e.g. CONNECT without authority).
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// Forwarding a plain HTTP request upstream failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The tunnel relay reported a transport failure.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The filter chain discarded the request without producing a response.
    #[error("request discarded")]
    Discarded,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
