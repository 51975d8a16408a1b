//! Filtering forward proxy with CONNECT tunnelling.
//!
//! Requests pass through an ordered [`filters::Chain`] of filters that can
//! answer, discard, or pass them on. The [`connect::ConnectInterceptor`]
//! turns CONNECT requests into tunnels relayed by [`connect::Relay`].

pub mod config;
pub mod connect;
pub mod error;
pub mod filters;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use error::{Error, Result};
pub use http::ProxyServer;
pub use lifecycle::Shutdown;
