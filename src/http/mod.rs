//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (net::Listener)
//!     → server.rs (hyper HTTP/1.1, one Context per request)
//!     → filter chain: RequestIdFilter → user filters → ConnectInterceptor
//!     → forward.rs (plain requests sent on to the origin)
//!     → CONNECT 2xx: upgrade, then connect::Relay copies bytes both ways
//! ```

pub mod forward;
pub mod server;

pub use forward::Forwarder;
pub use server::ProxyServer;
