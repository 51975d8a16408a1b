//! CONNECT tunnel subsystem.
//!
//! # Data Flow
//! ```text
//! CONNECT request
//!     → interceptor.rs (answer 200 now, or dial first and answer 200/502)
//!     → context carries ConnectOutcome (address or dialed upstream)
//!     → server flushes the response and upgrades the connection
//!     → relay.rs (dial if needed, then copy bytes both ways)
//! ```
//!
//! # Design Decisions
//! - Two policies: preemptive OK keeps clients trusting the proxy, waiting for
//!   the upstream lets clients fail over when the origin is unreachable
//! - The relay is the only stage that closes an upstream connection
//! - Relay buffers come from a pluggable [`BufferSource`]

pub mod buffer;
pub mod dial;
pub mod idle;
pub mod interceptor;
pub mod relay;

use tokio::io::{AsyncRead, AsyncWrite};

pub use buffer::{BufferSource, DefaultBufferSource, PooledBufferSource, MAX_DATA_LEN};
pub use dial::{dial_fn, Dialer, TcpDialer};
pub use idle::{idle_keep_alive_header, is_idled, IdleTimeoutConn, Idled};
pub use interceptor::ConnectInterceptor;
pub use relay::{Relay, RelayError};

/// A bidirectional byte stream: TCP, an upgraded HTTP connection, or a test double.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An owned connection whose concrete type is erased.
pub type BoxConn = Box<dyn Connection>;
