//! Per-request context threaded through the filter chain.
//!
//! # Responsibilities
//! - Identify the downstream connection a request arrived on
//! - Carry the per-connection request number (1 for the first request)
//! - Carry typed side-channel values between filters
//! - Carry the CONNECT outcome from the interceptor to the relay stage
//!
//! # Design Decisions
//! - Derivation never mutates: `with_*` builds a new context, so a filter that
//!   captured an earlier context keeps seeing the earlier state
//! - The downstream transport is described, never owned
//! - An already dialed upstream is owned by the context until the relay takes it

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Extensions;
use tokio::sync::watch;

use crate::connect::BoxConn;
use crate::net::connection::ConnectionId;

/// Read-only description of the client connection.
#[derive(Debug, Clone)]
pub struct Downstream {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl Downstream {
    /// Describe a connection accepted from `peer_addr` on `local_addr`.
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
        }
    }
}

/// What the CONNECT interceptor hands to the relay stage.
pub enum ConnectOutcome {
    /// Dialing was deferred; the relay dials this `host:port` itself.
    Address(String),
    /// The origin was dialed before answering. The relay owns and closes it.
    Upstream(BoxConn),
}

impl ConnectOutcome {
    /// Target `host:port` when dialing was deferred.
    pub fn address(&self) -> Option<&str> {
        match self {
            ConnectOutcome::Address(addr) => Some(addr),
            ConnectOutcome::Upstream(_) => None,
        }
    }

    /// True when an already dialed upstream is attached.
    pub fn is_upstream(&self) -> bool {
        matches!(self, ConnectOutcome::Upstream(_))
    }
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Address(addr) => f.debug_tuple("Address").field(addr).finish(),
            ConnectOutcome::Upstream(_) => f.write_str("Upstream(..)"),
        }
    }
}

/// Ambient state for one request on one downstream connection.
pub struct Context {
    downstream: Arc<Downstream>,
    request_number: u64,
    extensions: Extensions,
    connect: Option<ConnectOutcome>,
    shutdown: watch::Receiver<bool>,
}

impl Context {
    /// Create the context for request `request_number` on `downstream`.
    pub fn new(
        downstream: Arc<Downstream>,
        request_number: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            downstream,
            request_number,
            extensions: Extensions::new(),
            connect: None,
            shutdown,
        }
    }

    /// A context that is not bound to a live connection and never shuts down.
    pub fn detached() -> Self {
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));
        let (_tx, rx) = watch::channel(false);
        Self::new(
            Arc::new(Downstream::new(ConnectionId::new(), unspecified, unspecified)),
            1,
            rx,
        )
    }

    /// The client connection this request arrived on.
    pub fn downstream(&self) -> &Downstream {
        &self.downstream
    }

    /// 1 for the first request on the connection, 2 for the second, and so on.
    pub fn request_number(&self) -> u64 {
        self.request_number
    }

    /// Derive a context carrying `value` in the side channel.
    pub fn with_value<T>(&self, value: T) -> Context
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut derived = self.derive();
        derived.extensions.insert(value);
        derived
    }

    /// Look up a side-channel value by type.
    pub fn value<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.extensions.get::<T>()
    }

    /// Derive a context carrying the CONNECT outcome.
    pub fn with_connect_outcome(&self, outcome: ConnectOutcome) -> Context {
        let mut derived = self.derive();
        derived.connect = Some(outcome);
        derived
    }

    /// Borrow the CONNECT outcome, if the interceptor recorded one.
    pub fn connect_outcome(&self) -> Option<&ConnectOutcome> {
        self.connect.as_ref()
    }

    /// Move the CONNECT outcome out. Only the stage that relays calls this.
    pub fn take_connect_outcome(&mut self) -> Option<ConnectOutcome> {
        self.connect.take()
    }

    /// True once the proxy has begun shutting down.
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once the proxy begins shutting down.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown.clone();
        async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender gone without signalling: never shutting down.
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    // An owned upstream cannot be shared, so derivations start without one.
    fn derive(&self) -> Context {
        Context {
            downstream: Arc::clone(&self.downstream),
            request_number: self.request_number,
            extensions: self.extensions.clone(),
            connect: match &self.connect {
                Some(ConnectOutcome::Address(addr)) => Some(ConnectOutcome::Address(addr.clone())),
                _ => None,
            },
            shutdown: self.shutdown.clone(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("downstream", &self.downstream)
            .field("request_number", &self.request_number)
            .field("connect", &self.connect)
            .finish_non_exhaustive()
    }
}
