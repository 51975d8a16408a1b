//! HTTP proxy server.
//!
//! # Responsibilities
//! - Accept downstream connections and serve HTTP/1.1 on them
//! - Build one [`Context`] per request, numbered per connection
//! - Run the filter chain, ending in the [`Forwarder`]
//! - Hand CONNECT tunnels to the relay once the 2xx response is written
//! - Stop accepting on shutdown, then drain open connections
//!
//! # Design Decisions
//! - A chain that produces no response closes the connection
//! - The downstream transport carries the idle deadline, so tunnels and
//!   keep-alive connections idle out alike
//! - Tunnels hold the connection's permit and guard until the relay ends

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::config::ProxyConfig;
use crate::connect::idle::add_idle_keep_alive;
use crate::connect::{BoxConn, ConnectInterceptor, IdleTimeoutConn, Relay};
use crate::error::Error;
use crate::filters::{Chain, ConnectOutcome, Context, Downstream, Filter, RequestIdFilter};
use crate::http::forward::Forwarder;
use crate::lifecycle::Shutdown;
use crate::net::{ConnectionGuard, ConnectionPermit, ConnectionTracker, Listener, ListenerError};

/// Forward proxy: plain HTTP forwarding plus CONNECT tunnels.
pub struct ProxyServer {
    filters: Chain,
    interceptor: ConnectInterceptor,
    forwarder: Forwarder,
    idle_timeout: Duration,
    drain_timeout: Duration,
    tracker: ConnectionTracker,
    shutdown: Shutdown,
}

impl ProxyServer {
    /// Build the proxy from configuration; `shutdown` stops it.
    pub fn new(config: &ProxyConfig, shutdown: Shutdown) -> Self {
        Self {
            filters: Chain::default(),
            interceptor: ConnectInterceptor::from_config(&config.connect, &config.timeouts),
            forwarder: Forwarder::new(),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            drain_timeout: Duration::from_secs(config.timeouts.drain_secs),
            tracker: ConnectionTracker::new(),
            shutdown,
        }
    }

    /// Replace the CONNECT interceptor, e.g. to dial through another transport.
    pub fn with_interceptor(mut self, interceptor: ConnectInterceptor) -> Self {
        self.interceptor = interceptor;
        self
    }

    /// Add a filter that runs after request ID assignment and before CONNECT
    /// interception. Filters run in the order they were added.
    pub fn with_filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters = self.filters.append([filter]);
        self
    }

    /// Tracker of open downstream connections.
    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Serve `listener` until shutdown is triggered, then drain.
    pub async fn run(self, listener: Listener) -> Result<(), ListenerError> {
        let addr = listener.local_addr().ok();
        tracing::info!(address = ?addr, "Proxy server starting");

        let chain = Chain::join([
            Arc::new(RequestIdFilter) as Arc<dyn Filter>,
            Arc::new(self.filters.clone()) as Arc<dyn Filter>,
            Arc::new(self.interceptor.clone()) as Arc<dyn Filter>,
        ]);
        let shared = Arc::new(Shared {
            relay: self.interceptor.relay(),
            chain,
            forwarder: self.forwarder,
            idle_timeout: self.idle_timeout,
            shutdown: self.shutdown.clone(),
        });

        let result = loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.shutdown.triggered() => break Ok(()),
            };
            let (stream, peer_addr, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(e) => break Err(e),
            };

            let held = Arc::new(Held {
                _permit: permit,
                guard: self.tracker.track(),
            });
            tokio::spawn(Arc::clone(&shared).serve_connection(stream, peer_addr, held));
        };
        drop(listener);

        tracing::info!(
            active_connections = self.tracker.active_count(),
            "Proxy server draining"
        );
        if tokio::time::timeout(self.drain_timeout, self.tracker.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                active_connections = self.tracker.active_count(),
                "Drain deadline passed with connections still open"
            );
        }
        tracing::info!("Proxy server stopped");
        result
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("filters", &self.filters)
            .field("interceptor", &self.interceptor)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// Resources that live as long as any part of a connection does.
struct Held {
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
}

struct Shared {
    chain: Chain,
    forwarder: Forwarder,
    relay: Relay,
    idle_timeout: Duration,
    shutdown: Shutdown,
}

impl Shared {
    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, held: Arc<Held>) {
        let id = held.guard.id();
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!(connection_id = %id, error = %e, "Connection gone before serving");
                return;
            }
        };
        let downstream = Arc::new(Downstream::new(id, peer_addr, local_addr));
        let io: BoxConn = if self.idle_timeout.is_zero() {
            Box::new(stream)
        } else {
            Box::new(IdleTimeoutConn::new(stream, self.idle_timeout))
        };

        let requests = Arc::new(AtomicU64::new(0));
        let service = {
            let shared = Arc::clone(&self);
            let held = Arc::clone(&held);
            service_fn(move |mut req: Request<Incoming>| {
                let shared = Arc::clone(&shared);
                let held = Arc::clone(&held);
                let ctx = Context::new(
                    Arc::clone(&downstream),
                    requests.fetch_add(1, Ordering::Relaxed) + 1,
                    shared.shutdown.subscribe(),
                );
                let on_upgrade = (req.method() == Method::CONNECT).then(|| hyper::upgrade::on(&mut req));
                async move { shared.handle(ctx, req.map(Body::new), on_upgrade, held).await }
            })
        };

        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        tokio::pin!(conn);

        let result = tokio::select! {
            res = conn.as_mut() => res,
            _ = self.shutdown.triggered() => {
                conn.as_mut().graceful_shutdown();
                conn.await
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection_id = %id, error = %e, "Connection ended with error");
        }
    }

    async fn handle(
        &self,
        ctx: Context,
        req: Request<Body>,
        on_upgrade: Option<OnUpgrade>,
        held: Arc<Held>,
    ) -> Result<Response<Body>, Error> {
        let connection_id = ctx.downstream().id;
        let request_number = ctx.request_number();
        let method = req.method().clone();

        let mut outcome = self.chain.run(ctx, req, &self.forwarder).await;
        if let Some(err) = &outcome.error {
            tracing::debug!(
                connection_id = %connection_id,
                request_number,
                error = %err,
                "Filter chain reported error"
            );
        }
        let Some(mut response) = outcome.response.take() else {
            tracing::debug!(connection_id = %connection_id, request_number, "Request discarded, closing connection");
            return Err(Error::Discarded);
        };

        if method == Method::CONNECT && response.status().is_success() {
            match (on_upgrade, outcome.ctx.take_connect_outcome()) {
                (Some(on_upgrade), Some(connect)) => {
                    tokio::spawn(tunnel(on_upgrade, connect, self.relay.clone(), held));
                }
                (_, connect) => {
                    tracing::debug!(connection_id = %connection_id, outcome = ?connect, "CONNECT answered without a tunnel");
                }
            }
        } else {
            add_idle_keep_alive(response.headers_mut(), self.idle_timeout);
        }
        Ok(response)
    }
}

async fn tunnel(on_upgrade: OnUpgrade, connect: ConnectOutcome, relay: Relay, held: Arc<Held>) {
    let connection_id = held.guard.id();
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            tracing::debug!(connection_id = %connection_id, error = %e, "CONNECT upgrade failed");
            return;
        }
    };
    let mut downstream = TokioIo::new(upgraded);

    let result = match connect {
        ConnectOutcome::Upstream(upstream) => relay
            .copy(upstream, &mut downstream)
            .await
            .map_err(Error::from),
        ConnectOutcome::Address(addr) => relay.dial_and_copy(&addr, &mut downstream).await,
    };
    match result {
        Ok(()) => tracing::debug!(connection_id = %connection_id, "Tunnel finished"),
        Err(e) => tracing::warn!(connection_id = %connection_id, error = %e, "Tunnel failed"),
    }
}

