//! CONNECT handshake policy.
//!
//! # Policies
//! ```text
//! preemptive OK (ok_waits_for_upstream = false):
//!     CONNECT → 200 OK, context carries Address(host:port), dial happens in the relay
//!
//! wait for upstream (ok_waits_for_upstream = true):
//!     CONNECT → dial → ok:   200 OK, context carries Upstream(conn)
//!                    → fail: 502 Bad Gateway with the dial error as body
//! ```
//!
//! Some user agents treat any non-200 answer to CONNECT as a broken proxy and
//! stop using it, so preemptive OK never sends one. Waiting for the upstream
//! costs a round trip but lets a client fail over to another proxy that can
//! reach the origin.
//!
//! The target always comes from the request's authority-form URI, never the
//! `Host` header; clients disagree about the two for CONNECT.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;

use crate::config::{ConnectConfig, TimeoutConfig};
use crate::connect::buffer::{BufferSource, DefaultBufferSource, PooledBufferSource};
use crate::connect::dial::{Dialer, TcpDialer};
use crate::connect::idle::idle_keep_alive_header;
use crate::connect::relay::Relay;
use crate::error::Error;
use crate::filters::chain::{fail, short_circuit, Filter, Next, Outcome};
use crate::filters::context::{ConnectOutcome, Context};
use crate::observability::metrics;

/// Answers CONNECT requests according to the configured policy. Other
/// methods pass through untouched.
///
/// Shared read-only by every connection of one proxy.
#[derive(Clone)]
pub struct ConnectInterceptor {
    ok_waits_for_upstream: bool,
    idle_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    buffers: Arc<dyn BufferSource>,
}

impl ConnectInterceptor {
    /// Preemptive-OK interceptor using `dialer` and fresh relay buffers.
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            ok_waits_for_upstream: false,
            idle_timeout: Duration::ZERO,
            dialer,
            buffers: Arc::new(DefaultBufferSource),
        }
    }

    /// Build from configuration: TCP dialing with the configured timeouts and
    /// a buffer pool when `buffer_pool_size` is non-zero.
    pub fn from_config(connect: &ConnectConfig, timeouts: &TimeoutConfig) -> Self {
        let idle_timeout = Duration::from_secs(timeouts.idle_secs);
        let dialer = TcpDialer::new(Duration::from_secs(timeouts.connect_secs))
            .with_idle_timeout(idle_timeout);
        let buffers: Arc<dyn BufferSource> = if connect.buffer_pool_size > 0 {
            Arc::new(PooledBufferSource::new(connect.buffer_pool_size))
        } else {
            Arc::new(DefaultBufferSource)
        };

        Self::new(Arc::new(dialer))
            .ok_waits_for_upstream(connect.ok_waits_for_upstream)
            .idle_timeout(idle_timeout)
            .buffer_source(buffers)
    }

    /// Dial the origin before answering CONNECT (502 on failure).
    pub fn ok_waits_for_upstream(mut self, wait: bool) -> Self {
        self.ok_waits_for_upstream = wait;
        self
    }

    /// Idle timeout advertised in the `Keep-Alive` header.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Buffers used by relays created from this interceptor.
    pub fn buffer_source(mut self, buffers: Arc<dyn BufferSource>) -> Self {
        self.buffers = buffers;
        self
    }

    /// Whether CONNECT is answered only after a successful dial.
    pub fn waits_for_upstream(&self) -> bool {
        self.ok_waits_for_upstream
    }

    /// Relay sharing this interceptor's dialer and buffers.
    pub fn relay(&self) -> Relay {
        Relay::new(Arc::clone(&self.dialer), Arc::clone(&self.buffers))
    }

    /// `Keep-Alive` header for responses on persistent connections.
    pub fn idle_keep_alive_header(&self) -> HeaderMap {
        idle_keep_alive_header(self.idle_timeout)
    }

    async fn intercept(&self, ctx: Context, req: Request<Body>) -> Outcome {
        let Some(addr) = req.uri().authority().map(|a| a.as_str().to_owned()) else {
            let target = req.uri().to_string();
            tracing::debug!(target = %target, "CONNECT without authority-form target");
            return fail(ctx, &req, StatusCode::BAD_REQUEST, Error::InvalidTarget(target));
        };

        if !self.ok_waits_for_upstream {
            metrics::record_connect("preemptive");
            tracing::debug!(
                addr = %addr,
                connection_id = %ctx.downstream().id,
                "Answering CONNECT before dialing upstream"
            );
            let mut outcome = short_circuit(ctx, &req, ok());
            outcome.ctx = outcome.ctx.with_connect_outcome(ConnectOutcome::Address(addr));
            return outcome;
        }

        metrics::record_connect("wait_for_upstream");
        match self.dialer.dial(true, "tcp", &addr).await {
            Ok(upstream) => {
                tracing::debug!(
                    addr = %addr,
                    connection_id = %ctx.downstream().id,
                    "Upstream dialed, answering CONNECT"
                );
                let mut outcome = short_circuit(ctx, &req, ok());
                outcome.ctx = outcome.ctx.with_connect_outcome(ConnectOutcome::Upstream(upstream));
                outcome
            }
            Err(source) => {
                metrics::record_dial_failure();
                bad_gateway(ctx, &req, Error::Dial { addr, source })
            }
        }
    }
}

impl Filter for ConnectInterceptor {
    fn apply<'a>(
        &'a self,
        ctx: Context,
        req: Request<Body>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        if req.method() != Method::CONNECT {
            return next.run(ctx, req);
        }
        Box::pin(self.intercept(ctx, req))
    }
}

impl std::fmt::Debug for ConnectInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectInterceptor")
            .field("ok_waits_for_upstream", &self.ok_waits_for_upstream)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

fn ok() -> Response<Body> {
    Response::new(Body::empty())
}

fn bad_gateway(ctx: Context, req: &Request<Body>, err: Error) -> Outcome {
    tracing::debug!(error = %err, "Responding BadGateway");
    fail(ctx, req, StatusCode::BAD_GATEWAY, err)
}
