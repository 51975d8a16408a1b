//! Chain terminal that forwards plain proxy requests to their origin.
//!
//! # Responsibilities
//! - Require absolute-form targets (`GET http://host/path`)
//! - Strip hop-by-hop headers before forwarding
//! - Map transport failures to 502 with the error kept on the outcome

use axum::body::Body;
use axum::http::{header, HeaderName, Request, StatusCode};
use futures_util::future::BoxFuture;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::Error;
use crate::filters::chain::{fail, request_head, short_circuit, Outcome, Terminal};
use crate::filters::context::Context;

const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Forwards requests with a pooled HTTP/1 client.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
}

impl Forwarder {
    /// Create a forwarder with its own connection pool.
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    async fn forward(&self, ctx: Context, mut req: Request<Body>) -> Outcome {
        if req.uri().scheme().is_none() || req.uri().authority().is_none() {
            let target = req.uri().to_string();
            tracing::debug!(target = %target, method = %req.method(), "Rejecting non-proxy request");
            return fail(ctx, &req, StatusCode::BAD_REQUEST, Error::InvalidTarget(target));
        }

        strip_hop_by_hop(&mut req);
        let version = req.version();
        tracing::debug!(
            connection_id = %ctx.downstream().id,
            method = %req.method(),
            uri = %req.uri(),
            "Forwarding request"
        );

        match self.client.request(req).await {
            Ok(resp) => short_circuit(ctx, &request_head(version), resp.map(Body::new)),
            Err(e) => {
                tracing::warn!(error = %e, "Upstream request failed");
                fail(ctx, &request_head(version), StatusCode::BAD_GATEWAY, Error::Upstream(e))
            }
        }
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal for Forwarder {
    fn call<'a>(&'a self, ctx: Context, req: Request<Body>) -> BoxFuture<'a, Outcome> {
        Box::pin(self.forward(ctx, req))
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder").finish_non_exhaustive()
    }
}

fn strip_hop_by_hop<B>(req: &mut Request<B>) {
    let headers = req.headers_mut();
    // Headers named in Connection are hop-by-hop too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP) {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
    headers.remove("keep-alive");
}
