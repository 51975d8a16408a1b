//! Request ID tagging.
//!
//! Ensures every request carries an `x-request-id` header (UUID v4 unless the
//! client already sent one) and records the ID in the context so later filters
//! and log lines can correlate on it.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use futures_util::future::BoxFuture;
use uuid::Uuid;

use crate::filters::chain::{Filter, Next, Outcome};
use crate::filters::context::Context;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request ID as stored in the context side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestIdFilter;

impl Filter for RequestIdFilter {
    fn apply<'a>(
        &'a self,
        ctx: Context,
        mut req: Request<Body>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        let existing = req
            .headers()
            .get(&X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let id = match existing {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    req.headers_mut().insert(X_REQUEST_ID, value);
                }
                id
            }
        };

        tracing::trace!(
            request_id = %id,
            connection_id = %ctx.downstream().id,
            request_number = ctx.request_number(),
            method = %req.method(),
            "Request tagged"
        );

        let ctx = ctx.with_value(RequestId(id));
        next.run(ctx, req)
    }
}
