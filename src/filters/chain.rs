//! Filters and their continuation-passing composition.
//!
//! A [`Chain`] of `[f0, f1, .., fn-1]` run against a terminal `T` evaluates
//! `f0(ctx, req, next -> f1(ctx', req', next -> .. fn-1(.., T)))`. Each filter
//! sees the context and request produced by the stage before it. A filter that
//! returns without running its [`Next`] short-circuits everything after it.
//!
//! The chain never synthesizes or rewrites errors; whatever the executed
//! filter or terminal returned is what the caller gets.

use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Version};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;

use crate::error::Error;
use crate::filters::context::Context;

/// Result of running a filter: an optional response, the context as it stood
/// when processing stopped, and an optional error.
///
/// A response and an error may both be present (see [`fail`]).
#[derive(Debug)]
pub struct Outcome {
    pub response: Option<Response<Body>>,
    pub ctx: Context,
    pub error: Option<Error>,
}

impl Outcome {
    /// Outcome without an error.
    pub fn new(response: Option<Response<Body>>, ctx: Context) -> Self {
        Self {
            response,
            ctx,
            error: None,
        }
    }

    /// Status of the response, if there is one.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(Response::status)
    }
}

/// Intercepts a request and either passes it on through `next` or answers it.
pub trait Filter: Send + Sync {
    fn apply<'a>(&'a self, ctx: Context, req: Request<Body>, next: Next<'a>)
        -> BoxFuture<'a, Outcome>;
}

/// Where a chain ends when every filter passed the request on.
pub trait Terminal: Send + Sync {
    fn call<'a>(&'a self, ctx: Context, req: Request<Body>) -> BoxFuture<'a, Outcome>;
}

impl<F, Fut> Terminal for F
where
    F: Fn(Context, Request<Body>) -> Fut + Send + Sync,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    fn call<'a>(&'a self, ctx: Context, req: Request<Body>) -> BoxFuture<'a, Outcome> {
        Box::pin(self(ctx, req))
    }
}

/// Continuation handed to a filter. Running it invokes the rest of the chain.
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
    tail: Tail<'a>,
}

enum Tail<'a> {
    Terminal(&'a dyn Terminal),
    // Continuation of an enclosing chain when a chain is nested as a filter.
    Outer(Box<Next<'a>>),
}

impl<'a> Next<'a> {
    /// A continuation that goes straight to `terminal`.
    pub fn terminal(terminal: &'a dyn Terminal) -> Self {
        Self {
            filters: &[],
            tail: Tail::Terminal(terminal),
        }
    }

    /// Invoke the rest of the chain with the latest context and request.
    pub fn run(self, ctx: Context, req: Request<Body>) -> BoxFuture<'a, Outcome> {
        match self.filters.split_first() {
            Some((head, rest)) => head.apply(
                ctx,
                req,
                Next {
                    filters: rest,
                    tail: self.tail,
                },
            ),
            None => match self.tail {
                Tail::Terminal(terminal) => terminal.call(ctx, req),
                Tail::Outer(outer) => outer.run(ctx, req),
            },
        }
    }
}

/// Adapts a closure into a [`Filter`].
pub struct FilterFn<F>(F);

pub fn filter_fn<F>(f: F) -> FilterFn<F>
where
    F: for<'a> Fn(Context, Request<Body>, Next<'a>) -> BoxFuture<'a, Outcome> + Send + Sync,
{
    FilterFn(f)
}

impl<F> Filter for FilterFn<F>
where
    F: for<'a> Fn(Context, Request<Body>, Next<'a>) -> BoxFuture<'a, Outcome> + Send + Sync,
{
    fn apply<'a>(
        &'a self,
        ctx: Context,
        req: Request<Body>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        (self.0)(ctx, req, next)
    }
}

/// An ordered sequence of filters, itself usable as a filter.
#[derive(Clone, Default)]
pub struct Chain {
    filters: Vec<Arc<dyn Filter>>,
}

impl Chain {
    /// Build a chain from filters in execution order. Empty is a pass-through.
    pub fn join<I>(filters: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Filter>>,
    {
        Self {
            filters: filters.into_iter().collect(),
        }
    }

    /// New chain with `post` after the existing filters. `self` is unchanged.
    pub fn append<I>(&self, post: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Filter>>,
    {
        let post = post.into_iter();
        let mut filters = Vec::with_capacity(self.filters.len() + post.size_hint().0);
        filters.extend(self.filters.iter().cloned());
        filters.extend(post);
        Self { filters }
    }

    /// New chain with `pre` in front of the existing filters. `self` is unchanged.
    pub fn prepend(&self, pre: Arc<dyn Filter>) -> Self {
        let mut filters = Vec::with_capacity(self.filters.len() + 1);
        filters.push(pre);
        filters.extend(self.filters.iter().cloned());
        Self { filters }
    }

    /// Number of filters in the chain.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// True for a chain that passes straight through.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Entry point for the server loop: run the chain ending in `terminal`.
    pub fn run<'a>(
        &'a self,
        ctx: Context,
        req: Request<Body>,
        terminal: &'a dyn Terminal,
    ) -> BoxFuture<'a, Outcome> {
        Next {
            filters: &self.filters,
            tail: Tail::Terminal(terminal),
        }
        .run(ctx, req)
    }
}

impl Filter for Chain {
    fn apply<'a>(
        &'a self,
        ctx: Context,
        req: Request<Body>,
        next: Next<'a>,
    ) -> BoxFuture<'a, Outcome> {
        Next {
            filters: &self.filters,
            tail: Tail::Outer(Box::new(next)),
        }
        .run(ctx, req)
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain").field("len", &self.filters.len()).finish()
    }
}

/// Answer `req` with `resp` without running the rest of the chain.
///
/// The response takes the request's protocol version.
pub fn short_circuit<B>(ctx: Context, req: &Request<B>, mut resp: Response<Body>) -> Outcome {
    *resp.version_mut() = req.version();
    Outcome::new(Some(resp), ctx)
}

/// Answer `req` with `status` and `err`'s description as the body, and report
/// `err` alongside the response.
pub fn fail<B>(ctx: Context, req: &Request<B>, status: StatusCode, err: Error) -> Outcome {
    let mut resp = Response::new(Body::from(err.to_string()));
    *resp.status_mut() = status;
    *resp.version_mut() = req.version();
    Outcome {
        response: Some(resp),
        ctx,
        error: Some(err),
    }
}

/// Drop `req` on purpose without responding.
///
/// The body is drained before it is dropped; abandoning an unread body can
/// stall the connection it arrived on.
pub async fn discard(ctx: Context, req: Request<Body>) -> Outcome {
    let mut stream = req.into_body().into_data_stream();
    while let Some(chunk) = stream.next().await {
        if let Err(e) = chunk {
            tracing::trace!(error = %e, "Error draining discarded request body");
            break;
        }
    }
    Outcome::new(None, ctx)
}

/// Bodiless stand-in for a request that was already moved elsewhere, so
/// [`fail`] can still copy its protocol version.
pub(crate) fn request_head(version: Version) -> Request<()> {
    let mut head = Request::new(());
    *head.version_mut() = version;
    head
}
