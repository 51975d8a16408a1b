//! Request interception subsystem.
//!
//! # Data Flow
//! ```text
//! server loop (per request)
//!     → context.rs (connection identity, request number, side channel)
//!     → chain.rs (filters run in order, each may short-circuit)
//!     → request_id.rs, connect interceptor, embedder filters ...
//!     → terminal (forward upstream) unless a filter answered first
//! ```
//!
//! # Design Decisions
//! - Continuation passing: a filter decides whether the rest of the chain runs
//! - Contexts are derived, never mutated in place
//! - Filters report errors next to responses; the chain passes both through

pub mod chain;
pub mod context;
pub mod request_id;

pub use chain::{discard, fail, filter_fn, short_circuit, Chain, Filter, FilterFn, Next, Outcome, Terminal};
pub use context::{ConnectOutcome, Context, Downstream};
pub use request_id::{RequestId, RequestIdFilter, X_REQUEST_ID};
