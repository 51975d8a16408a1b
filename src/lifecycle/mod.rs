//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Ctrl+C / SIGTERM → Shutdown::trigger
//!     → server stops accepting
//!     → every Context reports is_shutting_down
//!     → connections drain (bounded by timeouts.drain_secs) → exit
//! ```

pub mod shutdown;

pub use shutdown::{signal_on_terminate, Shutdown};
