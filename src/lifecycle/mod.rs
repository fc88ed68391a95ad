//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger → router stops reading commands
//!             → every live worker is signalled
//!             → pool drains, then aborts stragglers
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Shutdown has timeout: workers still running after the grace period are aborted
//! - Teardown of one connection is cooperative; shutdown of the engine is not

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
