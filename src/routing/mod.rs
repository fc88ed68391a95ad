//! Connection registry and command router.
//!
//! # Data Flow
//! ```text
//! Command channel payload
//!     → router.rs (decode, validate, dispatch by command)
//!         Setup    → pool slot → registry.rs (fresh id, record) → worker started → reply
//!         Teardown → registry.rs (remove, signal stop) → reply
//!         other    → ERROR_ON_SYNTAX reply
//!     → reply published on the command's return channel
//! ```
//!
//! # Design Decisions
//! - The registry is the only state shared between the router and workers
//! - Identifiers are random, resampled on collision under the map's entry lock
//! - Teardown validation is strict (unknown id is a syntax error) while
//!   `handle_teardown` itself treats an unknown id as a no-op

pub mod registry;
pub mod router;

pub use registry::{ConnectionRecord, ConnectionRegistry};
pub use router::CommandRouter;
