//! Command protocol spoken over the message bus.
//!
//! # Data Flow
//! ```text
//! Caller publishes JSON on the command channel
//!     → message.rs (decode into CommandMessage::{Setup, Data, Teardown})
//!     → validation (field presence, registry membership)
//!     → routing / connection (execute)
//!     → status.rs (BridgeStatus written back into the same message)
//!     → message re-encoded and published on the caller's return channel
//! ```
//!
//! # Design Decisions
//! - One tagged enum for the finite command set; dispatch is an exhaustive `match`
//! - Replies are the request message mutated in place, so callers correlate by shape
//! - Field names keep the wire names existing callers already publish

pub mod message;
pub mod status;

pub use message::{
    syntax_error_payload, syntax_error_reply, CommandHeader, CommandMessage, ConnectionId, DataCommand, SetupCommand,
    TeardownCommand, ValidationError,
};
pub use status::BridgeStatus;
