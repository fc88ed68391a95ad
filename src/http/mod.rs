//! HTTP execution subsystem.
//!
//! # Data Flow
//! ```text
//! DataCommand + Setup context (url, proxy)
//!     → executor.rs (open client, enforce step order, map failures)
//!     → request.rs (method check, headers, url path, input body)
//!     → reqwest round trip
//!     → response.rs (status line, headers, body rules)
//!     → response body published on the output channel
//!     → DataCommand populated with code / message / headers / status
//! ```
//!
//! # Design Decisions
//! - Each failure is mapped to one status at the point it occurs
//! - Cleanup (output channel close) runs on every path and never changes the status
//! - The whole response body is buffered and published as one message

pub mod executor;
pub mod request;
pub mod response;

pub use executor::{ExecutorError, HttpExecutor, ProxyTarget};
