//! Connection workers.
//!
//! # Data Flow
//! ```text
//! Data command channel (one subscription per connection)
//!     → worker.rs (decode, validate, single-file execution)
//!     → http::HttpExecutor (one request/response cycle)
//!     → populated command published on the data return channel
//!
//! Stop:
//!     record stop token cancelled → loop exits after the current command
//!     → both channels closed → registry entry released
//! ```
//!
//! # Design Decisions
//! - A command already running when stop arrives finishes and is answered
//! - Publish failures after the caller has gone are logged, never raised

pub mod worker;

pub use worker::ConnectionWorker;
