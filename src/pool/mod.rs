//! Bounded executor pool for connection workers.
//!
//! # Data Flow
//! ```text
//! Router (setup)
//!     → WorkerPool::reserve()      waits while every slot is busy
//!     → WorkerPool::spawn(slot, …) runs the worker inside a span, catching panics
//!     → worker exits               slot returns to the pool
//!
//! Shutdown:
//!     close()  → further reservations fail
//!     drain    → wait up to the grace period, then abort what is left
//! ```
//!
//! # Design Decisions
//! - Zero queue: a reservation is a running slot, so saturation blocks the submitter
//!   instead of dropping work
//! - Per-task context (span, panic guard) is a wrapper on the submission path

pub mod bounded;

pub use bounded::{PoolError, PoolSlot, WorkerPool};
