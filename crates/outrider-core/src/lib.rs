//! Outrider Core - Shared worker-pool abstractions
//!
//! This crate provides the worker/factory seam used by both engines:
//! the windowed sequential pipeline (`outrider-pipeline`) and the
//! parallel batch mapper (`outrider-mapper`). The engines own the
//! channels and scheduling; the pieces here let callers plug in the
//! actual fetching/transformation without the engines knowing anything
//! about clients, protocols, or payloads.

pub mod logging;
pub mod worker;

// Re-exports for convenience
pub use logging::init_logging;
pub use worker::{ERROR_PAUSE, TaskError, Worker, WorkerFactory, panic_error};
