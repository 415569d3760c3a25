//! Outrider Mapper - parallel batch mapping with bounded retries
//!
//! [`Mapper`] turns one finite list into one result list by splitting
//! the input into contiguous chunks, processing them on a fixed worker
//! pool, and retrying failed chunks up to a budget. The caller sees a
//! single blocking [`Mapper::get`] call; a chunk that exhausts its
//! retry budget fails the whole call and cancels the pool.

pub mod error;
pub mod factory;
pub mod mapper;

// Re-exports for convenience
pub use error::MapperError;
pub use factory::{ChunkTask, ChunkWorker, ChunkWorkerFactory, worker_factory};
pub use mapper::Mapper;
