//! Outrider Pipeline - windowed sequential prefetching
//!
//! A consumer that walks an increasing sequence of work items
//! (heights, offsets, page numbers) usually pays the full fetch
//! latency for every step. When the per-item fetches are independent
//! of each other, a pool of workers can compute them ahead of demand
//! while the consumer still reads results strictly in order.
//!
//! [`Pipeline`] does exactly that: [`Pipeline::get`] serves sequence
//! `s` from a bounded sliding window of finished results, dispatching
//! work for the sequences behind it to a fixed worker pool. Completion
//! order is arbitrary; a reorder stage delivers results to the window
//! in sequence order. The consumer contract is that requests never
//! regress: after `get(s)`, the next request is `s` again or anything
//! `>= s` still inside the window.

pub mod error;
pub mod factory;
pub mod pipeline;

// Re-exports for convenience
pub use error::PipelineError;
pub use factory::{SeqTask, SeqWorker, SeqWorkerFactory, worker_factory};
pub use pipeline::Pipeline;
