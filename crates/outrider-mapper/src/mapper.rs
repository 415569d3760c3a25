//! The parallel batch mapper engine

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::bounded;
use outrider_core::{Worker, WorkerFactory};

use crate::error::MapperError;
use crate::factory::ChunkTask;

/// Parallel batch mapper: one call maps one finite list through a
/// worker pool, chunk by chunk, with bounded per-chunk retries.
///
/// `concurrent` is floored at 1, `split` (chunk size) at 1 and
/// `max_try` at 1; `redundancy` adds queue capacity on top of
/// `concurrent` so finished workers always find the next chunk waiting.
/// An instance serves at most one [`get`](Mapper::get) at a time.
pub struct Mapper<T, R, F> {
    factory: F,
    concurrent: usize,
    split: usize,
    max_try: u32,
    work_length: usize,
    gate: Mutex<()>,
    _types: PhantomData<fn(Vec<T>) -> Vec<R>>,
}

impl<T, R, F> Mapper<T, R, F>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: WorkerFactory<ChunkTask<T, R>, ChunkTask<T, R>>,
{
    pub fn new(
        concurrent: usize,
        redundancy: usize,
        split: usize,
        max_try: u32,
        factory: F,
    ) -> Self {
        let concurrent = concurrent.max(1);
        let split = split.max(1);
        let max_try = max_try.max(1);
        Self {
            factory,
            concurrent,
            split,
            max_try,
            work_length: concurrent + redundancy,
            gate: Mutex::new(()),
            _types: PhantomData,
        }
    }

    /// Map `list` through the worker pool and return all results.
    ///
    /// Fails with [`MapperError::InUse`] if another `get` on this
    /// instance is still running, and with [`MapperError::Chunk`] once
    /// any chunk exceeds `max_try` attempts (which cancels the whole
    /// pool). Results are appended in chunk completion order; chunks
    /// are dispatched from a strictly increasing offset and a failed
    /// chunk is retried rather than duplicated, so each offset appears
    /// exactly once.
    pub fn get(&self, list: Vec<T>) -> Result<Vec<R>, MapperError> {
        if list.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.gate.try_lock().map_err(|_| MapperError::InUse)?;

        let start = Instant::now();
        let total = list.len();
        let result = self.run_batch(list.into());
        log::info!("mapper: {total} items in {:?}", start.elapsed());
        result
    }

    fn run_batch(&self, input: Arc<[T]>) -> Result<Vec<R>, MapperError> {
        let total = input.len();
        let (inputs_tx, inputs_rx) = bounded(self.work_length);
        let (outputs_tx, outputs_rx) = bounded(self.work_length);
        // Dropping cancel_tx fires every worker's cancel select.
        let (cancel_tx, cancel_rx) = bounded::<()>(0);

        // Build every worker before dispatching anything; a factory
        // failure aborts the call with no work started.
        let mut workers = Vec::with_capacity(self.concurrent);
        for _ in 0..self.concurrent {
            match self.factory.build() {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    drop(cancel_tx);
                    return Err(MapperError::Build(e));
                }
            }
        }

        // Preload the queue up to its capacity.
        let mut cursor = 0usize;
        for _ in 0..self.work_length {
            if cursor >= total {
                break;
            }
            let end = (cursor + self.split).min(total);
            let _ = inputs_tx.send(ChunkTask::new(Arc::clone(&input), cursor, end, total));
            cursor += self.split;
        }

        for worker in workers {
            let inputs = inputs_rx.clone();
            let outputs = outputs_tx.clone();
            let cancel = cancel_rx.clone();
            thread::spawn(move || worker.run(inputs, outputs, cancel));
        }
        // The workers hold the only output senders now; if they all
        // exit early the drain loop sees the disconnect instead of
        // hanging.
        drop(outputs_tx);

        let mut results: Vec<R> = Vec::with_capacity(total);
        loop {
            let mut task = match outputs_rx.recv() {
                Ok(task) => task,
                Err(_) => {
                    drop(cancel_tx);
                    return Err(MapperError::PoolStopped);
                }
            };
            task.attempt += 1;
            if let Some(err) = task.err.take() {
                log::error!(
                    "chunk {}~{} of {}: {err}",
                    task.start,
                    task.end,
                    task.total
                );
                if task.attempt > self.max_try {
                    drop(cancel_tx);
                    return Err(MapperError::Chunk {
                        start: task.start,
                        end: task.end,
                        total: task.total,
                        attempts: self.max_try,
                        source: err,
                    });
                }
                task.result.clear();
                let _ = inputs_tx.send(task);
                continue;
            }

            results.append(&mut task.result);
            if cursor >= total {
                if results.len() >= total {
                    break;
                }
                continue;
            }
            let end = (cursor + self.split).min(total);
            let _ = inputs_tx.send(ChunkTask::new(Arc::clone(&input), cursor, end, total));
            cursor += self.split;
        }

        Ok(results)
    }
}
