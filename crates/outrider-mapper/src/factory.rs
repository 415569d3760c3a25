//! Task unit and factory helper for chunk workers

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, select};
use outrider_core::{ERROR_PAUSE, TaskError, Worker, WorkerFactory, panic_error};

/// The unit of work for one contiguous chunk of the input list.
///
/// The full input is shared behind an `Arc`; the task only names its
/// range. Workers fill `result`/`err`; the mapper owns the attempt
/// counter.
pub struct ChunkTask<T, R> {
    pub attempt: u32,
    pub start: usize,
    pub end: usize,
    pub total: usize,
    input: Arc<[T]>,
    pub result: Vec<R>,
    pub err: Option<TaskError>,
}

impl<T, R> ChunkTask<T, R> {
    pub(crate) fn new(input: Arc<[T]>, start: usize, end: usize, total: usize) -> Self {
        Self {
            attempt: 1,
            start,
            end,
            total,
            input,
            result: Vec::new(),
            err: None,
        }
    }

    /// The slice of the input this task covers.
    pub fn input(&self) -> &[T] {
        &self.input[self.start..self.end]
    }
}

/// Build a [`WorkerFactory`] from a per-slot client constructor and a
/// per-chunk business function.
///
/// Mirrors the pipeline helper: `next_client` runs once per slot,
/// `handle` maps one input chunk to one output chunk, failures are
/// annotated with the chunk range and paced by [`ERROR_PAUSE`] before
/// the task is handed back for retry accounting.
pub fn worker_factory<C, T, R, N, F>(
    label: impl Into<String>,
    next_client: N,
    handle: F,
) -> ChunkWorkerFactory<C, T, R, N, F>
where
    C: Send + 'static,
    T: Send + Sync + 'static,
    R: Send + 'static,
    N: Fn() -> Result<C, TaskError>,
    F: Fn(&mut C, &[T]) -> Result<Vec<R>, TaskError> + Clone + Send + 'static,
{
    ChunkWorkerFactory {
        label: label.into(),
        next_client,
        handle,
        _types: PhantomData,
    }
}

/// Factory produced by [`worker_factory`].
pub struct ChunkWorkerFactory<C, T, R, N, F> {
    label: String,
    next_client: N,
    handle: F,
    _types: PhantomData<fn() -> (C, T, R)>,
}

impl<C, T, R, N, F> WorkerFactory<ChunkTask<T, R>, ChunkTask<T, R>>
    for ChunkWorkerFactory<C, T, R, N, F>
where
    C: Send + 'static,
    T: Send + Sync + 'static,
    R: Send + 'static,
    N: Fn() -> Result<C, TaskError>,
    F: Fn(&mut C, &[T]) -> Result<Vec<R>, TaskError> + Clone + Send + 'static,
{
    type Worker = ChunkWorker<C, T, R, F>;

    fn build(&self) -> Result<Self::Worker, TaskError> {
        let client = (self.next_client)()?;
        Ok(ChunkWorker {
            label: self.label.clone(),
            client,
            handle: self.handle.clone(),
            _types: PhantomData,
        })
    }
}

/// Worker produced by [`ChunkWorkerFactory`].
pub struct ChunkWorker<C, T, R, F> {
    label: String,
    client: C,
    handle: F,
    _types: PhantomData<fn() -> (T, R)>,
}

impl<C, T, R, F> Worker<ChunkTask<T, R>, ChunkTask<T, R>> for ChunkWorker<C, T, R, F>
where
    C: Send + 'static,
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: Fn(&mut C, &[T]) -> Result<Vec<R>, TaskError> + Send + 'static,
{
    fn run(
        mut self,
        inputs: Receiver<ChunkTask<T, R>>,
        outputs: Sender<ChunkTask<T, R>>,
        cancel: Receiver<()>,
    ) {
        loop {
            let mut task = select! {
                recv(cancel) -> _ => return,
                recv(inputs) -> msg => match msg {
                    Ok(task) => task,
                    Err(_) => return,
                },
            };

            let start = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (self.handle)(&mut self.client, task.input())
            }));
            log::debug!(
                "{}: {}~{} of {} in {:?}",
                self.label,
                task.start,
                task.end,
                task.total,
                start.elapsed()
            );

            match outcome {
                Ok(Ok(result)) => {
                    task.result = result;
                    task.err = None;
                }
                Ok(Err(e)) => {
                    task.result.clear();
                    task.err =
                        Some(format!("{}~{} of {}: {e}", task.start, task.end, task.total).into());
                }
                Err(payload) => {
                    task.result.clear();
                    task.err = Some(panic_error(payload));
                }
            }
            if task.err.is_some() {
                std::thread::sleep(ERROR_PAUSE);
            }

            select! {
                send(outputs, task) -> res => {
                    if res.is_err() {
                        return;
                    }
                }
                recv(cancel) -> _ => return,
            }
        }
    }
}
