//! Task unit and factory helper for sequence workers

use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, select};
use outrider_core::{ERROR_PAUSE, TaskError, Worker, WorkerFactory, panic_error};

/// The unit of work flowing from workers to the collector: one
/// sequence number with its outcome filled in.
pub struct SeqTask<R> {
    pub sequence: i64,
    pub result: Option<R>,
    pub err: Option<TaskError>,
}

/// Build a [`WorkerFactory`] from a per-slot client constructor and a
/// per-sequence business function.
///
/// `next_client` runs once per pool slot, so every worker owns a
/// private client that never crosses thread boundaries. `handle` does
/// the actual fetch/transform for one sequence number. `label` names
/// the worker body in log lines.
///
/// The built worker loops until its input channel disconnects or the
/// pipeline cancels it. After a failed task it sleeps [`ERROR_PAUSE`]
/// so a permanently failing sequence does not flood the log; the
/// pipeline retries failed sequences without limit.
pub fn worker_factory<C, R, N, F>(
    label: impl Into<String>,
    next_client: N,
    handle: F,
) -> SeqWorkerFactory<C, R, N, F>
where
    C: Send + 'static,
    R: Send + 'static,
    N: Fn() -> Result<C, TaskError>,
    F: Fn(&mut C, i64) -> Result<R, TaskError> + Clone + Send + 'static,
{
    SeqWorkerFactory {
        label: label.into(),
        next_client,
        handle,
        _types: PhantomData,
    }
}

/// Factory produced by [`worker_factory`].
pub struct SeqWorkerFactory<C, R, N, F> {
    label: String,
    next_client: N,
    handle: F,
    _types: PhantomData<fn() -> (C, R)>,
}

impl<C, R, N, F> WorkerFactory<i64, SeqTask<R>> for SeqWorkerFactory<C, R, N, F>
where
    C: Send + 'static,
    R: Send + 'static,
    N: Fn() -> Result<C, TaskError>,
    F: Fn(&mut C, i64) -> Result<R, TaskError> + Clone + Send + 'static,
{
    type Worker = SeqWorker<C, R, F>;

    fn build(&self) -> Result<Self::Worker, TaskError> {
        let client = (self.next_client)()?;
        Ok(SeqWorker {
            label: self.label.clone(),
            client,
            handle: self.handle.clone(),
            _result: PhantomData,
        })
    }
}

/// Worker produced by [`SeqWorkerFactory`]: owns its client and the
/// shared business function.
pub struct SeqWorker<C, R, F> {
    label: String,
    client: C,
    handle: F,
    _result: PhantomData<fn() -> R>,
}

impl<C, R, F> Worker<i64, SeqTask<R>> for SeqWorker<C, R, F>
where
    C: Send + 'static,
    R: Send + 'static,
    F: Fn(&mut C, i64) -> Result<R, TaskError> + Send + 'static,
{
    fn run(
        mut self,
        inputs: Receiver<i64>,
        outputs: Sender<SeqTask<R>>,
        cancel: Receiver<()>,
    ) {
        loop {
            let sequence = select! {
                recv(cancel) -> _ => return,
                recv(inputs) -> msg => match msg {
                    Ok(s) => s,
                    Err(_) => return,
                },
            };

            log::debug!("{}: try get {sequence}", self.label);
            let start = Instant::now();
            let outcome =
                catch_unwind(AssertUnwindSafe(|| (self.handle)(&mut self.client, sequence)));
            log::debug!("{}: {sequence} done in {:?}", self.label, start.elapsed());

            let (result, err) = match outcome {
                Ok(Ok(r)) => (Some(r), None),
                Ok(Err(e)) => (None, Some(e)),
                Err(payload) => (None, Some(panic_error(payload))),
            };
            if err.is_some() {
                std::thread::sleep(ERROR_PAUSE);
            }

            let task = SeqTask {
                sequence,
                result,
                err,
            };
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
