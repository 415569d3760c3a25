//! Worker and factory traits shared by both engines

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

/// Error produced by business code behind the worker seam.
///
/// The engines never inspect these beyond logging and retry accounting,
/// so a boxed error keeps the seam open to any client stack.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pause a worker takes after a failed task.
///
/// Failed tasks are re-enqueued and retried; without pacing, a
/// permanently failing task floods the error log.
pub const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Convert a caught panic payload into a [`TaskError`].
///
/// Business code that panics must surface as a failed task, not as a
/// dead pool slot that silently drops its workload.
pub fn panic_error(payload: Box<dyn std::any::Any + Send>) -> TaskError {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}").into()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}").into()
    } else {
        "worker panicked".into()
    }
}

/// A worker owns one slot of a pool for the pool's lifetime.
///
/// `run` consumes the worker and loops: pull one task from `inputs`,
/// do the work, push the outcome to `outputs`. It returns when `inputs`
/// disconnects or `cancel` fires; a send must always be raced against
/// `cancel` (via `crossbeam_channel::select!`) so a cancelled worker
/// never blocks forever on a full or abandoned output channel.
///
/// `cancel` carries no messages. It fires by disconnection: the engine
/// drops the matching `Sender<()>` to tear the pool down.
pub trait Worker<I, O>: Send + 'static {
    fn run(self, inputs: Receiver<I>, outputs: Sender<O>, cancel: Receiver<()>);
}

impl<I, O, F> Worker<I, O> for F
where
    F: FnOnce(Receiver<I>, Sender<O>, Receiver<()>) + Send + 'static,
{
    fn run(self, inputs: Receiver<I>, outputs: Sender<O>, cancel: Receiver<()>) {
        self(inputs, outputs, cancel)
    }
}

/// Constructor invoked once per pool slot at startup.
///
/// This is where slot-local resources (a dedicated client, a session)
/// are acquired, so each worker can own state that must not be shared.
/// A build failure aborts pool startup before any task is dispatched.
pub trait WorkerFactory<I, O> {
    type Worker: Worker<I, O>;

    fn build(&self) -> Result<Self::Worker, TaskError>;
}

impl<I, O, W, F> WorkerFactory<I, O> for F
where
    F: Fn() -> Result<W, TaskError>,
    W: Worker<I, O>,
{
    type Worker = W;

    fn build(&self) -> Result<W, TaskError> {
        self()
    }
}
