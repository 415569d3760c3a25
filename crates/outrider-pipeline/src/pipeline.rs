//! The windowed sequential pipeline engine

use std::sync::{Arc, RwLock, Weak};
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded, select};
use outrider_core::{Worker, WorkerFactory};
use rustc_hash::FxHashMap;

use crate::error::PipelineError;
use crate::factory::SeqTask;

/// Windowed sequential pipeline: workers compute results for sequence
/// numbers ahead of demand, the consumer reads them in order through a
/// bounded sliding window.
///
/// Construction only stores parameters; the pool starts lazily on the
/// first [`get`](Pipeline::get). `concurrent` is floored at 1,
/// `redundancy` at 2 and `reserved_length` at 1. The in-flight budget
/// is `concurrent * redundancy` tasks; the window keeps up to
/// `reserved_length` finished results for repeat reads.
pub struct Pipeline<R, F> {
    factory: F,
    inner: Arc<Inner<R>>,
}

struct Inner<R> {
    concurrent: usize,
    work_length: i64,
    reserved_length: i64,
    state: RwLock<State<R>>,
}

/// Everything a generation owns. Replaced wholesale by `stop`;
/// dropping the old value drops `cancel_tx`, which tears the old pool
/// down through channel disconnection.
struct State<R> {
    generation: u64,
    cursor: Cursor,
    reserved: FxHashMap<i64, R>,
    pending: FxHashMap<i64, SeqTask<R>>,
    chans: Channels<R>,
}

#[derive(Clone, Copy)]
struct Cursor {
    started: bool,
    max_sequence: i64,
    last_dispatched: i64,
    last_ordered: i64,
    window_empty: bool,
    window_min: i64,
    window_max: i64,
}

struct Channels<R> {
    inputs_tx: Sender<i64>,
    inputs_rx: Receiver<i64>,
    outputs_tx: Sender<SeqTask<R>>,
    outputs_rx: Receiver<SeqTask<R>>,
    queue_tx: Sender<SeqTask<R>>,
    queue_rx: Receiver<SeqTask<R>>,
    // Never sent on. Dropping it is the teardown signal for the
    // generation's workers and collector.
    #[allow(dead_code)]
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl<R> State<R> {
    fn fresh(generation: u64, work_length: i64) -> Self {
        let cap = work_length as usize;
        let (inputs_tx, inputs_rx) = bounded(cap);
        let (outputs_tx, outputs_rx) = bounded(cap);
        let (queue_tx, queue_rx) = bounded(cap);
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            generation,
            cursor: Cursor {
                started: false,
                max_sequence: 0,
                last_dispatched: 0,
                last_ordered: 0,
                window_empty: true,
                window_min: 0,
                window_max: 0,
            },
            reserved: FxHashMap::default(),
            pending: FxHashMap::default(),
            chans: Channels {
                inputs_tx,
                inputs_rx,
                outputs_tx,
                outputs_rx,
                queue_tx,
                queue_rx,
                cancel_tx,
                cancel_rx,
            },
        }
    }
}

impl<R, F> Pipeline<R, F>
where
    R: Clone + Send + Sync + 'static,
    F: WorkerFactory<i64, SeqTask<R>>,
{
    pub fn new(concurrent: usize, redundancy: usize, reserved_length: usize, factory: F) -> Self {
        let concurrent = concurrent.max(1);
        let redundancy = redundancy.max(2);
        let reserved_length = reserved_length.max(1) as i64;
        let work_length = (concurrent * redundancy) as i64;
        Self {
            factory,
            inner: Arc::new(Inner {
                concurrent,
                work_length,
                reserved_length,
                state: RwLock::new(State::fresh(1, work_length)),
            }),
        }
    }

    /// Declare that sequence numbers up to `sequence` are eligible for
    /// dispatch. The bound is monotonically non-decreasing; a lower
    /// value is a contract violation.
    ///
    /// If the pipeline is running, newly eligible sequences are pushed
    /// to the workers immediately, capped at `window_max + work_length`
    /// so the input queue never grows unboundedly ahead of the window.
    pub fn update_max_sequence(&self, sequence: i64) -> Result<(), PipelineError> {
        let mut state = self.inner.state.write().expect("state lock poisoned");
        if sequence < state.cursor.max_sequence {
            return Err(PipelineError::Regression {
                sequence,
                max: state.cursor.max_sequence,
            });
        }
        state.cursor.max_sequence = sequence;
        if !state.cursor.started {
            return Ok(());
        }
        let cap = sequence.min(state.cursor.window_max + self.inner.work_length);
        for value in (state.cursor.last_dispatched + 1)..=cap {
            let _ = state.chans.inputs_tx.send(value);
            state.cursor.last_dispatched = value;
        }
        Ok(())
    }

    /// Return the result for `sequence`, blocking until the workers
    /// have delivered it.
    ///
    /// The first call starts the pool, anchored so that `sequence` is
    /// the first value computed. Repeat reads of a sequence still in
    /// the window are served from cache. Requests below the window are
    /// permanently gone; requests above `window_min + reserved_length`
    /// must wait for lower sequences to be consumed first.
    pub fn get(&self, sequence: i64) -> Result<R, PipelineError> {
        let cursor = self.inner.cursor_snapshot();
        if sequence > cursor.max_sequence {
            return Err(PipelineError::AboveMax {
                sequence,
                max: cursor.max_sequence,
            });
        }
        if !cursor.window_empty && sequence < cursor.window_min {
            return Err(PipelineError::Evicted {
                sequence,
                min: cursor.window_min,
            });
        }
        if !cursor.window_empty && sequence > cursor.window_min + self.inner.reserved_length {
            return Err(PipelineError::AheadOfWindow {
                sequence,
                min: cursor.window_min,
                reserved: self.inner.reserved_length,
            });
        }

        self.start_work(sequence)?;
        self.inner.read_from_reserved(sequence)
    }

    /// Reset to the not-started state, discarding the window, the
    /// reorder cache and the declared max sequence.
    ///
    /// The old generation's channels are dropped here; its workers and
    /// collector observe the disconnect and drain themselves, so a
    /// stopped pipeline leaks no threads.
    pub fn stop(&self) {
        let mut state = self.inner.state.write().expect("state lock poisoned");
        let generation = state.generation + 1;
        *state = State::fresh(generation, self.inner.work_length);
    }

    fn start_work(&self, sequence: i64) -> Result<(), PipelineError> {
        if self.inner.cursor_snapshot().started {
            return Ok(());
        }
        let mut state = self.inner.state.write().expect("state lock poisoned");
        if state.cursor.started {
            // Lost the start race to a concurrent get.
            return Ok(());
        }

        // Build every worker before dispatching anything: a factory
        // failure must abort startup with no task in flight.
        let mut workers = Vec::with_capacity(self.inner.concurrent);
        for _ in 0..self.inner.concurrent {
            workers.push(self.factory.build().map_err(PipelineError::Build)?);
        }

        state.cursor.window_empty = true;
        state.cursor.window_min = sequence - 1;
        state.cursor.window_max = sequence - 1;
        state.cursor.last_ordered = sequence - 1;

        for i in 0..self.inner.work_length {
            let value = sequence + i;
            if value <= state.cursor.max_sequence {
                let _ = state.chans.inputs_tx.send(value);
                state.cursor.last_dispatched = value;
            }
        }

        for worker in workers {
            let inputs = state.chans.inputs_rx.clone();
            let outputs = state.chans.outputs_tx.clone();
            let cancel = state.chans.cancel_rx.clone();
            thread::spawn(move || worker.run(inputs, outputs, cancel));
        }
        self.spawn_collector(&state);

        state.cursor.started = true;
        Ok(())
    }

    /// One collector per generation: drains worker results, re-enqueues
    /// failures and forwards successes to the ordered queue.
    ///
    /// Holds only a weak reference to the engine so a dropped pipeline
    /// still tears its threads down.
    fn spawn_collector(&self, state: &State<R>) {
        let weak: Weak<Inner<R>> = Arc::downgrade(&self.inner);
        let generation = state.generation;
        let outputs = state.chans.outputs_rx.clone();
        let inputs = state.chans.inputs_tx.clone();
        let queue = state.chans.queue_tx.clone();
        let cancel = state.chans.cancel_rx.clone();
        thread::spawn(move || {
            loop {
                let task = select! {
                    recv(cancel) -> _ => return,
                    recv(outputs) -> msg => match msg {
                        Ok(task) => task,
                        Err(_) => return,
                    },
                };
                let Some(inner) = weak.upgrade() else { return };
                inner.write_result(generation, task, &inputs, &queue);
            }
        });
    }
}

impl<R> Inner<R>
where
    R: Clone + Send + Sync + 'static,
{
    fn cursor_snapshot(&self) -> Cursor {
        self.state.read().expect("state lock poisoned").cursor
    }

    /// Serve `sequence` from the reserved window, folding ordered
    /// results in from the queue until the window reaches it.
    fn read_from_reserved(&self, sequence: i64) -> Result<R, PipelineError> {
        loop {
            let (generation, queue_rx) = {
                let state = self.state.read().expect("state lock poisoned");
                let cursor = &state.cursor;
                if cursor.window_min <= sequence && sequence <= cursor.window_max {
                    return match state.reserved.get(&sequence) {
                        Some(value) => Ok(value.clone()),
                        None => Err(PipelineError::MissingEntry {
                            sequence,
                            min: cursor.window_min,
                            max: cursor.window_max,
                        }),
                    };
                }
                (state.generation, state.chans.queue_rx.clone())
            };

            // Blocking receive happens with the lock released; the
            // collector needs the write lock to make progress.
            let task = queue_rx.recv().map_err(|_| PipelineError::Stopped)?;
            let mut state = self.state.write().expect("state lock poisoned");
            if state.generation != generation {
                return Err(PipelineError::Stopped);
            }
            self.fold_into_window(&mut state, task);
        }
    }

    /// Fold one ordered result into the window: top up the input queue
    /// relative to the new trailing edge, cache the result, slide the
    /// window.
    fn fold_into_window(&self, state: &mut State<R>, task: SeqTask<R>) {
        let next_sequence = task.sequence + self.work_length;
        if next_sequence <= state.cursor.max_sequence
            && next_sequence > state.cursor.last_dispatched
        {
            // Dispatch every value up to next_sequence. Pushing only
            // next_sequence itself would silently skip the values in
            // between whenever the queue fell behind the window.
            for value in (state.cursor.last_dispatched + 1)..=next_sequence {
                let _ = state.chans.inputs_tx.send(value);
                state.cursor.last_dispatched = value;
            }
        }

        let sequence = task.sequence;
        state.cursor.window_max = sequence;
        if let Some(result) = task.result {
            state.reserved.insert(sequence, result);
        }

        if state.cursor.window_empty {
            state.cursor.window_empty = false;
            state.cursor.window_min = sequence;
            return;
        }
        if sequence - state.cursor.window_min == self.reserved_length {
            let min = state.cursor.window_min;
            state.reserved.remove(&min);
            state.cursor.window_min += 1;
        }
    }

    /// Collector body for one completed task. Failures go back to the
    /// input queue (unbounded retry); successes are released to the
    /// ordered queue as soon as they are contiguous with `last_ordered`.
    fn write_result(
        &self,
        generation: u64,
        task: SeqTask<R>,
        inputs: &Sender<i64>,
        queue: &Sender<SeqTask<R>>,
    ) {
        let mut state = self.state.write().expect("state lock poisoned");
        if state.generation != generation {
            // Straggler from a stopped generation.
            return;
        }

        if let Some(err) = &task.err {
            log::error!("sequence {}: {err}", task.sequence);
            let _ = inputs.send(task.sequence);
            return;
        }
        if task.result.is_none() {
            log::error!(
                "sequence {}: worker returned neither result nor error",
                task.sequence
            );
            let _ = inputs.send(task.sequence);
            return;
        }

        if task.sequence > state.cursor.last_ordered + 1 {
            // Completed out of order; park until contiguous.
            state.pending.insert(task.sequence, task);
            return;
        }

        state.cursor.last_ordered = task.sequence;
        let mut next = task.sequence + 1;
        let _ = queue.send(task);
        while let Some(parked) = state.pending.remove(&next) {
            state.cursor.last_ordered = parked.sequence;
            let _ = queue.send(parked);
            next += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outrider_core::{TaskError, Worker};
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Salt + sequence, with a one-shot injected failure on sequence 10
    /// and a small stall on every third sequence to shake up completion
    /// order.
    struct SaltFactory {
        salt: i64,
        ten_failed: Arc<AtomicBool>,
    }

    impl SaltFactory {
        fn new(salt: i64) -> Self {
            Self {
                salt,
                ten_failed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    struct SaltWorker {
        salt: i64,
        ten_failed: Arc<AtomicBool>,
    }

    impl WorkerFactory<i64, SeqTask<i64>> for SaltFactory {
        type Worker = SaltWorker;

        fn build(&self) -> Result<SaltWorker, TaskError> {
            Ok(SaltWorker {
                salt: self.salt,
                ten_failed: Arc::clone(&self.ten_failed),
            })
        }
    }

    impl Worker<i64, SeqTask<i64>> for SaltWorker {
        fn run(
            self,
            inputs: Receiver<i64>,
            outputs: Sender<SeqTask<i64>>,
            _cancel: Receiver<()>,
        ) {
            while let Ok(sequence) = inputs.recv() {
                let mut result = Some(self.salt + sequence);
                let mut err: Option<TaskError> = None;
                if sequence == 10 && !self.ten_failed.swap(true, Ordering::SeqCst) {
                    result = None;
                    err = Some("haha".into());
                }
                if sequence % 3 == 0 {
                    thread::sleep(Duration::from_millis(3));
                }
                let task = SeqTask {
                    sequence,
                    result,
                    err,
                };
                if outputs.send(task).is_err() {
                    return;
                }
            }
        }
    }

    /// Every task fails; counts attempts. No pacing so retry pressure
    /// is visible within milliseconds.
    struct AlwaysFailFactory {
        attempts: Arc<AtomicUsize>,
    }

    struct AlwaysFailWorker {
        attempts: Arc<AtomicUsize>,
    }

    impl WorkerFactory<i64, SeqTask<i64>> for AlwaysFailFactory {
        type Worker = AlwaysFailWorker;

        fn build(&self) -> Result<AlwaysFailWorker, TaskError> {
            Ok(AlwaysFailWorker {
                attempts: Arc::clone(&self.attempts),
            })
        }
    }

    impl Worker<i64, SeqTask<i64>> for AlwaysFailWorker {
        fn run(
            self,
            inputs: Receiver<i64>,
            outputs: Sender<SeqTask<i64>>,
            _cancel: Receiver<()>,
        ) {
            while let Ok(sequence) = inputs.recv() {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let task = SeqTask {
                    sequence,
                    result: None,
                    err: Some("still broken".into()),
                };
                if outputs.send(task).is_err() {
                    return;
                }
            }
        }
    }

    /// Echoes each sequence back and records the highest sequence any
    /// worker has been handed.
    struct TrackingFactory {
        seen_max: Arc<AtomicI64>,
    }

    struct TrackingWorker {
        seen_max: Arc<AtomicI64>,
    }

    impl WorkerFactory<i64, SeqTask<i64>> for TrackingFactory {
        type Worker = TrackingWorker;

        fn build(&self) -> Result<TrackingWorker, TaskError> {
            Ok(TrackingWorker {
                seen_max: Arc::clone(&self.seen_max),
            })
        }
    }

    impl Worker<i64, SeqTask<i64>> for TrackingWorker {
        fn run(
            self,
            inputs: Receiver<i64>,
            outputs: Sender<SeqTask<i64>>,
            _cancel: Receiver<()>,
        ) {
            while let Ok(sequence) = inputs.recv() {
                self.seen_max.fetch_max(sequence, Ordering::SeqCst);
                let task = SeqTask {
                    sequence,
                    result: Some(sequence),
                    err: None,
                };
                if outputs.send(task).is_err() {
                    return;
                }
            }
        }
    }

    struct RefusingFactory;

    impl WorkerFactory<i64, SeqTask<i64>> for RefusingFactory {
        type Worker = SaltWorker;

        fn build(&self) -> Result<SaltWorker, TaskError> {
            Err("no client available".into())
        }
    }

    #[test]
    fn windowed_sequential_scenario() {
        let pipeline = Pipeline::new(3, 2, 4, SaltFactory::new(110));
        pipeline.update_max_sequence(10).unwrap();

        assert_eq!(pipeline.get(1).unwrap(), 111);

        // Too far ahead of the window.
        assert!(matches!(
            pipeline.get(6),
            Err(PipelineError::AheadOfWindow { .. })
        ));

        // Repeat read is served from the window.
        assert_eq!(pipeline.get(1).unwrap(), 111);

        assert!(matches!(
            pipeline.get(11),
            Err(PipelineError::AboveMax { .. })
        ));
        assert!(matches!(pipeline.get(0), Err(PipelineError::Evicted { .. })));
        assert!(matches!(
            pipeline.update_max_sequence(9),
            Err(PipelineError::Regression { .. })
        ));

        // Sequence 10 fails once on the way and is retried to success.
        for sequence in 2..=10 {
            assert_eq!(pipeline.get(sequence).unwrap(), 110 + sequence);
        }

        pipeline.update_max_sequence(12).unwrap();
    }

    #[test]
    fn stop_resets_to_initial_state() {
        let pipeline = Pipeline::new(3, 2, 1, SaltFactory::new(110));
        pipeline.update_max_sequence(5).unwrap();

        for sequence in 1..=4 {
            assert_eq!(pipeline.get(sequence).unwrap(), 110 + sequence);
        }
        // reserved_length = 1: sequence 2 has been evicted by now.
        assert!(matches!(pipeline.get(2), Err(PipelineError::Evicted { .. })));

        pipeline.stop();

        // A lower max is fine again; the cursor was fully reset.
        pipeline.update_max_sequence(4).unwrap();
        for sequence in 2..=4 {
            assert_eq!(pipeline.get(sequence).unwrap(), 110 + sequence);
        }
    }

    #[test]
    fn permanent_failure_retries_without_limit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let pipeline = Arc::new(Pipeline::new(
            1,
            2,
            1,
            AlwaysFailFactory {
                attempts: Arc::clone(&attempts),
            },
        ));
        pipeline.update_max_sequence(3).unwrap();

        let getter = {
            let pipeline = Arc::clone(&pipeline);
            thread::spawn(move || pipeline.get(1))
        };
        thread::sleep(Duration::from_millis(100));

        // Still failing, still retrying, still blocked.
        assert!(attempts.load(Ordering::SeqCst) > 3);
        assert!(!getter.is_finished());

        pipeline.stop();
        let result = getter.join().unwrap();
        assert!(matches!(result, Err(PipelineError::Stopped)));
    }

    #[test]
    fn dispatch_never_outruns_the_window() {
        let seen_max = Arc::new(AtomicI64::new(0));
        let pipeline = Pipeline::new(
            1,
            2,
            1,
            TrackingFactory {
                seen_max: Arc::clone(&seen_max),
            },
        );
        pipeline.update_max_sequence(2).unwrap();
        assert_eq!(pipeline.get(1).unwrap(), 1);

        // window_max = 1 and work_length = 2: no matter how far the max
        // jumps, only sequence 3 becomes newly eligible.
        pipeline.update_max_sequence(100).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen_max.load(Ordering::SeqCst), 3);

        // Consuming slides the window and releases more work, still
        // capped at window_max + work_length.
        assert_eq!(pipeline.get(2).unwrap(), 2);
        assert_eq!(pipeline.get(3).unwrap(), 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(seen_max.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn factory_failure_aborts_start() {
        let pipeline = Pipeline::new(2, 2, 1, RefusingFactory);
        pipeline.update_max_sequence(5).unwrap();
        assert!(matches!(pipeline.get(1), Err(PipelineError::Build(_))));
        // Not started; the same call keeps failing the same way.
        assert!(matches!(pipeline.get(1), Err(PipelineError::Build(_))));
    }

    #[test]
    fn parameters_are_floored() {
        // concurrent/redundancy/reserved_length of 0 floor to 1/2/1.
        let pipeline = Pipeline::new(0, 0, 0, SaltFactory::new(200));
        pipeline.update_max_sequence(3).unwrap();
        for sequence in 1..=3 {
            assert_eq!(pipeline.get(sequence).unwrap(), 200 + sequence);
        }
        // Only the newest entry survives with reserved_length = 1.
        assert_eq!(pipeline.get(3).unwrap(), 203);
        assert!(matches!(pipeline.get(2), Err(PipelineError::Evicted { .. })));
    }

    #[test]
    fn get_before_update_max_fails() {
        let pipeline = Pipeline::new(1, 2, 1, SaltFactory::new(0));
        assert!(matches!(
            pipeline.get(1),
            Err(PipelineError::AboveMax { .. })
        ));
    }
}
