use super::engine::Request;
use super::{
    lock_thread, BlockStepper, EngineError, ExecutionEngine, ExecutionResult, ExecutionState,
    SharedThread,
};
use crate::config::Config;
use crate::execution::interpreter::InterpreterStepper;
use crate::thread::GuestThreadId;
use crate::trace::TraceSink;
use log::{debug, error, info, warn};
use nohash::IntMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct SyncStatus {
    state: ExecutionState,
    running: bool,
    requested: Option<Request>,
    last_results: IntMap<GuestThreadId, ExecutionResult>,
    fatal: Option<EngineError>,
}

#[derive(Debug)]
struct SyncShared<S> {
    /// Stepping order.
    threads: Mutex<Vec<SharedThread>>,
    /// Held by the driver for a whole run.
    steppers: Mutex<IntMap<GuestThreadId, S>>,
    prototype: S,
    status: Mutex<SyncStatus>,
    changed: Condvar,
    stop: AtomicBool,
}

impl<S: BlockStepper + Clone> SyncShared<S> {
    fn record(&self, id: GuestThreadId, result: ExecutionResult) {
        lock(&self.status).last_results.insert(id, result);
    }

    /// Steps every thread one block in turn until one of them does not continue.
    fn round_robin(&self, step_limit: Option<u64>) -> (ExecutionResult, Option<EngineError>) {
        let mut steppers = lock(&self.steppers);
        let mut rounds = 0u64;
        loop {
            if step_limit.is_some_and(|limit| rounds >= limit) {
                debug!("step limit of {rounds} rounds reached");
                return (ExecutionResult::Halt, None);
            }
            let threads = lock(&self.threads).clone();
            if threads.is_empty() {
                return (ExecutionResult::Halt, None);
            }
            for thread in &threads {
                if self.stop.load(Ordering::Acquire) {
                    return (ExecutionResult::Halt, None);
                }
                let mut guard = lock_thread(thread);
                let id = guard.id();
                let stepper = steppers
                    .entry(id)
                    .or_insert_with(|| self.prototype.clone());
                let outcome = match guard.handle_message() {
                    ExecutionResult::Halt => Ok(ExecutionResult::Halt),
                    _ => stepper.step_block(&mut guard),
                };
                match outcome {
                    Ok(ExecutionResult::Continue) => {
                        self.record(id, ExecutionResult::Continue);
                    }
                    Ok(result) => {
                        debug!("thread {id} stopped the run with {result:?}");
                        self.record(id, result);
                        return (result, None);
                    }
                    Err(e) => {
                        error!("thread {id}: {e}");
                        self.record(id, ExecutionResult::Abort);
                        return (ExecutionResult::Abort, Some(e));
                    }
                }
            }
            rounds += 1;
        }
    }

    fn drive(&self, step_limit: Option<u64>) -> (ExecutionResult, Option<EngineError>) {
        let _stopped = StoppedOnExit(self);
        let (result, fatal) = self.round_robin(step_limit);
        info!("round-robin run finished with {result:?}");

        let mut status = lock(&self.status);
        status.fatal = fatal.clone();
        status.state = match status.requested.take() {
            Some(Request::Suspend) => ExecutionState::Ready,
            _ => ExecutionState::Halted,
        };
        status.running = false;
        (result, fatal)
    }

    fn wait_stopped(&self) {
        let mut status = lock(&self.status);
        while status.running {
            status = self
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct StoppedOnExit<'a, S>(&'a SyncShared<S>);

impl<S> Drop for StoppedOnExit<'_, S> {
    fn drop(&mut self) {
        let mut status = lock(&self.0.status);
        if status.running {
            status.running = false;
            status.state = ExecutionState::Halted;
        }
        self.0.changed.notify_all();
    }
}

/// Lock-step execution: a single driver steps every attached thread one block at a time, in
/// attach order, and the whole run stops as soon as any thread does not continue.
///
/// The driver runs on its own OS thread after [`start`](ExecutionEngine::start), or on the
/// caller's thread with [`run`](Self::run).
#[derive(Debug)]
pub struct SyncExecutionEngine<S: BlockStepper + Clone + Debug> {
    name: String,
    step_limit: Option<u64>,
    shared: Arc<SyncShared<S>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    trace: Mutex<Option<Arc<dyn TraceSink>>>,
}

impl SyncExecutionEngine<InterpreterStepper> {
    pub fn interpreter(name: &str, config: &Config) -> Self {
        Self::new(name, config, InterpreterStepper::new(config))
    }
}

impl<S: BlockStepper + Clone + Debug + Sync> SyncExecutionEngine<S> {
    pub fn new(name: &str, config: &Config, stepper: S) -> Self {
        Self {
            name: name.to_owned(),
            step_limit: config.step_limit,
            shared: Arc::new(SyncShared {
                threads: Mutex::default(),
                steppers: Mutex::default(),
                prototype: stepper,
                status: Mutex::default(),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
            trace: Mutex::new(None),
        }
    }

    fn begin(&self, operation: &'static str) -> Result<(), EngineError> {
        let mut status = lock(&self.shared.status);
        if status.state != ExecutionState::Ready {
            return Err(EngineError::InvalidState {
                operation,
                state: status.state,
            });
        }
        status.state = ExecutionState::Running;
        status.running = true;
        status.requested = None;
        status.fatal = None;
        self.shared.stop.store(false, Ordering::Release);
        Ok(())
    }

    /// Runs the round-robin loop on the calling thread and returns the result that ended it.
    ///
    /// A stepping error ends the run and is returned instead.
    pub fn run(&self) -> Result<ExecutionResult, EngineError> {
        self.begin("run")?;
        info!("{}: running on the caller's thread", self.name);
        match self.shared.drive(self.step_limit) {
            (_, Some(e)) => Err(e),
            (result, None) => Ok(result),
        }
    }

    pub fn fatal_error(&self) -> Option<EngineError> {
        lock(&self.shared.status).fatal.clone()
    }

    fn is_running(&self) -> bool {
        matches!(
            self.state(),
            ExecutionState::Running | ExecutionState::Suspending | ExecutionState::Halting
        )
    }

    fn reap(&self) {
        if let Some(handle) = lock(&self.driver).take() {
            if handle.join().is_err() {
                error!("{}: driver panicked", self.name);
            }
        }
    }

    fn stop(&self, request: Request) {
        {
            let mut status = lock(&self.shared.status);
            match (status.state, request) {
                (ExecutionState::Running, _) => {}
                (ExecutionState::Ready, Request::Halt) => {
                    status.state = ExecutionState::Halted;
                    return;
                }
                (state, _) => {
                    warn!("{}: ignoring {request:?} while {state:?}", self.name);
                    return;
                }
            }
            status.state = match request {
                Request::Suspend => ExecutionState::Suspending,
                Request::Halt => ExecutionState::Halting,
            };
            status.requested = Some(request);
            self.shared.stop.store(true, Ordering::Release);
        }
        self.shared.wait_stopped();
        self.reap();

        let mut status = lock(&self.shared.status);
        status.state = match request {
            Request::Suspend => ExecutionState::Ready,
            Request::Halt => ExecutionState::Halted,
        };
        info!("{}: {:?}", self.name, status.state);
    }

    fn step_with(
        &self,
        id: GuestThreadId,
        step: fn(&mut S, &mut crate::thread::ThreadInstance) -> Result<ExecutionResult, EngineError>,
    ) -> Result<ExecutionResult, EngineError> {
        let state = lock(&self.shared.status).state;
        if !matches!(state, ExecutionState::Ready | ExecutionState::Halted) {
            return Err(EngineError::InvalidState {
                operation: "step a thread",
                state,
            });
        }
        let thread = lock(&self.shared.threads)
            .iter()
            .find(|thread| lock_thread(thread).id() == id)
            .cloned()
            .ok_or(EngineError::NotAttached(id))?;
        let result = {
            let mut steppers = lock(&self.shared.steppers);
            let stepper = steppers
                .entry(id)
                .or_insert_with(|| self.shared.prototype.clone());
            step(stepper, &mut lock_thread(&thread))?
        };
        self.shared.record(id, result);
        Ok(result)
    }
}

impl<S: BlockStepper + Clone + Debug + Sync> ExecutionEngine for SyncExecutionEngine<S> {
    fn attach_thread(&self, thread: SharedThread) -> Result<(), EngineError> {
        let mut threads = lock(&self.shared.threads);
        let id = lock_thread(&thread).id();
        if threads.iter().any(|other| lock_thread(other).id() == id) {
            return Err(EngineError::AlreadyAttached(id));
        }
        if let Some(sink) = lock(&self.trace).clone() {
            lock_thread(&thread).set_trace_sink(Some(sink));
        }
        threads.push(thread);
        debug!("{}: attached thread {id}", self.name);
        Ok(())
    }

    fn detach_thread(&self, id: GuestThreadId) -> Result<SharedThread, EngineError> {
        if self.is_running() {
            return Err(EngineError::DetachWhileRunning(id));
        }
        // Same order as the driver. A run that began since the check above holds `steppers`
        // until it ends.
        let mut steppers = lock(&self.shared.steppers);
        let mut threads = lock(&self.shared.threads);
        let position = threads
            .iter()
            .position(|thread| lock_thread(thread).id() == id)
            .ok_or(EngineError::NotAttached(id))?;
        if self.is_running() {
            return Err(EngineError::DetachWhileRunning(id));
        }
        steppers.remove(&id);
        debug!("{}: detached thread {id}", self.name);
        Ok(threads.remove(position))
    }

    fn start(&self) -> Result<(), EngineError> {
        self.begin("start")?;
        let shared = Arc::clone(&self.shared);
        let step_limit = self.step_limit;
        let spawned = std::thread::Builder::new()
            .name(format!("sync-{}", self.name))
            .spawn(move || {
                shared.drive(step_limit);
            });
        match spawned {
            Ok(handle) => {
                *lock(&self.driver) = Some(handle);
                info!("{}: started round-robin driver", self.name);
                Ok(())
            }
            Err(e) => {
                let mut status = lock(&self.shared.status);
                status.state = ExecutionState::Ready;
                status.running = false;
                Err(EngineError::Spawn(e.to_string()))
            }
        }
    }

    fn suspend(&self) {
        self.stop(Request::Suspend);
    }

    fn halt(&self) {
        self.stop(Request::Halt);
    }

    fn join(&self) {
        self.shared.wait_stopped();
        self.reap();
    }

    fn state(&self) -> ExecutionState {
        lock(&self.shared.status).state
    }

    fn attached_threads(&self) -> Vec<GuestThreadId> {
        let mut ids: Vec<_> = lock(&self.shared.threads)
            .iter()
            .map(|thread| lock_thread(thread).id())
            .collect();
        ids.sort();
        ids
    }

    fn step_thread_block(&self, id: GuestThreadId) -> Result<ExecutionResult, EngineError> {
        self.step_with(id, S::step_block)
    }

    fn step_thread_single(&self, id: GuestThreadId) -> Result<ExecutionResult, EngineError> {
        self.step_with(id, S::step_single)
    }

    fn set_trace_sink(&self, sink: Option<Arc<dyn TraceSink>>) {
        for thread in lock(&self.shared.threads).iter() {
            lock_thread(thread).set_trace_sink(sink.clone());
        }
        *lock(&self.trace) = sink;
    }

    fn last_result(&self, id: GuestThreadId) -> Option<ExecutionResult> {
        lock(&self.shared.status).last_results.get(&id).copied()
    }
}

impl<S: BlockStepper + Clone + Debug> Drop for SyncExecutionEngine<S> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.driver).take() {
            if handle.join().is_err() {
                error!("{}: driver panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::tests::acc_thread;
    use crate::execution::share;
    use crate::thread::ThreadInstance;
    use std::time::{Duration, Instant};

    /// `add 1; jump 0` forever.
    const LOOP: [u32; 2] = [0x0100_0001, 0x0200_0000];

    fn r0(thread: &SharedThread) -> u64 {
        lock_thread(thread).read_register("R", 0).unwrap()
    }

    #[test]
    fn test_first_stop_ends_the_run() {
        let engine = SyncExecutionEngine::interpreter("sync", &Config::default());
        let looping = share(acc_thread(0, &LOOP));
        let finite = share(acc_thread(1, &[0x0100_0001, 0x0100_0001, 0x0000_0000]));
        engine.attach_thread(Arc::clone(&looping)).unwrap();
        engine.attach_thread(Arc::clone(&finite)).unwrap();

        assert_eq!(engine.run(), Ok(ExecutionResult::Halt));
        assert_eq!(r0(&looping), 1);
        assert_eq!(r0(&finite), 2);
        assert_eq!(
            engine.last_result(GuestThreadId::new(0)),
            Some(ExecutionResult::Continue)
        );
        assert_eq!(
            engine.last_result(GuestThreadId::new(1)),
            Some(ExecutionResult::Halt)
        );
        assert_eq!(engine.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_step_limit_counts_rounds() {
        let config = Config {
            step_limit: Some(3),
            ..Config::default()
        };
        let engine = SyncExecutionEngine::interpreter("sync", &config);
        let a = share(acc_thread(0, &LOOP));
        let b = share(acc_thread(1, &LOOP));
        engine.attach_thread(Arc::clone(&a)).unwrap();
        engine.attach_thread(Arc::clone(&b)).unwrap();

        assert_eq!(engine.run(), Ok(ExecutionResult::Halt));
        assert_eq!(r0(&a), 3);
        assert_eq!(r0(&b), 3);
    }

    #[test]
    fn test_halt_from_another_thread() {
        let engine = Arc::new(SyncExecutionEngine::interpreter("sync", &Config::default()));
        let a = share(acc_thread(0, &LOOP));
        engine.attach_thread(Arc::clone(&a)).unwrap();
        engine.attach_thread(share(acc_thread(1, &LOOP))).unwrap();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while r0(&a) < 10 {
            assert!(Instant::now() < deadline, "driver made no progress");
            std::thread::yield_now();
        }
        assert_eq!(
            engine.detach_thread(GuestThreadId::new(0)).unwrap_err(),
            EngineError::DetachWhileRunning(GuestThreadId::new(0))
        );

        let halter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.halt())
        };
        halter.join().unwrap();
        engine.join();
        assert_eq!(engine.state(), ExecutionState::Halted);
        assert!(engine.detach_thread(GuestThreadId::new(0)).is_ok());
        assert_eq!(engine.attached_threads(), vec![GuestThreadId::new(1)]);
    }

    #[test]
    fn test_suspend_then_step_manually() {
        let engine = SyncExecutionEngine::interpreter("sync", &Config::default());
        let a = share(acc_thread(0, &LOOP));
        engine.attach_thread(Arc::clone(&a)).unwrap();
        engine.start().unwrap();
        engine.suspend();
        assert_eq!(engine.state(), ExecutionState::Ready);

        let before = r0(&a);
        assert_eq!(
            engine.step_thread_block(GuestThreadId::new(0)),
            Ok(ExecutionResult::Continue)
        );
        assert_eq!(r0(&a), before + 1);
        engine.halt();
        assert_eq!(engine.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_detach_racing_start() {
        let config = Config {
            step_limit: Some(20),
            ..Config::default()
        };
        for _ in 0..50 {
            let engine = SyncExecutionEngine::interpreter("sync", &config);
            engine.attach_thread(share(acc_thread(0, &LOOP))).unwrap();
            std::thread::scope(|scope| {
                scope.spawn(|| engine.start().unwrap());
                match engine.detach_thread(GuestThreadId::new(0)) {
                    Ok(_) | Err(EngineError::DetachWhileRunning(_)) => {}
                    Err(e) => panic!("unexpected detach error: {e}"),
                }
            });
            engine.join();
            assert_eq!(engine.state(), ExecutionState::Halted);
        }
    }

    #[derive(Debug, Clone)]
    struct PanickingStepper;

    impl BlockStepper for PanickingStepper {
        fn step_block(&mut self, _: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            panic!("stepper failure");
        }

        fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            self.step_block(thread)
        }
    }

    #[test]
    fn test_join_reaps_panicked_driver() {
        let engine = SyncExecutionEngine::new("sync", &Config::default(), PanickingStepper);
        engine.attach_thread(share(acc_thread(0, &LOOP))).unwrap();
        engine.start().unwrap();
        engine.join();
        assert!(lock(&engine.driver).is_none());
        assert_eq!(engine.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_empty_engine_halts_immediately() {
        let engine = SyncExecutionEngine::interpreter("sync", &Config::default());
        assert_eq!(engine.run(), Ok(ExecutionResult::Halt));
        assert_eq!(engine.run(), Err(EngineError::InvalidState {
            operation: "run",
            state: ExecutionState::Halted
        }));
    }
}
