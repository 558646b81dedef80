use super::{
    lock_thread, BlockStepper, EngineError, ExecutionEngine, ExecutionResult, ExecutionState,
    SharedThread,
};
use crate::config::Config;
use crate::execution::blockjit::{BlockJitStepper, BlockTranslator};
use crate::execution::interpreter::InterpreterStepper;
use crate::thread::{GuestThreadId, ThreadMessage, ThreadMessenger};
use crate::trace::TraceSink;
use generational_arena::{Arena, Index};
use log::{debug, error, info, warn};
use nohash::IntMap;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// Why a worker was asked to stop.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Request {
    Suspend,
    Halt,
}

impl Request {
    pub(super) fn message(self) -> ThreadMessage {
        match self {
            Self::Suspend => ThreadMessage::Suspend,
            Self::Halt => ThreadMessage::Halt,
        }
    }
}

#[derive(Debug, Default)]
struct ContextStatus {
    state: ExecutionState,
    last_result: Option<ExecutionResult>,
    fatal: Option<EngineError>,
    /// A worker has been spawned and has not returned yet.
    running: bool,
    requested: Option<Request>,
}

/// The part of a context its worker shares with the engine.
#[derive(Debug, Default)]
struct ContextShared {
    status: Mutex<ContextStatus>,
    changed: Condvar,
}

impl ContextShared {
    fn lock(&self) -> MutexGuard<'_, ContextStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_stopped(&self) {
        let mut status = self.lock();
        while status.running {
            status = self
                .changed
                .wait(status)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// One attached thread. The stepper lives here while the context is idle and moves into the
/// worker while it runs.
#[derive(Debug)]
struct ExecutionContext<S> {
    id: GuestThreadId,
    thread: SharedThread,
    messenger: ThreadMessenger,
    shared: Arc<ContextShared>,
    worker: Option<JoinHandle<S>>,
    stepper: Option<S>,
}

impl<S: BlockStepper + Clone> ExecutionContext<S> {
    fn spawn(&mut self, prototype: &S, step_limit: Option<u64>) -> Result<(), EngineError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stepper = self.stepper.take().unwrap_or_else(|| prototype.clone());
        {
            let mut status = self.shared.lock();
            status.state = ExecutionState::Running;
            status.running = true;
            status.requested = None;
            status.fatal = None;
        }

        let id = self.id;
        let thread = Arc::clone(&self.thread);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("guest-{id}"))
            .spawn(move || run_worker(id, thread, shared, stepper, step_limit));
        match spawned {
            Ok(handle) => {
                debug!("thread {id}: worker started");
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut status = self.shared.lock();
                status.state = ExecutionState::Ready;
                status.running = false;
                Err(EngineError::Spawn(e.to_string()))
            }
        }
    }

    /// Joins a worker that has stopped and takes its stepper back.
    fn reap(&mut self, prototype: &S) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        match handle.join() {
            Ok(stepper) => self.stepper = Some(stepper),
            Err(_) => {
                error!("thread {}: worker panicked", self.id);
                let mut status = self.shared.lock();
                status.fatal = Some(EngineError::WorkerPanicked(self.id));
                status.last_result = Some(ExecutionResult::Abort);
                status.state = ExecutionState::Halted;
                status.running = false;
                self.stepper = Some(prototype.clone());
            }
        }
    }
}

/// Steps `thread` one block at a time until a non-`Continue` result, a halt or suspend message,
/// the step limit, or a stepping error.
fn run_worker<S: BlockStepper>(
    id: GuestThreadId,
    thread: SharedThread,
    shared: Arc<ContextShared>,
    mut stepper: S,
    step_limit: Option<u64>,
) -> S {
    let _stopped = StoppedOnExit(&shared);
    let mut steps = 0u64;
    let mut fatal = None;
    let result = loop {
        let mut guard = lock_thread(&thread);
        if guard.handle_message() == ExecutionResult::Halt {
            break ExecutionResult::Halt;
        }
        if step_limit.is_some_and(|limit| steps >= limit) {
            debug!("thread {id}: step limit of {steps} blocks reached");
            break ExecutionResult::Halt;
        }
        match stepper.step_block(&mut guard) {
            Ok(ExecutionResult::Continue) => steps += 1,
            Ok(result) => break result,
            Err(e) => {
                error!("thread {id}: {e}");
                fatal = Some(e);
                break ExecutionResult::Abort;
            }
        }
    };

    {
        let guard = lock_thread(&thread);
        if let Some(sink) = guard.trace_sink() {
            sink.flush();
        }
    }
    if result == ExecutionResult::Exception {
        warn!("thread {id}: stopped on an unhandled exception");
    }
    info!(thread = id.get(), blocks = steps; "worker finished with {result:?}");

    let mut status = shared.lock();
    status.last_result = Some(result);
    status.fatal = fatal;
    status.state = match status.requested {
        Some(Request::Suspend) => ExecutionState::Ready,
        _ => ExecutionState::Halted,
    };
    status.running = false;
    drop(status);
    stepper
}

/// Marks a context stopped when its worker returns or unwinds.
struct StoppedOnExit<'a>(&'a ContextShared);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        let mut status = self.0.lock();
        if status.running {
            status.running = false;
            status.state = ExecutionState::Halted;
            status.last_result = Some(ExecutionResult::Abort);
        }
        self.0.changed.notify_all();
    }
}

#[derive(Debug)]
struct EngineInner<S> {
    state: ExecutionState,
    prototype: S,
    contexts: Arena<ExecutionContext<S>>,
    by_thread: IntMap<GuestThreadId, Index>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl<S: BlockStepper + Clone> EngineInner<S> {
    fn context(&self, id: GuestThreadId) -> Result<&ExecutionContext<S>, EngineError> {
        self.by_thread
            .get(&id)
            .and_then(|&index| self.contexts.get(index))
            .ok_or(EngineError::NotAttached(id))
    }

    /// A running engine whose workers have all returned is halted.
    fn settle(&mut self) {
        if self.state != ExecutionState::Running {
            return;
        }
        if self
            .contexts
            .iter()
            .any(|(_, context)| context.shared.lock().running)
        {
            return;
        }
        let Self {
            contexts,
            prototype,
            ..
        } = self;
        for (_, context) in contexts.iter_mut() {
            context.reap(prototype);
        }
        self.state = ExecutionState::Halted;
    }
}

/// An engine that runs every attached thread on its own OS thread.
///
/// Each context gets a clone of the stepper the engine was created with, so per-thread caches
/// (such as translated blocks) are never shared between threads.
#[derive(Debug)]
pub struct BasicExecutionEngine<S: BlockStepper + Clone + Debug> {
    name: String,
    step_limit: Option<u64>,
    inner: Mutex<EngineInner<S>>,
}

impl BasicExecutionEngine<InterpreterStepper> {
    pub fn interpreter(name: &str, config: &Config) -> Self {
        Self::new(name, config, InterpreterStepper::new(config))
    }
}

impl BasicExecutionEngine<BlockJitStepper> {
    pub fn block_jit(name: &str, config: &Config, translator: Arc<dyn BlockTranslator>) -> Self {
        Self::new(name, config, BlockJitStepper::new(config, translator))
    }
}

impl<S: BlockStepper + Clone + Debug> BasicExecutionEngine<S> {
    pub fn new(name: &str, config: &Config, stepper: S) -> Self {
        Self {
            name: name.to_owned(),
            step_limit: config.step_limit,
            inner: Mutex::new(EngineInner {
                state: ExecutionState::Ready,
                prototype: stepper,
                contexts: Arena::new(),
                by_thread: IntMap::default(),
                trace: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// State of one context, which may differ from the engine's: a thread that executed a halt
    /// instruction is `Halted` while its neighbours keep running.
    pub fn context_state(&self, id: GuestThreadId) -> Option<ExecutionState> {
        let inner = self.lock();
        let context = inner.context(id).ok()?;
        let state = context.shared.lock().state;
        Some(state)
    }

    /// The error that stopped the thread's last run, if any.
    pub fn fatal_error(&self, id: GuestThreadId) -> Option<EngineError> {
        let inner = self.lock();
        let context = inner.context(id).ok()?;
        let fatal = context.shared.lock().fatal.clone();
        fatal
    }

    fn stop(&self, request: Request) {
        let waiting: Vec<Arc<ContextShared>> = {
            let mut inner = self.lock();
            match (inner.state, request) {
                (ExecutionState::Running, _) => {}
                (ExecutionState::Ready, Request::Halt) => {
                    info!("{}: halted before it was started", self.name);
                    inner.state = ExecutionState::Halted;
                    return;
                }
                (state, _) => {
                    warn!("{}: ignoring {request:?} while {state:?}", self.name);
                    return;
                }
            }
            inner.state = match request {
                Request::Suspend => ExecutionState::Suspending,
                Request::Halt => ExecutionState::Halting,
            };
            for (_, context) in inner.contexts.iter() {
                let mut status = context.shared.lock();
                if status.running {
                    status.requested = Some(request);
                    context.messenger.send(request.message());
                }
            }
            inner
                .contexts
                .iter()
                .map(|(_, context)| Arc::clone(&context.shared))
                .collect()
        };

        for shared in &waiting {
            shared.wait_stopped();
        }

        let mut inner = self.lock();
        let EngineInner {
            contexts,
            prototype,
            ..
        } = &mut *inner;
        for (_, context) in contexts.iter_mut() {
            context.reap(prototype);
        }
        inner.state = match request {
            Request::Suspend => ExecutionState::Ready,
            Request::Halt => ExecutionState::Halted,
        };
        info!("{}: {:?}", self.name, inner.state);
    }

    fn step_with(
        &self,
        id: GuestThreadId,
        step: fn(&mut S, &mut crate::thread::ThreadInstance) -> Result<ExecutionResult, EngineError>,
    ) -> Result<ExecutionResult, EngineError> {
        let mut inner = self.lock();
        inner.settle();
        let index = *inner.by_thread.get(&id).ok_or(EngineError::NotAttached(id))?;
        match inner.state {
            ExecutionState::Ready | ExecutionState::Halted => {}
            state => {
                return Err(EngineError::InvalidState {
                    operation: "step a thread",
                    state,
                })
            }
        }
        let EngineInner {
            contexts,
            prototype,
            ..
        } = &mut *inner;
        let context = contexts.get_mut(index).ok_or(EngineError::NotAttached(id))?;
        let stepper = context.stepper.get_or_insert_with(|| prototype.clone());
        let result = step(stepper, &mut lock_thread(&context.thread))?;
        context.shared.lock().last_result = Some(result);
        Ok(result)
    }
}

impl<S: BlockStepper + Clone + Debug> ExecutionEngine for BasicExecutionEngine<S> {
    fn attach_thread(&self, thread: SharedThread) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let (id, messenger) = {
            let mut guard = lock_thread(&thread);
            let id = guard.id();
            if inner.by_thread.contains_key(&id) {
                return Err(EngineError::AlreadyAttached(id));
            }
            if inner.trace.is_some() {
                guard.set_trace_sink(inner.trace.clone());
            }
            (id, guard.messenger().clone())
        };

        let context = ExecutionContext {
            id,
            thread,
            messenger,
            shared: Arc::default(),
            worker: None,
            stepper: Some(inner.prototype.clone()),
        };
        let index = inner.contexts.insert(context);
        inner.by_thread.insert(id, index);
        debug!("{}: attached thread {id}", self.name);

        if inner.state == ExecutionState::Running {
            let EngineInner {
                contexts,
                prototype,
                ..
            } = &mut *inner;
            if let Some(context) = contexts.get_mut(index) {
                context.spawn(prototype, self.step_limit)?;
            }
        }
        Ok(())
    }

    fn detach_thread(&self, id: GuestThreadId) -> Result<SharedThread, EngineError> {
        let mut inner = self.lock();
        inner.settle();
        let index = *inner.by_thread.get(&id).ok_or(EngineError::NotAttached(id))?;
        if matches!(
            inner.state,
            ExecutionState::Running | ExecutionState::Suspending | ExecutionState::Halting
        ) {
            return Err(EngineError::DetachWhileRunning(id));
        }
        inner.by_thread.remove(&id);
        let context = inner
            .contexts
            .remove(index)
            .ok_or(EngineError::NotAttached(id))?;
        debug!("{}: detached thread {id}", self.name);
        Ok(context.thread)
    }

    /// Spawns a worker for every attached thread.
    ///
    /// If a worker cannot be spawned the engine is left `Running` with the workers started so
    /// far; [`halt`](ExecutionEngine::halt) stops them.
    fn start(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.state != ExecutionState::Ready {
            return Err(EngineError::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }
        inner.state = ExecutionState::Running;
        let EngineInner {
            contexts,
            prototype,
            ..
        } = &mut *inner;
        for (_, context) in contexts.iter_mut() {
            context.messenger.clear();
            context.spawn(prototype, self.step_limit)?;
        }
        info!("{}: started {} threads", self.name, inner.contexts.len());
        Ok(())
    }

    fn suspend(&self) {
        self.stop(Request::Suspend);
    }

    fn halt(&self) {
        self.stop(Request::Halt);
    }

    fn join(&self) {
        let waiting: Vec<Arc<ContextShared>> = self
            .lock()
            .contexts
            .iter()
            .map(|(_, context)| Arc::clone(&context.shared))
            .collect();
        for shared in &waiting {
            shared.wait_stopped();
        }
    }

    fn state(&self) -> ExecutionState {
        let mut inner = self.lock();
        inner.settle();
        inner.state
    }

    fn attached_threads(&self) -> Vec<GuestThreadId> {
        let inner = self.lock();
        let mut ids: Vec<_> = inner.by_thread.keys().copied().collect();
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
        let mut inner = self.lock();
        for (_, context) in inner.contexts.iter() {
            lock_thread(&context.thread).set_trace_sink(sink.clone());
        }
        inner.trace = sink;
    }

    fn last_result(&self, id: GuestThreadId) -> Option<ExecutionResult> {
        let inner = self.lock();
        let context = inner.context(id).ok()?;
        let result = context.shared.lock().last_result;
        result
    }
}

impl<S: BlockStepper + Clone + Debug> Drop for BasicExecutionEngine<S> {
    fn drop(&mut self) {
        if self.lock().state == ExecutionState::Running {
            self.stop(Request::Halt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::tests::acc_thread;
    use crate::execution::share;
    use crate::thread::ThreadInstance;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    /// Always continues, counting the blocks it was asked to step.
    #[derive(Debug, Clone, Default)]
    struct Spin {
        steps: Arc<AtomicU64>,
    }

    impl BlockStepper for Spin {
        fn step_block(&mut self, _: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            self.steps.fetch_add(1, Ordering::SeqCst);
            std::thread::yield_now();
            Ok(ExecutionResult::Continue)
        }

        fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            self.step_block(thread)
        }
    }

    #[derive(Debug, Clone)]
    struct Broken;

    impl BlockStepper for Broken {
        fn step_block(&mut self, _: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            Err(EngineError::Malformed("broken".into()))
        }

        fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
            self.step_block(thread)
        }
    }

    fn wait_for_steps(steps: &AtomicU64, at_least: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while steps.load(Ordering::SeqCst) < at_least {
            assert!(Instant::now() < deadline, "worker made no progress");
            std::thread::yield_now();
        }
    }

    fn spin_engine(config: &Config) -> (BasicExecutionEngine<Spin>, Arc<AtomicU64>) {
        let spin = Spin::default();
        let steps = Arc::clone(&spin.steps);
        (BasicExecutionEngine::new("test", config, spin), steps)
    }

    #[test]
    fn test_halt_from_another_thread() {
        let (engine, steps) = spin_engine(&Config::default());
        let engine = Arc::new(engine);
        engine.attach_thread(share(acc_thread(0, &[]))).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), ExecutionState::Running);
        wait_for_steps(&steps, 10);

        let halter = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.halt())
        };
        halter.join().unwrap();
        assert_eq!(engine.state(), ExecutionState::Halted);
        engine.join();

        let id = GuestThreadId::new(0);
        assert_eq!(engine.last_result(id), Some(ExecutionResult::Halt));
        assert_eq!(engine.context_state(id), Some(ExecutionState::Halted));
        let after = steps.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(steps.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_detach_while_running() {
        let (engine, steps) = spin_engine(&Config::default());
        let id = GuestThreadId::new(3);
        engine.attach_thread(share(acc_thread(3, &[]))).unwrap();
        engine.start().unwrap();
        wait_for_steps(&steps, 1);

        assert_eq!(
            engine.detach_thread(id).unwrap_err(),
            EngineError::DetachWhileRunning(id)
        );
        assert_eq!(engine.attached_threads(), vec![id]);

        engine.halt();
        let thread = engine.detach_thread(id).unwrap();
        assert_eq!(lock_thread(&thread).id(), id);
        assert!(engine.attached_threads().is_empty());
        assert_eq!(
            engine.detach_thread(id).unwrap_err(),
            EngineError::NotAttached(id)
        );
    }

    #[test]
    fn test_attach_twice() {
        let (engine, _) = spin_engine(&Config::default());
        engine.attach_thread(share(acc_thread(1, &[]))).unwrap();
        assert_eq!(
            engine.attach_thread(share(acc_thread(1, &[]))),
            Err(EngineError::AlreadyAttached(GuestThreadId::new(1)))
        );
        assert_eq!(engine.attached_threads().len(), 1);
    }

    #[test]
    fn test_step_limit_halts() {
        let config = Config {
            step_limit: Some(25),
            ..Config::default()
        };
        let (engine, steps) = spin_engine(&config);
        engine.attach_thread(share(acc_thread(0, &[]))).unwrap();
        engine.start().unwrap();
        engine.join();
        assert_eq!(steps.load(Ordering::SeqCst), 25);
        assert_eq!(engine.state(), ExecutionState::Halted);
        assert_eq!(engine.start(), Err(EngineError::InvalidState {
            operation: "start",
            state: ExecutionState::Halted
        }));
    }

    #[test]
    fn test_suspend_and_resume() {
        let (engine, steps) = spin_engine(&Config::default());
        let id = GuestThreadId::new(0);
        engine.attach_thread(share(acc_thread(0, &[]))).unwrap();
        engine.start().unwrap();
        wait_for_steps(&steps, 5);

        engine.suspend();
        assert_eq!(engine.state(), ExecutionState::Ready);
        assert_eq!(engine.context_state(id), Some(ExecutionState::Ready));
        let suspended_at = steps.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(steps.load(Ordering::SeqCst), suspended_at);

        engine.start().unwrap();
        wait_for_steps(&steps, suspended_at + 5);
        engine.halt();
        assert_eq!(engine.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_attach_while_running_starts_thread() {
        let (engine, steps) = spin_engine(&Config::default());
        engine.attach_thread(share(acc_thread(0, &[]))).unwrap();
        engine.start().unwrap();
        engine.attach_thread(share(acc_thread(1, &[]))).unwrap();
        assert_eq!(
            engine.context_state(GuestThreadId::new(1)),
            Some(ExecutionState::Running)
        );
        wait_for_steps(&steps, 2);
        engine.halt();
    }

    #[test]
    fn test_stepping_error_is_fatal() {
        let engine = BasicExecutionEngine::new("broken", &Config::default(), Broken);
        let id = GuestThreadId::new(0);
        engine.attach_thread(share(acc_thread(0, &[]))).unwrap();
        engine.start().unwrap();
        engine.join();
        assert_eq!(engine.last_result(id), Some(ExecutionResult::Abort));
        assert_eq!(
            engine.fatal_error(id),
            Some(EngineError::Malformed("broken".into()))
        );
        assert_eq!(engine.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_interpreter_runs_to_halt() {
        let engine = BasicExecutionEngine::interpreter("interp", &Config::default());
        let thread = share(acc_thread(0, &[0x0100_0005, 0x0100_0007, 0x0000_0000]));
        engine.attach_thread(Arc::clone(&thread)).unwrap();
        engine.start().unwrap();
        engine.join();

        let id = GuestThreadId::new(0);
        assert_eq!(engine.last_result(id), Some(ExecutionResult::Halt));
        assert_eq!(lock_thread(&thread).read_register::<u64>("R", 0), Ok(12));
        assert!(engine.fatal_error(id).is_none());
    }

    #[test]
    fn test_step_thread_synchronously() {
        let engine = BasicExecutionEngine::interpreter("interp", &Config::default());
        let thread = share(acc_thread(0, &[0x0100_0002, 0x0200_0000]));
        let id = GuestThreadId::new(0);
        engine.attach_thread(Arc::clone(&thread)).unwrap();

        assert_eq!(engine.step_thread_single(id), Ok(ExecutionResult::Continue));
        assert_eq!(lock_thread(&thread).read_register::<u64>("R", 0), Ok(2));
        assert_eq!(engine.step_thread_block(id), Ok(ExecutionResult::Continue));
        assert_eq!(lock_thread(&thread).pc().unwrap().get(), 0);
        assert_eq!(engine.last_result(id), Some(ExecutionResult::Continue));
        assert_eq!(
            engine.step_thread_block(GuestThreadId::new(9)),
            Err(EngineError::NotAttached(GuestThreadId::new(9)))
        );
    }
}
