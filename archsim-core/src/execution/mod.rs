//! Stepping guest threads.
//!
//! An [`ExecutionEngine`] owns one execution context per attached thread and moves through
//! `Ready → Running → (Suspending | Halting) → (Ready | Halted)`. How a single block is executed is
//! up to its [`BlockStepper`]: [`InterpreterStepper`] decodes and dispatches one instruction at a
//! time, [`BlockJitStepper`] translates blocks to IR first.

use crate::arch::ArchError;
use crate::memory::MemoryError;
use crate::registers::RegisterError;
use crate::thread::{GuestThreadId, ThreadInstance};
use crate::trace::TraceSink;
use archsim_ir::instruction::Opcode;
use archsim_ir::IrError;
use downcast_rs::{impl_downcast, Downcast};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub mod blockjit;
pub mod engine;
pub mod interpreter;
pub mod ir_executor;
pub mod manager;
pub mod sync_engine;

pub use blockjit::{BehaviourCallTranslator, BlockJitStepper, BlockTranslator};
pub use engine::BasicExecutionEngine;
pub use interpreter::InterpreterStepper;
pub use ir_executor::IrExecutor;
pub use manager::ExecutionContextManager;
pub use sync_engine::SyncExecutionEngine;

/// Outcome of one step. This is a value, not an error: anything other than `Continue` ends the
/// current run of the stepping loop and is handed up to whoever drives it.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ExecutionResult {
    #[default]
    Continue,
    /// A guest exception the exception handler could not resolve.
    Exception,
    /// Translated code asked to abandon the current block.
    Abort,
    Halt,
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ExecutionState {
    #[default]
    Ready,
    Running,
    Suspending,
    Halting,
    Halted,
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum EngineError {
    #[error("thread {0} is already attached")]
    AlreadyAttached(GuestThreadId),
    #[error("thread {0} is not attached")]
    NotAttached(GuestThreadId),
    #[error("cannot detach thread {0} while the engine is running")]
    DetachWhileRunning(GuestThreadId),
    #[error("cannot {operation} while the engine is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ExecutionState,
    },
    #[error("opcode {opcode:?} is not implemented")]
    Unimplemented { opcode: Opcode },
    #[error("malformed translation: {0}")]
    Malformed(String),
    #[error("cannot spawn worker: {0}")]
    Spawn(String),
    #[error("worker for thread {0} panicked")]
    WorkerPanicked(GuestThreadId),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Arch(#[from] ArchError),
    #[error(transparent)]
    Ir(#[from] IrError),
}

/// A thread as shared between its owner and the engine it is attached to.
pub type SharedThread = Arc<Mutex<ThreadInstance>>;

pub fn share(thread: ThreadInstance) -> SharedThread {
    Arc::new(Mutex::new(thread))
}

pub(crate) fn lock_thread(thread: &SharedThread) -> MutexGuard<'_, ThreadInstance> {
    thread.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Executes guest code on a thread, one block or one instruction at a time.
pub trait BlockStepper: Send + 'static {
    fn step_block(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError>;

    fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError>;
}

/// Capability interface shared by every engine variant.
///
/// All methods take `&self`; engines synchronize internally so a supervisor can halt an engine
/// while another thread joins it.
pub trait ExecutionEngine: Downcast + Send + Sync + Debug {
    /// Fails if the thread is already attached. Starts the thread right away if the engine is
    /// running.
    fn attach_thread(&self, thread: SharedThread) -> Result<(), EngineError>;

    /// Fails if the engine is running or the thread is not attached.
    fn detach_thread(&self, id: GuestThreadId) -> Result<SharedThread, EngineError>;

    fn start(&self) -> Result<(), EngineError>;

    /// Stops every context after its current step and returns to `Ready`.
    fn suspend(&self);

    /// Stops every context after its current step. The engine ends up `Halted`.
    fn halt(&self);

    /// Blocks until every started context has stopped, without changing the engine state.
    fn join(&self);

    fn state(&self) -> ExecutionState;

    fn attached_threads(&self) -> Vec<GuestThreadId>;

    /// Steps one block of an attached thread on the caller's thread. Fails while running.
    fn step_thread_block(&self, id: GuestThreadId) -> Result<ExecutionResult, EngineError>;

    fn step_thread_single(&self, id: GuestThreadId) -> Result<ExecutionResult, EngineError>;

    /// Attaches `sink` to every current and future thread of this engine.
    fn set_trace_sink(&self, sink: Option<Arc<dyn TraceSink>>);

    /// The result the thread's last run or step ended with.
    fn last_result(&self, id: GuestThreadId) -> Option<ExecutionResult>;
}

impl_downcast!(ExecutionEngine);
