//! Run-wide configuration.

/// How the threads of an engine are scheduled.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum ExecutionMode {
    /// One OS worker per guest thread.
    #[default]
    Async,
    /// A single driver that steps every guest thread round-robin, one block at a time.
    Sync,
}

/// Which stepper an engine uses.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum EngineKind {
    #[default]
    Interpreter,
    BlockJit,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub execution_mode: ExecutionMode,
    pub engine: EngineKind,
    /// Maximum number of guest instructions in one block.
    pub max_block_instructions: usize,
    /// Number of blocks a thread may run before its worker halts it. `None` means no limit.
    pub step_limit: Option<u64>,
    /// Whether engines attach a trace sink to their threads.
    pub trace: bool,
    pub support_misaligned_memory_access: bool,
    /// Host registers available to the block translator's register allocator.
    pub host_registers: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            engine: EngineKind::default(),
            max_block_instructions: 64,
            step_limit: None,
            trace: false,
            support_misaligned_memory_access: true,
            host_registers: 16,
        }
    }
}
