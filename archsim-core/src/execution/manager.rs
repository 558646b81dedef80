use super::{EngineError, ExecutionEngine, ExecutionState};
use crate::trace::TraceSink;
use log::{debug, info};
use std::sync::Arc;

/// Top-level supervisor over a set of engines.
///
/// Engines are added once and never removed. `start`, `suspend`, `halt` and `join` go to every
/// engine in the order they were added; `start` stops at the first engine that fails and leaves
/// the ones already started running.
#[derive(Debug, Default)]
pub struct ExecutionContextManager {
    engines: Vec<Arc<dyn ExecutionEngine>>,
    trace: Option<Arc<dyn TraceSink>>,
}

impl ExecutionContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes ownership of `engine`, attaching the manager's trace sink to it.
    pub fn add_engine(&mut self, engine: Arc<dyn ExecutionEngine>) {
        if let Some(sink) = &self.trace {
            engine.set_trace_sink(Some(Arc::clone(sink)));
        }
        debug!("added engine #{}", self.engines.len());
        self.engines.push(engine);
    }

    pub fn set_trace_sink(&mut self, sink: Option<Arc<dyn TraceSink>>) {
        for engine in &self.engines {
            engine.set_trace_sink(sink.clone());
        }
        self.trace = sink;
    }

    pub fn engines(&self) -> &[Arc<dyn ExecutionEngine>] {
        &self.engines
    }

    /// The engine at `index`, if it is an `E`.
    pub fn engine<E: ExecutionEngine>(&self, index: usize) -> Option<&E> {
        let engine: &dyn ExecutionEngine = &**self.engines.get(index)?;
        engine.downcast_ref::<E>()
    }

    pub fn start(&self) -> Result<(), EngineError> {
        for engine in &self.engines {
            engine.start()?;
        }
        info!("started {} engines", self.engines.len());
        Ok(())
    }

    pub fn suspend(&self) {
        self.engines.iter().for_each(|engine| engine.suspend());
    }

    pub fn halt(&self) {
        self.engines.iter().for_each(|engine| engine.halt());
    }

    pub fn join(&self) {
        self.engines.iter().for_each(|engine| engine.join());
    }

    /// `Running` while any engine runs; `Halted` once all of them are.
    pub fn state(&self) -> ExecutionState {
        let states: Vec<ExecutionState> = self.engines.iter().map(|engine| engine.state()).collect();
        [
            ExecutionState::Running,
            ExecutionState::Halting,
            ExecutionState::Suspending,
        ]
        .into_iter()
        .find(|busy| states.contains(busy))
        .unwrap_or_else(|| {
            if !states.is_empty() && states.iter().all(|&state| state == ExecutionState::Halted) {
                ExecutionState::Halted
            } else {
                ExecutionState::Ready
            }
        })
    }
}
