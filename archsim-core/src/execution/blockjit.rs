//! Block translation to IR.
//!
//! A block is the straight-line run of guest instructions starting at the current PC. Its body is
//! translated to IR, register-allocated once, and cached per `(pc, mode)`. A control-flow
//! instruction ending the block is kept decoded and run through the interpreter path after the
//! body, since it owns the PC.

use super::interpreter::{execute_decoded, InterpreterStepper};
use super::ir_executor::IrExecutor;
use super::{BlockStepper, EngineError, ExecutionResult};
use crate::arch::{DecodedInstruction, IsaDescriptor};
use crate::config::Config;
use crate::thread::ThreadInstance;
use crate::trace::TraceRecord;
use crate::Address;
use archsim_ir::instruction::MAX_OPERANDS;
use archsim_ir::regalloc::{allocate_registers, AllocationSummary};
use archsim_ir::{IrBuilder, IrError, IrOperand, TranslationBuffer};
use log::{debug, trace};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Emits IR for single guest instructions.
pub trait BlockTranslator: Send + Sync + Debug {
    /// Appends the IR for `decoded` to the builder's current block.
    ///
    /// Returns `Ok(false)` if the instruction cannot be translated. The block then ends before
    /// it, and nothing may have been emitted for it.
    fn translate(
        &self,
        isa: &IsaDescriptor,
        decoded: &DecodedInstruction,
        pc: Address,
        builder: &mut IrBuilder<'_>,
    ) -> Result<bool, IrError>;
}

/// Translates every instruction to a call of its behaviour, with the decoded fields as constant
/// arguments.
#[derive(Debug, Default)]
pub struct BehaviourCallTranslator;

impl BlockTranslator for BehaviourCallTranslator {
    fn translate(
        &self,
        _isa: &IsaDescriptor,
        decoded: &DecodedInstruction,
        _pc: Address,
        builder: &mut IrBuilder<'_>,
    ) -> Result<bool, IrError> {
        if decoded.args.len() >= MAX_OPERANDS {
            return Ok(false);
        }
        let args: Vec<IrOperand> = decoded.args.iter().map(|&arg| IrOperand::const64(arg)).collect();
        builder.call(IrOperand::func(decoded.behaviour.0 as u64), &args)?;
        Ok(true)
    }
}

#[derive(Debug)]
struct TranslatedBlock {
    buffer: TranslationBuffer,
    summary: AllocationSummary,
    /// The control-flow instruction ending the block, and where it sits.
    tail: Option<(Address, DecodedInstruction)>,
}

impl TranslatedBlock {
    fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.tail.is_none()
    }
}

/// Steps threads by running cached IR translations of their blocks.
///
/// Instructions that cannot be fetched, decoded or translated at the start of a block are
/// stepped by the interpreter instead, which also takes care of raising the matching exception.
#[derive(Debug, Clone)]
pub struct BlockJitStepper {
    translator: Arc<dyn BlockTranslator>,
    max_block_instructions: usize,
    host_registers: u16,
    cache: HashMap<(Address, u32), Arc<TranslatedBlock>>,
}

impl BlockJitStepper {
    pub fn new(config: &Config, translator: Arc<dyn BlockTranslator>) -> Self {
        Self {
            translator,
            max_block_instructions: config.max_block_instructions.max(1),
            host_registers: config.host_registers,
            cache: HashMap::new(),
        }
    }

    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    /// Drops every cached translation, for example after guest code was modified.
    pub fn invalidate(&mut self) {
        debug!("dropping {} translated blocks", self.cache.len());
        self.cache.clear();
    }

    fn translate(
        &self,
        thread: &ThreadInstance,
        isa: &IsaDescriptor,
        start: Address,
    ) -> Result<TranslatedBlock, EngineError> {
        let mut buffer = TranslationBuffer::new();
        let mut tail = None;
        let mut builder = IrBuilder::new(&mut buffer);
        let entry = builder.alloc_block()?;
        builder.set_block(entry);

        let mut pc = start;
        let mut count = 0;
        while count < self.max_block_instructions {
            let Ok(word) = thread.fetch_interface().fetch_32(pc) else {
                break;
            };
            let Ok(decoded) = isa.decoder().decode(pc, word) else {
                break;
            };
            if decoded.writes_pc {
                tail = Some((pc, decoded));
                break;
            }
            if !self.translator.translate(isa, &decoded, pc, &mut builder)? {
                break;
            }
            builder.inc_pc(IrOperand::const64(decoded.length as u64))?;
            pc = pc.wrapping_add(decoded.length as u64);
            count += 1;
        }

        let summary = if count > 0 {
            builder.ret()?;
            allocate_registers(&mut buffer, self.host_registers)
        } else {
            AllocationSummary::default()
        };
        trace!(
            "translated {count} instructions at {start} into {} IR instructions",
            buffer.count()
        );
        Ok(TranslatedBlock {
            buffer,
            summary,
            tail,
        })
    }

    fn lookup(
        &mut self,
        thread: &ThreadInstance,
        isa: &IsaDescriptor,
    ) -> Result<Arc<TranslatedBlock>, EngineError> {
        let key = (thread.pc()?, thread.mode_id());
        if let Some(block) = self.cache.get(&key) {
            return Ok(Arc::clone(block));
        }
        let block = Arc::new(self.translate(thread, isa, key.0)?);
        if !block.is_empty() {
            self.cache.insert(key, Arc::clone(&block));
        }
        Ok(block)
    }
}

impl BlockStepper for BlockJitStepper {
    fn step_block(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
        let arch = Arc::clone(thread.arch());
        let isa = arch.isa_by_mode(thread.mode_id())?;
        let block = self.lookup(thread, isa)?;
        if block.is_empty() {
            let result = InterpreterStepper::step_instruction(thread)?.result;
            thread.trace(TraceRecord::BlockEnd);
            return Ok(result);
        }

        let mut executor = IrExecutor::new(thread, block.summary);
        let mut result = executor.run(&block.buffer)?;
        let completed = !executor.exception_taken();
        if let Some((pc, decoded)) = &block.tail {
            if completed && result == ExecutionResult::Continue {
                result = execute_decoded(thread, isa, decoded, *pc)?.result;
            }
        }
        thread.trace(TraceRecord::BlockEnd);
        Ok(result)
    }

    fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
        InterpreterStepper::step_instruction(thread).map(|outcome| outcome.result)
    }
}
