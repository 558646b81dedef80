use super::{EngineError, ExecutionResult};
use crate::arch::{BehaviourId, InvocationContext};
use crate::memory::MemoryResult;
use crate::thread::{exception, ExceptionAction, ThreadInstance};
use crate::trace::TraceRecord;
use crate::Address;
use archsim_ir::instruction::{IrInstruction, Opcode};
use archsim_ir::regalloc::{AllocationSummary, STACK_SLOT_SIZE};
use archsim_ir::{Allocation, IrOperand, IrRegId, TranslationBuffer};
use log::trace;
use nohash::IntMap;
use std::sync::Arc;

fn mask(size: u8) -> u64 {
    match size {
        0 | 8.. => u64::MAX,
        _ => (1u64 << (size as u32 * 8)) - 1,
    }
}

fn sign_extend(value: u64, size: u8) -> i64 {
    match size {
        0 | 8.. => value as i64,
        _ => {
            let shift = 64 - size as u32 * 8;
            ((value << shift) as i64) >> shift
        }
    }
}

/// Where control goes after an instruction.
enum Flow {
    Next,
    Jump(usize),
    Exit(ExecutionResult),
}

/// Evaluates a register-allocated [`TranslationBuffer`] against a thread.
///
/// Virtual registers live where the allocator put them: in a bank of host registers or in the
/// unit's stack frame. Registers the allocator never saw are kept by id.
#[derive(Debug)]
pub struct IrExecutor<'t> {
    thread: &'t mut ThreadInstance,
    registers: Vec<u64>,
    stack: Vec<u64>,
    unallocated: IntMap<IrRegId, u64>,
    /// Set once an exception handler asked to skip the current guest instruction; the unit ends
    /// after the next PC increment.
    exit_after_inc_pc: bool,
    exception_taken: bool,
}

impl<'t> IrExecutor<'t> {
    pub fn new(thread: &'t mut ThreadInstance, summary: AllocationSummary) -> Self {
        Self {
            thread,
            registers: vec![0; summary.registers_used as usize],
            stack: vec![0; summary.stack_frame_size.div_ceil(STACK_SLOT_SIZE) as usize],
            unallocated: IntMap::default(),
            exit_after_inc_pc: false,
            exception_taken: false,
        }
    }

    /// Whether a guest exception cut the last run short.
    pub fn exception_taken(&self) -> bool {
        self.exception_taken
    }

    /// Runs the unit from its first instruction until `ret`, a non-`Continue` result, or the end
    /// of the block control is in.
    pub fn run(&mut self, buffer: &TranslationBuffer) -> Result<ExecutionResult, EngineError> {
        let Some(first) = buffer.at(0) else {
            return Ok(ExecutionResult::Continue);
        };
        let mut block = first.block;
        let mut index = 0;
        while let Some(insn) = buffer.at(index) {
            if insn.block != block {
                break;
            }
            match self.execute(insn)? {
                Flow::Next => index += 1,
                Flow::Jump(target) => {
                    let start = buffer.block_start(insn.operands[target].block_id()?).ok_or_else(
                        || EngineError::Malformed(format!("jump to empty block from `{insn}`")),
                    )?;
                    block = buffer.as_slice()[start].block;
                    index = start;
                }
                Flow::Exit(result) => return Ok(result),
            }
        }
        Ok(ExecutionResult::Continue)
    }

    fn read(&self, operand: IrOperand) -> Result<u64, EngineError> {
        match operand {
            IrOperand::Constant { value, size } => Ok(value & mask(size)),
            IrOperand::VReg {
                id,
                size,
                allocation,
            } => {
                let value = match allocation {
                    Allocation::Register(r) => self.registers.get(r as usize).copied(),
                    Allocation::Stack(offset) => {
                        self.stack.get((offset / STACK_SLOT_SIZE) as usize).copied()
                    }
                    Allocation::NotAllocated => {
                        Some(self.unallocated.get(&id).copied().unwrap_or(0))
                    }
                };
                value
                    .map(|value| value & mask(size))
                    .ok_or_else(|| EngineError::Malformed(format!("{operand} is outside the frame")))
            }
            IrOperand::Pc { size } => Ok(self.thread.pc()?.get() & mask(size)),
            _ => Err(EngineError::Malformed(format!("{operand} has no value"))),
        }
    }

    fn write(&mut self, operand: IrOperand, value: u64) -> Result<(), EngineError> {
        let IrOperand::VReg {
            id,
            size,
            allocation,
        } = operand
        else {
            return Err(EngineError::Malformed(format!("cannot write to {operand}")));
        };
        let value = value & mask(size);
        let slot = match allocation {
            Allocation::Register(r) => self.registers.get_mut(r as usize),
            Allocation::Stack(offset) => self.stack.get_mut((offset / STACK_SLOT_SIZE) as usize),
            Allocation::NotAllocated => Some(self.unallocated.entry(id).or_insert(0)),
        };
        match slot {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(EngineError::Malformed(format!("{operand} is outside the frame"))),
        }
    }

    fn size_of(operand: IrOperand) -> u8 {
        operand.size().unwrap_or(8)
    }

    /// Applies the exception handler's decision for an exception taken mid-unit.
    fn exception_flow(&mut self, action: ExceptionAction) -> Flow {
        self.exception_taken = true;
        match action {
            ExceptionAction::ResumeNext => {
                self.exit_after_inc_pc = true;
                Flow::Next
            }
            other => Flow::Exit(other.execution_result()),
        }
    }

    fn memory_fault(&mut self, address: u64) -> Flow {
        let action = self.thread.take_exception(exception::DATA_FAULT, address);
        self.exception_flow(action)
    }

    fn execute(&mut self, insn: &IrInstruction) -> Result<Flow, EngineError> {
        let ops = insn.operands;
        let binary = |this: &mut Self, f: fn(u64, u64, u8) -> u64| -> Result<Flow, EngineError> {
            let src = this.read(ops[0])?;
            let dst = this.read(ops[1])?;
            this.write(ops[1], f(dst, src, Self::size_of(ops[1])))?;
            Ok(Flow::Next)
        };
        let unary = |this: &mut Self, f: fn(u64, u8) -> u64| -> Result<Flow, EngineError> {
            let src = this.read(ops[0])?;
            this.write(ops[1], f(src, Self::size_of(ops[0])))?;
            Ok(Flow::Next)
        };
        let compare = |this: &mut Self, f: fn(u64, u64, u8) -> bool| -> Result<Flow, EngineError> {
            let lhs = this.read(ops[0])?;
            let rhs = this.read(ops[1])?;
            this.write(ops[2], f(lhs, rhs, Self::size_of(ops[0])) as u64)?;
            Ok(Flow::Next)
        };

        match insn.opcode {
            Opcode::Nop
            | Opcode::Verify
            | Opcode::Count
            | Opcode::Profile
            | Opcode::Barrier
            | Opcode::IntCheck
            | Opcode::Flush
            | Opcode::FlushItlb
            | Opcode::FlushDtlb
            | Opcode::FlushItlbEntry
            | Opcode::FlushDtlbEntry => Ok(Flow::Next),
            Opcode::Trap => Ok(Flow::Exit(ExecutionResult::Abort)),

            Opcode::Mov | Opcode::MovZx | Opcode::MovTrunc => {
                let value = self.read(ops[0])?;
                self.write(ops[1], value)?;
                Ok(Flow::Next)
            }
            Opcode::MovSx => unary(self, |v, size| sign_extend(v, size) as u64),
            Opcode::Cmov => {
                if self.read(ops[0])? != 0 {
                    let value = self.read(ops[1])?;
                    self.write(ops[2], value)?;
                }
                Ok(Flow::Next)
            }
            Opcode::Ldpc => {
                let pc = self.thread.pc()?.get();
                self.write(ops[0], pc)?;
                Ok(Flow::Next)
            }
            Opcode::IncPc => {
                let amount = self.read(ops[0])?;
                let pc = self.thread.pc()?;
                self.thread.set_pc(pc.wrapping_add(amount))?;
                if self.exit_after_inc_pc {
                    return Ok(Flow::Exit(ExecutionResult::Continue));
                }
                Ok(Flow::Next)
            }

            Opcode::Add => binary(self, |d, s, _| d.wrapping_add(s)),
            Opcode::Sub => binary(self, |d, s, _| d.wrapping_sub(s)),
            Opcode::Imul => binary(self, |d, s, size| {
                sign_extend(d, size).wrapping_mul(sign_extend(s, size)) as u64
            }),
            Opcode::Umul => binary(self, |d, s, _| d.wrapping_mul(s)),
            // Division by zero follows the common RISC convention instead of trapping.
            Opcode::Udiv => binary(self, |d, s, _| d.checked_div(s).unwrap_or(u64::MAX)),
            Opcode::Sdiv => binary(self, |d, s, size| {
                sign_extend(d, size)
                    .checked_div(sign_extend(s, size))
                    .unwrap_or(-1) as u64
            }),
            Opcode::Mod => binary(self, |d, s, _| d.checked_rem(s).unwrap_or(d)),
            Opcode::Shl => binary(self, |d, s, _| d.checked_shl(s as u32).unwrap_or(0)),
            Opcode::Shr => binary(self, |d, s, _| d.checked_shr(s as u32).unwrap_or(0)),
            Opcode::Sar => binary(self, |d, s, size| {
                (sign_extend(d, size) >> (s as u32).min(63)) as u64
            }),
            Opcode::Ror | Opcode::Rol => {
                let amount = self.read(ops[0])?;
                let value = self.read(ops[1])?;
                let bits = Self::size_of(ops[1]).clamp(1, 8) as u64 * 8;
                let amount = amount % bits;
                let amount = if insn.opcode == Opcode::Rol {
                    (bits - amount) % bits
                } else {
                    amount
                };
                let rotated = if amount == 0 {
                    value
                } else {
                    (value >> amount) | (value << (bits - amount))
                };
                self.write(ops[1], rotated)?;
                Ok(Flow::Next)
            }
            Opcode::Clz => unary(self, |v, size| {
                let size = size.clamp(1, 8) as u32;
                (v.leading_zeros() - (64 - size * 8)) as u64
            }),
            Opcode::Popcnt => unary(self, |v, _| v.count_ones() as u64),
            Opcode::Bswap => unary(self, |v, size| {
                let size = size.clamp(1, 8) as u32;
                v.swap_bytes() >> (64 - size * 8)
            }),
            Opcode::And => binary(self, |d, s, _| d & s),
            Opcode::Or => binary(self, |d, s, _| d | s),
            Opcode::Xor => binary(self, |d, s, _| d ^ s),

            Opcode::CmpEq => compare(self, |a, b, _| a == b),
            Opcode::CmpNe => compare(self, |a, b, _| a != b),
            Opcode::CmpGt => compare(self, |a, b, _| a > b),
            Opcode::CmpGte => compare(self, |a, b, _| a >= b),
            Opcode::CmpLt => compare(self, |a, b, _| a < b),
            Opcode::CmpLte => compare(self, |a, b, _| a <= b),
            Opcode::CmpsGt => compare(self, |a, b, n| sign_extend(a, n) > sign_extend(b, n)),
            Opcode::CmpsGte => compare(self, |a, b, n| sign_extend(a, n) >= sign_extend(b, n)),
            Opcode::CmpsLt => compare(self, |a, b, n| sign_extend(a, n) < sign_extend(b, n)),
            Opcode::CmpsLte => compare(self, |a, b, n| sign_extend(a, n) <= sign_extend(b, n)),

            Opcode::Ldreg => {
                let offset = self.read(ops[0])? as usize;
                let size = Self::size_of(ops[1]) as usize;
                let value = self.thread.registers().read_sized(offset, size)?;
                self.write(ops[1], value)?;
                Ok(Flow::Next)
            }
            Opcode::Streg => {
                let value = self.read(ops[0])?;
                let offset = self.read(ops[1])? as usize;
                let size = Self::size_of(ops[0]) as usize;
                self.thread
                    .registers_mut()
                    .write_sized(offset, size, value)?;
                Ok(Flow::Next)
            }
            Opcode::Ldmem => {
                let address = self.read(ops[1])?;
                let size = Self::size_of(ops[2]);
                match self.load(ops[0], Address::new(address), size)? {
                    Ok(value) => {
                        self.thread.trace(TraceRecord::MemRead {
                            addr: Address::new(address),
                            value,
                            size,
                        });
                        self.write(ops[2], value)?;
                        Ok(Flow::Next)
                    }
                    Err(e) => {
                        trace!("thread {}: {e}", self.thread.id());
                        Ok(self.memory_fault(address))
                    }
                }
            }
            Opcode::Stmem => {
                let address = self.read(ops[1])?;
                let value = self.read(ops[2])?;
                let size = Self::size_of(ops[2]);
                match self.store(ops[0], Address::new(address), size, value)? {
                    Ok(()) => {
                        self.thread.trace(TraceRecord::MemWrite {
                            addr: Address::new(address),
                            value,
                            size,
                        });
                        Ok(Flow::Next)
                    }
                    Err(e) => {
                        trace!("thread {}: {e}", self.thread.id());
                        Ok(self.memory_fault(address))
                    }
                }
            }

            Opcode::Call => self.call(insn),
            Opcode::Jmp => Ok(Flow::Jump(0)),
            Opcode::Branch => {
                if self.read(ops[0])? != 0 {
                    Ok(Flow::Jump(1))
                } else {
                    Ok(Flow::Jump(2))
                }
            }
            Opcode::Ret => Ok(Flow::Exit(ExecutionResult::Continue)),

            Opcode::TakeException => {
                let category = self.read(ops[0])? as u32;
                let data = self.read(ops[1])?;
                let action = self.thread.take_exception(category, data);
                Ok(self.exception_flow(action))
            }
            Opcode::SetCpuMode => {
                let mode = self.read(ops[0])? as u32;
                self.thread.set_mode_id(mode);
                Ok(Flow::Next)
            }
            Opcode::SetFeature => {
                let feature = self.read(ops[0])? as u32;
                let level = self.read(ops[1])? as u32;
                self.thread.features_mut().set_level(feature, level);
                Ok(Flow::Next)
            }
            Opcode::FctrlSetRound => {
                self.thread.fp_state_mut().rounding_mode = self.read(ops[0])? as u8;
                Ok(Flow::Next)
            }
            Opcode::FctrlGetRound => {
                let mode = self.thread.fp_state().rounding_mode;
                self.write(ops[0], mode as u64)?;
                Ok(Flow::Next)
            }
            Opcode::FctrlSetFlush => {
                self.thread.fp_state_mut().flush_mode = self.read(ops[0])? != 0;
                Ok(Flow::Next)
            }
            Opcode::FctrlGetFlush => {
                let flush = self.thread.fp_state().flush_mode;
                self.write(ops[0], flush as u64)?;
                Ok(Flow::Next)
            }

            opcode => Err(EngineError::Unimplemented { opcode }),
        }
    }

    fn interface_id(&self, operand: IrOperand) -> Result<u32, EngineError> {
        match operand {
            IrOperand::Constant { value, .. } => Ok(value as u32),
            _ => Err(EngineError::Malformed(format!(
                "memory interface must be a constant, got {operand}"
            ))),
        }
    }

    fn load(
        &self,
        interface: IrOperand,
        address: Address,
        size: u8,
    ) -> Result<MemoryResult<u64>, EngineError> {
        let id = self.interface_id(interface)?;
        let interface = self
            .thread
            .memory_interface_by_id(id)
            .ok_or_else(|| EngineError::Malformed(format!("no memory interface {id}")))?;
        Ok(match size {
            1 => interface.read_8(address).map(u64::from),
            2 => interface.read_16(address).map(u64::from),
            4 => interface.read_32(address).map(u64::from),
            8 => interface.read_64(address),
            size => {
                return Err(EngineError::Malformed(format!(
                    "unsupported {size}-byte load from {address}"
                )))
            }
        })
    }

    fn store(
        &self,
        interface: IrOperand,
        address: Address,
        size: u8,
        value: u64,
    ) -> Result<MemoryResult, EngineError> {
        let id = self.interface_id(interface)?;
        let interface = self
            .thread
            .memory_interface_by_id(id)
            .ok_or_else(|| EngineError::Malformed(format!("no memory interface {id}")))?;
        Ok(match size {
            1 => interface.write_8(address, value as u8),
            2 => interface.write_16(address, value as u16),
            4 => interface.write_32(address, value as u32),
            8 => interface.write_64(address, value),
            size => {
                return Err(EngineError::Malformed(format!(
                    "unsupported {size}-byte store to {address}"
                )))
            }
        })
    }

    /// Invokes the behaviour named by the `Func` operand of the current mode's instruction set.
    fn call(&mut self, insn: &IrInstruction) -> Result<Flow, EngineError> {
        let IrOperand::Func(id) = insn.operands[0] else {
            return Err(EngineError::Malformed(format!("bad call target in `{insn}`")));
        };
        let mut args = [0u64; 5];
        let count = insn.operand_count().saturating_sub(1);
        for (arg, operand) in args.iter_mut().zip(&insn.operands[1..=count]) {
            *arg = self.read(*operand)?;
        }

        let arch = Arc::clone(self.thread.arch());
        let isa = arch.isa_by_mode(self.thread.mode_id())?;
        let mut context = InvocationContext::new(self.thread, &args[..count]);
        isa.invoke_by_id(BehaviourId(id as u32), &mut context)?;
        let result = context.result();
        Ok(match context.exception() {
            Some(action) => self.exception_flow(action),
            None if result != ExecutionResult::Continue => Flow::Exit(result),
            None => Flow::Next,
        })
    }
}

trait BlockOperand {
    fn block_id(&self) -> Result<archsim_ir::IrBlockId, EngineError>;
}

impl BlockOperand for IrOperand {
    fn block_id(&self) -> Result<archsim_ir::IrBlockId, EngineError> {
        match *self {
            IrOperand::Block(block) => Ok(block),
            other => Err(EngineError::Malformed(format!("{other} is not a block"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::interpreter::tests::acc_thread;
    use archsim_ir::regalloc::allocate_registers;
    use archsim_ir::IrBuilder;

    fn run(thread: &mut ThreadInstance, buffer: &mut TranslationBuffer) -> ExecutionResult {
        let summary = allocate_registers(buffer, 4);
        IrExecutor::new(thread, summary).run(buffer).unwrap()
    }

    #[test]
    fn test_arithmetic_through_registers() {
        let mut thread = acc_thread(0, &[]);
        let pc_offset = thread.registers().pc_offset().unwrap() as u64;
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let x = b.alloc_reg(8).unwrap();
        let y = b.alloc_reg(8).unwrap();
        b.mov(IrOperand::const64(6), x).unwrap();
        b.mov(IrOperand::const64(7), y).unwrap();
        b.umul(x, y).unwrap();
        b.streg(y, IrOperand::const64(0)).unwrap();
        b.ldreg(IrOperand::const64(pc_offset), x).unwrap();
        b.add(IrOperand::const64(0x40), x).unwrap();
        b.streg(x, IrOperand::const64(8)).unwrap();
        b.ret().unwrap();

        assert_eq!(run(&mut thread, &mut buffer), ExecutionResult::Continue);
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 42);
        assert_eq!(thread.read_register::<u64>("R", 1).unwrap(), 0x40);
    }

    #[test]
    fn test_sizes_and_signs() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let byte = b.alloc_reg(1).unwrap();
        let wide = b.alloc_reg(8).unwrap();
        let flag = b.alloc_reg(1).unwrap();
        b.mov(IrOperand::const8(0xff), byte).unwrap();
        b.add(IrOperand::const8(2), byte).unwrap();
        b.sx(IrOperand::const8(0x80), wide).unwrap();
        b.cmps_lt(wide, IrOperand::const64(0), flag).unwrap();
        b.streg(byte, IrOperand::const64(0)).unwrap();
        b.streg(wide, IrOperand::const64(8)).unwrap();
        b.zx(flag, wide).unwrap();
        b.streg(wide, IrOperand::const64(16)).unwrap();
        b.ret().unwrap();

        run(&mut thread, &mut buffer);
        assert_eq!(thread.read_register::<u8>("R", 0).unwrap(), 1);
        assert_eq!(thread.read_register::<u64>("R", 1).unwrap(), (-128i64) as u64);
        assert_eq!(thread.pc().unwrap(), Address::new(1));
    }

    #[test]
    fn test_branches_between_blocks() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        let taken = b.alloc_block().unwrap();
        let not_taken = b.alloc_block().unwrap();
        let cond = b.alloc_reg(1).unwrap();
        b.set_block(entry);
        b.cmp_gt(IrOperand::const32(5), IrOperand::const32(3), cond)
            .unwrap();
        b.branch(cond, IrOperand::block(taken), IrOperand::block(not_taken))
            .unwrap();
        b.set_block(not_taken);
        b.streg(IrOperand::const64(1), IrOperand::const64(0)).unwrap();
        b.ret().unwrap();
        b.set_block(taken);
        b.streg(IrOperand::const64(2), IrOperand::const64(0)).unwrap();
        b.trap().unwrap();

        assert_eq!(run(&mut thread, &mut buffer), ExecutionResult::Abort);
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 2);
    }

    #[test]
    fn test_memory_and_faults() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let value = b.alloc_reg(4).unwrap();
        b.stmem(IrOperand::const32(0), IrOperand::const64(0x100), IrOperand::const32(0xabcd))
            .unwrap();
        b.ldmem(IrOperand::const32(0), IrOperand::const64(0x100), value)
            .unwrap();
        b.streg(value, IrOperand::const64(0)).unwrap();
        b.ldmem(IrOperand::const32(0), IrOperand::const64(0x5000), value)
            .unwrap();
        b.streg(IrOperand::const64(9), IrOperand::const64(8)).unwrap();
        b.ret().unwrap();

        // The second load faults; without a handler the unit stops there.
        assert_eq!(run(&mut thread, &mut buffer), ExecutionResult::Exception);
        assert_eq!(thread.read_register::<u32>("R", 0).unwrap(), 0xabcd);
        assert_eq!(thread.read_register::<u64>("R", 1).unwrap(), 0);
    }

    #[test]
    fn test_odd_sized_memory_access() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let value = b.alloc_reg(3).unwrap();
        b.ldmem(IrOperand::const32(0), IrOperand::const64(0x100), value)
            .unwrap();
        b.ret().unwrap();
        let summary = allocate_registers(&mut buffer, 4);
        assert!(matches!(
            IrExecutor::new(&mut thread, summary).run(&buffer),
            Err(EngineError::Malformed(_))
        ));

        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let value = b.alloc_reg(3).unwrap();
        b.stmem(IrOperand::const32(0), IrOperand::const64(0x100), value)
            .unwrap();
        b.ret().unwrap();
        let summary = allocate_registers(&mut buffer, 4);
        assert!(matches!(
            IrExecutor::new(&mut thread, summary).run(&buffer),
            Err(EngineError::Malformed(_))
        ));
        let mut word = [0; 8];
        thread
            .memory_interface_by_id(0)
            .unwrap()
            .read_bytes(Address::new(0x100), &mut word)
            .unwrap();
        assert_eq!(word, [0; 8]);
    }

    #[test]
    fn test_calls_behaviours() {
        let mut thread = acc_thread(0, &[]);
        let add = thread.isa().unwrap().behaviour_id("add").unwrap();
        let halt = thread.isa().unwrap().behaviour_id("halt").unwrap();
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        b.call(IrOperand::func(add.0 as u64), &[IrOperand::const64(5)])
            .unwrap();
        b.inc_pc(IrOperand::const64(4)).unwrap();
        b.call(IrOperand::func(halt.0 as u64), &[]).unwrap();
        b.inc_pc(IrOperand::const64(4)).unwrap();
        b.ret().unwrap();

        assert_eq!(run(&mut thread, &mut buffer), ExecutionResult::Halt);
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 5);
        assert_eq!(thread.pc().unwrap(), Address::new(4));
    }

    #[test]
    fn test_unimplemented_opcode() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let f = b.alloc_reg(8).unwrap();
        b.fadd(IrOperand::const_f64(1.0), IrOperand::const_f64(2.0), f)
            .unwrap();
        b.ret().unwrap();
        let summary = allocate_registers(&mut buffer, 4);
        assert_eq!(
            IrExecutor::new(&mut thread, summary).run(&buffer),
            Err(EngineError::Unimplemented {
                opcode: Opcode::Fadd
            })
        );
    }

    #[test]
    fn test_spilled_registers() {
        let mut thread = acc_thread(0, &[]);
        let mut buffer = TranslationBuffer::new();
        let mut b = IrBuilder::new(&mut buffer);
        let entry = b.alloc_block().unwrap();
        b.set_block(entry);
        let regs: Vec<IrOperand> = (0..6).map(|_| b.alloc_reg(8).unwrap()).collect();
        for (i, r) in regs.iter().enumerate() {
            b.mov(IrOperand::const64(i as u64 + 1), *r).unwrap();
        }
        let sum = regs[0];
        for r in &regs[1..] {
            b.add(*r, sum).unwrap();
        }
        b.streg(sum, IrOperand::const64(0)).unwrap();
        b.ret().unwrap();

        let summary = allocate_registers(&mut buffer, 2);
        assert!(summary.stack_frame_size > 0);
        IrExecutor::new(&mut thread, summary).run(&buffer).unwrap();
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 21);
    }
}
