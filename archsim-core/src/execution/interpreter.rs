use super::{BlockStepper, EngineError, ExecutionResult};
use crate::arch::{DecodedInstruction, InvocationContext, IsaDescriptor};
use crate::config::Config;
use crate::thread::{exception, ExceptionAction, ThreadInstance};
use crate::trace::TraceRecord;
use crate::Address;
use log::{debug, trace};
use std::sync::Arc;

/// What executing one guest instruction did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct InstructionOutcome {
    pub result: ExecutionResult,
    /// The instruction changed control flow, so the current block ends here.
    pub ends_block: bool,
}

/// Fetch, decode, dispatch.
#[derive(Debug, Clone)]
pub struct InterpreterStepper {
    max_block_instructions: usize,
}

impl InterpreterStepper {
    pub fn new(config: &Config) -> Self {
        Self {
            max_block_instructions: config.max_block_instructions.max(1),
        }
    }

    pub(crate) fn step_instruction(
        thread: &mut ThreadInstance,
    ) -> Result<InstructionOutcome, EngineError> {
        let pc = thread.pc()?;
        let word = match thread.fetch_interface().fetch_32(pc) {
            Ok(word) => word,
            Err(e) => {
                debug!("thread {}: fetch at {pc} failed: {e}", thread.id());
                let action = thread.take_exception(exception::FETCH_FAULT, pc.get());
                return resolve_fault(thread, action, pc, 4);
            }
        };
        thread.trace(TraceRecord::InstructionHeader { pc, ir: word });

        let arch = Arc::clone(thread.arch());
        let isa = arch.isa_by_mode(thread.mode_id())?;
        let decoded = match isa.decoder().decode(pc, word) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("thread {}: {e}", thread.id());
                let action = thread.take_exception(exception::UNDEFINED_INSTRUCTION, word as u64);
                return resolve_fault(thread, action, pc, 4);
            }
        };
        execute_decoded(thread, isa, &decoded, pc)
    }
}

/// Runs the behaviour of an already decoded instruction and advances the PC past it unless the
/// instruction or an exception handler moved it.
pub(crate) fn execute_decoded(
    thread: &mut ThreadInstance,
    isa: &IsaDescriptor,
    decoded: &DecodedInstruction,
    pc: Address,
) -> Result<InstructionOutcome, EngineError> {
    let mut context = InvocationContext::new(thread, decoded.args.as_slice());
    isa.invoke_by_id(decoded.behaviour, &mut context)?;
    let result = context.result();
    let exception = context.exception();

    let advance = match exception {
        Some(ExceptionAction::ResumeNext) => true,
        Some(_) => false,
        None => result == ExecutionResult::Continue && !decoded.writes_pc,
    };
    if advance {
        thread.set_pc(pc.wrapping_add(decoded.length as u64))?;
    }
    trace!(
        "thread {}: {pc} {} -> {result:?}",
        thread.id(),
        isa.behaviour_name(decoded.behaviour).unwrap_or("?")
    );
    Ok(InstructionOutcome {
        result,
        ends_block: decoded.writes_pc || exception.is_some(),
    })
}

fn resolve_fault(
    thread: &mut ThreadInstance,
    action: ExceptionAction,
    pc: Address,
    length: u64,
) -> Result<InstructionOutcome, EngineError> {
    if action == ExceptionAction::ResumeNext {
        thread.set_pc(pc.wrapping_add(length))?;
    }
    Ok(InstructionOutcome {
        result: action.execution_result(),
        ends_block: true,
    })
}

impl BlockStepper for InterpreterStepper {
    fn step_block(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
        let mut result = ExecutionResult::Continue;
        for _ in 0..self.max_block_instructions {
            let outcome = Self::step_instruction(thread)?;
            result = outcome.result;
            if outcome.ends_block || result != ExecutionResult::Continue {
                break;
            }
        }
        thread.trace(TraceRecord::BlockEnd);
        Ok(result)
    }

    fn step_single(&mut self, thread: &mut ThreadInstance) -> Result<ExecutionResult, EngineError> {
        Self::step_instruction(thread).map(|outcome| outcome.result)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::{
        ArchDescriptor, DecodeError, Decoder, FeaturesDescriptor, MemoryInterfaceDescriptor,
        MemoryInterfacesDescriptor, RegisterFileDescriptor,
    };
    use crate::resources::ram::Ram;
    use crate::thread::{ExceptionHandler, GuestThreadId};
    use crate::trace::VecTraceSink;
    use crate::Endianness;
    use archsim_ir::small_vec::MaybeVec;

    /// A tiny accumulator machine used by the execution tests.
    ///
    /// Words are `op << 24 | imm`:
    /// `0` halt, `1` add imm to r0, `2` jump to imm, `3` raise exception imm,
    /// `4` store r0 at address imm, `5` branch to imm if r0 < r1.
    #[derive(Debug)]
    pub(crate) struct AccDecoder;

    impl Decoder for AccDecoder {
        fn decode(&self, pc: Address, word: u32) -> Result<DecodedInstruction, DecodeError> {
            let imm = (word & 0x00ff_ffff) as u64;
            let (behaviour, writes_pc) = match word >> 24 {
                0 => (0, false),
                1 => (1, false),
                2 => (2, true),
                3 => (3, false),
                4 => (4, false),
                5 => (5, true),
                _ => return Err(DecodeError { pc, word }),
            };
            let mut args = MaybeVec::new();
            args.push(imm);
            Ok(DecodedInstruction {
                word,
                length: 4,
                behaviour: crate::arch::BehaviourId(behaviour),
                args,
                writes_pc,
            })
        }
    }

    fn halt(context: &mut InvocationContext<'_>) -> u64 {
        context.raise(ExecutionResult::Halt);
        0
    }

    fn add(context: &mut InvocationContext<'_>) -> u64 {
        let value: u64 = context.thread.read_register("R", 0).unwrap_or(0);
        let value = value.wrapping_add(context.arg(0));
        let _ = context.thread.write_register("R", 0, value);
        value
    }

    fn jump(context: &mut InvocationContext<'_>) -> u64 {
        let target = Address::new(context.arg(0));
        let _ = context.thread.set_pc(target);
        0
    }

    fn raise(context: &mut InvocationContext<'_>) -> u64 {
        let category = context.arg(0) as u32;
        context.raise_exception(category, 0);
        0
    }

    fn store(context: &mut InvocationContext<'_>) -> u64 {
        let value: u64 = context.thread.read_register("R", 0).unwrap_or(0);
        let address = Address::new(context.arg(0));
        if context
            .thread
            .fetch_interface()
            .write_64(address, value)
            .is_err()
        {
            context.raise_exception(exception::DATA_FAULT, address.get());
        }
        0
    }

    fn branch_lt(context: &mut InvocationContext<'_>) -> u64 {
        let r0: u64 = context.thread.read_register("R", 0).unwrap_or(0);
        let r1: u64 = context.thread.read_register("R", 1).unwrap_or(0);
        if let Ok(pc) = context.thread.pc() {
            let next = if r0 < r1 {
                Address::new(context.arg(0))
            } else {
                pc.wrapping_add(4)
            };
            let _ = context.thread.set_pc(next);
        }
        0
    }

    pub(crate) fn acc_arch() -> Arc<ArchDescriptor> {
        let registers = RegisterFileDescriptor::builder()
            .bank("R", 0, 2, 8, 8)
            .tagged("PC", 16, 8, "PC")
            .build()
            .unwrap();
        let interfaces = MemoryInterfacesDescriptor::new(vec![MemoryInterfaceDescriptor {
            name: "Mem".into(),
            id: 0,
            address_width: 8,
            data_width: 8,
            endianness: Endianness::LE,
            is_fetch: true,
        }])
        .unwrap();
        let mut isa = IsaDescriptor::builder("acc", 0);
        isa.add_behaviour("halt", halt).unwrap();
        isa.add_behaviour("add", add).unwrap();
        isa.add_behaviour("jump", jump).unwrap();
        isa.add_behaviour("raise", raise).unwrap();
        isa.add_behaviour("store", store).unwrap();
        isa.add_behaviour("branch_lt", branch_lt).unwrap();
        let isa = isa.build(Arc::new(AccDecoder));
        Arc::new(
            ArchDescriptor::new(
                "acc",
                registers,
                interfaces,
                FeaturesDescriptor::default(),
                vec![isa],
            )
            .unwrap(),
        )
    }

    /// Builds a thread with `program` loaded at address zero.
    pub(crate) fn acc_thread(id: u32, program: &[u32]) -> ThreadInstance {
        let ram = Arc::new(Ram::new(0x1000).unwrap());
        let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        ram.load(Address::NULL, &image).unwrap();
        ThreadInstance::builder(GuestThreadId::new(id), acc_arch())
            .connect_all(ram)
            .build()
            .unwrap()
    }

    #[derive(Debug)]
    struct Resume;

    impl ExceptionHandler for Resume {
        fn handle(&self, thread: &mut ThreadInstance, category: u32, _data: u64) -> ExceptionAction {
            let _ = thread.write_register("R", 1, category as u64);
            ExceptionAction::ResumeNext
        }
    }

    fn stepper() -> InterpreterStepper {
        InterpreterStepper::new(&Config::default())
    }

    #[test]
    fn test_straight_line_block() {
        let mut thread = acc_thread(0, &[0x0100_0002, 0x0100_0003, 0x0000_0000]);
        let result = stepper().step_block(&mut thread).unwrap();
        assert_eq!(result, ExecutionResult::Halt);
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 5);
        // The halting instruction does not advance the PC.
        assert_eq!(thread.pc().unwrap(), Address::new(8));
    }

    #[test]
    fn test_jump_ends_block() {
        let mut thread = acc_thread(0, &[0x0200_0008, 0x0100_0001, 0x0100_0010, 0]);
        assert_eq!(
            stepper().step_block(&mut thread).unwrap(),
            ExecutionResult::Continue
        );
        assert_eq!(thread.pc().unwrap(), Address::new(8));
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 0);
    }

    #[test]
    fn test_block_limit() {
        let mut thread = acc_thread(0, &[0x0100_0001; 8]);
        let mut stepper = InterpreterStepper::new(&Config {
            max_block_instructions: 3,
            ..Config::default()
        });
        stepper.step_block(&mut thread).unwrap();
        assert_eq!(thread.pc().unwrap(), Address::new(12));
        stepper.step_single(&mut thread).unwrap();
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 4);
    }

    #[test]
    fn test_undefined_instruction_without_handler() {
        let mut thread = acc_thread(0, &[0xff00_0000]);
        assert_eq!(
            stepper().step_single(&mut thread).unwrap(),
            ExecutionResult::Exception
        );
        assert_eq!(thread.pc().unwrap(), Address::NULL);
    }

    #[test]
    fn test_exception_resume_next() {
        let mut thread = acc_thread(0, &[0x0300_0009, 0x0100_0001, 0]);
        thread.set_exception_handler(Some(Arc::new(Resume)));
        assert_eq!(
            stepper().step_block(&mut thread).unwrap(),
            ExecutionResult::Continue
        );
        assert_eq!(thread.pc().unwrap(), Address::new(4));
        assert_eq!(thread.read_register::<u64>("R", 1).unwrap(), 9);
    }

    #[test]
    fn test_fetch_fault() {
        let mut thread = acc_thread(0, &[]);
        thread.set_pc(Address::new(0x2000)).unwrap();
        assert_eq!(
            stepper().step_single(&mut thread).unwrap(),
            ExecutionResult::Exception
        );
        thread.set_exception_handler(Some(Arc::new(Resume)));
        assert_eq!(
            stepper().step_single(&mut thread).unwrap(),
            ExecutionResult::Continue
        );
        assert_eq!(thread.pc().unwrap(), Address::new(0x2004));
        assert_eq!(
            thread.read_register::<u64>("R", 1).unwrap(),
            exception::FETCH_FAULT as u64
        );
    }

    #[test]
    fn test_trace_records() {
        let mut thread = acc_thread(0, &[0x0100_0001, 0]);
        let sink = Arc::new(VecTraceSink::new());
        thread.set_trace_sink(Some(sink.clone()));
        stepper().step_block(&mut thread).unwrap();
        assert_eq!(
            sink.take(),
            vec![
                TraceRecord::InstructionHeader {
                    pc: Address::NULL,
                    ir: 0x0100_0001
                },
                TraceRecord::InstructionHeader {
                    pc: Address::new(4),
                    ir: 0
                },
                TraceRecord::BlockEnd,
            ]
        );
    }
}
