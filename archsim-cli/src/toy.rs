//! A small 32-bit load/store machine for the demo.
//!
//! Every instruction is one little-endian word: `op[31:24] rd[23:20] rs1[19:16] imm[15:0]`.
//! `add` and `sc` take their second source register from `imm[3:0]`.
//!
//! | op | mnemonic            | effect                                              |
//! |----|---------------------|-----------------------------------------------------|
//! | 0  | `halt`              | stops the thread                                    |
//! | 1  | `li rd, imm`        | `rd = sext(imm)`                                    |
//! | 2  | `add rd, rs1, rs2`  | `rd = rs1 + rs2`                                    |
//! | 3  | `addi rd, rs1, imm` | `rd = rs1 + sext(imm)`                              |
//! | 4  | `ld rd, imm(rs1)`   | `rd = mem32[rs1 + imm]`                             |
//! | 5  | `st rd, imm(rs1)`   | `mem32[rs1 + imm] = rd`                             |
//! | 6  | `ll rd, (rs1)`      | load-linked                                         |
//! | 7  | `sc rd, rs2, (rs1)` | store-conditional of `rs2`; `rd = 0` on success     |
//! | 8  | `bne rd, rs1, imm`  | `pc += sext(imm)` if `rd != rs1`                    |
//! | 9  | `tid rd`            | `rd` = guest thread id                              |

use archsim_core::arch::{
    ArchDescriptor, ArchError, BehaviourId, DecodeError, DecodedInstruction, Decoder,
    FeaturesDescriptor, InvocationContext, IsaDescriptor, MemoryInterfaceDescriptor,
    MemoryInterfacesDescriptor, RegisterFileDescriptor,
};
use archsim_core::execution::{BehaviourCallTranslator, BlockTranslator, ExecutionResult};
use archsim_core::memory::MemoryError;
use archsim_core::thread::exception;
use archsim_core::{Address, Endianness};
use archsim_ir::small_vec::MaybeVec;
use archsim_ir::{IrBuilder, IrError, IrOperand};
use log::warn;
use std::sync::Arc;

pub const RAM_SIZE: u64 = 0x1_0000;
/// Stack space reserved per thread, growing down from the top of RAM.
pub const STACK_SIZE: u64 = 0x400;
/// Where the demo program keeps its shared counter.
pub const COUNTER: u64 = 0x100;

pub mod op {
    pub const HALT: u8 = 0;
    pub const LI: u8 = 1;
    pub const ADD: u8 = 2;
    pub const ADDI: u8 = 3;
    pub const LD: u8 = 4;
    pub const ST: u8 = 5;
    pub const LL: u8 = 6;
    pub const SC: u8 = 7;
    pub const BNE: u8 = 8;
    pub const TID: u8 = 9;
}

const REGISTERS: u64 = 8;

pub fn encode(op: u8, rd: u8, rs1: u8, imm: i16) -> u32 {
    (op as u32) << 24 | (rd as u32 & 0xf) << 20 | (rs1 as u32 & 0xf) << 16 | imm as u16 as u32
}

/// Largest count [`counter_program`] accepts. `li` sign-extends its immediate.
pub const MAX_ITERATIONS: u16 = i16::MAX as u16;

/// Every thread adds one to the word at [`COUNTER`] `iterations` times with an ll/sc retry loop,
/// then halts.
///
/// Returns `None` unless `iterations` is in `1..=MAX_ITERATIONS`; the loop only exits when its
/// count reaches zero.
pub fn counter_program(iterations: u16) -> Option<Vec<u32>> {
    let iterations = i16::try_from(iterations).ok().filter(|&n| n > 0)?;
    Some(vec![
        encode(op::LI, 1, 0, COUNTER as i16),
        encode(op::LI, 2, 0, iterations),
        encode(op::LI, 5, 0, 0),
        // retry:
        encode(op::LL, 3, 1, 0),
        encode(op::ADDI, 3, 3, 1),
        encode(op::SC, 4, 1, 3),
        encode(op::BNE, 4, 5, -12),
        encode(op::ADDI, 2, 2, -1),
        encode(op::BNE, 2, 5, -20),
        encode(op::HALT, 0, 0, 0),
    ])
}

#[derive(Debug, Default)]
pub struct ToyDecoder;

impl Decoder for ToyDecoder {
    fn decode(&self, pc: Address, word: u32) -> Result<DecodedInstruction, DecodeError> {
        let op = (word >> 24) as u8;
        let rd = ((word >> 20) & 0xf) as u64;
        let rs1 = ((word >> 16) & 0xf) as u64;
        let imm = word as u16 as i16;
        let rs2_used = matches!(op, op::ADD | op::SC);
        if op > op::TID
            || rd >= REGISTERS
            || rs1 >= REGISTERS
            || (rs2_used && (imm as u64 & 0xf) >= REGISTERS)
        {
            return Err(DecodeError { pc, word });
        }

        let mut args = MaybeVec::new();
        args.push(rd);
        args.push(rs1);
        args.push(imm as i64 as u64);
        Ok(DecodedInstruction {
            word,
            length: 4,
            behaviour: BehaviourId(op as u32),
            args,
            writes_pc: op == op::BNE,
        })
    }
}

fn reg(context: &InvocationContext<'_>, index: u64) -> u32 {
    context
        .thread
        .read_register::<u32>("R", index as usize)
        .unwrap_or(0)
}

fn set_reg(context: &mut InvocationContext<'_>, index: u64, value: u32) {
    if let Err(e) = context.thread.write_register("R", index as usize, value) {
        warn!("thread {}: {e}", context.thread.id());
        context.raise(ExecutionResult::Abort);
    }
}

fn rd(context: &InvocationContext<'_>) -> u64 {
    context.arg(0)
}

fn rs1(context: &InvocationContext<'_>) -> u64 {
    context.arg(1)
}

fn imm(context: &InvocationContext<'_>) -> u32 {
    context.arg(2) as u32
}

fn rs2(context: &InvocationContext<'_>) -> u64 {
    context.arg(2) & 0xf
}

fn effective_address(context: &InvocationContext<'_>) -> Address {
    Address::from(reg(context, rs1(context)).wrapping_add(imm(context)))
}

fn data_fault(context: &mut InvocationContext<'_>, address: Address, error: MemoryError) {
    warn!("thread {}: {error}", context.thread.id());
    context.raise_exception(exception::DATA_FAULT, address.get());
}

fn halt(context: &mut InvocationContext<'_>) -> u64 {
    context.raise(ExecutionResult::Halt);
    0
}

fn li(context: &mut InvocationContext<'_>) -> u64 {
    let value = imm(context);
    set_reg(context, rd(context), value);
    value as u64
}

fn add(context: &mut InvocationContext<'_>) -> u64 {
    let value = reg(context, rs1(context)).wrapping_add(reg(context, rs2(context)));
    set_reg(context, rd(context), value);
    value as u64
}

fn addi(context: &mut InvocationContext<'_>) -> u64 {
    let value = reg(context, rs1(context)).wrapping_add(imm(context));
    set_reg(context, rd(context), value);
    value as u64
}

fn ld(context: &mut InvocationContext<'_>) -> u64 {
    let address = effective_address(context);
    match context.thread.fetch_interface().read_32(address) {
        Ok(value) => {
            set_reg(context, rd(context), value);
            value as u64
        }
        Err(e) => {
            data_fault(context, address, e);
            0
        }
    }
}

fn st(context: &mut InvocationContext<'_>) -> u64 {
    let address = effective_address(context);
    let value = reg(context, rd(context));
    if let Err(e) = context.thread.fetch_interface().write_32(address, value) {
        data_fault(context, address, e);
    }
    0
}

fn ll(context: &mut InvocationContext<'_>) -> u64 {
    let address = Address::from(reg(context, rs1(context)));
    let mut buf = [0u8; 4];
    match context.thread.fetch_interface().load_linked(address, &mut buf) {
        Ok(()) => {
            let value = u32::from_le_bytes(buf);
            set_reg(context, rd(context), value);
            value as u64
        }
        Err(e) => {
            data_fault(context, address, e);
            0
        }
    }
}

fn sc(context: &mut InvocationContext<'_>) -> u64 {
    let address = Address::from(reg(context, rs1(context)));
    let value = reg(context, rs2(context));
    match context
        .thread
        .fetch_interface()
        .store_conditional(address, &value.to_le_bytes())
    {
        Ok(stored) => {
            set_reg(context, rd(context), !stored as u32);
            stored as u64
        }
        Err(e) => {
            data_fault(context, address, e);
            0
        }
    }
}

fn bne(context: &mut InvocationContext<'_>) -> u64 {
    let taken = reg(context, rd(context)) != reg(context, rs1(context));
    let Ok(pc) = context.thread.pc() else {
        context.raise(ExecutionResult::Abort);
        return 0;
    };
    let next = if taken {
        pc.wrapping_offset(imm(context) as i32 as i64)
    } else {
        pc.wrapping_add(4)
    };
    if context.thread.set_pc(next).is_err() {
        context.raise(ExecutionResult::Abort);
    }
    taken as u64
}

fn tid(context: &mut InvocationContext<'_>) -> u64 {
    let id = context
        .thread
        .state_block()
        .get_entry::<u32>("thread_id")
        .unwrap_or_default();
    set_reg(context, rd(context), id);
    id as u64
}

pub fn arch() -> Result<Arc<ArchDescriptor>, ArchError> {
    let registers = RegisterFileDescriptor::builder()
        .bank("R", 0, REGISTERS as usize, 4, 4)
        .tagged("PC", 32, 4, "PC")
        .tagged("SP", 36, 4, "SP")
        .build()?;
    let interfaces = MemoryInterfacesDescriptor::new(vec![MemoryInterfaceDescriptor {
        name: "Mem".into(),
        id: 0,
        address_width: 4,
        data_width: 4,
        endianness: Endianness::LE,
        is_fetch: true,
    }])?;

    let mut isa = IsaDescriptor::builder("toy", 0);
    // Registration order gives each behaviour the id of its opcode.
    isa.add_behaviour("halt", halt)?;
    isa.add_behaviour("li", li)?;
    isa.add_behaviour("add", add)?;
    isa.add_behaviour("addi", addi)?;
    isa.add_behaviour("ld", ld)?;
    isa.add_behaviour("st", st)?;
    isa.add_behaviour("ll", ll)?;
    isa.add_behaviour("sc", sc)?;
    isa.add_behaviour("bne", bne)?;
    isa.add_behaviour("tid", tid)?;
    let isa = isa.build(Arc::new(ToyDecoder));

    ArchDescriptor::new(
        "toy",
        registers,
        interfaces,
        FeaturesDescriptor::default(),
        vec![isa],
    )
    .map(Arc::new)
}

/// Emits register arithmetic inline and calls behaviours for everything else.
#[derive(Debug, Default)]
pub struct ToyTranslator;

fn slot(register: u64) -> IrOperand {
    IrOperand::const64(register * 4)
}

impl BlockTranslator for ToyTranslator {
    fn translate(
        &self,
        isa: &IsaDescriptor,
        decoded: &DecodedInstruction,
        pc: Address,
        builder: &mut IrBuilder<'_>,
    ) -> Result<bool, IrError> {
        let arg = |index| decoded.args.get(index).copied().unwrap_or(0);
        let (rd, rs1, imm) = (arg(0), arg(1), arg(2) as u32);
        match (decoded.word >> 24) as u8 {
            op::LI => builder.streg(IrOperand::const32(imm), slot(rd))?,
            op::ADD => {
                let lhs = builder.alloc_reg(4)?;
                let rhs = builder.alloc_reg(4)?;
                builder.ldreg(slot(rs1), lhs)?;
                builder.ldreg(slot(imm as u64 & 0xf), rhs)?;
                builder.add(rhs, lhs)?;
                builder.streg(lhs, slot(rd))?;
            }
            op::ADDI => {
                let value = builder.alloc_reg(4)?;
                builder.ldreg(slot(rs1), value)?;
                builder.add(IrOperand::const32(imm), value)?;
                builder.streg(value, slot(rd))?;
            }
            _ => return BehaviourCallTranslator.translate(isa, decoded, pc, builder),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use archsim_core::config::Config;
    use archsim_core::execution::{
        share, BasicExecutionEngine, ExecutionEngine, SharedThread, SyncExecutionEngine,
    };
    use archsim_core::memory::MemoryDevice;
    use archsim_core::monitor::{BaseMemoryMonitor, MemoryMonitor};
    use archsim_core::resources::ram::Ram;
    use archsim_core::thread::{GuestThreadId, ThreadInstance};

    fn threads(count: u32, program: &[u32]) -> (Arc<Ram>, Vec<SharedThread>) {
        let ram = Arc::new(Ram::new(RAM_SIZE as usize).unwrap());
        let image: Vec<u8> = program.iter().flat_map(|w| w.to_le_bytes()).collect();
        ram.load(Address::NULL, &image).unwrap();
        let monitor: Arc<dyn MemoryMonitor> = Arc::new(BaseMemoryMonitor::new());
        let arch = arch().unwrap();
        let threads = (0..count)
            .map(|i| {
                let thread = ThreadInstance::builder(GuestThreadId::new(i), Arc::clone(&arch))
                    .connect("Mem", Arc::clone(&ram) as Arc<dyn MemoryDevice>)
                    .monitor(Arc::clone(&monitor))
                    .build()
                    .unwrap();
                share(thread)
            })
            .collect();
        (ram, threads)
    }

    fn counter(ram: &Ram) -> u32 {
        let mut buf = [0u8; 4];
        ram.read(Address::new(COUNTER), &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    #[test]
    fn test_decode() {
        let decoded = ToyDecoder
            .decode(Address::NULL, encode(op::ADDI, 2, 3, -1))
            .unwrap();
        assert_eq!(decoded.behaviour, BehaviourId(op::ADDI as u32));
        assert_eq!(decoded.args.as_slice(), &[2, 3, u64::MAX]);
        assert!(!decoded.writes_pc);
        assert!(ToyDecoder.decode(Address::NULL, encode(op::BNE, 0, 0, 8)).unwrap().writes_pc);
        assert!(ToyDecoder.decode(Address::NULL, 0x0a00_0000).is_err());
        assert!(ToyDecoder.decode(Address::NULL, encode(op::LI, 9, 0, 0)).is_err());
        assert!(ToyDecoder.decode(Address::NULL, encode(op::ADD, 1, 2, 12)).is_err());
    }

    #[test]
    fn test_counter_program_bounds() {
        assert!(counter_program(0).is_none());
        assert!(counter_program(MAX_ITERATIONS + 1).is_none());
        let program = counter_program(MAX_ITERATIONS).unwrap();
        assert_eq!(program[1], encode(op::LI, 2, 0, i16::MAX));
        assert_eq!(program.len(), 10);
    }

    #[test]
    fn test_interpreted_counter_is_exact() {
        let (ram, threads) = threads(4, &counter_program(200).unwrap());
        let engine = BasicExecutionEngine::interpreter("toy", &Config::default());
        for thread in &threads {
            engine.attach_thread(Arc::clone(thread)).unwrap();
        }
        engine.start().unwrap();
        engine.join();
        assert_eq!(counter(&ram), 800);
        for thread in &threads {
            let id = thread.lock().unwrap().id();
            assert_eq!(engine.last_result(id), Some(ExecutionResult::Halt));
        }
    }

    #[test]
    fn test_translated_counter_is_exact() {
        let (ram, threads) = threads(3, &counter_program(150).unwrap());
        let engine =
            BasicExecutionEngine::block_jit("toy", &Config::default(), Arc::new(ToyTranslator));
        for thread in &threads {
            engine.attach_thread(Arc::clone(thread)).unwrap();
        }
        engine.start().unwrap();
        engine.join();
        assert_eq!(counter(&ram), 450);
    }

    #[test]
    fn test_inline_arithmetic() {
        let program = [
            encode(op::LI, 1, 0, 40),
            encode(op::ADDI, 2, 1, -3),
            encode(op::ADD, 3, 1, 2),
            encode(op::TID, 4, 0, 0),
            encode(op::HALT, 0, 0, 0),
        ];
        let (_, threads) = threads(2, &program);
        let engine = SyncExecutionEngine::new(
            "toy",
            &Config::default(),
            archsim_core::execution::BlockJitStepper::new(
                &Config::default(),
                Arc::new(ToyTranslator),
            ),
        );
        engine.attach_thread(Arc::clone(&threads[1])).unwrap();
        assert_eq!(engine.run(), Ok(ExecutionResult::Halt));

        let thread = threads[1].lock().unwrap();
        assert_eq!(thread.read_register::<u32>("R", 2), Ok(37));
        assert_eq!(thread.read_register::<u32>("R", 3), Ok(77));
        assert_eq!(thread.read_register::<u32>("R", 4), Ok(1));
        assert_eq!(thread.pc().unwrap(), Address::new(16));
    }
}
