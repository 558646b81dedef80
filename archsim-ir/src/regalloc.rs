//! Liveness-driven register allocation over a [`TranslationBuffer`].

use crate::buffer::TranslationBuffer;
use crate::ids::{IrBlockId, IrRegId};
use crate::instruction::{Opcode, MAX_OPERANDS};
use crate::interference::InterferenceMatrix;
use crate::operand::Allocation;
use crate::small_vec::MaybeVec;
use log::{debug, trace};
use nohash::{IntMap, IntSet};
use std::ops::Range;

/// Width of one stack slot in bytes.
pub const STACK_SLOT_SIZE: u32 = 8;

/// What [`allocate_registers`] ended up using.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct AllocationSummary {
    /// One more than the highest host register index handed out.
    pub registers_used: u16,
    /// Bytes of stack needed for global and spilled registers.
    pub stack_frame_size: u32,
}

/// Assigns every virtual register in `buffer` to one of `host_registers` host registers or to a
/// stack slot, and stamps the result into the operands.
///
/// Registers used by more than one block live on the stack for the whole unit. The rest are
/// colored per block using an [`InterferenceMatrix`] built from a backward liveness walk, in
/// decreasing-degree order; any that cannot be colored are spilled.
///
/// The buffer is sorted by block first.
pub fn allocate_registers(buffer: &mut TranslationBuffer, host_registers: u16) -> AllocationSummary {
    buffer.sort_by_block();

    let mut summary = AllocationSummary::default();
    let globals = allocate_globals(buffer, &mut summary);

    for range in block_ranges(buffer) {
        let locals = color_block(buffer, range.clone(), &globals, host_registers, &mut summary);
        for insn in &mut buffer.as_mut_slice()[range] {
            for operand in insn.operands.iter_mut() {
                if let Some(id) = operand.reg_id() {
                    let allocation = globals
                        .get(&id)
                        .or_else(|| locals.get(&id))
                        .copied()
                        .unwrap_or_default();
                    operand.set_allocation(allocation);
                }
            }
        }
    }

    debug!(
        "allocated {} registers, {} bytes of stack",
        summary.registers_used, summary.stack_frame_size
    );
    summary
}

/// Gives a stack slot to every register seen in more than one block.
fn allocate_globals(
    buffer: &TranslationBuffer,
    summary: &mut AllocationSummary,
) -> IntMap<IrRegId, Allocation> {
    let mut first_seen: IntMap<IrRegId, IrBlockId> = IntMap::default();
    let mut globals = IntMap::default();

    for insn in buffer.iter().filter(|insn| is_live(insn.block, insn.opcode)) {
        for id in insn.operands.iter().filter_map(|operand| operand.reg_id()) {
            let block = *first_seen.entry(id).or_insert(insn.block);
            if block != insn.block && !globals.contains_key(&id) {
                globals.insert(id, Allocation::Stack(summary.stack_frame_size));
                trace!("{id} is global, stack offset {}", summary.stack_frame_size);
                summary.stack_frame_size += STACK_SLOT_SIZE;
            }
        }
    }

    globals
}

/// Colors the block-local registers of the instructions in `range`.
fn color_block(
    buffer: &TranslationBuffer,
    range: Range<usize>,
    globals: &IntMap<IrRegId, Allocation>,
    host_registers: u16,
    summary: &mut AllocationSummary,
) -> IntMap<IrRegId, Allocation> {
    let instructions = &buffer.as_slice()[range];

    let mut keys: Vec<IrRegId> = Vec::new();
    let mut index_of: IntMap<IrRegId, usize> = IntMap::default();
    for insn in instructions.iter().filter(|insn| is_live(insn.block, insn.opcode)) {
        for id in insn.operands.iter().filter_map(|operand| operand.reg_id()) {
            if !globals.contains_key(&id) && !index_of.contains_key(&id) {
                index_of.insert(id, keys.len());
                keys.push(id);
            }
        }
    }

    let mut matrix = InterferenceMatrix::new(keys.len());
    let mut live: IntSet<IrRegId> = IntSet::default();
    for insn in instructions.iter().rev() {
        if !is_live(insn.block, insn.opcode) {
            continue;
        }
        let local = |id: &IrRegId| index_of.get(id).copied();

        let mut defs: MaybeVec<IrRegId, MAX_OPERANDS> = MaybeVec::new();
        let mut uses: MaybeVec<IrRegId, MAX_OPERANDS> = MaybeVec::new();
        for (_, operand, direction) in insn.operands_with_direction() {
            if let Some(id) = operand.reg_id().filter(|id| index_of.contains_key(id)) {
                if direction.is_def() {
                    defs.push(id);
                }
                if direction.is_use() {
                    uses.push(id);
                }
            }
        }

        for def in &defs {
            if let Some(d) = local(def) {
                for other in &live {
                    if let Some(o) = local(other) {
                        matrix.insert(d, o);
                    }
                }
            }
        }
        for def in &defs {
            if !uses.contains(def) {
                live.remove(def);
            }
        }
        live.extend(uses.iter().copied());
    }

    let mut order: Vec<usize> = (0..keys.len()).collect();
    order.sort_by(|&a, &b| {
        matrix
            .count_interferences(b)
            .cmp(&matrix.count_interferences(a))
            .then(a.cmp(&b))
    });

    let mut colors: Vec<Option<u16>> = vec![None; keys.len()];
    let mut allocations = IntMap::default();
    for key in order {
        let taken: IntSet<u16> = matrix
            .get_interferences(key)
            .filter_map(|neighbour| colors[neighbour])
            .collect();
        let allocation = match (0..host_registers).find(|r| !taken.contains(r)) {
            Some(register) => {
                colors[key] = Some(register);
                summary.registers_used = summary.registers_used.max(register + 1);
                Allocation::Register(register)
            }
            None => {
                let offset = summary.stack_frame_size;
                summary.stack_frame_size += STACK_SLOT_SIZE;
                trace!("spilling {} to stack offset {offset}", keys[key]);
                Allocation::Stack(offset)
            }
        };
        allocations.insert(keys[key], allocation);
    }

    allocations
}

fn is_live(block: IrBlockId, opcode: Opcode) -> bool {
    !block.is_nop() && opcode != Opcode::Nop
}

/// Index ranges of each block's instructions in a block-sorted buffer.
fn block_ranges(buffer: &TranslationBuffer) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let instructions = buffer.as_slice();
    for i in 1..=instructions.len() {
        if i == instructions.len() || instructions[i].block != instructions[start].block {
            ranges.push(start..i);
            start = i;
        }
    }
    ranges
}
