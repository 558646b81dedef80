//! Append-only instruction storage for one translation unit.

use crate::error::IrError;
use crate::ids::{IrBlockId, IrRegId};
use crate::instruction::IrInstruction;
use std::fmt;

/// A growable sequence of IR instructions plus the id counters for one translation unit.
///
/// Block and register ids are handed out strictly increasing and are never reused, even across
/// [`clear`](Self::clear). Builders share a buffer instead of allocating ids themselves, so
/// several builders working on the same unit cannot collide.
///
/// ```
/// use archsim_ir::buffer::TranslationBuffer;
///
/// let mut buffer = TranslationBuffer::new();
/// let a = buffer.alloc_reg().unwrap();
/// let b = buffer.alloc_reg().unwrap();
/// assert!(b > a);
/// ```
#[derive(Debug, Clone, Default)]
pub struct TranslationBuffer {
    instructions: Vec<IrInstruction>,
    block_count: u32,
    reg_count: u32,
}

impl TranslationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            instructions: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Appends `instruction`, stamping it with `block`.
    pub fn add_instruction(&mut self, block: IrBlockId, mut instruction: IrInstruction) {
        instruction.block = block;
        self.instructions.push(instruction);
    }

    /// Fails once every id below [`IrBlockId::NOP`] has been handed out.
    pub fn alloc_block(&mut self) -> Result<IrBlockId, IrError> {
        let id = IrBlockId::new(self.block_count);
        self.block_count = self
            .block_count
            .checked_add(1)
            .ok_or(IrError::IdsExhausted("block"))?;
        Ok(id)
    }

    pub fn alloc_reg(&mut self) -> Result<IrRegId, IrError> {
        let id = IrRegId::new(self.reg_count);
        self.reg_count = self
            .reg_count
            .checked_add(1)
            .ok_or(IrError::IdsExhausted("virtual register"))?;
        Ok(id)
    }

    /// Number of blocks allocated so far.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Number of virtual registers allocated so far.
    pub fn reg_count(&self) -> u32 {
        self.reg_count
    }

    /// Number of instructions stored.
    pub fn count(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn at(&self, index: usize) -> Option<&IrInstruction> {
        self.instructions.get(index)
    }

    pub fn at_mut(&mut self, index: usize) -> Option<&mut IrInstruction> {
        self.instructions.get_mut(index)
    }

    /// Overwrites the instruction at `index`.
    pub fn put(&mut self, index: usize, instruction: IrInstruction) -> Result<(), IrError> {
        let count = self.count();
        let slot = self
            .instructions
            .get_mut(index)
            .ok_or(IrError::IndexOutOfRange { index, count })?;
        *slot = instruction;
        Ok(())
    }

    /// Swaps the instructions at `a` and `b`.
    pub fn swap(&mut self, a: usize, b: usize) -> Result<(), IrError> {
        let count = self.count();
        for index in [a, b] {
            if index >= count {
                return Err(IrError::IndexOutOfRange { index, count });
            }
        }
        self.instructions.swap(a, b);
        Ok(())
    }

    /// Stable-sorts the instructions so each block's instructions are contiguous, in block-id
    /// order. Instructions stamped with [`IrBlockId::NOP`] end up last.
    pub fn sort_by_block(&mut self) {
        self.instructions.sort_by_key(|insn| insn.block);
    }

    /// Removes every instruction. Id counters keep counting.
    pub fn clear(&mut self) {
        self.instructions.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IrInstruction> {
        self.instructions.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, IrInstruction> {
        self.instructions.iter_mut()
    }

    pub fn as_slice(&self) -> &[IrInstruction] {
        &self.instructions
    }

    pub fn as_mut_slice(&mut self) -> &mut [IrInstruction] {
        &mut self.instructions
    }

    /// Returns the index of the first instruction of `block`, if the buffer is sorted by block.
    pub fn block_start(&self, block: IrBlockId) -> Option<usize> {
        self.instructions.iter().position(|insn| insn.block == block)
    }
}

impl<'a> IntoIterator for &'a TranslationBuffer {
    type Item = &'a IrInstruction;
    type IntoIter = std::slice::Iter<'a, IrInstruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for TranslationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut current = None;
        for (i, insn) in self.instructions.iter().enumerate() {
            if current != Some(insn.block) {
                writeln!(f, "{}:", insn.block)?;
                current = Some(insn.block);
            }
            writeln!(f, "  {i:4}: {insn}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Opcode;
    use crate::operand::IrOperand;
    use proptest::prelude::*;

    #[test]
    fn test_add_instruction_stamps_block() {
        let mut buffer = TranslationBuffer::new();
        let block = buffer.alloc_block().unwrap();
        buffer.add_instruction(block, IrInstruction::nop());
        assert_eq!(buffer.count(), 1);
        assert_eq!(buffer.at(0).map(|i| i.block), Some(block));
    }

    #[test]
    fn test_put_and_swap() {
        let mut buffer = TranslationBuffer::new();
        let block = buffer.alloc_block().unwrap();
        buffer.add_instruction(block, IrInstruction::nop());
        buffer.add_instruction(block, IrInstruction::new(Opcode::Ret, &[]));
        buffer.swap(0, 1).unwrap();
        assert_eq!(buffer.at(0).unwrap().opcode, Opcode::Ret);
        assert_eq!(
            buffer.swap(0, 2),
            Err(IrError::IndexOutOfRange { index: 2, count: 2 })
        );

        let mut jmp = IrInstruction::new(Opcode::Jmp, &[IrOperand::block(block)]);
        jmp.block = block;
        buffer.put(1, jmp).unwrap();
        assert_eq!(buffer.at(1), Some(&jmp));
        assert!(buffer.put(5, jmp).is_err());
    }

    #[test]
    fn test_clear_keeps_counters() {
        let mut buffer = TranslationBuffer::new();
        let b0 = buffer.alloc_block().unwrap();
        let r0 = buffer.alloc_reg().unwrap();
        buffer.add_instruction(b0, IrInstruction::nop());
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.alloc_block().unwrap() > b0);
        assert!(buffer.alloc_reg().unwrap() > r0);
    }

    #[test]
    fn test_ids_never_reach_nop() {
        let mut buffer = TranslationBuffer {
            block_count: u32::MAX - 1,
            reg_count: u32::MAX - 1,
            ..TranslationBuffer::new()
        };
        let last = buffer.alloc_block().unwrap();
        assert_ne!(last, IrBlockId::NOP);
        assert_eq!(buffer.alloc_block(), Err(IrError::IdsExhausted("block")));
        assert_eq!(buffer.block_count(), u32::MAX);

        assert_eq!(buffer.alloc_reg().unwrap().index(), u32::MAX - 1);
        assert_eq!(
            buffer.alloc_reg(),
            Err(IrError::IdsExhausted("virtual register"))
        );
    }

    #[test]
    fn test_sort_by_block_is_stable() {
        let mut buffer = TranslationBuffer::new();
        let b0 = buffer.alloc_block().unwrap();
        let b1 = buffer.alloc_block().unwrap();
        buffer.add_instruction(b1, IrInstruction::new(Opcode::Ret, &[]));
        buffer.add_instruction(b0, IrInstruction::new(Opcode::Trap, &[]));
        buffer.add_instruction(b0, IrInstruction::new(Opcode::Barrier, &[IrOperand::const8(0)]));
        buffer.sort_by_block();
        let opcodes: Vec<_> = buffer.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, [Opcode::Trap, Opcode::Barrier, Opcode::Ret]);
        assert_eq!(buffer.block_start(b1), Some(2));
    }

    proptest! {
        #[test]
        fn test_ids_strictly_increase(calls in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut buffer = TranslationBuffer::new();
            let mut last_block: Option<IrBlockId> = None;
            let mut last_reg: Option<IrRegId> = None;
            for alloc_block in calls {
                if alloc_block {
                    let id = buffer.alloc_block().unwrap();
                    prop_assert!(last_block.map_or(true, |last| id > last));
                    last_block = Some(id);
                } else {
                    let id = buffer.alloc_reg().unwrap();
                    prop_assert!(last_reg.map_or(true, |last| id > last));
                    last_reg = Some(id);
                }
            }
        }
    }
}
