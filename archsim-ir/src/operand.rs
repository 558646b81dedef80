//! Instruction operands.

use crate::ids::{IrBlockId, IrRegId};
use std::fmt;

/// Where the register allocator placed a virtual register.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum Allocation {
    #[default]
    NotAllocated,
    /// Index of a host register.
    Register(u16),
    /// Byte offset into the translated block's stack frame.
    Stack(u32),
}

/// A single operand of an [`IrInstruction`](crate::instruction::IrInstruction).
///
/// Sizes are expressed in bytes.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum IrOperand {
    #[default]
    None,
    Constant {
        value: u64,
        size: u8,
    },
    VReg {
        id: IrRegId,
        size: u8,
        allocation: Allocation,
    },
    Block(IrBlockId),
    /// Address of a host helper function.
    Func(u64),
    /// The guest program counter, read directly from the register file.
    Pc {
        size: u8,
    },
}

impl IrOperand {
    pub fn const8(value: u8) -> Self {
        Self::Constant {
            value: value as u64,
            size: 1,
        }
    }

    pub fn const16(value: u16) -> Self {
        Self::Constant {
            value: value as u64,
            size: 2,
        }
    }

    pub fn const32(value: u32) -> Self {
        Self::Constant {
            value: value as u64,
            size: 4,
        }
    }

    pub fn const64(value: u64) -> Self {
        Self::Constant { value, size: 8 }
    }

    /// A 4-byte constant holding the bit pattern of `value`.
    pub fn const_f32(value: f32) -> Self {
        Self::const32(value.to_bits())
    }

    /// An 8-byte constant holding the bit pattern of `value`.
    pub fn const_f64(value: f64) -> Self {
        Self::const64(value.to_bits())
    }

    pub fn vreg(id: IrRegId, size: u8) -> Self {
        Self::VReg {
            id,
            size,
            allocation: Allocation::NotAllocated,
        }
    }

    pub fn block(id: IrBlockId) -> Self {
        Self::Block(id)
    }

    pub fn func(address: u64) -> Self {
        Self::Func(address)
    }

    pub fn pc(size: u8) -> Self {
        Self::Pc { size }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant { .. })
    }

    pub fn is_vreg(&self) -> bool {
        matches!(self, Self::VReg { .. })
    }

    /// Returns the virtual register id if this is a register operand.
    pub fn reg_id(&self) -> Option<IrRegId> {
        match *self {
            Self::VReg { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Returns the value width in bytes, or `None` for operands without a width.
    pub fn size(&self) -> Option<u8> {
        match *self {
            Self::Constant { size, .. } | Self::VReg { size, .. } | Self::Pc { size } => Some(size),
            Self::None | Self::Block(_) | Self::Func(_) => None,
        }
    }

    pub fn allocation(&self) -> Allocation {
        match *self {
            Self::VReg { allocation, .. } => allocation,
            _ => Allocation::NotAllocated,
        }
    }

    /// Records `new` as this operand's allocation. No effect on non-register operands.
    pub fn set_allocation(&mut self, new: Allocation) {
        if let Self::VReg { allocation, .. } = self {
            *allocation = new;
        }
    }
}

impl fmt::Display for IrOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::None => f.write_str("-"),
            Self::Constant { value, size } => write!(f, "i{}:{:#x}", size * 8, value),
            Self::VReg {
                id,
                size,
                allocation,
            } => {
                write!(f, "i{}:{}", size * 8, id)?;
                match allocation {
                    Allocation::NotAllocated => Ok(()),
                    Allocation::Register(r) => write!(f, "(r{r})"),
                    Allocation::Stack(offset) => write!(f, "(s{offset})"),
                }
            }
            Self::Block(block) => write!(f, "{block}"),
            Self::Func(address) => write!(f, "&{address:#x}"),
            Self::Pc { size } => write!(f, "i{}:pc", size * 8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_sizes() {
        assert_eq!(IrOperand::const8(0xff).size(), Some(1));
        assert_eq!(IrOperand::const16(1).size(), Some(2));
        assert_eq!(IrOperand::const32(1).size(), Some(4));
        assert_eq!(IrOperand::const64(1).size(), Some(8));
        assert_eq!(IrOperand::block(IrBlockId::new(3)).size(), None);
    }

    #[test]
    fn test_float_constants_keep_bits() {
        assert_eq!(
            IrOperand::const_f32(1.5),
            IrOperand::Constant {
                value: 1.5f32.to_bits() as u64,
                size: 4
            }
        );
        assert_eq!(
            IrOperand::const_f64(-2.0),
            IrOperand::Constant {
                value: (-2.0f64).to_bits(),
                size: 8
            }
        );
    }

    #[test]
    fn test_allocation_only_sticks_to_vregs() {
        let mut reg = IrOperand::vreg(IrRegId::new(2), 4);
        reg.set_allocation(Allocation::Register(5));
        assert_eq!(reg.allocation(), Allocation::Register(5));

        let mut constant = IrOperand::const32(7);
        constant.set_allocation(Allocation::Register(5));
        assert_eq!(constant.allocation(), Allocation::NotAllocated);
    }

    #[test]
    fn test_display() {
        let mut reg = IrOperand::vreg(IrRegId::new(1), 4);
        assert_eq!(reg.to_string(), "i32:v1");
        reg.set_allocation(Allocation::Stack(16));
        assert_eq!(reg.to_string(), "i32:v1(s16)");
        assert_eq!(IrOperand::const8(0x10).to_string(), "i8:0x10");
    }
}
