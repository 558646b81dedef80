//! Identifiers handed out by a [`TranslationBuffer`](crate::buffer::TranslationBuffer).

use std::fmt;

/// Identifies a basic block within a single translation unit.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IrBlockId(u32);

impl IrBlockId {
    /// Sentinel for "no block". Instructions stamped with it are treated as dead by later passes.
    pub const NOP: Self = Self(u32::MAX);

    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index of this block.
    pub fn index(self) -> u32 {
        self.0
    }

    pub fn is_nop(self) -> bool {
        self == Self::NOP
    }
}

impl fmt::Display for IrBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nop() {
            f.write_str("b<nop>")
        } else {
            write!(f, "b{}", self.0)
        }
    }
}

/// Identifies a virtual register within a single translation unit.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IrRegId(u32);

impl IrRegId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index of this register.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl nohash::IsEnabled for IrRegId {}
impl nohash::IsEnabled for IrBlockId {}

impl fmt::Display for IrRegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<IrRegId> for usize {
    fn from(value: IrRegId) -> Self {
        value.0 as usize
    }
}

impl From<IrBlockId> for usize {
    fn from(value: IrBlockId) -> Self {
        value.0 as usize
    }
}
