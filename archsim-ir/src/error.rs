use crate::ids::{IrBlockId, IrRegId};
use crate::instruction::Opcode;
use thiserror::Error;

/// Errors raised while building or transforming a translation buffer.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum IrError {
    #[error("no current block selected in builder")]
    NoCurrentBlock,
    #[error("block {0} was not allocated from this buffer")]
    UnknownBlock(IrBlockId),
    #[error("virtual register {0} was not allocated from this buffer")]
    UnknownRegister(IrRegId),
    #[error("instruction index {index} out of range (buffer holds {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("operand {index} of {opcode:?} has the wrong kind")]
    InvalidOperand { opcode: Opcode, index: usize },
    #[error("{0} ids exhausted")]
    IdsExhausted(&'static str),
}
