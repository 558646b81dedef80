//! Machine-independent intermediate representation used when translating guest code.
//!
//! A translation unit is built into a [`TranslationBuffer`](buffer::TranslationBuffer) through an
//! [`IrBuilder`](builder::IrBuilder), then lowered with the help of
//! [`regalloc::allocate_registers`].

#[macro_use]
extern crate static_assertions;

pub mod buffer;
pub mod builder;
pub mod error;
pub mod ids;
pub mod instruction;
pub mod interference;
pub mod operand;
pub mod regalloc;
pub mod small_vec;

pub use buffer::TranslationBuffer;
pub use builder::IrBuilder;
pub use error::IrError;
pub use ids::{IrBlockId, IrRegId};
pub use instruction::{IrInstruction, Opcode};
pub use operand::{Allocation, IrOperand};
