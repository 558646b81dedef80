//! Guest register file.

use crate::arch::{ArchError, RegisterFileDescriptor};
use crate::state_block::StateValue;
use crate::Address;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RegisterError {
    #[error(transparent)]
    Arch(#[from] ArchError),
    #[error("tagged register {tag:?} is {size} bytes wide, only 4 and 8 are implemented")]
    Unimplemented { tag: String, size: usize },
    #[error("register bank {bank:?} holds {element_size}-byte values, access needs {value_size}")]
    WidthMismatch {
        bank: String,
        element_size: usize,
        value_size: usize,
    },
    #[error("access of {size} bytes at offset {offset} exceeds register file of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
}

/// A register resolved through its semantic tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct TaggedSlot {
    offset: usize,
    /// Either 4 or 8.
    size: usize,
}

/// The raw bytes of one thread's registers, laid out by a [`RegisterFileDescriptor`].
///
/// The program counter and stack pointer are found through the banks tagged `"PC"` and `"SP"`.
/// Those must be 4 or 8 bytes wide.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    descriptor: Arc<RegisterFileDescriptor>,
    bytes: Box<[u8]>,
    pc: Option<TaggedSlot>,
    sp: Option<TaggedSlot>,
}

impl RegisterFile {
    /// Returns a zeroed register file. Fails if the PC or SP slot has an unsupported width.
    pub fn new(descriptor: Arc<RegisterFileDescriptor>) -> Result<Self, RegisterError> {
        let pc = Self::resolve_optional(&descriptor, "PC")?;
        let sp = Self::resolve_optional(&descriptor, "SP")?;
        Ok(Self {
            bytes: vec![0; descriptor.size()].into_boxed_slice(),
            descriptor,
            pc,
            sp,
        })
    }

    fn resolve(descriptor: &RegisterFileDescriptor, tag: &str) -> Result<TaggedSlot, RegisterError> {
        let bank = descriptor.tagged(tag)?;
        match bank.element_size {
            4 | 8 => Ok(TaggedSlot {
                offset: bank.offset,
                size: bank.element_size,
            }),
            size => Err(RegisterError::Unimplemented {
                tag: tag.to_owned(),
                size,
            }),
        }
    }

    fn resolve_optional(
        descriptor: &RegisterFileDescriptor,
        tag: &str,
    ) -> Result<Option<TaggedSlot>, RegisterError> {
        match Self::resolve(descriptor, tag) {
            Ok(slot) => Ok(Some(slot)),
            Err(RegisterError::Arch(ArchError::UnknownTag(_))) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn descriptor(&self) -> &RegisterFileDescriptor {
        &self.descriptor
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pc(&self) -> Result<Address, RegisterError> {
        let slot = self.pc.ok_or_else(|| ArchError::UnknownTag("PC".into()))?;
        self.read_sized(slot.offset, slot.size).map(Address::new)
    }

    /// Sets the program counter, truncating to the slot's width.
    pub fn set_pc(&mut self, pc: Address) -> Result<(), RegisterError> {
        let slot = self.pc.ok_or_else(|| ArchError::UnknownTag("PC".into()))?;
        self.write_sized(slot.offset, slot.size, pc.get())
    }

    pub fn sp(&self) -> Result<Address, RegisterError> {
        let slot = self.sp.ok_or_else(|| ArchError::UnknownTag("SP".into()))?;
        self.read_sized(slot.offset, slot.size).map(Address::new)
    }

    pub fn set_sp(&mut self, sp: Address) -> Result<(), RegisterError> {
        let slot = self.sp.ok_or_else(|| ArchError::UnknownTag("SP".into()))?;
        self.write_sized(slot.offset, slot.size, sp.get())
    }

    /// Byte offset of the program counter, for translated code.
    pub fn pc_offset(&self) -> Option<usize> {
        self.pc.map(|slot| slot.offset)
    }

    /// Reads any tagged register.
    pub fn tagged_slot(&self, tag: &str) -> Result<u64, RegisterError> {
        let slot = Self::resolve(&self.descriptor, tag)?;
        self.read_sized(slot.offset, slot.size)
    }

    pub fn set_tagged_slot(&mut self, tag: &str, value: u64) -> Result<(), RegisterError> {
        let slot = Self::resolve(&self.descriptor, tag)?;
        self.write_sized(slot.offset, slot.size, value)
    }

    /// Reads element `index` of `bank` as a `T`. `T` may be narrower than the element.
    pub fn read<T: StateValue>(&self, bank: &str, index: usize) -> Result<T, RegisterError> {
        let offset = self.element_offset::<T>(bank, index)?;
        self.bytes_at(offset, T::SIZE).map(T::from_bytes)
    }

    pub fn write<T: StateValue>(
        &mut self,
        bank: &str,
        index: usize,
        value: T,
    ) -> Result<(), RegisterError> {
        let offset = self.element_offset::<T>(bank, index)?;
        value.to_bytes(self.bytes_at_mut(offset, T::SIZE)?);
        Ok(())
    }

    fn element_offset<T: StateValue>(&self, bank: &str, index: usize) -> Result<usize, RegisterError> {
        let descriptor = self.descriptor.bank(bank)?;
        if T::SIZE > descriptor.element_size {
            return Err(RegisterError::WidthMismatch {
                bank: bank.to_owned(),
                element_size: descriptor.element_size,
                value_size: T::SIZE,
            });
        }
        Ok(descriptor.slot_range(index)?.start)
    }

    /// Reads a 1, 2, 4 or 8 byte value at a raw byte offset, zero-extended.
    pub fn read_sized(&self, offset: usize, size: usize) -> Result<u64, RegisterError> {
        let bytes = self.bytes_at(offset, Self::scalar_size(offset, size, self.bytes.len())?)?;
        Ok(match size {
            1 => u8::from_bytes(bytes) as u64,
            2 => u16::from_bytes(bytes) as u64,
            4 => u32::from_bytes(bytes) as u64,
            _ => u64::from_bytes(bytes),
        })
    }

    /// Writes the low `size` bytes of `value` at a raw byte offset.
    pub fn write_sized(&mut self, offset: usize, size: usize, value: u64) -> Result<(), RegisterError> {
        let len = self.bytes.len();
        let bytes = self.bytes_at_mut(offset, Self::scalar_size(offset, size, len)?)?;
        match size {
            1 => (value as u8).to_bytes(bytes),
            2 => (value as u16).to_bytes(bytes),
            4 => (value as u32).to_bytes(bytes),
            _ => value.to_bytes(bytes),
        }
        Ok(())
    }

    fn scalar_size(offset: usize, size: usize, len: usize) -> Result<usize, RegisterError> {
        match size {
            1 | 2 | 4 | 8 => Ok(size),
            _ => Err(RegisterError::OutOfBounds { offset, size, len }),
        }
    }

    fn byte_range(offset: usize, size: usize) -> Option<Range<usize>> {
        match size {
            1 | 2 | 4 | 8 | 16 => Some(offset..offset.checked_add(size)?),
            _ => None,
        }
    }

    fn bytes_at(&self, offset: usize, size: usize) -> Result<&[u8], RegisterError> {
        let len = self.bytes.len();
        Self::byte_range(offset, size)
            .and_then(|range| self.bytes.get(range))
            .ok_or(RegisterError::OutOfBounds { offset, size, len })
    }

    fn bytes_at_mut(&mut self, offset: usize, size: usize) -> Result<&mut [u8], RegisterError> {
        let len = self.bytes.len();
        let bytes = match Self::byte_range(offset, size) {
            Some(range) => self.bytes.get_mut(range),
            None => None,
        };
        bytes.ok_or(RegisterError::OutOfBounds { offset, size, len })
    }
}
