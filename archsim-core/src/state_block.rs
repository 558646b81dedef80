//! Named-offset byte arena holding per-thread metadata.
//!
//! A [`StateBlockDescriptor`] is built by adding named blocks, then frozen (shared behind an
//! `Arc`) and used to create one [`StateBlock`] per thread. Values are accessed by name, or
//! through a pre-resolved [`StateSlot`] that skips the name lookup.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// A plain value that can be stored as raw bytes in a state block or register file.
///
/// Values are stored in host byte order.
pub trait StateValue: Copy {
    const SIZE: usize;

    /// Reads a value from exactly [`Self::SIZE`] bytes.
    fn from_bytes(bytes: &[u8]) -> Self;

    /// Writes the value to exactly [`Self::SIZE`] bytes.
    fn to_bytes(self, bytes: &mut [u8]);
}

macro_rules! state_values {
    ( $( $t:ty ),* $(,)? ) => {
        $(
            impl StateValue for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                fn from_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_ne_bytes(buf)
                }

                fn to_bytes(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

state_values!(u8, u16, u32, u64, u128, i8, i16, i32, i64, f32, f64);

impl StateValue for bool {
    const SIZE: usize = 1;

    fn from_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn to_bytes(self, bytes: &mut [u8]) {
        bytes[0] = self as u8;
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum StateBlockError {
    #[error("state block entry {0:?} already exists")]
    DuplicateName(String),
    #[error("no state block entry named {0:?}")]
    UnknownName(String),
    #[error("state block entry {name:?} holds {reserved} bytes, value needs {needed}")]
    SizeMismatch {
        name: String,
        reserved: usize,
        needed: usize,
    },
    #[error("access of {size} bytes at offset {offset} exceeds state block of {len} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
}

/// One named block within a state block.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StateBlockEntry {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Layout of a state block: ordered, non-overlapping named blocks.
#[derive(Debug, Clone, Default)]
pub struct StateBlockDescriptor {
    entries: Vec<StateBlockEntry>,
    by_name: HashMap<String, usize>,
    total_size: usize,
}

impl StateBlockDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a block of `size` bytes and returns its offset, which is the total size before
    /// the call.
    ///
    /// Fails without changing the layout if `name` is already present.
    ///
    /// ```
    /// use archsim_core::state_block::StateBlockDescriptor;
    ///
    /// let mut descriptor = StateBlockDescriptor::new();
    /// assert_eq!(descriptor.add_block("a", 8), Ok(0));
    /// assert_eq!(descriptor.add_block("b", 4), Ok(8));
    /// assert!(descriptor.add_block("a", 2).is_err());
    /// assert_eq!(descriptor.total_size(), 12);
    /// ```
    pub fn add_block(&mut self, name: &str, size: usize) -> Result<usize, StateBlockError> {
        if self.by_name.contains_key(name) {
            return Err(StateBlockError::DuplicateName(name.to_owned()));
        }
        let offset = self.total_size;
        self.by_name.insert(name.to_owned(), self.entries.len());
        self.entries.push(StateBlockEntry {
            name: name.to_owned(),
            offset,
            size,
        });
        self.total_size += size;
        Ok(offset)
    }

    pub fn entry(&self, name: &str) -> Result<&StateBlockEntry, StateBlockError> {
        self.by_name
            .get(name)
            .map(|&index| &self.entries[index])
            .ok_or_else(|| StateBlockError::UnknownName(name.to_owned()))
    }

    pub fn block_offset(&self, name: &str) -> Result<usize, StateBlockError> {
        self.entry(name).map(|entry| entry.offset)
    }

    pub fn block_size(&self, name: &str) -> Result<usize, StateBlockError> {
        self.entry(name).map(|entry| entry.size)
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn entries(&self) -> impl Iterator<Item = &StateBlockEntry> {
        self.entries.iter()
    }

    /// Resolves `name` to a typed slot, checking that the block is large enough for `T`.
    pub fn slot<T: StateValue>(&self, name: &str) -> Result<StateSlot<T>, StateBlockError> {
        let entry = self.entry(name)?;
        if entry.size < T::SIZE {
            return Err(StateBlockError::SizeMismatch {
                name: name.to_owned(),
                reserved: entry.size,
                needed: T::SIZE,
            });
        }
        Ok(StateSlot {
            offset: entry.offset,
            _marker: PhantomData,
        })
    }
}

/// Pre-resolved, size-checked location of a `T` within a state block.
pub struct StateSlot<T> {
    offset: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateSlot<T> {
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<T> fmt::Debug for StateSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSlot")
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> Clone for StateSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateSlot<T> {}

impl<T> PartialEq for StateSlot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for StateSlot<T> {}

/// Per-thread byte buffer laid out by a frozen [`StateBlockDescriptor`].
#[derive(Debug, Clone)]
pub struct StateBlock {
    descriptor: Arc<StateBlockDescriptor>,
    data: Box<[u8]>,
}

impl StateBlock {
    /// Creates a zeroed block of exactly `descriptor.total_size()` bytes.
    pub fn new(descriptor: Arc<StateBlockDescriptor>) -> Self {
        let data = vec![0u8; descriptor.total_size()].into_boxed_slice();
        Self { descriptor, data }
    }

    pub fn descriptor(&self) -> &StateBlockDescriptor {
        &self.descriptor
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn get_entry<T: StateValue>(&self, name: &str) -> Result<T, StateBlockError> {
        let slot = self.descriptor.slot::<T>(name)?;
        self.get(slot)
    }

    pub fn set_entry<T: StateValue>(&mut self, name: &str, value: T) -> Result<(), StateBlockError> {
        let slot = self.descriptor.slot::<T>(name)?;
        self.set(slot, value)
    }

    /// Mutable view of the raw bytes of entry `name`.
    pub fn entry_bytes_mut(&mut self, name: &str) -> Result<&mut [u8], StateBlockError> {
        let entry = self.descriptor.entry(name)?;
        let range = entry.offset..entry.offset + entry.size;
        Ok(&mut self.data[range])
    }

    pub fn get<T: StateValue>(&self, slot: StateSlot<T>) -> Result<T, StateBlockError> {
        self.data
            .get(slot.offset..slot.offset + T::SIZE)
            .map(T::from_bytes)
            .ok_or(StateBlockError::OutOfBounds {
                offset: slot.offset,
                size: T::SIZE,
                len: self.data.len(),
            })
    }

    pub fn set<T: StateValue>(&mut self, slot: StateSlot<T>, value: T) -> Result<(), StateBlockError> {
        let len = self.data.len();
        let bytes = self
            .data
            .get_mut(slot.offset..slot.offset + T::SIZE)
            .ok_or(StateBlockError::OutOfBounds {
                offset: slot.offset,
                size: T::SIZE,
                len,
            })?;
        value.to_bytes(bytes);
        Ok(())
    }
}
