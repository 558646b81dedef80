//! Execution substrate of a retargetable instruction-set simulator.
//!
//! Guest architectures are described by an [`arch::ArchDescriptor`]. Guest threads
//! ([`thread::ThreadInstance`]) are built from it and stepped by an
//! [`execution::ExecutionEngine`], either by interpreting or by running translated IR.

#[macro_use]
extern crate static_assertions;

use std::fmt;

pub mod arch;
pub mod config;
pub mod execution;
pub mod features;
pub mod memory;
pub mod module;
pub mod monitor;
pub mod registers;
pub mod resources;
pub mod state_block;
pub mod sync;
pub mod thread;
pub mod trace;

pub use config::Config;

/// A guest address.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(u64);

impl Address {
    pub const NULL: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub fn wrapping_add(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Adds a signed displacement, wrapping on overflow.
    pub fn wrapping_offset(self, offset: i64) -> Self {
        Self(self.0.wrapping_add_signed(offset))
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<u32> for Address {
    fn from(value: u32) -> Self {
        Self(value as u64)
    }
}

impl From<Address> for u64 {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl nohash::IsEnabled for Address {}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

pub mod unit {
    //! Collection of the units in which memory can be addressed (in bytes).

    /// A _byte_ is 8 bits.
    pub const BYTE: usize = 1;

    /// A _halfword_ is 16 bits (2 bytes).
    pub const HALFWORD: usize = 2;

    /// A _word_ is 32 bits (4 bytes).
    pub const WORD: usize = 4;

    /// A _doubleword_ is 64 bits (8 bytes).
    pub const DOUBLEWORD: usize = 8;

    /// A _quadword_ is 128 bits (16 bytes).
    pub const QUADWORD: usize = 16;
}

/// Power-of-two address alignment.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    /// Byte alignment is equivalent to no alignment.
    pub const BYTE: Self = Self(1);

    pub const HALFWORD: Self = Self(2);

    pub const WORD: Self = Self(4);

    pub const DOUBLEWORD: Self = Self(8);

    pub const QUADWORD: Self = Self(16);

    /// Creates the natural alignment for a unit of `size` bytes. Returns `None` if `size` is not a
    /// power of two.
    pub fn natural_for_size(size: usize) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size as u64))
    }

    pub fn as_power_of_two(self) -> u64 {
        self.0
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: Address) -> bool {
        address.0 & (self.0 - 1) == 0
    }
}

/// Sum type for the two possible byte orders: big-endian or little-endian.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum Endianness {
    /// Little-endian (least significant byte at lowest address)
    #[default]
    LE,
    /// Big-endian (most significant byte at lowest address)
    BE,
}
