//! Guest memory interfaces.
//!
//! A [`MemoryInterface`] is one thread's view of a named guest address space. It translates guest
//! addresses through a [`TranslationProvider`], routes the access to a [`MemoryDevice`] and keeps
//! the memory monitor informed of every write.

use crate::arch::MemoryInterfaceDescriptor;
use crate::monitor::{MemoryMonitor, MonitorError};
use crate::thread::GuestThreadId;
use crate::{Address, Alignment, Endianness};
use log::trace;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

macro_rules! access_fns {
    ( $( $read_fn:ident, $write_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Reads a value in the interface's byte order.
            ///
            /// Misaligned addresses fail with [`MemoryError::Misaligned`] unless the interface
            /// allows misaligned access.
            pub fn $read_fn(&self, address: Address) -> MemoryResult<$u> {
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.check_alignment(address, buf.len())?;
                self.read_bytes(address, &mut buf)?;
                Ok(match self.descriptor.endianness {
                    Endianness::LE => $u::from_le_bytes(buf),
                    Endianness::BE => $u::from_be_bytes(buf),
                })
            }

            /// Writes a value in the interface's byte order.
            pub fn $write_fn(&self, address: Address, value: $u) -> MemoryResult {
                let buf = match self.descriptor.endianness {
                    Endianness::LE => value.to_le_bytes(),
                    Endianness::BE => value.to_be_bytes(),
                };
                self.check_alignment(address, buf.len())?;
                self.write_bytes(address, &buf)
            }
        )*
    };
}

pub type MemoryResult<T = ()> = Result<T, MemoryError>;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("access of {size} bytes at {address} is out of range")]
    OutOfRange { address: Address, size: usize },
    #[error("misaligned access of {size} bytes at {address}")]
    Misaligned { address: Address, size: usize },
    #[error("cannot translate {address}: {fault}")]
    Translation {
        address: Address,
        fault: TranslationFault,
    },
    #[error("device error: {0}")]
    Device(String),
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum TranslationFault {
    #[error("page not present")]
    NotPresent,
    #[error("insufficient privilege")]
    NotPrivileged,
}

/// Something guest memory accesses can be routed to.
///
/// Addresses are device-relative after translation. Accesses outside the device fail with
/// [`MemoryError::OutOfRange`] and leave the device untouched.
pub trait MemoryDevice: Send + Sync + Debug {
    fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult;

    fn write(&self, address: Address, buf: &[u8]) -> MemoryResult;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessKind {
    Read,
    Write,
    Fetch,
}

/// Guest virtual to physical address translation.
pub trait TranslationProvider: Send + Sync + Debug {
    fn translate(&self, address: Address, kind: AccessKind) -> Result<Address, TranslationFault>;
}

/// Maps every address to itself.
#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityTranslation;

impl TranslationProvider for IdentityTranslation {
    fn translate(&self, address: Address, _kind: AccessKind) -> Result<Address, TranslationFault> {
        Ok(address)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryInterface {
    descriptor: MemoryInterfaceDescriptor,
    device: Arc<dyn MemoryDevice>,
    translation: Arc<dyn TranslationProvider>,
    monitor: Option<Arc<dyn MemoryMonitor>>,
    owner: GuestThreadId,
    allow_misaligned: bool,
}

impl MemoryInterface {
    /// Creates an interface with identity translation and no monitor.
    pub fn new(
        descriptor: MemoryInterfaceDescriptor,
        device: Arc<dyn MemoryDevice>,
        owner: GuestThreadId,
    ) -> Self {
        Self {
            descriptor,
            device,
            translation: Arc::new(IdentityTranslation),
            monitor: None,
            owner,
            allow_misaligned: true,
        }
    }

    pub fn with_translation(mut self, translation: Arc<dyn TranslationProvider>) -> Self {
        self.translation = translation;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_misaligned_access(mut self, allow: bool) -> Self {
        self.allow_misaligned = allow;
        self
    }

    pub fn descriptor(&self) -> &MemoryInterfaceDescriptor {
        &self.descriptor
    }

    pub fn endianness(&self) -> Endianness {
        self.descriptor.endianness
    }

    pub fn monitor(&self) -> Option<&Arc<dyn MemoryMonitor>> {
        self.monitor.as_ref()
    }

    pub fn device(&self) -> &Arc<dyn MemoryDevice> {
        &self.device
    }

    fn translate(&self, address: Address, kind: AccessKind) -> MemoryResult<Address> {
        self.translation
            .translate(address, kind)
            .map_err(|fault| MemoryError::Translation { address, fault })
    }

    fn check_alignment(&self, address: Address, size: usize) -> MemoryResult {
        if self.allow_misaligned {
            return Ok(());
        }
        match Alignment::natural_for_size(size) {
            Some(alignment) if alignment.is_aligned(address) => Ok(()),
            _ => Err(MemoryError::Misaligned { address, size }),
        }
    }

    pub fn read_bytes(&self, address: Address, buf: &mut [u8]) -> MemoryResult {
        let physical = self.translate(address, AccessKind::Read)?;
        self.device.read(physical, buf)
    }

    /// Writes `buf` at `address`. With a monitor, other threads' monitors on that address are
    /// invalidated and the write lands before any of them can load-link it again.
    pub fn write_bytes(&self, address: Address, buf: &[u8]) -> MemoryResult {
        let physical = self.translate(address, AccessKind::Write)?;
        match &self.monitor {
            Some(monitor) => {
                monitor.exclusive_write(self.owner, physical, &mut || self.device.write(physical, buf))
            }
            None => self.device.write(physical, buf),
        }
    }

    access_fns! {
        read_8, write_8 => u8,
        read_16, write_16 => u16,
        read_32, write_32 => u32,
        read_64, write_64 => u64,
        read_128, write_128 => u128,
    }

    /// Fetches an instruction word.
    pub fn fetch_32(&self, address: Address) -> MemoryResult<u32> {
        let physical = self.translate(address, AccessKind::Fetch)?;
        let mut buf = [0u8; 4];
        self.device.read(physical, &mut buf)?;
        Ok(match self.descriptor.endianness {
            Endianness::LE => u32::from_le_bytes(buf),
            Endianness::BE => u32::from_be_bytes(buf),
        })
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes. Invalid UTF-8 is replaced.
    pub fn read_string(&self, address: Address, max_len: usize) -> MemoryResult<String> {
        let mut bytes = Vec::new();
        for i in 0..max_len {
            let byte = self.read_8(address.wrapping_add(i as u64))?;
            if byte == 0 {
                break;
            }
            bytes.push(byte);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Writes `value` followed by a NUL byte.
    pub fn write_string(&self, address: Address, value: &str) -> MemoryResult {
        self.write_bytes(address, value.as_bytes())?;
        self.write_8(address.wrapping_add(value.len() as u64), 0)
    }

    fn require_monitor(&self) -> MemoryResult<&Arc<dyn MemoryMonitor>> {
        self.monitor
            .as_ref()
            .ok_or(MemoryError::Unimplemented("exclusive access without a memory monitor"))
    }

    /// Loads `buf.len()` bytes and starts monitoring `address` for this interface's thread.
    pub fn load_linked(&self, address: Address, buf: &mut [u8]) -> MemoryResult {
        let monitor = self.require_monitor()?;
        let physical = self.translate(address, AccessKind::Read)?;
        // The monitor must be in place before the read.
        monitor.acquire_monitor(self.owner, physical);
        self.device.read(physical, buf).map_err(|e| {
            monitor.clear_monitor(self.owner);
            e
        })
    }

    /// Stores `buf` only if no other thread wrote `address` since this thread's last
    /// [`load_linked`](Self::load_linked). Returns whether the store happened. The monitor is
    /// cleared either way.
    pub fn store_conditional(&self, address: Address, buf: &[u8]) -> MemoryResult<bool> {
        let monitor = self.require_monitor()?;
        let physical = self.translate(address, AccessKind::Write)?;
        if !monitor.lock_monitor(self.owner, physical) {
            trace!("store-conditional by thread {} to {address} failed", self.owner);
            monitor.clear_monitor(self.owner);
            return Ok(false);
        }
        let stored = self.device.write(physical, buf).map(|()| {
            monitor.notify(self.owner, physical);
            monitor.clear_monitor(self.owner);
        });
        monitor.unlock_monitor(self.owner, physical)?;
        stored.map(|()| true)
    }
}
