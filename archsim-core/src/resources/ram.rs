use crate::memory::{MemoryDevice, MemoryError, MemoryResult};
use crate::module::{Device, ModuleError, ParameterSchema, ParameterType, ParameterValues};
use crate::Address;
use std::ops::Range;
use std::sync::{PoisonError, RwLock};

/// Byte-based RAM with support for misaligned memory access.
///
/// Reads take a shared lock, so any number of guest threads can read concurrently.
#[derive(Debug)]
pub struct Ram {
    data: RwLock<Box<[u8]>>,
}

impl Ram {
    /// Create a new zero-initialized RAM resource that can hold `size` bytes.
    ///
    /// Returns `None` if `size` is zero.
    pub fn new(size: usize) -> Option<Self> {
        (size != 0).then(|| Self {
            data: RwLock::new(vec![0; size].into_boxed_slice()),
        })
    }

    /// Returns the size expressed in bytes. Guaranteed to be at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Force RAM back to its reset state, which is all-zeros.
    pub fn reset(&self) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(0);
    }

    /// Copies an image into RAM at `address`.
    pub fn load(&self, address: Address, image: &[u8]) -> MemoryResult {
        self.write(address, image)
    }

    fn range(len: usize, address: Address, size: usize) -> MemoryResult<Range<usize>> {
        usize::try_from(address.get())
            .ok()
            .and_then(|start| Some(start..start.checked_add(size)?))
            .filter(|range| range.end <= len)
            .ok_or(MemoryError::OutOfRange { address, size })
    }

    /// Reads `buf.len()` bytes at `address`. Fails without touching `buf` if any byte is outside
    /// the RAM.
    pub fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let range = Self::range(data.len(), address, buf.len())?;
        buf.copy_from_slice(&data[range]);
        Ok(())
    }

    /// Writes `buf` at `address`. Fails without writing anything if any byte is outside the RAM.
    pub fn write(&self, address: Address, buf: &[u8]) -> MemoryResult {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let range = Self::range(data.len(), address, buf.len())?;
        data[range].copy_from_slice(buf);
        Ok(())
    }
}

impl MemoryDevice for Ram {
    fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult {
        Ram::read(self, address, buf)
    }

    fn write(&self, address: Address, buf: &[u8]) -> MemoryResult {
        Ram::write(self, address, buf)
    }
}

impl Device for Ram {
    fn read(&self, offset: u64, buf: &mut [u8]) -> MemoryResult {
        Ram::read(self, Address::new(offset), buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> MemoryResult {
        Ram::write(self, Address::new(offset), buf)
    }
}

/// Parameters of [`factory`].
pub fn schema() -> ParameterSchema {
    ParameterSchema::new().required("size", ParameterType::U64)
}

/// Builds a [`Ram`] of `size` bytes for the module registry.
pub fn factory(params: &ParameterValues) -> Result<Box<dyn Device>, ModuleError> {
    let size = params.get_u64("size")?;
    usize::try_from(size)
        .ok()
        .and_then(Ram::new)
        .map(|ram| Box::new(ram) as Box<dyn Device>)
        .ok_or_else(|| ModuleError::InvalidParameter {
            name: "size".into(),
            reason: format!("cannot allocate {size} bytes"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size() {
        assert!(Ram::new(0).is_none());
    }

    #[test]
    fn test_read_write() {
        let ram = Ram::new(16).unwrap();
        ram.load(Address::new(4), &[1, 2, 3]).unwrap();
        let mut buf = [0; 5];
        ram.read(Address::new(3), &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 0]);
        ram.reset();
        ram.read(Address::new(3), &mut buf).unwrap();
        assert_eq!(buf, [0; 5]);
    }

    #[test]
    fn test_partial_out_of_range_is_untouched() {
        let ram = Ram::new(16).unwrap();
        assert_eq!(
            ram.write(Address::new(14), &[9, 9, 9]),
            Err(MemoryError::OutOfRange {
                address: Address::new(14),
                size: 3
            })
        );
        let mut buf = [7; 2];
        ram.read(Address::new(14), &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
        assert!(ram.read(Address::new(u64::MAX), &mut buf).is_err());
    }
}
