//! Structured execution traces.

use crate::Address;
use log::trace;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TraceRecord {
    /// Start of a guest instruction. `ir` is the raw instruction word.
    InstructionHeader { pc: Address, ir: u32 },
    RegRead { bank: u32, index: u32, value: u64 },
    RegWrite { bank: u32, index: u32, value: u64 },
    MemRead { addr: Address, value: u64, size: u8 },
    MemWrite { addr: Address, value: u64, size: u8 },
    BlockEnd,
}

pub trait TraceSink: Send + Sync + Debug {
    fn push(&self, record: TraceRecord);

    fn flush(&self) {}
}

/// Forwards every record to the `log` facade at trace level.
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn push(&self, record: TraceRecord) {
        match record {
            TraceRecord::InstructionHeader { pc, ir } => {
                trace!(pc = pc.get(), ir = ir; "instruction")
            }
            TraceRecord::RegRead { bank, index, value } => {
                trace!(bank = bank, index = index, value = value; "register read")
            }
            TraceRecord::RegWrite { bank, index, value } => {
                trace!(bank = bank, index = index, value = value; "register write")
            }
            TraceRecord::MemRead { addr, value, size } => {
                trace!(addr = addr.get(), value = value, size = size; "memory read")
            }
            TraceRecord::MemWrite { addr, value, size } => {
                trace!(addr = addr.get(), value = value, size = size; "memory write")
            }
            TraceRecord::BlockEnd => trace!("block end"),
        }
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct VecTraceSink {
    records: Mutex<Vec<TraceRecord>>,
}

impl VecTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<TraceRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl TraceSink for VecTraceSink {
    fn push(&self, record: TraceRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
