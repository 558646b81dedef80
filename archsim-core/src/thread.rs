//! Mutable per-thread guest state.

use crate::arch::{ArchDescriptor, ArchError, IsaDescriptor};
use crate::execution::ExecutionResult;
use crate::features::FeatureState;
use crate::memory::{MemoryDevice, MemoryInterface, TranslationProvider};
use crate::monitor::MemoryMonitor;
use crate::registers::{RegisterError, RegisterFile};
use crate::state_block::{StateBlock, StateBlockDescriptor, StateBlockError, StateSlot, StateValue};
use crate::trace::{TraceRecord, TraceSink};
use crate::Address;
use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Identity of a guest thread, unique within one simulation.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestThreadId(u32);

impl GuestThreadId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl nohash::IsEnabled for GuestThreadId {}

// Stored in the 4-byte `thread_id` state block entry.
const_assert!(std::mem::size_of::<GuestThreadId>() == 4);

impl fmt::Display for GuestThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ThreadError {
    #[error(transparent)]
    Arch(#[from] ArchError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error(transparent)]
    StateBlock(#[from] StateBlockError),
    #[error("memory interface {0:?} is not connected to a device")]
    Unconnected(String),
}

/// Out-of-band requests to a running thread, consumed between steps.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadMessage {
    Nop,
    Interrupt,
    Halt,
    Suspend,
}

#[derive(Debug, Default)]
struct MessengerInner {
    queue: Mutex<VecDeque<ThreadMessage>>,
    has_message: AtomicBool,
    pending_irqs: AtomicU32,
}

/// Sending half of a thread's message queue. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct ThreadMessenger {
    inner: Arc<MessengerInner>,
}

impl ThreadMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, message: ThreadMessage) {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.push_back(message);
        self.inner.has_message.store(true, Ordering::Release);
    }

    /// Cheap check, safe to call on every step.
    pub fn has_message(&self) -> bool {
        self.inner.has_message.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<ThreadMessage> {
        if !self.has_message() {
            return None;
        }
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let message = queue.pop_front();
        self.inner
            .has_message
            .store(!queue.is_empty(), Ordering::Release);
        message
    }

    /// Drops all queued messages. Pending IRQs are kept.
    pub fn clear(&self) {
        let mut queue = self
            .inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        queue.clear();
        self.inner.has_message.store(false, Ordering::Release);
    }

    /// Marks an interrupt pending and wakes the thread with [`ThreadMessage::Interrupt`].
    pub fn raise_irq(&self) {
        self.inner.pending_irqs.fetch_add(1, Ordering::AcqRel);
        self.send(ThreadMessage::Interrupt);
    }

    pub fn clear_irq(&self) {
        let _ = self
            .inner
            .pending_irqs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn pending_irqs(&self) -> u32 {
        self.inner.pending_irqs.load(Ordering::Acquire)
    }
}

/// Exception categories shared by the steppers and the bundled exception handlers.
pub mod exception {
    pub const FETCH_FAULT: u32 = 1;
    pub const DATA_FAULT: u32 = 2;
    pub const UNDEFINED_INSTRUCTION: u32 = 3;
    pub const INTERRUPT: u32 = 4;
}

/// What to do after a guest exception was taken.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExceptionAction {
    /// Continue at whatever PC the handler left behind.
    Continue,
    /// Drop the faulting instruction without advancing the PC.
    AbortInstruction,
    /// Skip the faulting instruction.
    ResumeNext,
    Halt,
}

impl ExceptionAction {
    /// The step result this action ends the current step with.
    pub fn execution_result(self) -> ExecutionResult {
        match self {
            ExceptionAction::Halt => ExecutionResult::Exception,
            _ => ExecutionResult::Continue,
        }
    }
}

/// Guest-architecture-specific exception entry.
pub trait ExceptionHandler: Send + Sync + fmt::Debug {
    fn handle(&self, thread: &mut ThreadInstance, category: u32, data: u64) -> ExceptionAction;
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FpState {
    pub rounding_mode: u8,
    pub flush_mode: bool,
}

/// The mutable state of one guest thread.
///
/// Owned by exactly one execution context at a time; nothing in here is shared with other threads
/// except through the memory interfaces.
#[derive(Debug)]
pub struct ThreadInstance {
    id: GuestThreadId,
    arch: Arc<ArchDescriptor>,
    registers: RegisterFile,
    state: StateBlock,
    mode_slot: StateSlot<u32>,
    ring_slot: StateSlot<u32>,
    /// In the order of the architecture's memory interface descriptors.
    interfaces: Vec<MemoryInterface>,
    fetch_interface: usize,
    features: FeatureState,
    fp_state: FpState,
    messenger: ThreadMessenger,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
}

impl ThreadInstance {
    pub fn builder(id: GuestThreadId, arch: Arc<ArchDescriptor>) -> ThreadInstanceBuilder {
        ThreadInstanceBuilder {
            id,
            arch,
            devices: HashMap::new(),
            default_device: None,
            monitor: None,
            translation: None,
            exception_handler: None,
            state_entries: Vec::new(),
            allow_misaligned: true,
        }
    }

    pub fn id(&self) -> GuestThreadId {
        self.id
    }

    pub fn arch(&self) -> &Arc<ArchDescriptor> {
        &self.arch
    }

    pub fn pc(&self) -> Result<Address, RegisterError> {
        self.registers.pc()
    }

    pub fn set_pc(&mut self, pc: Address) -> Result<(), RegisterError> {
        self.registers.set_pc(pc)
    }

    pub fn sp(&self) -> Result<Address, RegisterError> {
        self.registers.sp()
    }

    pub fn set_sp(&mut self, sp: Address) -> Result<(), RegisterError> {
        self.registers.set_sp(sp)
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    /// Byte range of register `index` of bank `bank` within the register file.
    pub fn register_slot(&self, bank: &str, index: usize) -> Result<Range<usize>, ThreadError> {
        Ok(self.arch.register_file().bank(bank)?.slot_range(index)?)
    }

    pub fn read_register<T: StateValue>(&self, bank: &str, index: usize) -> Result<T, RegisterError> {
        self.registers.read(bank, index)
    }

    pub fn write_register<T: StateValue>(
        &mut self,
        bank: &str,
        index: usize,
        value: T,
    ) -> Result<(), RegisterError> {
        self.registers.write(bank, index, value)
    }

    pub fn state_block(&self) -> &StateBlock {
        &self.state
    }

    pub fn state_block_mut(&mut self) -> &mut StateBlock {
        &mut self.state
    }

    pub fn mode_id(&self) -> u32 {
        // The slot was resolved against this block's own descriptor, so it is in bounds.
        self.state.get(self.mode_slot).unwrap_or_default()
    }

    /// Switches the instruction set the thread decodes with.
    pub fn set_mode_id(&mut self, mode_id: u32) {
        debug!("thread {} switches to mode {mode_id}", self.id);
        let _ = self.state.set(self.mode_slot, mode_id);
    }

    pub fn ring_id(&self) -> u32 {
        self.state.get(self.ring_slot).unwrap_or_default()
    }

    pub fn set_ring_id(&mut self, ring_id: u32) {
        let _ = self.state.set(self.ring_slot, ring_id);
    }

    /// The instruction set of the current mode.
    pub fn isa(&self) -> Result<&IsaDescriptor, ArchError> {
        self.arch.isa_by_mode(self.mode_id())
    }

    pub fn memory_interface(&self, name: &str) -> Result<&MemoryInterface, ArchError> {
        self.interfaces
            .iter()
            .find(|interface| interface.descriptor().name == name)
            .ok_or_else(|| ArchError::UnknownMemoryInterface(name.to_owned()))
    }

    pub fn memory_interface_by_id(&self, id: u32) -> Option<&MemoryInterface> {
        self.interfaces
            .iter()
            .find(|interface| interface.descriptor().id == id)
    }

    pub fn fetch_interface(&self) -> &MemoryInterface {
        &self.interfaces[self.fetch_interface]
    }

    pub fn features(&self) -> &FeatureState {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut FeatureState {
        &mut self.features
    }

    pub fn feature(&self, name: &str) -> Result<u32, ArchError> {
        self.features.level_by_name(self.arch.features(), name)
    }

    pub fn set_feature(&mut self, name: &str, level: u32) -> Result<(), ArchError> {
        self.features
            .set_level_by_name(self.arch.features(), name, level)
    }

    pub fn fp_state(&self) -> FpState {
        self.fp_state
    }

    pub fn fp_state_mut(&mut self) -> &mut FpState {
        &mut self.fp_state
    }

    pub fn messenger(&self) -> &ThreadMessenger {
        &self.messenger
    }

    pub fn pending_irqs(&self) -> u32 {
        self.messenger.pending_irqs()
    }

    pub fn raise_irq(&self) {
        self.messenger.raise_irq();
    }

    pub fn clear_irq(&self) {
        self.messenger.clear_irq();
    }

    /// Consumes one queued message, if any.
    ///
    /// Returns [`Continue`](ExecutionResult::Continue) when there was nothing to do, and
    /// [`Exception`](ExecutionResult::Exception) when an interrupt was delivered to the exception
    /// handler and the thread may keep running. [`Halt`](ExecutionResult::Halt) means the thread
    /// must stop stepping, either because it was asked to or because the handler gave up.
    pub fn handle_message(&mut self) -> ExecutionResult {
        let Some(message) = self.messenger.take() else {
            return ExecutionResult::Continue;
        };
        trace!("thread {} handles {message:?}", self.id);
        match message {
            ThreadMessage::Nop => ExecutionResult::Continue,
            ThreadMessage::Interrupt => {
                let irqs = self.pending_irqs() as u64;
                match self.take_exception(exception::INTERRUPT, irqs) {
                    ExceptionAction::Halt => ExecutionResult::Halt,
                    _ => ExecutionResult::Exception,
                }
            }
            ThreadMessage::Halt | ThreadMessage::Suspend => ExecutionResult::Halt,
        }
    }

    /// Enters the guest exception handler. Without a handler the thread halts.
    pub fn take_exception(&mut self, category: u32, data: u64) -> ExceptionAction {
        debug!(
            "thread {} takes exception {category} ({data:#x}) at {:?}",
            self.id,
            self.pc().ok()
        );
        match self.exception_handler.clone() {
            Some(handler) => handler.handle(self, category, data),
            None => ExceptionAction::Halt,
        }
    }

    pub fn set_exception_handler(&mut self, handler: Option<Arc<dyn ExceptionHandler>>) {
        self.exception_handler = handler;
    }

    pub fn trace_sink(&self) -> Option<&Arc<dyn TraceSink>> {
        self.trace_sink.as_ref()
    }

    pub fn set_trace_sink(&mut self, sink: Option<Arc<dyn TraceSink>>) {
        self.trace_sink = sink;
    }

    /// Pushes `record` to the trace sink, if one is attached.
    pub fn trace(&self, record: TraceRecord) {
        if let Some(sink) = &self.trace_sink {
            sink.push(record);
        }
    }
}

/// Connects a [`ThreadInstance`] to its devices before it first runs.
#[derive(Debug)]
pub struct ThreadInstanceBuilder {
    id: GuestThreadId,
    arch: Arc<ArchDescriptor>,
    devices: HashMap<String, Arc<dyn MemoryDevice>>,
    default_device: Option<Arc<dyn MemoryDevice>>,
    monitor: Option<Arc<dyn MemoryMonitor>>,
    translation: Option<Arc<dyn TranslationProvider>>,
    exception_handler: Option<Arc<dyn ExceptionHandler>>,
    state_entries: Vec<(String, usize)>,
    allow_misaligned: bool,
}

impl ThreadInstanceBuilder {
    /// Routes memory interface `name` to `device`.
    pub fn connect(mut self, name: &str, device: Arc<dyn MemoryDevice>) -> Self {
        self.devices.insert(name.to_owned(), device);
        self
    }

    /// Routes every interface not connected by name to `device`.
    pub fn connect_all(mut self, device: Arc<dyn MemoryDevice>) -> Self {
        self.default_device = Some(device);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn MemoryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn translation(mut self, translation: Arc<dyn TranslationProvider>) -> Self {
        self.translation = Some(translation);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Reserves an extra state block entry after the default ones.
    pub fn state_entry(mut self, name: &str, size: usize) -> Self {
        self.state_entries.push((name.to_owned(), size));
        self
    }

    pub fn misaligned_access(mut self, allow: bool) -> Self {
        self.allow_misaligned = allow;
        self
    }

    pub fn build(self) -> Result<ThreadInstance, ThreadError> {
        let descriptors = self.arch.memory_interfaces();
        for name in self.devices.keys() {
            descriptors.get(name)?;
        }

        let fetch_interface = descriptors
            .iter()
            .position(|descriptor| descriptor.is_fetch)
            .ok_or(ArchError::NoFetchInterface)?;
        let mut interfaces = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.iter() {
            let device = self
                .devices
                .get(&descriptor.name)
                .or(self.default_device.as_ref())
                .ok_or_else(|| ThreadError::Unconnected(descriptor.name.clone()))?;
            let mut interface = MemoryInterface::new(descriptor.clone(), Arc::clone(device), self.id)
                .with_misaligned_access(self.allow_misaligned);
            if let Some(translation) = &self.translation {
                interface = interface.with_translation(Arc::clone(translation));
            }
            if let Some(monitor) = &self.monitor {
                interface = interface.with_monitor(Arc::clone(monitor));
            }
            interfaces.push(interface);
        }

        let mut layout = StateBlockDescriptor::new();
        layout.add_block("thread_id", 4)?;
        layout.add_block("mode_id", 4)?;
        layout.add_block("ring_id", 4)?;
        for (name, size) in &self.state_entries {
            layout.add_block(name, *size)?;
        }
        let mode_slot = layout.slot::<u32>("mode_id")?;
        let ring_slot = layout.slot::<u32>("ring_id")?;
        let mut state = StateBlock::new(Arc::new(layout));
        state.set_entry("thread_id", self.id.get())?;

        debug!("built thread {} for {}", self.id, self.arch.name());
        Ok(ThreadInstance {
            id: self.id,
            registers: RegisterFile::new(Arc::clone(self.arch.register_file()))?,
            features: FeatureState::new(self.arch.features()),
            arch: self.arch,
            state,
            mode_slot,
            ring_slot,
            interfaces,
            fetch_interface,
            fp_state: FpState::default(),
            messenger: ThreadMessenger::new(),
            exception_handler: self.exception_handler,
            trace_sink: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::{
        FeatureDescriptor, FeaturesDescriptor, MemoryInterfaceDescriptor, MemoryInterfacesDescriptor,
        RegisterFileDescriptor,
    };
    use crate::resources::ram::Ram;
    use crate::trace::VecTraceSink;
    use crate::Endianness;

    /// Four 8-byte general purpose registers, an 8-byte PC and two memory interfaces.
    pub(crate) fn test_arch() -> Arc<ArchDescriptor> {
        let registers = RegisterFileDescriptor::builder()
            .bank("R", 0, 4, 8, 8)
            .tagged("PC", 32, 8, "PC")
            .build()
            .unwrap();
        let interfaces = MemoryInterfacesDescriptor::new(vec![
            MemoryInterfaceDescriptor {
                name: "Fetch".into(),
                id: 0,
                address_width: 8,
                data_width: 4,
                endianness: Endianness::LE,
                is_fetch: true,
            },
            MemoryInterfaceDescriptor {
                name: "Data".into(),
                id: 1,
                address_width: 8,
                data_width: 8,
                endianness: Endianness::LE,
                is_fetch: false,
            },
        ])
        .unwrap();
        let features = FeaturesDescriptor::new(vec![FeatureDescriptor {
            name: "fpu".into(),
            id: 3,
            default_level: 1,
        }])
        .unwrap();
        Arc::new(ArchDescriptor::new("test", registers, interfaces, features, Vec::new()).unwrap())
    }

    fn ram() -> Arc<dyn MemoryDevice> {
        Arc::new(Ram::new(0x1000).unwrap())
    }

    #[derive(Debug)]
    struct SkipHandler;

    impl ExceptionHandler for SkipHandler {
        fn handle(&self, thread: &mut ThreadInstance, category: u32, data: u64) -> ExceptionAction {
            thread.write_register("R", 0, category as u64).unwrap();
            thread.write_register("R", 1, data).unwrap();
            ExceptionAction::ResumeNext
        }
    }

    #[test]
    fn test_set_and_get_pc() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .build()
            .unwrap();
        thread.set_pc(Address::new(0x1000)).unwrap();
        assert_eq!(thread.pc().unwrap(), Address::new(0x1000));
        assert_eq!(thread.register_slot("PC", 0).unwrap(), 32..40);
        assert!(thread.sp().is_err());
    }

    #[test]
    fn test_unconnected_interface() {
        let result = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect("Fetch", ram())
            .build();
        assert_eq!(result.unwrap_err(), ThreadError::Unconnected("Data".into()));

        let result = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .connect("Bogus", ram())
            .build();
        assert!(matches!(
            result,
            Err(ThreadError::Arch(ArchError::UnknownMemoryInterface(_)))
        ));
    }

    #[test]
    fn test_interfaces_route_to_their_devices() {
        let data = ram();
        let thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .connect("Data", Arc::clone(&data))
            .build()
            .unwrap();
        thread
            .memory_interface("Data")
            .unwrap()
            .write_32(Address::new(8), 42)
            .unwrap();
        assert_eq!(thread.fetch_interface().read_32(Address::new(8)).unwrap(), 0);
        assert_eq!(
            thread.memory_interface_by_id(1).unwrap().read_32(Address::new(8)).unwrap(),
            42
        );
        assert!(thread.memory_interface("Nope").is_err());
    }

    #[test]
    fn test_default_state_entries() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(7), test_arch())
            .connect_all(ram())
            .state_entry("scratch", 16)
            .build()
            .unwrap();
        let state = thread.state_block();
        assert_eq!(state.get_entry::<u32>("thread_id").unwrap(), 7);
        assert_eq!(state.descriptor().block_offset("scratch").unwrap(), 12);
        assert_eq!(thread.mode_id(), 0);

        thread.set_mode_id(2);
        thread.set_ring_id(1);
        assert_eq!(thread.state_block().get_entry::<u32>("mode_id").unwrap(), 2);
        assert_eq!(thread.ring_id(), 1);
    }

    #[test]
    fn test_duplicate_state_entry() {
        let result = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .state_entry("mode_id", 4)
            .build();
        assert!(matches!(
            result,
            Err(ThreadError::StateBlock(StateBlockError::DuplicateName(_)))
        ));
    }

    #[test]
    fn test_features() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .build()
            .unwrap();
        assert_eq!(thread.feature("fpu").unwrap(), 1);
        thread.set_feature("fpu", 0).unwrap();
        assert!(!thread.features().is_active(3));
        assert!(thread.set_feature("vector", 1).is_err());
    }

    #[test]
    fn test_messages() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .build()
            .unwrap();
        let messenger = thread.messenger().clone();
        assert_eq!(thread.handle_message(), ExecutionResult::Continue);
        messenger.send(ThreadMessage::Nop);
        messenger.send(ThreadMessage::Suspend);
        assert_eq!(thread.handle_message(), ExecutionResult::Continue);
        assert_eq!(thread.handle_message(), ExecutionResult::Halt);
        assert!(!messenger.has_message());

        // Without a handler, an interrupt halts the thread.
        messenger.raise_irq();
        assert_eq!(thread.pending_irqs(), 1);
        assert_eq!(thread.handle_message(), ExecutionResult::Halt);
        thread.clear_irq();
        thread.clear_irq();
        assert_eq!(thread.pending_irqs(), 0);

        messenger.send(ThreadMessage::Halt);
        messenger.clear();
        assert_eq!(thread.handle_message(), ExecutionResult::Continue);
    }

    #[test]
    fn test_exception_handler() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .exception_handler(Arc::new(SkipHandler))
            .build()
            .unwrap();
        assert_eq!(
            thread.take_exception(exception::DATA_FAULT, 0x44),
            ExceptionAction::ResumeNext
        );
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 2);
        assert_eq!(thread.read_register::<u64>("R", 1).unwrap(), 0x44);

        thread.raise_irq();
        assert_eq!(thread.handle_message(), ExecutionResult::Exception);
        assert_eq!(thread.read_register::<u64>("R", 0).unwrap(), 4);

        thread.set_exception_handler(None);
        assert_eq!(thread.take_exception(0, 0), ExceptionAction::Halt);
        assert_eq!(
            ExceptionAction::Halt.execution_result(),
            ExecutionResult::Exception
        );
    }

    #[test]
    fn test_trace_sink() {
        let mut thread = ThreadInstance::builder(GuestThreadId::new(0), test_arch())
            .connect_all(ram())
            .build()
            .unwrap();
        thread.trace(TraceRecord::BlockEnd);
        let sink = Arc::new(VecTraceSink::new());
        thread.set_trace_sink(Some(sink.clone()));
        thread.trace(TraceRecord::BlockEnd);
        assert_eq!(sink.records(), vec![TraceRecord::BlockEnd]);
    }
}
