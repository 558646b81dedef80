//! Static description of a guest architecture.
//!
//! An [`ArchDescriptor`] is built once at startup and shared read-only (behind an `Arc`) by every
//! thread of that architecture. All lookups by name fail with an [`ArchError`] when the name is
//! absent.

use crate::execution::ExecutionResult;
use crate::thread::{ExceptionAction, ThreadInstance};
use crate::{Address, Endianness};
use archsim_ir::small_vec::MaybeVec;
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ArchError {
    #[error("duplicate {kind} {name:?}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("no register bank named {0:?}")]
    UnknownRegisterBank(String),
    #[error("no register bank tagged {0:?}")]
    UnknownTag(String),
    #[error("no memory interface named {0:?}")]
    UnknownMemoryInterface(String),
    #[error("no feature named {0:?}")]
    UnknownFeature(String),
    #[error("no instruction set named {0:?}")]
    UnknownIsa(String),
    #[error("no instruction set for mode {0}")]
    UnknownIsaMode(u32),
    #[error("no behaviour named {0:?}")]
    UnknownBehaviour(String),
    #[error("no behaviour with id {0}")]
    UnknownBehaviourId(u32),
    #[error("register {bank}[{index}] out of range (bank has {count} entries)")]
    RegisterIndexOutOfRange {
        bank: String,
        index: usize,
        count: usize,
    },
    #[error("register banks {first:?} and {second:?} overlap")]
    OverlappingBanks { first: String, second: String },
    #[error("register bank {0:?} has a stride smaller than its element size")]
    InvalidStride(String),
    #[error("no memory interface is marked as the fetch interface")]
    NoFetchInterface,
    #[error("more than one memory interface is marked as the fetch interface")]
    MultipleFetchInterfaces,
}

/// One named bank of registers within the register file.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegisterBankDescriptor {
    pub name: String,
    pub id: u32,
    /// Byte offset of the first element.
    pub offset: usize,
    pub count: usize,
    pub element_size: usize,
    /// Distance in bytes between consecutive elements.
    pub stride: usize,
    /// Semantic role such as `"PC"` or `"SP"`.
    pub tag: Option<String>,
}

impl RegisterBankDescriptor {
    /// Byte range of the whole bank.
    pub fn span(&self) -> Range<usize> {
        let len = match self.count {
            0 => 0,
            n => self.stride * (n - 1) + self.element_size,
        };
        self.offset..self.offset + len
    }

    /// Byte range of element `index`.
    pub fn slot_range(&self, index: usize) -> Result<Range<usize>, ArchError> {
        if index >= self.count {
            return Err(ArchError::RegisterIndexOutOfRange {
                bank: self.name.clone(),
                index,
                count: self.count,
            });
        }
        let start = self.offset + index * self.stride;
        Ok(start..start + self.element_size)
    }
}

/// Layout of the register file.
#[derive(Debug, Clone, Default)]
pub struct RegisterFileDescriptor {
    size: usize,
    banks: Vec<RegisterBankDescriptor>,
    by_name: HashMap<String, usize>,
}

impl RegisterFileDescriptor {
    pub fn builder() -> RegisterFileDescriptorBuilder {
        RegisterFileDescriptorBuilder::default()
    }

    /// Total size of the register file in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bank(&self, name: &str) -> Result<&RegisterBankDescriptor, ArchError> {
        self.by_name
            .get(name)
            .map(|&i| &self.banks[i])
            .ok_or_else(|| ArchError::UnknownRegisterBank(name.to_owned()))
    }

    pub fn bank_by_id(&self, id: u32) -> Option<&RegisterBankDescriptor> {
        self.banks.iter().find(|bank| bank.id == id)
    }

    pub fn tagged(&self, tag: &str) -> Result<&RegisterBankDescriptor, ArchError> {
        self.banks
            .iter()
            .find(|bank| bank.tag.as_deref() == Some(tag))
            .ok_or_else(|| ArchError::UnknownTag(tag.to_owned()))
    }

    pub fn banks(&self) -> impl Iterator<Item = &RegisterBankDescriptor> {
        self.banks.iter()
    }
}

#[derive(Debug, Default)]
pub struct RegisterFileDescriptorBuilder {
    banks: Vec<RegisterBankDescriptor>,
}

impl RegisterFileDescriptorBuilder {
    /// Adds a bank of `count` registers of `element_size` bytes, `stride` bytes apart.
    pub fn bank(
        mut self,
        name: &str,
        offset: usize,
        count: usize,
        element_size: usize,
        stride: usize,
    ) -> Self {
        let id = self.banks.len() as u32;
        self.banks.push(RegisterBankDescriptor {
            name: name.to_owned(),
            id,
            offset,
            count,
            element_size,
            stride,
            tag: None,
        });
        self
    }

    /// Adds a single register carrying a semantic `tag`.
    pub fn tagged(mut self, name: &str, offset: usize, size: usize, tag: &str) -> Self {
        self = self.bank(name, offset, 1, size, size);
        if let Some(bank) = self.banks.last_mut() {
            bank.tag = Some(tag.to_owned());
        }
        self
    }

    /// Validates names, strides and overlap, and computes the total size.
    pub fn build(self) -> Result<RegisterFileDescriptor, ArchError> {
        let mut by_name = HashMap::new();
        for (i, bank) in self.banks.iter().enumerate() {
            if by_name.insert(bank.name.clone(), i).is_some() {
                return Err(ArchError::DuplicateName {
                    kind: "register bank",
                    name: bank.name.clone(),
                });
            }
            if bank.count > 1 && bank.stride < bank.element_size {
                return Err(ArchError::InvalidStride(bank.name.clone()));
            }
        }
        for (i, a) in self.banks.iter().enumerate() {
            for b in &self.banks[i + 1..] {
                let (sa, sb) = (a.span(), b.span());
                if sa.start < sb.end && sb.start < sa.end {
                    return Err(ArchError::OverlappingBanks {
                        first: a.name.clone(),
                        second: b.name.clone(),
                    });
                }
            }
        }
        let size = self
            .banks
            .iter()
            .map(|bank| bank.span().end)
            .max()
            .unwrap_or(0);
        Ok(RegisterFileDescriptor {
            size,
            banks: self.banks,
            by_name,
        })
    }
}

/// A named view of guest memory.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MemoryInterfaceDescriptor {
    pub name: String,
    pub id: u32,
    /// Address width in bytes.
    pub address_width: u8,
    /// Native data width in bytes.
    pub data_width: u8,
    pub endianness: Endianness,
    pub is_fetch: bool,
}

/// The memory interfaces of an architecture. Only [`new`](Self::new) creates one, so there is
/// always exactly one fetch interface.
#[derive(Debug, Clone)]
pub struct MemoryInterfacesDescriptor {
    interfaces: Vec<MemoryInterfaceDescriptor>,
    fetch: usize,
}

// An empty set would have no fetch interface.
assert_not_impl_any!(MemoryInterfacesDescriptor: Default);

impl MemoryInterfacesDescriptor {
    /// Validates unique names and ids, and that exactly one interface is the fetch interface.
    pub fn new(interfaces: Vec<MemoryInterfaceDescriptor>) -> Result<Self, ArchError> {
        for (i, a) in interfaces.iter().enumerate() {
            if interfaces[..i]
                .iter()
                .any(|b| b.name == a.name || b.id == a.id)
            {
                return Err(ArchError::DuplicateName {
                    kind: "memory interface",
                    name: a.name.clone(),
                });
            }
        }
        let fetch: Vec<usize> = interfaces
            .iter()
            .enumerate()
            .filter(|(_, mi)| mi.is_fetch)
            .map(|(i, _)| i)
            .collect();
        match *fetch.as_slice() {
            [] => Err(ArchError::NoFetchInterface),
            [index] => Ok(Self {
                interfaces,
                fetch: index,
            }),
            _ => Err(ArchError::MultipleFetchInterfaces),
        }
    }

    pub fn get(&self, name: &str) -> Result<&MemoryInterfaceDescriptor, ArchError> {
        self.interfaces
            .iter()
            .find(|mi| mi.name == name)
            .ok_or_else(|| ArchError::UnknownMemoryInterface(name.to_owned()))
    }

    pub fn by_id(&self, id: u32) -> Option<&MemoryInterfaceDescriptor> {
        self.interfaces.iter().find(|mi| mi.id == id)
    }

    pub fn fetch_interface(&self) -> &MemoryInterfaceDescriptor {
        &self.interfaces[self.fetch]
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryInterfaceDescriptor> {
        self.interfaces.iter()
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeatureDescriptor {
    pub name: String,
    pub id: u32,
    pub default_level: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FeaturesDescriptor {
    features: Vec<FeatureDescriptor>,
}

impl FeaturesDescriptor {
    pub fn new(features: Vec<FeatureDescriptor>) -> Result<Self, ArchError> {
        for (i, a) in features.iter().enumerate() {
            if features[..i].iter().any(|b| b.name == a.name || b.id == a.id) {
                return Err(ArchError::DuplicateName {
                    kind: "feature",
                    name: a.name.clone(),
                });
            }
        }
        Ok(Self { features })
    }

    pub fn get(&self, name: &str) -> Result<&FeatureDescriptor, ArchError> {
        self.features
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| ArchError::UnknownFeature(name.to_owned()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureDescriptor> {
        self.features.iter()
    }
}

/// Index into an ISA's behaviour table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BehaviourId(pub u32);

/// A named ISA helper, callable from the interpreter and from translated code.
pub type BehaviourFn = fn(&mut InvocationContext<'_>) -> u64;

/// What a behaviour gets to work with.
pub struct InvocationContext<'a> {
    pub thread: &'a mut ThreadInstance,
    pub args: &'a [u64],
    result: ExecutionResult,
    exception: Option<ExceptionAction>,
}

impl<'a> InvocationContext<'a> {
    pub fn new(thread: &'a mut ThreadInstance, args: &'a [u64]) -> Self {
        Self {
            thread,
            args,
            result: ExecutionResult::Continue,
            exception: None,
        }
    }

    /// Argument `index`, or zero if absent.
    pub fn arg(&self, index: usize) -> u64 {
        self.args.get(index).copied().unwrap_or(0)
    }

    /// Ends the current step with `result` once the behaviour returns.
    pub fn raise(&mut self, result: ExecutionResult) {
        self.result = result;
    }

    /// Takes a guest exception through the thread's exception handler.
    pub fn raise_exception(&mut self, category: u32, data: u64) {
        let action = self.thread.take_exception(category, data);
        self.exception = Some(action);
        self.result = action.execution_result();
    }

    pub fn result(&self) -> ExecutionResult {
        self.result
    }

    /// The action chosen by the exception handler, if an exception was taken.
    pub fn exception(&self) -> Option<ExceptionAction> {
        self.exception
    }
}

/// Raised by a [`Decoder`] for words that are not valid instructions.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[error("undefined instruction {word:#010x} at {pc}")]
pub struct DecodeError {
    pub pc: Address,
    pub word: u32,
}

/// A decoded guest instruction.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    pub word: u32,
    /// Length in bytes.
    pub length: u8,
    pub behaviour: BehaviourId,
    pub args: MaybeVec<u64, 4>,
    /// The behaviour sets the PC itself; this also ends a block.
    pub writes_pc: bool,
}

/// Turns fetched instruction words into [`DecodedInstruction`]s.
pub trait Decoder: Send + Sync + fmt::Debug {
    fn decode(&self, pc: Address, word: u32) -> Result<DecodedInstruction, DecodeError>;
}

/// One instruction set of an architecture.
pub struct IsaDescriptor {
    name: String,
    id: u32,
    decoder: Arc<dyn Decoder>,
    behaviours: Vec<(String, BehaviourFn)>,
    by_name: HashMap<String, BehaviourId>,
}

impl IsaDescriptor {
    pub fn builder(name: &str, id: u32) -> IsaDescriptorBuilder {
        IsaDescriptorBuilder {
            name: name.to_owned(),
            id,
            behaviours: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn decoder(&self) -> &dyn Decoder {
        self.decoder.as_ref()
    }

    pub fn behaviour_id(&self, name: &str) -> Result<BehaviourId, ArchError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ArchError::UnknownBehaviour(name.to_owned()))
    }

    pub fn behaviour_name(&self, id: BehaviourId) -> Option<&str> {
        self.behaviours.get(id.0 as usize).map(|(name, _)| name.as_str())
    }

    pub fn invoke(&self, name: &str, context: &mut InvocationContext<'_>) -> Result<u64, ArchError> {
        self.invoke_by_id(self.behaviour_id(name)?, context)
    }

    pub fn invoke_by_id(
        &self,
        id: BehaviourId,
        context: &mut InvocationContext<'_>,
    ) -> Result<u64, ArchError> {
        let (_, behaviour) = self
            .behaviours
            .get(id.0 as usize)
            .ok_or(ArchError::UnknownBehaviourId(id.0))?;
        Ok(behaviour(context))
    }
}

pub struct IsaDescriptorBuilder {
    name: String,
    id: u32,
    behaviours: Vec<(String, BehaviourFn)>,
    by_name: HashMap<String, BehaviourId>,
}

impl IsaDescriptorBuilder {
    pub fn add_behaviour(&mut self, name: &str, behaviour: BehaviourFn) -> Result<BehaviourId, ArchError> {
        if self.by_name.contains_key(name) {
            return Err(ArchError::DuplicateName {
                kind: "behaviour",
                name: name.to_owned(),
            });
        }
        let id = BehaviourId(self.behaviours.len() as u32);
        self.behaviours.push((name.to_owned(), behaviour));
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn build(self, decoder: Arc<dyn Decoder>) -> IsaDescriptor {
        IsaDescriptor {
            name: self.name,
            id: self.id,
            decoder,
            behaviours: self.behaviours,
            by_name: self.by_name,
        }
    }
}

impl fmt::Debug for IsaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsaDescriptor")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("decoder", &self.decoder)
            .field(
                "behaviours",
                &self.behaviours.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl fmt::Debug for IsaDescriptorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsaDescriptorBuilder")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("behaviours", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything static about one guest architecture.
#[derive(Debug)]
pub struct ArchDescriptor {
    name: String,
    register_file: Arc<RegisterFileDescriptor>,
    memory_interfaces: MemoryInterfacesDescriptor,
    features: FeaturesDescriptor,
    isas: Vec<IsaDescriptor>,
}

impl ArchDescriptor {
    pub fn new(
        name: &str,
        register_file: RegisterFileDescriptor,
        memory_interfaces: MemoryInterfacesDescriptor,
        features: FeaturesDescriptor,
        isas: Vec<IsaDescriptor>,
    ) -> Result<Self, ArchError> {
        for (i, a) in isas.iter().enumerate() {
            if isas[..i].iter().any(|b| b.name == a.name || b.id == a.id) {
                return Err(ArchError::DuplicateName {
                    kind: "instruction set",
                    name: a.name.clone(),
                });
            }
        }
        Ok(Self {
            name: name.to_owned(),
            register_file: Arc::new(register_file),
            memory_interfaces,
            features,
            isas,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_file(&self) -> &Arc<RegisterFileDescriptor> {
        &self.register_file
    }

    pub fn memory_interfaces(&self) -> &MemoryInterfacesDescriptor {
        &self.memory_interfaces
    }

    pub fn features(&self) -> &FeaturesDescriptor {
        &self.features
    }

    pub fn isa(&self, name: &str) -> Result<&IsaDescriptor, ArchError> {
        self.isas
            .iter()
            .find(|isa| isa.name == name)
            .ok_or_else(|| ArchError::UnknownIsa(name.to_owned()))
    }

    /// The instruction set used in mode `mode_id`.
    pub fn isa_by_mode(&self, mode_id: u32) -> Result<&IsaDescriptor, ArchError> {
        self.isas
            .iter()
            .find(|isa| isa.id == mode_id)
            .ok_or(ArchError::UnknownIsaMode(mode_id))
    }

    pub fn isas(&self) -> impl Iterator<Item = &IsaDescriptor> {
        self.isas.iter()
    }
}
