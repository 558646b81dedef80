//! Registry of device modules.
//!
//! A module is a named bundle of device factories. Modules are registered with a
//! [`ModuleManager`] at startup; devices are then instantiated by name with parameters that are
//! checked against the factory's [`ParameterSchema`].

use crate::memory::{MemoryDevice, MemoryResult};
use crate::Address;
use log::debug;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ModuleError {
    #[error("duplicate module {0:?}")]
    DuplicateModule(String),
    #[error("no module named {0:?}")]
    UnknownModule(String),
    #[error("duplicate device {device:?} in module {module:?}")]
    DuplicateDevice { module: String, device: String },
    #[error("module {module:?} has no device named {device:?}")]
    UnknownDevice { module: String, device: String },
    #[error("missing parameter {0:?}")]
    MissingParameter(String),
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
    #[error("parameter {name:?} must be of type {expected:?}")]
    ParameterType {
        name: String,
        expected: ParameterType,
    },
    #[error("invalid parameter {name:?}: {reason}")]
    InvalidParameter { name: String, reason: String },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParameterType {
    U64,
    String,
    Bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ParameterValue {
    U64(u64),
    String(String),
    Bool(bool),
}

impl ParameterValue {
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterValue::U64(_) => ParameterType::U64,
            ParameterValue::String(_) => ParameterType::String,
            ParameterValue::Bool(_) => ParameterType::Bool,
        }
    }
}

/// Named parameter values handed to a device factory.
#[derive(Debug, Clone, Default)]
pub struct ParameterValues {
    values: HashMap<String, ParameterValue>,
}

impl ParameterValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: ParameterValue) -> Self {
        self.values.insert(name.to_owned(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.values.get(name)
    }

    pub fn get_u64(&self, name: &str) -> Result<u64, ModuleError> {
        match self.get(name) {
            Some(ParameterValue::U64(value)) => Ok(*value),
            Some(_) => Err(ModuleError::ParameterType {
                name: name.to_owned(),
                expected: ParameterType::U64,
            }),
            None => Err(ModuleError::MissingParameter(name.to_owned())),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&str, ModuleError> {
        match self.get(name) {
            Some(ParameterValue::String(value)) => Ok(value),
            Some(_) => Err(ModuleError::ParameterType {
                name: name.to_owned(),
                expected: ParameterType::String,
            }),
            None => Err(ModuleError::MissingParameter(name.to_owned())),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, ModuleError> {
        match self.get(name) {
            Some(ParameterValue::Bool(value)) => Ok(*value),
            Some(_) => Err(ModuleError::ParameterType {
                name: name.to_owned(),
                expected: ParameterType::Bool,
            }),
            None => Err(ModuleError::MissingParameter(name.to_owned())),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
struct Parameter {
    name: String,
    parameter_type: ParameterType,
    required: bool,
}

/// The parameters a device factory accepts.
#[derive(Debug, Clone, Default)]
pub struct ParameterSchema {
    parameters: Vec<Parameter>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, parameter_type: ParameterType) -> Self {
        self.parameters.push(Parameter {
            name: name.to_owned(),
            parameter_type,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, parameter_type: ParameterType) -> Self {
        self.parameters.push(Parameter {
            name: name.to_owned(),
            parameter_type,
            required: false,
        });
        self
    }

    /// Checks that every required parameter is present, that nothing unknown is passed, and that
    /// every value has its declared type.
    pub fn validate(&self, values: &ParameterValues) -> Result<(), ModuleError> {
        for name in values.names() {
            if !self.parameters.iter().any(|p| p.name == name) {
                return Err(ModuleError::UnknownParameter(name.to_owned()));
            }
        }
        for parameter in &self.parameters {
            match values.get(&parameter.name) {
                Some(value) if value.parameter_type() != parameter.parameter_type => {
                    return Err(ModuleError::ParameterType {
                        name: parameter.name.clone(),
                        expected: parameter.parameter_type,
                    })
                }
                None if parameter.required => {
                    return Err(ModuleError::MissingParameter(parameter.name.clone()))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A memory-mapped device. Offsets are relative to the device's base.
pub trait Device: Send + Sync + Debug {
    fn read(&self, offset: u64, buf: &mut [u8]) -> MemoryResult;

    fn write(&self, offset: u64, buf: &[u8]) -> MemoryResult;
}

pub type DeviceFactory = fn(&ParameterValues) -> Result<Box<dyn Device>, ModuleError>;

struct DeviceEntry {
    schema: ParameterSchema,
    factory: DeviceFactory,
}

impl Debug for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceEntry")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ModuleDescriptor {
    name: String,
    devices: HashMap<String, DeviceEntry>,
}

impl ModuleDescriptor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            devices: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_device(
        &mut self,
        name: &str,
        schema: ParameterSchema,
        factory: DeviceFactory,
    ) -> Result<(), ModuleError> {
        if self.devices.contains_key(name) {
            return Err(ModuleError::DuplicateDevice {
                module: self.name.clone(),
                device: name.to_owned(),
            });
        }
        self.devices
            .insert(name.to_owned(), DeviceEntry { schema, factory });
        Ok(())
    }

    pub fn schema(&self, device: &str) -> Result<&ParameterSchema, ModuleError> {
        self.entry(device).map(|entry| &entry.schema)
    }

    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    fn entry(&self, device: &str) -> Result<&DeviceEntry, ModuleError> {
        self.devices
            .get(device)
            .ok_or_else(|| ModuleError::UnknownDevice {
                module: self.name.clone(),
                device: device.to_owned(),
            })
    }
}

/// All registered modules. One manager per simulation; there is no global registry.
#[derive(Debug, Default)]
pub struct ModuleManager {
    modules: HashMap<String, ModuleDescriptor>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, module: ModuleDescriptor) -> Result<(), ModuleError> {
        if self.modules.contains_key(&module.name) {
            return Err(ModuleError::DuplicateModule(module.name));
        }
        debug!("registered module {:?}", module.name);
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    pub fn module(&self, name: &str) -> Result<&ModuleDescriptor, ModuleError> {
        self.modules
            .get(name)
            .ok_or_else(|| ModuleError::UnknownModule(name.to_owned()))
    }

    /// Validates `params` against the device's schema, then runs its factory.
    pub fn instantiate_device(
        &self,
        module: &str,
        device: &str,
        params: &ParameterValues,
    ) -> Result<Box<dyn Device>, ModuleError> {
        let entry = self.module(module)?.entry(device)?;
        entry.schema.validate(params)?;
        debug!("instantiating {module}.{device}");
        (entry.factory)(params)
    }
}

/// Exposes a [`Device`] to memory interfaces.
#[derive(Debug)]
pub struct DeviceAdapter {
    device: Box<dyn Device>,
}

impl DeviceAdapter {
    pub fn new(device: Box<dyn Device>) -> Self {
        Self { device }
    }
}

impl MemoryDevice for DeviceAdapter {
    fn read(&self, address: Address, buf: &mut [u8]) -> MemoryResult {
        self.device.read(address.get(), buf)
    }

    fn write(&self, address: Address, buf: &[u8]) -> MemoryResult {
        self.device.write(address.get(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ram;

    fn manager() -> ModuleManager {
        let mut module = ModuleDescriptor::new("demo");
        module
            .add_device("ram", ram::schema(), ram::factory)
            .unwrap();
        let mut manager = ModuleManager::new();
        manager.register_module(module).unwrap();
        manager
    }

    #[test]
    fn test_duplicates() {
        let mut manager = manager();
        assert_eq!(
            manager.register_module(ModuleDescriptor::new("demo")),
            Err(ModuleError::DuplicateModule("demo".into()))
        );
        let mut module = ModuleDescriptor::new("other");
        module.add_device("ram", ram::schema(), ram::factory).unwrap();
        assert!(module.add_device("ram", ram::schema(), ram::factory).is_err());
    }

    #[test]
    fn test_schema_validation() {
        let schema = ParameterSchema::new()
            .required("size", ParameterType::U64)
            .optional("name", ParameterType::String);
        let ok = ParameterValues::new().with("size", ParameterValue::U64(4));
        assert_eq!(schema.validate(&ok), Ok(()));
        assert_eq!(
            schema.validate(&ParameterValues::new()),
            Err(ModuleError::MissingParameter("size".into()))
        );
        let wrong = ParameterValues::new().with("size", ParameterValue::Bool(true));
        assert!(matches!(
            schema.validate(&wrong),
            Err(ModuleError::ParameterType { .. })
        ));
        let extra = ok.clone().with("speed", ParameterValue::U64(1));
        assert_eq!(
            schema.validate(&extra),
            Err(ModuleError::UnknownParameter("speed".into()))
        );
    }

    #[test]
    fn test_instantiate_and_adapt() {
        let manager = manager();
        let params = ParameterValues::new().with("size", ParameterValue::U64(64));
        let device = manager.instantiate_device("demo", "ram", &params).unwrap();
        let adapter = DeviceAdapter::new(device);
        adapter.write(Address::new(8), &[1, 2]).unwrap();
        let mut buf = [0; 2];
        adapter.read(Address::new(8), &mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert!(adapter.read(Address::new(64), &mut buf).is_err());
    }

    #[test]
    fn test_unknown_names() {
        let manager = manager();
        let params = ParameterValues::new();
        assert!(matches!(
            manager.instantiate_device("nope", "ram", &params),
            Err(ModuleError::UnknownModule(_))
        ));
        assert!(matches!(
            manager.instantiate_device("demo", "uart", &params),
            Err(ModuleError::UnknownDevice { .. })
        ));
        assert!(matches!(
            manager.instantiate_device("demo", "ram", &ParameterValues::new().with("size", ParameterValue::U64(0))),
            Err(ModuleError::InvalidParameter { .. })
        ));
    }
}
