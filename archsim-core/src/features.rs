//! Per-thread CPU feature levels.

use crate::arch::{ArchError, FeaturesDescriptor};
use log::debug;
use nohash::IntMap;

/// Current activation level of every feature, keyed by feature id.
#[derive(Debug, Clone, Default)]
pub struct FeatureState {
    levels: IntMap<u32, u32>,
}

impl FeatureState {
    /// Starts every feature at its default level.
    pub fn new(descriptor: &FeaturesDescriptor) -> Self {
        Self {
            levels: descriptor
                .iter()
                .map(|feature| (feature.id, feature.default_level))
                .collect(),
        }
    }

    /// Level of feature `id`. Unknown features are inactive.
    pub fn level(&self, id: u32) -> u32 {
        self.levels.get(&id).copied().unwrap_or(0)
    }

    pub fn set_level(&mut self, id: u32, level: u32) {
        debug!("feature {id} set to level {level}");
        self.levels.insert(id, level);
    }

    pub fn is_active(&self, id: u32) -> bool {
        self.level(id) != 0
    }

    pub fn level_by_name(&self, descriptor: &FeaturesDescriptor, name: &str) -> Result<u32, ArchError> {
        descriptor.get(name).map(|feature| self.level(feature.id))
    }

    pub fn set_level_by_name(
        &mut self,
        descriptor: &FeaturesDescriptor,
        name: &str,
        level: u32,
    ) -> Result<(), ArchError> {
        let id = descriptor.get(name)?.id;
        self.set_level(id, level);
        Ok(())
    }
}
