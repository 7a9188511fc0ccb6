//! Location → zone partitioning.
//!
//! The publisher uses it to build routing keys and the topology uses it to know
//! which zone queues exist. Changing the hash re-routes every location and
//! orphans the existing queue bindings, so it is pinned to 64-bit FNV-1a.

pub const DEFAULT_ZONE_COUNT: u32 = 10;

/// 64-bit FNV-1a; stable across processes and toolchains.
pub fn location_hash(location: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    location.as_bytes().iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRouter {
    zones: u32,
    prefix: String,
}

impl Default for ZoneRouter {
    fn default() -> Self {
        Self::new("validations", DEFAULT_ZONE_COUNT)
    }
}

impl ZoneRouter {
    /// `zones` is clamped to at least 1.
    pub fn new(prefix: impl Into<String>, zones: u32) -> Self {
        Self {
            zones: zones.max(1),
            prefix: prefix.into(),
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.zones
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Zone in `1..=zone_count`.
    pub fn zone(&self, location: &str) -> u32 {
        (location_hash(location) % u64::from(self.zones)) as u32 + 1
    }

    pub fn zones(&self) -> impl Iterator<Item = u32> {
        1..=self.zones
    }

    /// `<prefix>.zone<N>`
    pub fn queue_name(&self, zone: u32) -> String {
        format!("{}.zone{}", self.prefix, zone)
    }

    /// `<prefix>.zone<N>.#`
    pub fn binding_pattern(&self, zone: u32) -> String {
        format!("{}.zone{}.#", self.prefix, zone)
    }

    /// `<prefix>.zone<N>.<equipmentId>`
    pub fn routing_key(&self, location: &str, equipment_id: &str) -> (u32, String) {
        let zone = self.zone(location);
        (zone, format!("{}.zone{}.{}", self.prefix, zone, equipment_id))
    }
}
