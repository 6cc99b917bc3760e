use std::collections::{BTreeMap, BTreeSet};

use vmrun_schemas::{Event, HardwareProfile};

/// Numeric specs of a hardware profile.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProfileSpec {
    pub memory_gib: f64,
    pub vcpu: i32,
}

/// Read side of the hardware-profile catalog.
///
/// `None` means the profile is unknown. Callers treat that as missing
/// enrichment, never as a failure.
pub trait CatalogLookup {
    fn lookup(&self, profile_id: &str) -> Option<ProfileSpec>;
}

/// Point-in-time copy of the catalog entries a replay needs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CatalogSnapshot {
    entries: BTreeMap<String, ProfileSpec>,
}

impl CatalogSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles<'a>(profiles: impl IntoIterator<Item = &'a HardwareProfile>) -> Self {
        let mut snap = Self::new();
        for p in profiles {
            snap.insert(
                p.profile_id.clone(),
                ProfileSpec {
                    memory_gib: p.memory_gib,
                    vcpu: p.vcpu,
                },
            );
        }
        snap
    }

    pub fn insert(&mut self, profile_id: impl Into<String>, spec: ProfileSpec) {
        self.entries.insert(profile_id.into(), spec);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CatalogLookup for CatalogSnapshot {
    fn lookup(&self, profile_id: &str) -> Option<ProfileSpec> {
        self.entries.get(profile_id).copied()
    }
}

/// Distinct profile identifiers referenced by a history, sorted.
///
/// Stores use this to fetch only the catalog rows a replay can touch.
pub fn referenced_profiles(events: &[Event]) -> Vec<String> {
    let set: BTreeSet<&str> = events
        .iter()
        .filter_map(|e| e.profile_id.as_deref())
        .collect();
    set.into_iter().map(str::to_string).collect()
}
