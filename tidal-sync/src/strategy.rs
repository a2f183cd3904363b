//! Source selection per store topology

use tidal_index::{Did, StoreMultiplicity};

use crate::version_vector::VersionVector;

/// Chosen once per store and kept by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStrategy {
    /// Devices of one user: fetch from the most complete candidate
    Single,
    /// Shared store: rotate among candidates to spread load
    Multi { cursor: usize },
}

impl StoreStrategy {
    pub fn for_multiplicity(multiplicity: StoreMultiplicity) -> Self {
        match multiplicity {
            StoreMultiplicity::Single => StoreStrategy::Single,
            StoreMultiplicity::Multi => StoreStrategy::Multi { cursor: 0 },
        }
    }

    /// Pick a reachable candidate and the version to request from it
    pub fn select(
        &mut self,
        candidates: &[(Did, VersionVector)],
        reachable: &[Did],
    ) -> Option<(Did, VersionVector)> {
        let mut usable: Vec<&(Did, VersionVector)> = candidates
            .iter()
            .filter(|(device, _)| reachable.contains(device))
            .collect();
        if usable.is_empty() {
            return None;
        }

        let chosen = match self {
            StoreStrategy::Single => usable
                .into_iter()
                .max_by(|(a_did, a), (b_did, b)| {
                    a.total_ticks()
                        .cmp(&b.total_ticks())
                        .then_with(|| a_did.cmp(b_did))
                })?,
            StoreStrategy::Multi { cursor } => {
                usable.sort_by_key(|(device, _)| *device);
                let pick = usable[*cursor % usable.len()];
                *cursor = cursor.wrapping_add(1);
                pick
            }
        };

        Some(chosen.clone())
    }
}
