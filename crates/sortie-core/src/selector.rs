//! Work Selector
//!
//! Draws N distinct catalog entries without replacement. A malformed draw is
//! replaced by drawing again from the entries not yet used.

use crate::error::SelectionError;
use crate::types::{CatalogEntry, SizeClass, WorkItemSelection};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Random work item sampler
#[derive(Debug)]
pub struct WorkSelector {
    rng: StdRng,
}

impl Default for WorkSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkSelector {
    /// Seeded from the OS
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic sampler for tests and replays
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Select `size_class.count()` distinct, well-formed entries
    pub fn select(
        &mut self,
        size_class: SizeClass,
        catalog: &[CatalogEntry],
    ) -> Result<Vec<WorkItemSelection>, SelectionError> {
        let requested = size_class.count();
        if catalog.len() < requested {
            return Err(SelectionError::CatalogTooSmall {
                requested,
                available: catalog.len(),
            });
        }

        let mut order: Vec<usize> = (0..catalog.len()).collect();
        order.shuffle(&mut self.rng);

        let mut chosen = Vec::with_capacity(requested);
        let mut keys = HashSet::with_capacity(requested);
        for index in order {
            if chosen.len() == requested {
                break;
            }
            let entry = &catalog[index];
            match WorkItemSelection::try_from(entry) {
                Ok(selection) if keys.insert(selection.catalog_key.clone()) => {
                    chosen.push(selection);
                }
                Ok(selection) => {
                    debug!(key = %selection.catalog_key, "Duplicate catalog key, re-sampling");
                }
                Err(reason) => {
                    warn!(%reason, "Malformed catalog entry, re-sampling");
                }
            }
        }

        if chosen.len() < requested {
            return Err(SelectionError::InsufficientValidEntries {
                requested,
                valid: chosen.len(),
            });
        }
        Ok(chosen)
    }
}
