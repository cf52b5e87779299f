//! Canary guard words
//!
//! Every section of the shared region is fenced by a 64-bit guard word. The
//! broker fills them with unpredictable values at startup and re-checks them
//! on every loop iteration. In-process accesses are bounds-checked, so a
//! changed guard means some other process wrote past its slot.

use super::region::SharedRegion;
use crate::error::{Error, Result};

/// A guard location and the value it must hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canary {
    offset: usize,
    reference: u64,
}

impl Canary {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn reference(&self) -> u64 {
        self.reference
    }

    /// Whether the guard still holds its reference value
    pub fn check(&self, region: &SharedRegion) -> bool {
        region.read_guard(self.offset) == self.reference
    }
}

/// All guards of one region
#[derive(Debug, Clone)]
pub struct CanarySet {
    canaries: Vec<Canary>,
}

impl CanarySet {
    /// Write fresh random values into every guard word (broker side)
    pub fn install(region: &SharedRegion) -> Self {
        let canaries = region
            .layout()
            .canary_offsets()
            .into_iter()
            .map(|offset| {
                let reference = loop {
                    // Zero is what an untouched file holds
                    let v = fastrand::u64(..);
                    if v != 0 {
                        break v;
                    }
                };
                region.write_guard(offset, reference);
                Canary { offset, reference }
            })
            .collect::<Vec<_>>();

        tracing::debug!(count = canaries.len(), "Canaries installed");
        Self { canaries }
    }

    /// Remember the guard values currently in the region (member side)
    pub fn observe(region: &SharedRegion) -> Self {
        let canaries = region
            .layout()
            .canary_offsets()
            .into_iter()
            .map(|offset| Canary {
                offset,
                reference: region.read_guard(offset),
            })
            .collect();
        Self { canaries }
    }

    pub fn len(&self) -> usize {
        self.canaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canaries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Canary> {
        self.canaries.iter()
    }

    /// True when every guard holds its reference value
    pub fn check(&self, region: &SharedRegion) -> bool {
        self.canaries.iter().all(|c| c.check(region))
    }

    /// Report the first corrupted guard as a fatal error
    pub fn verify(&self, region: &SharedRegion) -> Result<()> {
        for canary in &self.canaries {
            let found = region.read_guard(canary.offset);
            if found != canary.reference {
                return Err(Error::CanaryViolation {
                    offset: canary.offset,
                    expected: canary.reference,
                    found,
                });
            }
        }
        Ok(())
    }
}
