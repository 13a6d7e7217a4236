// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reference-counted multiset of tuples.
//!
//! Counts never go negative. A tuple whose count drops to zero keeps its slot
//! until enough zeros pile up to exceed the zero tolerance; compaction then
//! evicts a batch of them at once instead of paying a removal per delete.
//!
//! # Invariants
//!
//! - Compaction only ever removes entries whose count is zero.
//! - `nzero` equals the number of zero-count entries still in the map.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use ordo_proto::{Template, Tuple};

use crate::ArchiveError;

/// Default number of zero-count entries tolerated before compaction.
pub const ZERO_TOLERANCE: usize = 1000;

/// Multiset view of the space.
#[derive(Debug, Clone)]
pub struct Tuplespace {
    counts: HashMap<Tuple, usize>,
    nzero: usize,
    zero_tolerance: usize,
}

impl Default for Tuplespace {
    fn default() -> Self {
        Self::new(ZERO_TOLERANCE)
    }
}

impl Tuplespace {
    /// Empty space that compacts once more than `zero_tolerance` zero-count
    /// entries accumulate.
    pub fn new(zero_tolerance: usize) -> Self {
        Self {
            counts: HashMap::new(),
            nzero: 0,
            zero_tolerance,
        }
    }

    /// Configured tolerance.
    pub fn zero_tolerance(&self) -> usize {
        self.zero_tolerance
    }

    /// Add one instance of `tuple`.
    pub fn insert(&mut self, tuple: Tuple) {
        match self.counts.entry(tuple) {
            Entry::Occupied(mut slot) => {
                if *slot.get() == 0 {
                    self.nzero -= 1;
                }
                *slot.get_mut() += 1;
            }
            Entry::Vacant(slot) => {
                slot.insert(1);
            }
        }
    }

    /// Remove one instance of `tuple`. Returns `false` if none is present.
    pub fn delete_once(&mut self, tuple: &Tuple) -> bool {
        match self.counts.get_mut(tuple) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.nzero += 1;
                    if self.nzero > self.zero_tolerance {
                        self.clear_excess_zeros();
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Apply deletes, then inserts.
    ///
    /// A delete of an absent tuple means the caller replayed out of order or
    /// against a desynchronized copy. Steps already applied stay applied.
    pub fn transaction(&mut self, deletes: &[Tuple], inserts: &[Tuple]) -> Result<(), ArchiveError> {
        for tuple in deletes {
            if !self.delete_once(tuple) {
                return Err(ArchiveError::MissingTuple(tuple.clone()));
            }
        }
        for tuple in inserts {
            self.insert(tuple.clone());
        }
        Ok(())
    }

    fn clear_excess_zeros(&mut self) {
        let mut budget = self.nzero - self.zero_tolerance / 2;
        let before = self.counts.len();
        self.counts.retain(|_, count| {
            if *count == 0 && budget > 0 {
                budget -= 1;
                false
            } else {
                true
            }
        });
        self.nzero -= before - self.counts.len();
    }

    /// True if at least one instance of exactly `tuple` is present.
    pub fn find_match(&self, tuple: &Tuple) -> bool {
        self.count(tuple) > 0
    }

    /// For each candidate, in order, the tuple if unclaimed stock remains,
    /// else `None`. Stock claimed by earlier candidates in the same call is not
    /// offered twice.
    pub fn find_distinct_matches(&self, candidates: &[Tuple]) -> Vec<Option<Tuple>> {
        let mut claimed: HashMap<&Tuple, usize> = HashMap::new();
        candidates
            .iter()
            .map(|tuple| {
                let used = claimed.entry(tuple).or_insert(0);
                if self.count(tuple) > *used {
                    *used += 1;
                    Some(tuple.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Current count of `tuple` (0 when absent).
    pub fn count(&self, tuple: &Tuple) -> usize {
        self.counts.get(tuple).copied().unwrap_or(0)
    }

    /// Iterate distinct present tuples with their counts.
    pub fn iter(&self) -> impl Iterator<Item = (&Tuple, usize)> + '_ {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(tuple, count)| (tuple, *count))
    }

    /// Some present tuple accepted by `template`.
    pub fn find_template(&self, template: &Template) -> Option<Tuple> {
        self.iter()
            .find(|(tuple, _)| template.matches(tuple))
            .map(|(tuple, _)| tuple.clone())
    }

    /// Every present instance accepted by `template`, with multiplicity.
    pub fn matches(&self, template: &Template) -> Vec<Tuple> {
        self.iter()
            .filter(|(tuple, _)| template.matches(tuple))
            .flat_map(|(tuple, count)| std::iter::repeat_n(tuple.clone(), count))
            .collect()
    }

    /// Number of distinct present tuples.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// True when nothing is present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-count entries still occupying a slot.
    pub fn zero_entries(&self) -> usize {
        self.nzero
    }

    /// Slots in the map, present or not.
    pub fn slots(&self) -> usize {
        self.counts.len()
    }
}
