use crate::domain::{Hashes, ItemKind};
use crate::hasher::HashKind;
use crate::storage::models::ContentRecord;
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Existing,
    Updated,
    New,
    /// Batch-created record folded into another slot.
    Merged(usize),
}

/// How a catalog item was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub slot: usize,
    pub created: bool,
    pub backfilled: bool,
}

/// In-memory candidate index for one item kind.
///
/// Seeded with the bulk query results, then grown with every record the
/// batch creates so later items dedup against earlier ones. A hash value
/// claimed by two distinct records is pulled out of the fast maps; both
/// records go to the collision list, which is scanned linearly.
pub struct CandidateIndex {
    kind: ItemKind,
    records: Vec<ContentRecord>,
    state: Vec<SlotState>,
    by_hash: HashMap<HashKind, HashMap<String, usize>>,
    poisoned: HashSet<(HashKind, String)>,
    collisions: Vec<usize>,
}

impl CandidateIndex {
    pub fn new(kind: ItemKind) -> Self {
        Self {
            kind,
            records: Vec::new(),
            state: Vec::new(),
            by_hash: HashMap::new(),
            poisoned: HashSet::new(),
            collisions: Vec::new(),
        }
    }

    pub fn from_candidates(kind: ItemKind, candidates: Vec<ContentRecord>) -> Self {
        let mut index = Self::new(kind);
        let mut seen = HashSet::new();
        for record in candidates {
            if record.kind != kind || !seen.insert(record.id) {
                continue;
            }
            index.push(record, SlotState::Existing);
        }
        index
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn collision_count(&self) -> usize {
        self.collisions.len()
    }

    pub fn record(&self, slot: usize) -> &ContentRecord {
        &self.records[slot]
    }

    /// Slot that now stands for `slot` after merges.
    pub fn canonical(&self, mut slot: usize) -> usize {
        while let SlotState::Merged(into) = self.state[slot] {
            slot = into;
        }
        slot
    }

    fn push(&mut self, record: ContentRecord, state: SlotState) -> usize {
        let slot = self.records.len();
        self.records.push(record);
        self.state.push(state);
        self.index_slot(slot);
        slot
    }

    fn mark_collision(&mut self, slot: usize) {
        if !self.collisions.contains(&slot) {
            self.collisions.push(slot);
        }
    }

    fn index_slot(&mut self, slot: usize) {
        let entries: Vec<(HashKind, String)> = self.records[slot]
            .hashes
            .present()
            .map(|(k, v)| (k, v.to_string()))
            .collect();

        for (algo, value) in entries {
            if self.poisoned.contains(&(algo, value.clone())) {
                self.mark_collision(slot);
                continue;
            }
            let map = self.by_hash.entry(algo).or_default();
            match map.get(&value).copied() {
                None => {
                    map.insert(value, slot);
                }
                Some(other) if other == slot => {}
                Some(other) => {
                    trace!(
                        "{} {} {} claimed by {} and {} bytes",
                        self.kind,
                        algo,
                        value,
                        self.records[other].size,
                        self.records[slot].size
                    );
                    map.remove(&value);
                    self.poisoned.insert((algo, value));
                    self.mark_collision(other);
                    self.mark_collision(slot);
                }
            }
        }
    }

    /// Existing (or batch-created) record that is the same payload.
    pub fn find(&self, hashes: &Hashes, size: u64) -> Option<usize> {
        for algo in HashKind::BY_STRENGTH {
            let Some(value) = hashes.get(algo) else {
                continue;
            };
            let Some(&slot) = self.by_hash.get(&algo).and_then(|m| m.get(value)) else {
                continue;
            };
            let slot = self.canonical(slot);
            if self.records[slot].is_identity_of(hashes, size) {
                return Some(slot);
            }
            // same digest, different payload: keep probing weaker digests
        }

        self.collisions
            .iter()
            .map(|&slot| self.canonical(slot))
            .find(|&slot| self.records[slot].is_identity_of(hashes, size))
    }

    /// Fold batch-created records that became the same payload as `slot`
    /// once it gained digests.
    fn absorb(&mut self, slot: usize) {
        loop {
            let size = self.records[slot].size;
            let other = (0..self.records.len()).find(|&s| {
                s != slot
                    && self.state[s] == SlotState::New
                    && self.records[s].is_identity_of(&self.records[slot].hashes, size)
            });
            let Some(other) = other else {
                return;
            };
            let donor = self.records[other].hashes.clone();
            self.records[slot].hashes.backfill(&donor);
            self.state[other] = SlotState::Merged(slot);
            for map in self.by_hash.values_mut() {
                for target in map.values_mut() {
                    if *target == other {
                        *target = slot;
                    }
                }
            }
            if self.state[slot] == SlotState::Existing {
                self.state[slot] = SlotState::Updated;
            }
            trace!("{} record in slot {} merged into slot {}", self.kind, other, slot);
            self.index_slot(slot);
        }
    }

    /// Match `hashes`/`size` against the index, backfilling the matched
    /// record, or register a new record.
    pub fn resolve(&mut self, hashes: &Hashes, size: u64) -> Resolution {
        if let Some(slot) = self.find(hashes, size) {
            let filled = self.records[slot].hashes.backfill(hashes);
            let backfilled = !filled.is_empty();
            if backfilled {
                if self.state[slot] == SlotState::Existing {
                    self.state[slot] = SlotState::Updated;
                }
                self.index_slot(slot);
                self.absorb(slot);
            }
            return Resolution {
                slot,
                created: false,
                backfilled,
            };
        }

        let record = ContentRecord::new(self.kind, hashes.clone(), size);
        let slot = self.push(record, SlotState::New);
        Resolution {
            slot,
            created: true,
            backfilled: false,
        }
    }

    /// Slots of records created by this batch, in creation order.
    pub fn new_slots(&self) -> Vec<usize> {
        (0..self.records.len())
            .filter(|&s| self.state[s] == SlotState::New)
            .collect()
    }

    /// Pre-existing records that gained digests.
    pub fn updated_records(&self) -> impl Iterator<Item = &ContentRecord> {
        self.records
            .iter()
            .zip(&self.state)
            .filter(|(_, state)| **state == SlotState::Updated)
            .map(|(record, _)| record)
    }

    pub fn set_id(&mut self, slot: usize, id: i64) {
        self.records[slot].id = id;
    }
}
