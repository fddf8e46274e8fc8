//! Open-addressed hash map keyed by hashable values.
//!
//! Linear probing with tombstones: an entry is *empty* when its key is
//! undefined and its value is `false`, a *tombstone* when the key is
//! undefined and the value is `true`. Insertion reuses the first tombstone
//! on the probe sequence but keeps probing to detect duplicate keys.

use crate::buffer::{GROW_FACTOR, MIN_CAPACITY};
use crate::heap::Heap;
use crate::object::Object;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// The maximum percentage of entries that can be filled before the map is
/// grown. Lower values reduce collisions at the cost of memory.
const MAP_LOAD_PERCENT: usize = 75;

/// One key/value slot of the table.
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub key: Var,
    pub value: Var,
}

impl MapEntry {
    fn empty() -> Self {
        Self {
            key: Var::UNDEFINED,
            value: Var::FALSE,
        }
    }

    fn is_vacant(&self) -> bool {
        self.key.is_undef()
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_undef() && self.value.same(Var::TRUE)
    }
}

/// An open-addressed key/value table.
pub struct Map {
    pub(crate) entries: Vec<MapEntry>,
    pub(crate) count: usize,
}

impl Map {
    /// Creates an empty map. Nothing is allocated until the first insert.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            count: 0,
        }
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The slot capacity.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entry_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<MapEntry>()
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of probing for a key.
enum Probe {
    /// The key lives at this slot index.
    Found(usize),
    /// The key is absent; insert at this slot index.
    Insert(usize),
    /// The table has no slots at all.
    NoTable,
}

impl Heap {
    fn map_probe(&self, map: ObjRef, key: Var) -> Probe {
        let m = self.map(map);
        if m.entries.is_empty() {
            return Probe::NoTable;
        }

        let capacity = m.entries.len();
        let start_index = self.hash_value(key) as usize % capacity;
        let mut index = start_index;

        // First tombstone on the probe sequence; it becomes the insertion
        // slot when the key turns out to be absent.
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &m.entries[index];

            if entry.is_vacant() {
                debug_assert!(entry.value.is_bool());
                if entry.is_tombstone() {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                } else {
                    return Probe::Insert(tombstone.unwrap_or(index));
                }
            } else if self.values_equal(entry.key, key) {
                return Probe::Found(index);
            }

            index = (index + 1) % capacity;
            if index == start_index {
                break;
            }
        }

        // The table is filled with tombstones; reuse the first one.
        Probe::Insert(tombstone.expect("Probe sequence covered a table with no vacancy."))
    }

    /// Inserts without resizing. Returns `true` when a new key was added.
    fn map_insert_entry(&mut self, map: ObjRef, key: Var, value: Var) -> bool {
        debug_assert!(
            !self.map(map).entries.is_empty(),
            "Should ensure the capacity before inserting."
        );
        match self.map_probe(map, key) {
            Probe::Found(index) => {
                self.map_mut(map).entries[index].value = value;
                false
            }
            Probe::Insert(index) => {
                let entry = &mut self.map_mut(map).entries[index];
                entry.key = key;
                entry.value = value;
                true
            }
            Probe::NoTable => unreachable!(),
        }
    }

    fn map_resize(&mut self, map: ObjRef, capacity: usize) {
        let old_entries = std::mem::replace(
            &mut self.map_mut(map).entries,
            vec![MapEntry::empty(); capacity],
        );
        self.add_bytes(capacity * std::mem::size_of::<MapEntry>());

        for entry in old_entries {
            if entry.is_vacant() {
                continue;
            }
            self.map_insert_entry(map, entry.key, entry.value);
        }
    }

    /// Returns the value stored for `key`, or undefined when absent.
    pub fn map_get(&self, map: ObjRef, key: Var) -> Var {
        match self.map_probe(map, key) {
            Probe::Found(index) => self.map(map).entries[index].value,
            _ => Var::UNDEFINED,
        }
    }

    /// Returns `true` when `key` is present.
    pub fn map_contains(&self, map: ObjRef, key: Var) -> bool {
        matches!(self.map_probe(map, key), Probe::Found(_))
    }

    /// Inserts or replaces the value for `key`. The key must be hashable.
    pub fn map_set(&mut self, map: ObjRef, key: Var, value: Var) {
        // If the map is about to fill past the load factor, resize first.
        let (count, capacity) = {
            let m = self.map(map);
            (m.count, m.entries.len())
        };
        if count + 1 > capacity * MAP_LOAD_PERCENT / 100 {
            let capacity = (capacity * GROW_FACTOR).max(MIN_CAPACITY);
            self.map_resize(map, capacity);
        }

        if self.map_insert_entry(map, key, value) {
            self.map_mut(map).count += 1;
        }
    }

    /// Drops every entry and releases the table.
    pub fn map_clear(&mut self, map: ObjRef) {
        let m = self.map_mut(map);
        m.entries = Vec::new();
        m.count = 0;
    }

    /// Removes `key`, tombstoning its slot. Returns the removed value or
    /// undefined when the key was absent. Shrinks the table once occupancy
    /// drops to a quarter.
    pub fn map_remove_key(&mut self, map: ObjRef, key: Var) -> Var {
        let index = match self.map_probe(map, key) {
            Probe::Found(index) => index,
            _ => return Var::UNDEFINED,
        };

        let value = {
            let entry = &mut self.map_mut(map).entries[index];
            let value = entry.value;
            entry.key = Var::UNDEFINED;
            entry.value = Var::TRUE;
            value
        };
        self.map_mut(map).count -= 1;

        let (count, capacity) = {
            let m = self.map(map);
            (m.count, m.entries.len())
        };

        if count == 0 {
            self.map_clear(map);
        } else if capacity > MIN_CAPACITY
            && capacity / (GROW_FACTOR * GROW_FACTOR) > (count * 100) / MAP_LOAD_PERCENT
        {
            // Grown maps are not shrunk at half occupancy; waiting until a
            // quarter is filled minimizes reallocation churn.
            let capacity = (capacity / (GROW_FACTOR * GROW_FACTOR)).max(MIN_CAPACITY);
            self.map_resize(map, capacity);
        }

        value
    }

    /// Index of the first live entry at or after `index`, for iteration.
    pub(crate) fn map_next_entry(&self, map: ObjRef, mut index: usize) -> Option<usize> {
        let m = self.map(map);
        while index < m.entries.len() {
            if !m.entries[index].is_vacant() {
                return Some(index);
            }
            index += 1;
        }
        None
    }
}

impl Vm {
    /// Allocates a new empty map.
    pub fn new_map(&mut self) -> ObjRef {
        self.allocate(Object::Map(Map::new()))
    }
}
