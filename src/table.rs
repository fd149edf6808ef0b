// String interning table: a hand-rolled open-addressing hash set over
// `Heap`-allocated strings, so that any two equal Lox strings always share
// one `Handle` and can be compared by handle equality instead of content
// equality. Grounded on `CLox/table.c`'s `FindEntry`/`AdjustCapacity`/
// `TableFindString` and `CLox/object.c`'s `HashString`.

use crate::object::{Heap, ObjData, StringObj};
use crate::value::Handle;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(Handle),
}

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD: f64 = 0.75;

/// FNV-1a, byte-for-byte the algorithm in `CLox/object.c`'s `HashString`.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

pub struct StringInterner {
    slots: Vec<Slot>,
    /// Occupied + tombstone count, used for the load-factor check. Unlike
    /// CLox's `AdjustCapacity` (which leaves `table->count` untouched during
    /// rehash, a no-op statement the spec calls out as a bug), this count is
    /// recomputed from the live occupied slots every time the table grows.
    count: usize,
}

impl StringInterner {
    pub fn new() -> Self {
        Self { slots: Vec::new(), count: 0 }
    }

    /// Return the handle for `s`, allocating and interning a fresh
    /// `StringObj` only if an equal string isn't already present.
    pub fn intern(&mut self, heap: &mut Heap, s: &str) -> Handle {
        let hash = fnv1a_hash(s.as_bytes());
        if let Some(existing) = self.find(heap, s, hash) {
            return existing;
        }
        self.ensure_capacity(heap);
        let handle = heap.allocate(ObjData::String(StringObj { chars: s.to_string(), hash }));
        self.insert_handle(heap, handle, hash);
        handle
    }

    fn find(&self, heap: &Heap, s: &str, hash: u32) -> Option<Handle> {
        if self.slots.is_empty() {
            return None;
        }
        let cap = self.slots.len();
        let mut idx = (hash as usize) % cap;
        loop {
            match self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(handle) => {
                    let obj = match &heap.get(handle).data {
                        ObjData::String(so) => so,
                        _ => unreachable!("interner slot did not hold a string"),
                    };
                    if obj.hash == hash && obj.chars == s {
                        return Some(handle);
                    }
                }
            }
            idx = (idx + 1) % cap;
        }
    }

    /// Insert `handle` (already allocated, with `hash` cached) into the
    /// table, reusing the first tombstone seen on the probe sequence.
    fn insert_handle(&mut self, heap: &Heap, handle: Handle, hash: u32) {
        let cap = self.slots.len();
        let mut idx = (hash as usize) % cap;
        let mut tombstone: Option<usize> = None;
        loop {
            match self.slots[idx] {
                Slot::Empty => {
                    let target = tombstone.unwrap_or(idx);
                    self.slots[target] = Slot::Occupied(handle);
                    self.count += 1;
                    return;
                }
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(idx);
                    }
                }
                Slot::Occupied(existing) => {
                    let obj = match &heap.get(existing).data {
                        ObjData::String(so) => so,
                        _ => unreachable!(),
                    };
                    if obj.hash == hash {
                        // Already present (shouldn't happen: `intern` checks
                        // first), overwrite in place.
                        self.slots[idx] = Slot::Occupied(handle);
                        return;
                    }
                }
            }
            idx = (idx + 1) % cap;
        }
    }

    fn ensure_capacity(&mut self, heap: &Heap) {
        if self.slots.is_empty() {
            self.slots = vec![Slot::Empty; INITIAL_CAPACITY];
            return;
        }
        if (self.count + 1) as f64 > self.slots.len() as f64 * MAX_LOAD {
            self.grow(heap);
        }
    }

    fn grow(&mut self, heap: &Heap) {
        let new_cap = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        let mut live = 0;
        for slot in old {
            if let Slot::Occupied(handle) = slot {
                let hash = match &heap.get(handle).data {
                    ObjData::String(so) => so.hash,
                    _ => unreachable!(),
                };
                self.insert_handle(heap, handle, hash);
                live += 1;
            }
        }
        self.count = live;
    }

    /// Drop any interned entry whose backing object didn't survive the
    /// mark phase, before `Heap::sweep` reclaims it — otherwise the table
    /// would hold a dangling handle. Mirrors `CLox/table.c`'s
    /// `TableRemoveWhite`.
    pub fn remove_unmarked(&mut self, heap: &Heap) {
        for slot in &mut self.slots {
            if let Slot::Occupied(handle) = *slot {
                if !heap.get(handle).marked {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_equal_strings_returns_same_handle() {
        let mut heap = Heap::new();
        let mut table = StringInterner::new();
        let a = table.intern(&mut heap, "hello");
        let b = table.intern(&mut heap, "hello");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_strings_get_distinct_handles() {
        let mut heap = Heap::new();
        let mut table = StringInterner::new();
        let a = table.intern(&mut heap, "foo");
        let b = table.intern(&mut heap, "bar");
        assert_ne!(a, b);
    }

    #[test]
    fn rehashing_preserves_all_live_entries() {
        let mut heap = Heap::new();
        let mut table = StringInterner::new();
        let mut handles = Vec::new();
        for i in 0..50 {
            handles.push(table.intern(&mut heap, &format!("s{i}")));
        }
        assert_eq!(table.len(), 50);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(heap.as_string(*h), format!("s{i}"));
        }
    }

    #[test]
    fn tombstones_do_not_break_lookup_after_removal() {
        let mut heap = Heap::new();
        let mut table = StringInterner::new();
        let a = table.intern(&mut heap, "keep");
        heap.get_mut(a).marked = false;
        table.remove_unmarked(&heap);
        // re-interning must allocate a fresh handle since the old entry was
        // tombstoned, and must still find other live strings normally.
        let b = table.intern(&mut heap, "other");
        let c = table.intern(&mut heap, "other");
        assert_eq!(b, c);
    }
}
