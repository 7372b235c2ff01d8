use crate::value::{Gc, InternedString, Value};

/// Numerator/denominator of the maximum load factor. Growth keeps the
/// occupied fraction (live entries plus tombstones) at or below 3/4.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

const MIN_CAPACITY: usize = 8;

#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    Empty,
    Tombstone,
    Entry {
        key: InternedString,
        value: Value,
    },
}

/// Open-addressing hash table from interned strings to values.
///
/// Capacity is always a power of two; probing is linear from
/// `hash & (capacity - 1)`. Deletions leave tombstones which are reclaimed on
/// the next rehash. Key comparison inside a probe is pointer identity, which
/// is sound because every key is interned; content comparison exists only in
/// [`Table::find_string`], the operation the interner itself is built on.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Live entries plus tombstones. Only a rehash resets the tombstone part.
    count: usize,
    slots: Vec<Slot>,
}

impl Table {
    pub fn new() -> Self {
        Self {
            count: 0,
            slots: Vec::new(),
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts or overwrites. Returns `true` if the key was not present.
    pub fn set(&mut self, key: InternedString, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = self.find_slot(key);
        let slot = &mut self.slots[index];
        let is_new = match slot {
            Slot::Empty => {
                // Tombstones were already counted when their entry was
                // inserted, so only a truly empty slot bumps the count.
                self.count += 1;
                true
            }
            Slot::Tombstone => true,
            Slot::Entry { .. } => false,
        };

        *slot = Slot::Entry { key, value };
        is_new
    }

    pub fn get(&self, key: InternedString) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }

        match &self.slots[self.find_slot(key)] {
            Slot::Entry { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Removes the key, leaving a tombstone so later probes keep walking.
    pub fn delete(&mut self, key: InternedString) -> bool {
        if self.slots.is_empty() {
            return false;
        }

        let index = self.find_slot(key);
        match self.slots[index] {
            Slot::Entry { .. } => {
                self.slots[index] = Slot::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copies every entry of `other` into `self`.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Looks a string up by content. This is the only content-based probe and
    /// is what establishes interning identity: the interner calls it before
    /// allocating a new string object.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<InternedString> {
        if self.slots.is_empty() {
            return None;
        }

        let mut index = hash as usize & (self.slots.len() - 1);
        loop {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Entry { key, .. } => {
                    if key.hash() == hash && key.as_str() == s {
                        return Some(*key);
                    }
                }
            }
            index = (index + 1) & (self.slots.len() - 1);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (InternedString, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Entry { key, value } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Marks every key and value as reachable.
    pub fn mark(&self, gc: &mut Gc) {
        for (key, value) in self.iter() {
            gc.mark_string(key);
            gc.mark_value(&value);
        }
    }

    /// Deletes every entry whose key did not survive the mark phase. The
    /// intern table is purged this way right before the sweep frees objects,
    /// so it never holds a dangling key.
    pub fn remove_unmarked(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Entry { key, .. } = slot {
                if !key.is_marked() {
                    *slot = Slot::Tombstone;
                }
            }
        }
    }

    /// Index of the entry for `key`, or of the slot where it would be
    /// inserted: the first tombstone seen on the probe if any, else the empty
    /// slot that ended the probe.
    fn find_slot(&self, key: InternedString) -> usize {
        debug_assert!(self.slots.len().is_power_of_two());

        let mut index = key.hash() as usize & (self.slots.len() - 1);
        let mut tombstone = None;
        loop {
            match &self.slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Entry { key: existing, .. } => {
                    if *existing == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & (self.slots.len() - 1);
        }
    }

    fn grow(&mut self) {
        let capacity = usize::max(MIN_CAPACITY, self.slots.len() * 2);
        let old = std::mem::replace(&mut self.slots, vec![Slot::default(); capacity]);

        // Tombstones are dropped here, so the count starts over from the
        // live entries.
        self.count = 0;
        for slot in old {
            if let Slot::Entry { key, value } = slot {
                let index = self.find_slot(key);
                self.slots[index] = Slot::Entry { key, value };
                self.count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Heap;

    #[test]
    fn set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        let a = heap.intern("a");
        let b = heap.intern("b");

        assert!(table.set(a, Value::new_number(1.0)));
        assert!(table.set(b, Value::new_number(2.0)));
        assert!(!table.set(a, Value::new_number(3.0)));

        assert_eq!(table.get(a), Some(Value::new_number(3.0)));
        assert_eq!(table.get(b), Some(Value::new_number(2.0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn missing_key() {
        let mut heap = Heap::new();
        let table = Table::new();

        let key = heap.intern("missing");
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn delete_leaves_reusable_tombstone() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        let a = heap.intern("a");
        let b = heap.intern("b");

        table.set(a, Value::TRUE);
        table.set(b, Value::FALSE);

        assert!(table.delete(a));
        assert!(!table.delete(a));
        assert_eq!(table.get(a), None);
        // b must still be reachable past the tombstone
        assert_eq!(table.get(b), Some(Value::FALSE));

        // reinserting fills the tombstone back in
        assert!(table.set(a, Value::NIL));
        assert_eq!(table.get(a), Some(Value::NIL));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn survives_growth() {
        let mut heap = Heap::new();
        let mut table = Table::new();

        let keys: Vec<_> = (0..100)
            .map(|i| heap.intern(format!("key{i}")))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, Value::new_number(i as f64));
        }

        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(Value::new_number(i as f64)));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn add_all_copies_entries() {
        let mut heap = Heap::new();
        let mut from = Table::new();
        let mut to = Table::new();

        let a = heap.intern("a");
        let b = heap.intern("b");

        from.set(a, Value::new_number(1.0));
        from.set(b, Value::new_number(2.0));
        to.set(b, Value::new_number(9.0));

        to.add_all(&from);

        assert_eq!(to.get(a), Some(Value::new_number(1.0)));
        // entries from `from` overwrite
        assert_eq!(to.get(b), Some(Value::new_number(2.0)));
    }

    #[test]
    fn interning_is_identity() {
        let mut heap = Heap::new();

        let a = heap.intern("shared");
        let b = heap.intern(String::from("shared"));
        assert_eq!(a, b);

        let c = heap.intern("other");
        assert_ne!(a, c);
    }
}
