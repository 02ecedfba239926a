//! Journaled tables: every mutation records the prior row so a cancelled
//! transaction can restore it.

use std::collections::BTreeMap;

/// Something whose mutations can be committed or undone as a unit.
pub trait Journal {
    fn commit(&mut self);
    fn rollback(&mut self);
}

#[derive(Debug)]
pub struct Table<K, V> {
    rows: BTreeMap<K, V>,
    undo: Vec<(K, Option<V>)>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self { rows: BTreeMap::new(), undo: Vec::new() }
    }
}

impl<K: Ord + Clone, V: Clone> Table<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.contains_key(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let old = self.rows.insert(key.clone(), value);
        self.undo.push((key, old.clone()));
        old
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.rows.remove(key)?;
        self.undo.push((key.clone(), Some(old.clone())));
        Some(old)
    }

    /// Mutable access to a row. The current value is journaled first.
    pub fn stage(&mut self, key: &K) -> Option<&mut V> {
        let current = self.rows.get(key)?.clone();
        self.undo.push((key.clone(), Some(current)));
        self.rows.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.rows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.rows.keys()
    }
}

impl<K: Ord, V> Journal for Table<K, V> {
    fn commit(&mut self) {
        self.undo.clear();
    }

    fn rollback(&mut self) {
        while let Some((key, old)) = self.undo.pop() {
            match old {
                Some(value) => {
                    self.rows.insert(key, value);
                }
                None => {
                    self.rows.remove(&key);
                }
            }
        }
    }
}

/// A single journaled value.
#[derive(Debug, Default)]
pub struct Cell<T> {
    value: T,
    saved: Option<T>,
}

impl<T: Clone> Cell<T> {
    pub fn new(value: T) -> Self {
        Self { value, saved: None }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn stage(&mut self) -> &mut T {
        if self.saved.is_none() {
            self.saved = Some(self.value.clone());
        }
        &mut self.value
    }
}

impl<T> Journal for Cell<T> {
    fn commit(&mut self) {
        self.saved = None;
    }

    fn rollback(&mut self) {
        if let Some(value) = self.saved.take() {
            self.value = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_restores_every_row() {
        let mut t: Table<u32, String> = Table::new();
        t.insert(1, "one".into());
        t.insert(2, "two".into());
        t.commit();

        t.insert(3, "three".into());
        t.remove(&1);
        t.stage(&2).unwrap().push('!');
        t.insert(2, "overwritten".into());
        t.rollback();

        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&1).map(String::as_str), Some("one"));
        assert_eq!(t.get(&2).map(String::as_str), Some("two"));
        assert!(!t.contains(&3));
    }

    #[test]
    fn commit_keeps_changes() {
        let mut t: Table<u32, u32> = Table::new();
        t.insert(1, 10);
        t.commit();
        t.rollback();
        assert_eq!(t.get(&1), Some(&10));
    }

    #[test]
    fn cell_rolls_back_to_first_snapshot() {
        let mut c = Cell::new(5u64);
        *c.stage() += 1;
        *c.stage() += 1;
        c.rollback();
        assert_eq!(*c.get(), 5);
        *c.stage() = 9;
        c.commit();
        c.rollback();
        assert_eq!(*c.get(), 9);
    }
}
