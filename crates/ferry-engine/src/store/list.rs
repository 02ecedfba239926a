//! Durable doubly-linked lists of object references, each with user data.
//!
//! Elements are addressed by `Elt`, so a holder can unlink itself in
//! constant time without knowing its position.

use super::table::{Cell, Journal, Table};
use super::{Elt, ListId, Object};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct ListHead<U> {
    user: U,
    first: Option<Elt>,
    last: Option<Elt>,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct EltRec {
    list: ListId,
    prev: Option<Elt>,
    next: Option<Elt>,
    data: Object,
}

#[derive(Debug)]
pub struct Lists<U> {
    heads: Table<ListId, ListHead<U>>,
    elts: Table<Elt, EltRec>,
    next_id: Cell<u64>,
}

impl<U: Clone> Default for Lists<U> {
    fn default() -> Self {
        Self { heads: Table::new(), elts: Table::new(), next_id: Cell::new(1) }
    }
}

impl<U: Clone> Lists<U> {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_id.stage();
        let out = *id;
        *id += 1;
        out
    }

    fn head(&self, list: ListId) -> Result<&ListHead<U>, StoreError> {
        self.heads.get(&list).ok_or(StoreError::NoSuchList(list.0))
    }

    fn head_mut(&mut self, list: ListId) -> Result<&mut ListHead<U>, StoreError> {
        self.heads.stage(&list).ok_or(StoreError::NoSuchList(list.0))
    }

    fn rec(&self, elt: Elt) -> Result<EltRec, StoreError> {
        self.elts.get(&elt).copied().ok_or(StoreError::NoSuchElt(elt.0))
    }

    fn rec_mut(&mut self, elt: Elt) -> Result<&mut EltRec, StoreError> {
        self.elts.stage(&elt).ok_or(StoreError::NoSuchElt(elt.0))
    }

    pub fn create(&mut self, user: U) -> ListId {
        let id = ListId(self.allocate());
        self.heads.insert(id, ListHead { user, first: None, last: None, len: 0 });
        id
    }

    /// Destroy a list and every element still in it.
    pub fn destroy(&mut self, list: ListId) -> Result<(), StoreError> {
        let mut cursor = self.head(list)?.first;
        while let Some(elt) = cursor {
            cursor = self.rec(elt)?.next;
            self.elts.remove(&elt);
        }
        self.heads.remove(&list);
        Ok(())
    }

    pub fn exists(&self, list: ListId) -> bool {
        self.heads.contains(&list)
    }

    pub fn user_data(&self, list: ListId) -> Result<&U, StoreError> {
        Ok(&self.head(list)?.user)
    }

    pub fn set_user_data(&mut self, list: ListId, user: U) -> Result<(), StoreError> {
        self.head_mut(list)?.user = user;
        Ok(())
    }

    pub fn len(&self, list: ListId) -> Result<usize, StoreError> {
        Ok(self.head(list)?.len)
    }

    pub fn first(&self, list: ListId) -> Result<Option<Elt>, StoreError> {
        Ok(self.head(list)?.first)
    }

    pub fn last(&self, list: ListId) -> Result<Option<Elt>, StoreError> {
        Ok(self.head(list)?.last)
    }

    pub fn next(&self, elt: Elt) -> Result<Option<Elt>, StoreError> {
        Ok(self.rec(elt)?.next)
    }

    pub fn prev(&self, elt: Elt) -> Result<Option<Elt>, StoreError> {
        Ok(self.rec(elt)?.prev)
    }

    pub fn data(&self, elt: Elt) -> Result<Object, StoreError> {
        Ok(self.rec(elt)?.data)
    }

    pub fn list_of(&self, elt: Elt) -> Result<ListId, StoreError> {
        Ok(self.rec(elt)?.list)
    }

    /// Snapshot of the list's elements in order.
    pub fn to_vec(&self, list: ListId) -> Result<Vec<(Elt, Object)>, StoreError> {
        let mut out = Vec::with_capacity(self.head(list)?.len);
        let mut cursor = self.head(list)?.first;
        while let Some(elt) = cursor {
            let rec = self.rec(elt)?;
            out.push((elt, rec.data));
            cursor = rec.next;
        }
        Ok(out)
    }

    pub fn insert_first(&mut self, list: ListId, data: Object) -> Result<Elt, StoreError> {
        match self.head(list)?.first {
            Some(first) => self.insert_before(first, data),
            None => self.insert_only(list, data),
        }
    }

    pub fn insert_last(&mut self, list: ListId, data: Object) -> Result<Elt, StoreError> {
        match self.head(list)?.last {
            Some(last) => self.insert_after(last, data),
            None => self.insert_only(list, data),
        }
    }

    fn insert_only(&mut self, list: ListId, data: Object) -> Result<Elt, StoreError> {
        let elt = Elt(self.allocate());
        self.elts.insert(elt, EltRec { list, prev: None, next: None, data });
        let head = self.head_mut(list)?;
        head.first = Some(elt);
        head.last = Some(elt);
        head.len = 1;
        Ok(elt)
    }

    pub fn insert_before(&mut self, at: Elt, data: Object) -> Result<Elt, StoreError> {
        let anchor = self.rec(at)?;
        let elt = Elt(self.allocate());
        self.elts.insert(elt, EltRec { list: anchor.list, prev: anchor.prev, next: Some(at), data });
        self.rec_mut(at)?.prev = Some(elt);
        match anchor.prev {
            Some(prev) => self.rec_mut(prev)?.next = Some(elt),
            None => self.head_mut(anchor.list)?.first = Some(elt),
        }
        self.head_mut(anchor.list)?.len += 1;
        Ok(elt)
    }

    pub fn insert_after(&mut self, at: Elt, data: Object) -> Result<Elt, StoreError> {
        let anchor = self.rec(at)?;
        let elt = Elt(self.allocate());
        self.elts.insert(elt, EltRec { list: anchor.list, prev: Some(at), next: anchor.next, data });
        self.rec_mut(at)?.next = Some(elt);
        match anchor.next {
            Some(next) => self.rec_mut(next)?.prev = Some(elt),
            None => self.head_mut(anchor.list)?.last = Some(elt),
        }
        self.head_mut(anchor.list)?.len += 1;
        Ok(elt)
    }

    /// Unlink an element, returning the object it referenced.
    pub fn delete(&mut self, elt: Elt) -> Result<Object, StoreError> {
        let rec = self.rec(elt)?;
        match rec.prev {
            Some(prev) => self.rec_mut(prev)?.next = rec.next,
            None => self.head_mut(rec.list)?.first = rec.next,
        }
        match rec.next {
            Some(next) => self.rec_mut(next)?.prev = rec.prev,
            None => self.head_mut(rec.list)?.last = rec.prev,
        }
        self.head_mut(rec.list)?.len -= 1;
        self.elts.remove(&elt);
        Ok(rec.data)
    }
}

impl<U> Journal for Lists<U> {
    fn commit(&mut self) {
        self.heads.commit();
        self.elts.commit();
        self.next_id.commit();
    }

    fn rollback(&mut self) {
        self.heads.rollback();
        self.elts.rollback();
        self.next_id.rollback();
    }
}
