//! The transactional store.
//!
//! One `Sdr` guards the whole database. `begin()` takes the lock and hands
//! back a `Transaction`; every mutation goes through it. `end()` commits.
//! Dropping the transaction without `end()` cancels it and every journaled
//! table rolls back, so `?` inside a transaction never leaves partial state.

pub mod list;
pub mod table;

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
pub use list::Lists;
pub use table::{Cell, Journal, Table};

/// Address of a stored object (bundle, event, incomplete bundle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Object(pub u64);

/// A durable list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListId(pub u64);

/// An element of a durable list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Elt(pub u64);

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

pub struct Sdr<S> {
    state: Mutex<S>,
}

impl<S: Journal> Sdr<S> {
    pub fn new(state: S) -> Self {
        Self { state: Mutex::new(state) }
    }

    pub fn begin(&self) -> Result<Transaction<'_, S>, StoreError> {
        let guard = self.state.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(Transaction { guard, open: true })
    }
}

pub struct Transaction<'a, S: Journal> {
    guard: MutexGuard<'a, S>,
    open: bool,
}

impl<S: Journal> Transaction<'_, S> {
    /// Commit every change made in this transaction.
    pub fn end(mut self) {
        self.guard.commit();
        self.open = false;
    }

    /// Undo every change made in this transaction.
    pub fn cancel(mut self) {
        self.guard.rollback();
        self.open = false;
    }
}

impl<S: Journal> Deref for Transaction<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.guard
    }
}

impl<S: Journal> DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.guard
    }
}

impl<S: Journal> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.open {
            tracing::debug!("transaction cancelled");
            self.guard.rollback();
        }
    }
}
