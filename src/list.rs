//! Index-based circular doubly-linked lists.
//!
//! A [`Ring`] is nothing but the id of its sentinel. The prev/next links of
//! every member, sentinel included, live in an arena reached through the
//! [`Links`] trait, so the same list code threads node groups through the
//! free/full lists and nodes through the LRU tiers without allocating.
//!
//! ```text
//!   head <-> a <-> b <-> c <-> head
//!   first() = a (oldest), last() = c (newest)
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Storage for the prev/next links of list members.
///
/// Links live in shared memory, so every access can find the arena corrupt.
pub trait Links {
    type Id: Copy + Eq + fmt::Debug;

    fn next(&self, id: Self::Id) -> Result<Self::Id>;
    fn prev(&self, id: Self::Id) -> Result<Self::Id>;
    fn set_next(&mut self, id: Self::Id, next: Self::Id) -> Result<()>;
    fn set_prev(&mut self, id: Self::Id, prev: Self::Id) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring<Id> {
    head: Id,
}

impl<Id: Copy + Eq + fmt::Debug> Ring<Id> {
    pub const fn new(head: Id) -> Self {
        Self { head }
    }

    pub fn head(&self) -> Id {
        self.head
    }

    /// Make the sentinel point at itself
    pub fn init<L: Links<Id = Id>>(&self, links: &mut L) -> Result<()> {
        links.set_next(self.head, self.head)?;
        links.set_prev(self.head, self.head)
    }

    /// Oldest member
    pub fn first<L: Links<Id = Id>>(&self, links: &L) -> Result<Option<Id>> {
        let id = links.next(self.head)?;
        Ok((id != self.head).then_some(id))
    }

    pub fn push_back<L: Links<Id = Id>>(&self, links: &mut L, id: Id) -> Result<()> {
        let tail = links.prev(self.head)?;
        self.splice(links, tail, id, self.head)
    }

    pub fn push_front<L: Links<Id = Id>>(&self, links: &mut L, id: Id) -> Result<()> {
        let first = links.next(self.head)?;
        self.splice(links, self.head, id, first)
    }

    /// Insert `id` directly before `pos`, which must be a member or the
    /// sentinel.
    pub fn insert_before<L: Links<Id = Id>>(&self, links: &mut L, pos: Id, id: Id) -> Result<()> {
        let prev = links.prev(pos)?;
        self.splice(links, prev, id, pos)
    }

    pub fn remove<L: Links<Id = Id>>(&self, links: &mut L, id: Id) -> Result<()> {
        if id == self.head {
            return Err(Error::Integrity(format!("unlink of list sentinel {:?}", id)));
        }
        self.unlink(links, id)?;
        links.set_next(id, id)?;
        links.set_prev(id, id)
    }

    /// Move a member of any ring to the tail of this one.
    pub fn move_to_back<L: Links<Id = Id>>(&self, links: &mut L, id: Id) -> Result<()> {
        self.unlink(links, id)?;
        self.push_back(links, id)
    }

    fn unlink<L: Links<Id = Id>>(&self, links: &mut L, id: Id) -> Result<()> {
        let prev = links.prev(id)?;
        let next = links.next(id)?;
        if links.next(prev)? != id || links.prev(next)? != id {
            return Err(Error::Integrity(format!("broken links around {:?}", id)));
        }
        links.set_next(prev, next)?;
        links.set_prev(next, prev)
    }

    fn splice<L: Links<Id = Id>>(&self, links: &mut L, prev: Id, id: Id, next: Id) -> Result<()> {
        links.set_prev(id, prev)?;
        links.set_next(id, next)?;
        links.set_next(prev, id)?;
        links.set_prev(next, id)
    }
}
