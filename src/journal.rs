//! Write-back collaborator.
//!
//! Before a dirty record's payload is freed, the pond hands its key and
//! value to a [`Journal`]. A successful append returns a sequence id that
//! increases monotonically; replication catches up from it. A failed
//! append leaves the record cached and dirty.

use crate::error::JournalError;

pub trait Journal {
    /// Durably append an update. Blocks until the append is durable.
    fn write_update(&mut self, key: &[u8], value: &[u8]) -> Result<u64, JournalError>;
}

/// Journal that accepts and discards every update
#[derive(Debug, Default)]
pub struct NullJournal {
    seq: u64,
}

impl NullJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for NullJournal {
    fn write_update(&mut self, _key: &[u8], _value: &[u8]) -> Result<u64, JournalError> {
        self.seq += 1;
        Ok(self.seq)
    }
}

/// In-memory journal that keeps every update, with a switch to make
/// appends fail.
#[derive(Debug, Default)]
pub struct VecJournal {
    entries: Vec<(u64, Vec<u8>, Vec<u8>)>,
    fail: bool,
}

impl VecJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (or succeed again)
    pub fn set_fail(&mut self, fail: bool) {
        self.fail = fail;
    }

    pub fn entries(&self) -> &[(u64, Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Journal for VecJournal {
    fn write_update(&mut self, key: &[u8], value: &[u8]) -> Result<u64, JournalError> {
        if self.fail {
            return Err(JournalError::WriteFailed("appends disabled".to_string()));
        }
        let seq = self.entries.last().map_or(1, |(seq, _, _)| seq + 1);
        self.entries.push((seq, key.to_vec(), value.to_vec()));
        Ok(seq)
    }
}
