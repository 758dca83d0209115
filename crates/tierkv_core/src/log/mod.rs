//! Write-ahead log store of the LOG tier.
//!
//! Positions are absolute: the first operation ever appended is position 0
//! and a position is never reused, so trimming the prefix does not shift
//! the positions of the records that remain.

mod journal;

use crate::error::{CoreError, CoreResult};
use journal::{Journal, JournalRecord};
use std::collections::VecDeque;
use tierkv_protocol::Operation;
use tierkv_storage::StorageBackend;
use tracing::debug;

/// Ordered, append-only sequence of [`Operation`]s.
#[derive(Debug, Default)]
pub struct LogStore {
    entries: VecDeque<Operation>,
    first: u64,
    journal: Option<Journal>,
}

impl LogStore {
    /// Creates an empty, purely in-memory log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a log journaled to `backend`, replaying what it holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is corrupt or cannot be read.
    pub fn open(backend: Box<dyn StorageBackend>) -> CoreResult<Self> {
        let (journal, records) = Journal::open(backend)?;
        let mut log = Self::new();
        for record in records {
            match record {
                JournalRecord::Append(op) => log.entries.push_back(op),
                JournalRecord::Trim(upto) => {
                    log.drop_prefix(upto);
                }
            }
        }
        debug!(
            first = log.first,
            next = log.next_position(),
            "log replayed"
        );
        log.journal = Some(journal);
        Ok(log)
    }

    /// Appends `op` and returns its position.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails; the operation is then
    /// not in the log.
    pub fn append(&mut self, op: Operation) -> CoreResult<u64> {
        if let Some(journal) = &mut self.journal {
            journal.write(&JournalRecord::Append(op.clone()))?;
        }
        let position = self.next_position();
        self.entries.push_back(op);
        Ok(position)
    }

    /// Discards every position below `upto`. Returns how many were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn trim(&mut self, upto: u64) -> CoreResult<usize> {
        let upto = upto.min(self.next_position());
        if upto <= self.first {
            return Ok(0);
        }
        if let Some(journal) = &mut self.journal {
            journal.write(&JournalRecord::Trim(upto))?;
        }
        Ok(self.drop_prefix(upto))
    }

    fn drop_prefix(&mut self, upto: u64) -> usize {
        let upto = upto.min(self.next_position());
        let count = upto.saturating_sub(self.first) as usize;
        self.entries.drain(..count);
        self.first = self.first.max(upto);
        count
    }

    /// Returns the operation at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogPositionOutOfRange`] for trimmed or unwritten
    /// positions.
    pub fn read(&self, position: u64) -> CoreResult<&Operation> {
        position
            .checked_sub(self.first)
            .and_then(|index| self.entries.get(index as usize))
            .ok_or_else(|| self.out_of_range(position))
    }

    /// Returns every operation from `from` to the end.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogPositionOutOfRange`] when `from` is trimmed
    /// or at or past the end.
    pub fn subscribe(&self, from: u64) -> CoreResult<Vec<Operation>> {
        if from < self.first || from >= self.next_position() {
            return Err(self.out_of_range(from));
        }
        let skip = (from - self.first) as usize;
        Ok(self.entries.iter().skip(skip).cloned().collect())
    }

    fn out_of_range(&self, position: u64) -> CoreError {
        CoreError::LogPositionOutOfRange {
            position,
            first: self.first,
            next: self.next_position(),
        }
    }

    /// First retained position.
    #[must_use]
    pub fn first_position(&self) -> u64 {
        self.first
    }

    /// Position the next append will receive.
    #[must_use]
    pub fn next_position(&self) -> u64 {
        self.first + self.entries.len() as u64
    }

    /// Number of retained operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no operation is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if appends are journaled.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tierkv_protocol::ErrorCode;
    use tierkv_storage::FileBackend;

    fn op(n: u64) -> Operation {
        Operation::new(format!("c-1:{n}"), format!("k{n}"), format!("v{n}"))
    }

    fn filled(n: u64) -> LogStore {
        let mut log = LogStore::new();
        for i in 0..n {
            assert_eq!(log.append(op(i)).unwrap(), i);
        }
        log
    }

    #[test]
    fn read_returns_appended_operation() {
        let log = filled(3);
        assert_eq!(log.read(1).unwrap(), &op(1));
        assert_eq!(log.read(3).unwrap_err().code(), ErrorCode::LogDne);
        assert!(!log.is_durable());
    }

    #[test]
    fn trim_keeps_positions_stable() {
        let mut log = filled(5);
        assert_eq!(log.trim(2).unwrap(), 2);
        assert_eq!(log.first_position(), 2);
        assert_eq!(log.len(), 3);

        assert_eq!(log.read(1).unwrap_err().code(), ErrorCode::LogDne);
        assert_eq!(log.read(2).unwrap(), &op(2));
        assert_eq!(log.append(op(5)).unwrap(), 5);

        assert_eq!(log.trim(1).unwrap(), 0);
        assert_eq!(log.trim(100).unwrap(), 4);
        assert!(log.is_empty());
        assert_eq!(log.next_position(), 6);
    }

    #[test]
    fn subscribe_is_restartable() {
        let log = filled(4);
        assert_eq!(log.subscribe(0).unwrap().len(), 4);
        assert_eq!(log.subscribe(2).unwrap(), vec![op(2), op(3)]);
        assert_eq!(log.subscribe(2).unwrap(), vec![op(2), op(3)]);
        assert_eq!(log.subscribe(4).unwrap_err().code(), ErrorCode::LogDne);
        assert!(LogStore::new().subscribe(0).is_err());
    }

    #[test]
    fn journaled_log_reopens_with_same_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.tkvl");
        {
            let mut log = LogStore::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
            assert!(log.is_durable());
            for i in 0..4 {
                log.append(op(i)).unwrap();
            }
            log.trim(1).unwrap();
        }

        let mut log = LogStore::open(Box::new(FileBackend::open(&path).unwrap())).unwrap();
        assert_eq!(log.first_position(), 1);
        assert_eq!(log.next_position(), 4);
        assert_eq!(log.subscribe(1).unwrap(), vec![op(1), op(2), op(3)]);
        assert_eq!(log.append(op(4)).unwrap(), 4);
    }
}
