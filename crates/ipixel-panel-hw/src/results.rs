//! Per-unit outcomes of fan-out operations.

use crate::unit::UnitId;
use crate::{Error, Result};

/// One result per targeted unit, ordered by unit id.
#[derive(Debug)]
pub struct UnitResults<T> {
    entries: Vec<(UnitId, Result<T>)>,
}

impl<T> UnitResults<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, unit: UnitId, result: Result<T>) {
        self.entries.push((unit, result));
        self.entries.sort_by_key(|(id, _)| *id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if every unit succeeded.
    pub fn all_ok(&self) -> bool {
        self.entries.iter().all(|(_, r)| r.is_ok())
    }

    /// Units whose operation succeeded.
    pub fn succeeded(&self) -> Vec<UnitId> {
        self.entries
            .iter()
            .filter(|(_, r)| r.is_ok())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Units whose operation failed, with the error.
    pub fn failed(&self) -> Vec<(UnitId, &Error)> {
        self.entries
            .iter()
            .filter_map(|(id, r)| r.as_ref().err().map(|e| (*id, e)))
            .collect()
    }

    pub fn get(&self, unit: UnitId) -> Option<&Result<T>> {
        self.entries
            .iter()
            .find(|(id, _)| *id == unit)
            .map(|(_, r)| r)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(UnitId, Result<T>)> {
        self.entries.iter()
    }

    pub fn into_inner(self) -> Vec<(UnitId, Result<T>)> {
        self.entries
    }
}

impl<T> Default for UnitResults<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<(UnitId, Result<T>)> for UnitResults<T> {
    fn from_iter<I: IntoIterator<Item = (UnitId, Result<T>)>>(iter: I) -> Self {
        let mut entries: Vec<_> = iter.into_iter().collect();
        entries.sort_by_key(|(id, _)| *id);
        Self { entries }
    }
}

impl<T> IntoIterator for UnitResults<T> {
    type Item = (UnitId, Result<T>);
    type IntoIter = std::vec::IntoIter<(UnitId, Result<T>)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
