//! In-memory record containers.
//!
//! A `Batch` is an ordered collection of one record kind, shared by the
//! logging path (per-topic buffers) and by bulk query results. It mirrors
//! the access patterns of the disk-backed [`Stream`](crate::stream::Stream):
//! negative indexing, slicing, predicate filtering, JSON materialization.

use std::sync::Arc;

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

use crate::errors::Result;
use crate::event::Event;
use crate::transaction::{Transaction, TransactionGroup};
use crate::util::{norm_index, slice_indices};

pub type EventBatch = Batch<Event>;
pub type TransactionBatch = Batch<Transaction>;
pub type GroupBatch = Batch<TransactionGroup>;

/// Ordered, homogeneous, shareable record container.
#[derive(Clone, Debug)]
pub struct Batch<T> {
    name: String,
    records: Vec<Arc<T>>,
}

impl<T> Default for Batch<T> {
    fn default() -> Self {
        Self {
            name: String::new(),
            records: Vec::new(),
        }
    }
}

impl<T> Batch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
        }
    }

    /// Stream/topic name this batch belongs to. Empty until first assigned.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn append(&mut self, record: impl Into<Arc<T>>) {
        self.records.push(record.into());
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Indexing with negative-index semantics.
    pub fn get(&self, index: i64) -> Option<&Arc<T>> {
        norm_index(self.records.len(), index).map(|i| &self.records[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.records.iter()
    }

    /// `[start:stop:step]` slicing with full sequence semantics; the result
    /// shares the underlying records.
    pub fn slice(&self, start: Option<i64>, stop: Option<i64>, step: i64) -> Batch<T> {
        let records = slice_indices(self.records.len(), start, stop, step)
            .into_iter()
            .map(|i| self.records[i].clone())
            .collect();
        Batch {
            name: self.name.clone(),
            records,
        }
    }

    /// Keep records matching `predicate`, preserving relative order.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool) -> Batch<T> {
        let records = self
            .records
            .iter()
            .filter(|r| predicate(r))
            .cloned()
            .collect();
        Batch {
            name: self.name.clone(),
            records,
        }
    }
}

impl<T: Serialize> Batch<T> {
    /// Materialize the whole batch as a JSON array.
    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl<T> FromIterator<Arc<T>> for Batch<T> {
    fn from_iter<I: IntoIterator<Item = Arc<T>>>(iter: I) -> Self {
        Self {
            name: String::new(),
            records: iter.into_iter().collect(),
        }
    }
}

impl<'a, T> IntoIterator for &'a Batch<T> {
    type Item = &'a Arc<T>;
    type IntoIter = std::slice::Iter<'a, Arc<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl<T: Serialize> Serialize for Batch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.records.len()))?;
        for record in &self.records {
            seq.serialize_element(&**record)?;
        }
        seq.end()
    }
}
