//! Lazy, ranged, filterable views over persisted topics.
//!
//! A stream knows how many records it holds from the sidecar alone;
//! decoding happens per record, on demand, against the shared columnar
//! table. Iteration is restartable — every call to `iter()` begins again
//! at the first record of the view.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::bus::Record;
use crate::errors::Result;
use crate::loader::{TopicEntry, TopicTable};
use crate::schema::TopicKind;
use crate::transaction::Transaction;
use crate::util::norm_index;

type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

pub struct Stream {
    entry: Arc<TopicEntry>,
    start: usize,
    end: usize,
    filter: Option<Predicate>,
    /// `where()` length policy: computed once on first demand, then cached.
    filtered_len: Mutex<Option<usize>>,
}

impl Stream {
    pub(crate) fn whole(entry: Arc<TopicEntry>) -> Self {
        let end = entry.meta.count as usize;
        Self {
            entry,
            start: 0,
            end,
            filter: None,
            filtered_len: Mutex::new(None),
        }
    }

    /// Restrict to the half-open record range `[start, end)`, clamped to
    /// the view.
    pub(crate) fn range(&self, start: usize, end: usize) -> Self {
        let abs_start = (self.start + start).min(self.end);
        let abs_end = (self.start + end).min(self.end);
        Self {
            entry: self.entry.clone(),
            start: abs_start,
            end: abs_end.max(abs_start),
            filter: self.filter.clone(),
            filtered_len: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.entry.meta.name
    }

    /// True when elements decode as transaction groups.
    pub fn is_group_stream(&self) -> bool {
        self.entry.kind() == TopicKind::Group
    }

    fn table(&self) -> Result<Arc<TopicTable>> {
        self.entry.table()
    }

    fn span(&self) -> usize {
        self.end - self.start
    }

    /// Number of records in the view. Unfiltered views answer from
    /// metadata without opening the payload; filtered views count matches
    /// once and cache the result.
    pub fn len(&self) -> Result<usize> {
        let Some(filter) = &self.filter else {
            return Ok(self.span());
        };
        if let Some(len) = *self.filtered_len.lock().unwrap() {
            return Ok(len);
        }
        let table = self.table()?;
        let mut count = 0;
        for index in self.start..self.end {
            if filter(&table.decode(index)?) {
                count += 1;
            }
        }
        *self.filtered_len.lock().unwrap() = Some(count);
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Index into the view with negative-index semantics.
    pub fn get(&self, index: i64) -> Result<Option<Record>> {
        match &self.filter {
            None => {
                let Some(offset) = norm_index(self.span(), index) else {
                    return Ok(None);
                };
                let table = self.table()?;
                Ok(Some(table.decode(self.start + offset)?))
            }
            Some(_) => {
                let Some(offset) = norm_index(self.len()?, index) else {
                    return Ok(None);
                };
                // nth match, walking in persisted order
                let mut seen = 0;
                for record in self.iter() {
                    let record = record?;
                    if seen == offset {
                        return Ok(Some(record));
                    }
                    seen += 1;
                }
                Ok(None)
            }
        }
    }

    /// Fresh lazy iteration over the view, in persisted order.
    pub fn iter(&self) -> StreamIter<'_> {
        StreamIter {
            stream: self,
            next: self.start,
        }
    }

    /// Lazily filtered view of the same records.
    pub fn filtered(&self, predicate: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Stream {
        let predicate: Predicate = Arc::new(predicate);
        let combined: Predicate = match &self.filter {
            Some(existing) => {
                let existing = existing.clone();
                Arc::new(move |record| existing(record) && predicate(record))
            }
            None => predicate,
        };
        Stream {
            entry: self.entry.clone(),
            start: self.start,
            end: self.end,
            filter: Some(combined),
            filtered_len: Mutex::new(None),
        }
    }

    /// Filter on the transactions themselves; for group streams the
    /// predicate must hold for every transaction in the group.
    pub fn where_txn(&self, predicate: impl Fn(&Transaction) -> bool + Send + Sync + 'static) -> Stream {
        self.filtered(move |record| match record {
            Record::Transaction(txn) => predicate(txn),
            Record::Group(group) => group.iter().all(|txn| predicate(txn)),
            Record::Event(_) => false,
        })
    }

    /// Materialize the whole view as a JSON array. Transaction streams
    /// produce an array of transaction objects; group streams produce an
    /// array of arrays of transaction objects.
    pub fn json(&self) -> Result<Value> {
        let mut out = Vec::new();
        for record in self.iter() {
            let record = record?;
            let value = match &record {
                Record::Group(group) => {
                    let mut value = serde_json::to_value(&**group)?;
                    value["transactions"].take()
                }
                Record::Transaction(txn) => serde_json::to_value(&**txn)?,
                Record::Event(event) => serde_json::to_value(&**event)?,
            };
            out.push(value);
        }
        Ok(Value::Array(out))
    }

    /// Force the payload decode so table errors surface on the caller's
    /// thread before work is fanned out.
    pub(crate) fn preload(&self) -> Result<()> {
        self.table().map(|_| ())
    }

    /// Decode without range/filter mediation; used by the checker's
    /// worker partitions. `index` is view-relative.
    pub(crate) fn decode_at(&self, index: usize) -> Result<Record> {
        let table = self.table()?;
        table.decode(self.start + index)
    }
}

pub struct StreamIter<'a> {
    stream: &'a Stream,
    next: usize,
}

impl Iterator for StreamIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.next >= self.stream.end {
                return None;
            }
            let index = self.next;
            self.next += 1;
            let record = match self.stream.table().and_then(|t| t.decode(index)) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            match &self.stream.filter {
                Some(filter) if !filter(&record) => continue,
                _ => return Some(Ok(record)),
            }
        }
    }
}
