//! Bulk time-window queries over persisted topics.
//!
//! A thin layer on top of the loader for checker implementations and
//! post-run analysis: fetch the transactions or events that overlap a time
//! window, or walk from one transaction to the next in persisted order.
//! Topic sidecars carry the observed time span, so topics entirely outside
//! the window are pruned without touching their payloads.

use std::sync::Arc;

use crate::batch::{EventBatch, TransactionBatch};
use crate::bus::Record;
use crate::errors::Result;
use crate::loader::Loader;
use crate::transaction::Transaction;

pub struct QueryHelper<'a> {
    loader: &'a Loader,
}

impl<'a> QueryHelper<'a> {
    pub fn new(loader: &'a Loader) -> Self {
        Self { loader }
    }

    pub fn loader(&self) -> &Loader {
        self.loader
    }

    fn window_disjoint(&self, topic: &str, min_time: u64, max_time: u64) -> bool {
        match self.loader.metadata(topic) {
            Some(meta) => meta.min_time > max_time || meta.max_time < min_time,
            None => false,
        }
    }

    /// Transactions of `topic` whose `[start_time, end_time]` span
    /// overlaps `[min_time, max_time]`, in persisted order. Group topics
    /// contribute their member transactions.
    pub fn transactions_between(
        &self,
        topic: &str,
        min_time: u64,
        max_time: u64,
    ) -> Result<TransactionBatch> {
        let mut batch = TransactionBatch::named(topic);
        if self.window_disjoint(topic, min_time, max_time) {
            return Ok(batch);
        }
        let stream = self.loader.stream(topic)?;
        for record in stream.iter() {
            let txns: Vec<Arc<Transaction>> = match record? {
                Record::Transaction(txn) => vec![txn],
                Record::Group(group) => group.transactions().to_vec(),
                Record::Event(_) => continue,
            };
            for txn in txns {
                if txn.start_time() <= max_time && txn.end_time() >= min_time {
                    batch.append(txn);
                }
            }
        }
        Ok(batch)
    }

    /// Events of `topic` with `min_time <= time <= max_time`, in persisted
    /// order. Works on any topic kind; nesting is flattened.
    pub fn events_between(&self, topic: &str, min_time: u64, max_time: u64) -> Result<EventBatch> {
        if self.window_disjoint(topic, min_time, max_time) {
            return Ok(EventBatch::named(topic));
        }
        let all = self.loader.events(topic)?;
        Ok(all.filter(|e| e.time() >= min_time && e.time() <= max_time))
    }

    /// The transaction following `txn` in persisted order, if any.
    pub fn next_transaction(
        &self,
        topic: &str,
        txn: &Transaction,
    ) -> Result<Option<Arc<Transaction>>> {
        let stream = self.loader.stream(topic)?;
        let mut take_next = false;
        for record in stream.iter() {
            let txns: Vec<Arc<Transaction>> = match record? {
                Record::Transaction(t) => vec![t],
                Record::Group(group) => group.transactions().to_vec(),
                Record::Event(_) => continue,
            };
            for candidate in txns {
                if take_next {
                    return Ok(Some(candidate));
                }
                if candidate.id() == txn.id() {
                    take_next = true;
                }
            }
        }
        Ok(None)
    }
}
