//! Transactions and transaction groups.
//!
//! A transaction names an ordered run of events that together form one
//! higher-level operation (a bus read, a DMA burst, a cache refill). A
//! group is one level up: an ordered run of transactions. Groups never
//! nest — indexing a group always yields a plain transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::ser::{Serialize, SerializeSeq, SerializeStruct, Serializer};

use crate::errors::Result;
use crate::event::Event;
use crate::util::norm_index;
use crate::value::{AttrMap, AttrValue};

static TXN_IDS: AtomicU64 = AtomicU64::new(0);
static GROUP_IDS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn reset_record_ids() {
    TXN_IDS.store(0, Ordering::Relaxed);
    GROUP_IDS.store(0, Ordering::Relaxed);
}

/// A named, ordered group of events in append order.
///
/// `finish()` closes event-append; attributes stay settable afterwards so a
/// summary value computed at the end of an operation can still land on the
/// record ("aa" set last is fine).
#[derive(Clone, Debug)]
pub struct Transaction {
    id: u64,
    name: String,
    values: AttrMap,
    events: Vec<Arc<Event>>,
    finished: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::named(String::new())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: TXN_IDS.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            values: AttrMap::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Append an event. Returns `false` once the transaction is finished.
    pub fn add_event(&mut self, event: impl Into<Arc<Event>>) -> bool {
        if self.finished {
            return false;
        }
        self.events.push(event.into());
        true
    }

    /// Close event-append. Idempotent.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Indexing with negative-index semantics: `get(-1)` is the last event.
    pub fn get(&self, index: i64) -> Option<&Arc<Event>> {
        norm_index(self.events.len(), index).map(|i| &self.events[i])
    }

    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.events.iter()
    }

    /// First event time, or 0 for an empty transaction.
    pub fn start_time(&self) -> u64 {
        self.events.first().map(|e| e.time()).unwrap_or(0)
    }

    /// Last event time, or 0 for an empty transaction.
    pub fn end_time(&self) -> u64 {
        self.events.last().map(|e| e.time()).unwrap_or(0)
    }

    pub fn is_group(&self) -> bool {
        false
    }

    // Transaction attributes: settable at any point in the lifecycle.

    pub fn add_value(&mut self, name: &str, value: impl Into<AttrValue>) -> bool {
        self.values.add(name, value)
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        self.values.set(name, value);
    }

    pub fn get_value(&self, name: &str) -> Result<&AttrValue> {
        self.values.get(name)
    }

    pub fn try_get_value(&self, name: &str) -> Option<&AttrValue> {
        self.values.try_get(name)
    }

    pub fn values(&self) -> &AttrMap {
        &self.values
    }

    pub(crate) fn from_parts(
        id: u64,
        name: String,
        values: AttrMap,
        events: Vec<Arc<Event>>,
        finished: bool,
    ) -> Self {
        Self {
            id,
            name,
            values,
            events,
            finished,
        }
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

/// A named, ordered collection of transactions. Exactly one level deep.
#[derive(Clone, Debug)]
pub struct TransactionGroup {
    id: u64,
    name: String,
    transactions: Vec<Arc<Transaction>>,
    finished: bool,
}

impl TransactionGroup {
    pub fn new() -> Self {
        Self::named(String::new())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: GROUP_IDS.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            transactions: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn add_transaction(&mut self, txn: impl Into<Arc<Transaction>>) -> bool {
        if self.finished {
            return false;
        }
        self.transactions.push(txn.into());
        true
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Indexing a group yields a transaction, never another group.
    pub fn get(&self, index: i64) -> Option<&Arc<Transaction>> {
        norm_index(self.transactions.len(), index).map(|i| &self.transactions[i])
    }

    pub fn transactions(&self) -> &[Arc<Transaction>] {
        &self.transactions
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Transaction>> {
        self.transactions.iter()
    }

    pub fn start_time(&self) -> u64 {
        self.transactions
            .first()
            .map(|t| t.start_time())
            .unwrap_or(0)
    }

    pub fn end_time(&self) -> u64 {
        self.transactions.last().map(|t| t.end_time()).unwrap_or(0)
    }

    pub fn is_group(&self) -> bool {
        true
    }

    pub(crate) fn from_parts(id: u64, name: String, transactions: Vec<Arc<Transaction>>) -> Self {
        Self {
            id,
            name,
            transactions,
            finished: true,
        }
    }
}

impl Default for TransactionGroup {
    fn default() -> Self {
        Self::new()
    }
}

struct EventsSer<'a>(&'a [Arc<Event>]);

impl Serialize for EventsSer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for event in self.0 {
            seq.serialize_element(&**event)?;
        }
        seq.end()
    }
}

impl Serialize for Transaction {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let fields = if self.values.is_empty() { 3 } else { 4 };
        let mut state = serializer.serialize_struct("Transaction", fields)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("name", &self.name)?;
        if !self.values.is_empty() {
            state.serialize_field("value", &self.values)?;
        }
        state.serialize_field("events", &EventsSer(&self.events))?;
        state.end()
    }
}

struct TxnsSer<'a>(&'a [Arc<Transaction>]);

impl Serialize for TxnsSer<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for txn in self.0 {
            seq.serialize_element(&**txn)?;
        }
        seq.end()
    }
}

impl Serialize for TransactionGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TransactionGroup", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("transactions", &TxnsSer(&self.transactions))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_order_and_negative_indexing() {
        let mut txn = Transaction::named("t");
        for i in 0..5u64 {
            txn.add_event(Event::at(i));
        }
        assert_eq!(txn.len(), 5);
        assert_eq!(txn.get(0).unwrap().time(), 0);
        assert_eq!(txn.get(-1).unwrap().time(), 4);
        assert_eq!(txn.get(-5).unwrap().time(), 0);
        assert!(txn.get(5).is_none());
        assert!(txn.get(-6).is_none());
    }

    #[test]
    fn finish_closes_events_not_attributes() {
        let mut txn = Transaction::named("t");
        txn.add_event(Event::new());
        txn.finish();
        assert!(!txn.add_event(Event::new()));
        assert_eq!(txn.len(), 1);
        // attribute mutability outlives event-append closure
        txn.set("aa", 42u64);
        assert_eq!(txn.get_value("aa").unwrap().as_uint(), Some(42));
    }

    #[test]
    fn group_is_one_level_deep() {
        let mut group = TransactionGroup::named("g");
        let mut txn = Transaction::named("t");
        txn.add_event(Event::new());
        group.add_transaction(txn);
        assert!(group.is_group());
        let child = group.get(0).unwrap();
        assert!(!child.is_group());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn start_end_times_from_events() {
        let mut txn = Transaction::named("t");
        txn.add_event(Event::at(10));
        txn.add_event(Event::at(20));
        txn.add_event(Event::at(30));
        assert_eq!(txn.start_time(), 10);
        assert_eq!(txn.end_time(), 30);
    }

    #[test]
    fn transaction_json_nests_events() {
        let mut txn = Transaction::named("t");
        let mut e = Event::at(1);
        e.add_value("v", 5u64);
        txn.add_event(e);
        let json = serde_json::to_value(&txn).unwrap();
        assert_eq!(json["name"], "t");
        assert_eq!(json["events"][0]["value"]["v"], 5);
        // empty attribute map stays out of the shape
        assert!(json.get("value").is_none());
    }
}
