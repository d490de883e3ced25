//! Event records.
//!
//! An event is the smallest traced unit: an id unique within the run, a
//! logical timestamp, and an ordered set of named attribute values. Events
//! stay mutable while the testbench owns them; handing one to a transaction
//! or to the bus moves it behind an `Arc` and freezes it for every
//! downstream consumer.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::errors::Result;
use crate::value::{AttrMap, AttrValue};

/// Column name reserved for the event id.
pub const ID_NAME: &str = "id";
/// Column name reserved for the event timestamp.
pub const TIME_NAME: &str = "time";

static EVENT_IDS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_event_id() -> u64 {
    EVENT_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Reset the run-wide id allocators. Test-only escape hatch; ids are
/// otherwise unique for the lifetime of the process.
pub fn reset_id_allocators() {
    EVENT_IDS.store(0, Ordering::Relaxed);
    crate::transaction::reset_record_ids();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    id: u64,
    time: u64,
    values: AttrMap,
}

impl Event {
    /// New event whose timestamp defaults to its id.
    pub fn new() -> Self {
        let id = next_event_id();
        Self {
            id,
            time: id,
            values: AttrMap::new(),
        }
    }

    /// New event at an explicit timestamp.
    pub fn at(time: u64) -> Self {
        Self {
            id: next_event_id(),
            time,
            values: AttrMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn set_time(&mut self, time: u64) {
        self.time = time;
    }

    /// Add a named value. Returns `false` if the name is already present or
    /// collides with the reserved `id`/`time` columns.
    pub fn add_value(&mut self, name: &str, value: impl Into<AttrValue>) -> bool {
        if name == ID_NAME || name == TIME_NAME {
            return false;
        }
        self.values.add(name, value)
    }

    /// Indexed assignment: insert or overwrite.
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        if name == ID_NAME || name == TIME_NAME {
            return;
        }
        self.values.set(name, value);
    }

    /// Read an attribute; absent names are an error.
    pub fn get(&self, name: &str) -> Result<&AttrValue> {
        self.values.get(name)
    }

    pub fn try_get(&self, name: &str) -> Option<&AttrValue> {
        self.values.try_get(name)
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains(name)
    }

    pub fn remove_value(&mut self, name: &str) -> bool {
        self.values.remove(name)
    }

    pub fn values(&self) -> &AttrMap {
        &self.values
    }

    /// Rebuild a persisted event. Does not consume an id from the allocator.
    pub(crate) fn from_parts(id: u64, time: u64, values: AttrMap) -> Self {
        Self { id, time, values }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Event", 3)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("time", &self.time)?;
        state.serialize_field("value", &self.values)?;
        state.end()
    }
}
