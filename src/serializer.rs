//! Buffered columnar persistence.
//!
//! The serializer subscribes to one or more topics and buffers every record
//! it receives. Buffers flush to Parquet when they pass a row threshold,
//! when `flush()` is called explicitly, and at `finalize()` — each flush
//! appends a row group to the topic's payload file, keeping memory bounded
//! under high event volume. `finalize()` closes every payload and only then
//! writes the JSON metadata sidecars, so a partially written payload is
//! never referenced by a sidecar.
//!
//! # Thread safety
//!
//! The write path runs on a single logical producer thread; the internal
//! mutex exists for fan-out consistency, not for concurrent producers.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::sync::{Arc, Mutex};

use arrow::array::{ArrayRef, BooleanBuilder, RecordBatch, StringBuilder, UInt64Builder};
use arrow::datatypes::Schema;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::debug;

use crate::batch::{EventBatch, GroupBatch, TransactionBatch};
use crate::bus::{Bus, BusSubscriber, Record};
use crate::errors::{Error, Result};
use crate::event::Event;
use crate::schema::{payload_schema, AttrSchema, TopicKind, TopicMeta};
use crate::storage::{StorageHandle, StorageOptions};
use crate::transaction::{Transaction, TransactionGroup};
use crate::value::{AttrType, AttrValue};

/// Default row threshold before a topic buffer flushes on its own.
const DEFAULT_FLUSH_THRESHOLD: usize = 16_384;

enum ColumnBuilder {
    UInt(UInt64Builder),
    Bool(BooleanBuilder),
    Str(StringBuilder),
}

impl ColumnBuilder {
    fn for_type(ty: AttrType, capacity: usize) -> Self {
        match ty {
            AttrType::UInt => ColumnBuilder::UInt(UInt64Builder::with_capacity(capacity)),
            AttrType::Bool => ColumnBuilder::Bool(BooleanBuilder::with_capacity(capacity)),
            AttrType::Str => {
                ColumnBuilder::Str(StringBuilder::with_capacity(capacity, capacity * 8))
            }
        }
    }

    fn append(&mut self, value: Option<&AttrValue>) {
        match (self, value) {
            (ColumnBuilder::UInt(b), Some(AttrValue::UInt(v))) => b.append_value(*v),
            (ColumnBuilder::Bool(b), Some(AttrValue::Bool(v))) => b.append_value(*v),
            (ColumnBuilder::Str(b), Some(AttrValue::Str(v))) => b.append_value(v),
            // type agreement is enforced when the schema union is built,
            // so a residual mismatch can only mean "absent"
            (ColumnBuilder::UInt(b), _) => b.append_null(),
            (ColumnBuilder::Bool(b), _) => b.append_null(),
            (ColumnBuilder::Str(b), _) => b.append_null(),
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            ColumnBuilder::UInt(b) => Arc::new(b.finish()),
            ColumnBuilder::Bool(b) => Arc::new(b.finish()),
            ColumnBuilder::Str(b) => Arc::new(b.finish()),
        }
    }
}

struct TopicBuffer {
    kind: TopicKind,
    pending: Vec<Record>,
    pending_rows: usize,
    event_schema: AttrSchema,
    txn_schema: AttrSchema,
    /// Arrow schema, locked by the first physical write.
    locked: Option<Arc<Schema>>,
    writer: Option<ArrowWriter<File>>,
    payload: String,
    records_written: u64,
    min_time: u64,
    max_time: u64,
    seen_time: bool,
}

impl TopicBuffer {
    fn new(kind: TopicKind, topic: &str) -> Self {
        Self {
            kind,
            pending: Vec::new(),
            pending_rows: 0,
            event_schema: AttrSchema::new(),
            txn_schema: AttrSchema::new(),
            locked: None,
            writer: None,
            payload: format!("{topic}.parquet"),
            records_written: 0,
            min_time: u64::MAX,
            max_time: 0,
            seen_time: false,
        }
    }

    fn observe_event(&mut self, topic: &str, event: &Event) -> Result<()> {
        for (name, value) in event.values().iter() {
            if self.locked.is_some() && !self.event_schema.contains(name) {
                return Err(Error::SchemaMismatch {
                    topic: topic.to_string(),
                    attr: name.to_string(),
                });
            }
            self.event_schema.observe(topic, name, value.attr_type())?;
        }
        let time = event.time();
        self.min_time = self.min_time.min(time);
        self.max_time = self.max_time.max(time);
        self.seen_time = true;
        Ok(())
    }

    fn observe_transaction(&mut self, topic: &str, txn: &Transaction) -> Result<()> {
        if txn.is_empty() {
            return Err(Error::EmptyRecord {
                topic: topic.to_string(),
            });
        }
        for (name, value) in txn.values().iter() {
            if self.locked.is_some() && !self.txn_schema.contains(name) {
                return Err(Error::SchemaMismatch {
                    topic: topic.to_string(),
                    attr: name.to_string(),
                });
            }
            self.txn_schema.observe(topic, name, value.attr_type())?;
        }
        for event in txn.iter() {
            self.observe_event(topic, event)?;
        }
        Ok(())
    }
}

struct SerializerCore {
    storage: StorageHandle,
    threshold: usize,
    props: WriterProperties,
    topics: BTreeMap<String, TopicBuffer>,
    finalized: bool,
}

impl SerializerCore {
    fn on_record(&mut self, topic: &str, record: Record) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        if topic.is_empty() {
            return Err(Error::serialization(topic, "empty topic name"));
        }
        let kind = match record {
            Record::Event(_) => TopicKind::Event,
            Record::Transaction(_) => TopicKind::Transaction,
            Record::Group(_) => TopicKind::Group,
        };
        let buffer = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicBuffer::new(kind, topic));
        if buffer.kind != kind {
            return Err(Error::KindConflict {
                topic: topic.to_string(),
                existing: buffer.kind.kind_name(),
            });
        }

        let rows = match &record {
            Record::Event(event) => {
                buffer.observe_event(topic, event)?;
                1
            }
            Record::Transaction(txn) => {
                buffer.observe_transaction(topic, txn)?;
                txn.len()
            }
            Record::Group(group) => {
                if group.is_empty() {
                    return Err(Error::EmptyRecord {
                        topic: topic.to_string(),
                    });
                }
                for txn in group.iter() {
                    buffer.observe_transaction(topic, txn)?;
                }
                group.iter().map(|t| t.len()).sum()
            }
        };
        buffer.pending.push(record);
        buffer.pending_rows += rows;

        if buffer.pending_rows >= self.threshold {
            self.flush_topic(topic)?;
        }
        Ok(())
    }

    fn flush_topic(&mut self, topic: &str) -> Result<()> {
        let Some(buffer) = self.topics.get_mut(topic) else {
            return Ok(());
        };
        if buffer.pending.is_empty() {
            return Ok(());
        }

        let schema = match &buffer.locked {
            Some(schema) => schema.clone(),
            None => {
                let schema =
                    payload_schema(buffer.kind, &buffer.event_schema, &buffer.txn_schema);
                buffer.locked = Some(schema.clone());
                schema
            }
        };

        let batch = build_rows(buffer, &schema).map_err(|e| Error::serialization(topic, e))?;

        if buffer.writer.is_none() {
            let path = self.storage.path_for(&buffer.payload);
            let file = File::create(&path).map_err(|e| Error::serialization(topic, e))?;
            let writer = ArrowWriter::try_new(file, schema.clone(), Some(self.props.clone()))
                .map_err(|e| Error::serialization(topic, e))?;
            buffer.writer = Some(writer);
        }
        let writer = buffer.writer.as_mut().expect("writer created above");
        writer
            .write(&batch)
            .map_err(|e| Error::serialization(topic, e))?;

        debug!(topic, rows = batch.num_rows(), "flushed topic buffer");
        buffer.records_written += buffer.pending.len() as u64;
        buffer.pending.clear();
        buffer.pending_rows = 0;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        let topics: Vec<String> = self.topics.keys().cloned().collect();
        let mut first_error = None;
        for topic in topics {
            if let Err(e) = self.flush_topic(&topic) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let flush_result = self.flush_all();
        let mut first_error = None;

        for (topic, buffer) in self.topics.iter_mut() {
            let Some(writer) = buffer.writer.take() else {
                continue;
            };
            // the sidecar is written only after its payload closed cleanly
            if let Err(e) = writer.close() {
                first_error.get_or_insert(Error::serialization(topic, e));
                continue;
            }
            let meta = TopicMeta::new(
                topic,
                buffer.kind,
                buffer.payload.clone(),
                buffer.records_written,
                if buffer.seen_time { buffer.min_time } else { 0 },
                buffer.max_time,
                &buffer.event_schema,
            );
            let sidecar = self.storage.path_for(&format!("{topic}.json"));
            let write = serde_json::to_string_pretty(&meta)
                .map_err(Error::from)
                .and_then(|body| fs::write(&sidecar, body).map_err(Error::from));
            if let Err(e) = write {
                first_error.get_or_insert(Error::serialization(topic, e));
            }
        }
        self.finalized = true;

        flush_result?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn build_rows(buffer: &TopicBuffer, schema: &Arc<Schema>) -> Result<RecordBatch> {
    let capacity = buffer.pending_rows.max(1);
    let kind = buffer.kind;

    let mut group_ids = UInt64Builder::with_capacity(capacity);
    let mut txn_ids = UInt64Builder::with_capacity(capacity);
    let mut txn_finished = BooleanBuilder::with_capacity(capacity);
    let mut ids = UInt64Builder::with_capacity(capacity);
    let mut times = UInt64Builder::with_capacity(capacity);
    let mut event_cols: Vec<(String, ColumnBuilder)> = buffer
        .event_schema
        .fields()
        .iter()
        .map(|(name, ty)| (name.clone(), ColumnBuilder::for_type(*ty, capacity)))
        .collect();
    let mut txn_cols: Vec<(String, ColumnBuilder)> = buffer
        .txn_schema
        .fields()
        .iter()
        .map(|(name, ty)| (name.clone(), ColumnBuilder::for_type(*ty, capacity)))
        .collect();

    let mut push_event = |group: Option<&TransactionGroup>,
                          txn: Option<&Transaction>,
                          event: &Event| {
        if let Some(group) = group {
            group_ids.append_value(group.id());
        }
        if let Some(txn) = txn {
            txn_ids.append_value(txn.id());
            txn_finished.append_value(txn.finished());
        }
        ids.append_value(event.id());
        times.append_value(event.time());
        for (name, builder) in event_cols.iter_mut() {
            builder.append(event.try_get(name));
        }
        for (name, builder) in txn_cols.iter_mut() {
            builder.append(txn.and_then(|t| t.try_get_value(name)));
        }
    };

    for record in &buffer.pending {
        match record {
            Record::Event(event) => push_event(None, None, event),
            Record::Transaction(txn) => {
                for event in txn.iter() {
                    push_event(None, Some(txn), event);
                }
            }
            Record::Group(group) => {
                for txn in group.iter() {
                    for event in txn.iter() {
                        push_event(Some(group), Some(txn), event);
                    }
                }
            }
        }
    }

    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    if kind == TopicKind::Group {
        arrays.push(Arc::new(group_ids.finish()));
    }
    if kind != TopicKind::Event {
        arrays.push(Arc::new(txn_ids.finish()));
        arrays.push(Arc::new(txn_finished.finish()));
    }
    arrays.push(Arc::new(ids.finish()));
    arrays.push(Arc::new(times.finish()));
    for (_, builder) in event_cols.iter_mut() {
        arrays.push(builder.finish());
    }
    if kind != TopicKind::Event {
        for (_, builder) in txn_cols.iter_mut() {
            arrays.push(builder.finish());
        }
    }

    Ok(RecordBatch::try_new(schema.clone(), arrays)?)
}

/// Buffered writer handle. Cloning shares the underlying buffers, so the
/// same serializer can subscribe to several topics and still be flushed
/// and finalized from testbench code.
#[derive(Clone)]
pub struct Serializer {
    core: Arc<Mutex<SerializerCore>>,
}

struct SerializerNode {
    core: Arc<Mutex<SerializerCore>>,
}

impl BusSubscriber for SerializerNode {
    fn on_record(&mut self, topic: &str, record: Record) -> Result<()> {
        self.core.lock().unwrap().on_record(topic, record)
    }

    fn flush(&mut self) -> Result<()> {
        self.core.lock().unwrap().flush_all()
    }
}

impl Serializer {
    /// Resolve the storage handle and hold it for this instance's
    /// lifetime.
    pub fn new(options: StorageOptions) -> Result<Self> {
        Self::with_flush_threshold(options, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_flush_threshold(options: StorageOptions, threshold: usize) -> Result<Self> {
        let storage = StorageHandle::open(&options)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::ZSTD(Default::default()))
            .set_max_row_group_size(1_000_000)
            .build();
        Ok(Self {
            core: Arc::new(Mutex::new(SerializerCore {
                storage,
                threshold: threshold.max(1),
                props,
                topics: BTreeMap::new(),
                finalized: false,
            })),
        })
    }

    /// Subscribe this serializer to a topic pattern — the pass-through
    /// feed used for raw event topics or for a tracker's output.
    pub fn connect(&self, bus: &Arc<Bus>, pattern: impl Into<String>) {
        bus.subscribe(
            pattern,
            Arc::new(Mutex::new(SerializerNode {
                core: self.core.clone(),
            })),
        );
    }

    /// Bulk enqueue outside the bus. The batch's name is its topic.
    pub fn serialize_events(&self, batch: &EventBatch) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        for event in batch.iter() {
            core.on_record(batch.name(), Record::Event(event.clone()))?;
        }
        Ok(())
    }

    pub fn serialize_transactions(&self, batch: &TransactionBatch) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        for txn in batch.iter() {
            core.on_record(batch.name(), Record::Transaction(txn.clone()))?;
        }
        Ok(())
    }

    pub fn serialize_groups(&self, batch: &GroupBatch) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        for group in batch.iter() {
            core.on_record(batch.name(), Record::Group(group.clone()))?;
        }
        Ok(())
    }

    /// Partial write of every buffered topic; topics stay open for more
    /// records.
    pub fn flush(&self) -> Result<()> {
        self.core.lock().unwrap().flush_all()
    }

    /// Terminal flush: close payloads, then write sidecars. Afterwards the
    /// serializer rejects records.
    pub fn finalize(&self) -> Result<()> {
        self.core.lock().unwrap().finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_with(time: u64, v: u64) -> Event {
        let mut e = Event::at(time);
        e.add_value("v", v);
        e
    }

    #[test]
    fn events_persist_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
        let mut batch = EventBatch::named("ev");
        for i in 0..100 {
            batch.append(event_with(i, i));
        }
        serializer.serialize_events(&batch).unwrap();
        serializer.finalize().unwrap();

        assert!(dir.path().join("ev.parquet").exists());
        let sidecar = fs::read_to_string(dir.path().join("ev.json")).unwrap();
        let meta: TopicMeta = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(meta.name, "ev");
        assert_eq!(meta.meta_type, "event");
        assert_eq!(meta.count, 100);
        assert_eq!(meta.max_time, 99);
        assert_eq!(meta.schema, vec![("v".to_string(), "uint".to_string())]);
    }

    #[test]
    fn empty_transactions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
        let mut batch = TransactionBatch::named("t");
        batch.append(Transaction::named("t"));
        assert!(matches!(
            serializer.serialize_transactions(&batch),
            Err(Error::EmptyRecord { .. })
        ));
    }

    #[test]
    fn records_after_finalize_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
        serializer.finalize().unwrap();
        let mut batch = EventBatch::named("ev");
        batch.append(Event::new());
        assert!(matches!(
            serializer.serialize_events(&batch),
            Err(Error::Finalized)
        ));
    }

    #[test]
    fn kind_conflicts_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let serializer = Serializer::new(StorageOptions::local(dir.path())).unwrap();
        let mut events = EventBatch::named("t");
        events.append(Event::new());
        serializer.serialize_events(&events).unwrap();

        let mut txns = TransactionBatch::named("t");
        let mut txn = Transaction::named("t");
        txn.add_event(Event::new());
        txns.append(txn);
        assert!(matches!(
            serializer.serialize_transactions(&txns),
            Err(Error::KindConflict { .. })
        ));
    }

    #[test]
    fn new_attribute_after_lock_is_a_schema_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        // threshold 1: every record triggers a physical write
        let serializer =
            Serializer::with_flush_threshold(StorageOptions::local(dir.path()), 1).unwrap();
        let mut first = EventBatch::named("ev");
        first.append(event_with(0, 0));
        serializer.serialize_events(&first).unwrap();

        let mut second = EventBatch::named("ev");
        let mut e = Event::at(1);
        e.add_value("late", true);
        second.append(e);
        assert!(matches!(
            serializer.serialize_events(&second),
            Err(Error::SchemaMismatch { .. })
        ));
    }
}
