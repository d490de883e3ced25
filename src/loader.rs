//! Reconstructing queryable streams from persisted topics.
//!
//! Construction scans a storage location for metadata sidecars and builds
//! the topic index eagerly; payloads are opened and decoded lazily, once
//! per topic, and shared behind an `Arc` so checker workers can read them
//! without copies. Malformed sidecars and sidecars whose payload has gone
//! missing are skipped with a warning — a load only fails outright when a
//! sidecar declares an empty topic name. The loader never mutates storage.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arrow::array::{Array, BooleanArray, RecordBatch, StringArray, UInt64Array};
use arrow::compute::concat_batches;
use arrow::datatypes::DataType;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tracing::warn;

use crate::batch::EventBatch;
use crate::bus::Record;
use crate::errors::{Error, Result};
use crate::event::{Event, ID_NAME, TIME_NAME};
use crate::schema::{
    AttrSchema, TopicKind, TopicMeta, GROUP_ID_COL, TXN_ATTR_PREFIX, TXN_FINISHED_COL, TXN_ID_COL,
};
use crate::storage::{StorageHandle, StorageOptions};
use crate::stream::Stream;
use crate::transaction::{Transaction, TransactionGroup};
use crate::value::{AttrMap, AttrType, AttrValue};

/// Decoded columnar payload for one topic: the concatenated record batch
/// plus the row ranges of each top-level record.
pub(crate) struct TopicTable {
    topic: String,
    kind: TopicKind,
    batch: RecordBatch,
    bounds: Vec<(usize, usize)>,
    id_col: usize,
    time_col: usize,
    txn_id_col: Option<usize>,
    txn_finished_col: Option<usize>,
    group_id_col: Option<usize>,
    event_attrs: Vec<(String, usize, AttrType)>,
    txn_attrs: Vec<(String, usize, AttrType)>,
}

fn attr_type_of(data_type: &DataType) -> Option<AttrType> {
    match data_type {
        DataType::UInt64 => Some(AttrType::UInt),
        DataType::Boolean => Some(AttrType::Bool),
        DataType::Utf8 => Some(AttrType::Str),
        _ => None,
    }
}

impl TopicTable {
    fn from_batch(topic: &str, kind: TopicKind, batch: RecordBatch) -> Result<Self> {
        let mut id_col = None;
        let mut time_col = None;
        let mut txn_id_col = None;
        let mut txn_finished_col = None;
        let mut group_id_col = None;
        let mut event_attrs = Vec::new();
        let mut txn_attrs = Vec::new();

        for (idx, field) in batch.schema().fields().iter().enumerate() {
            match field.name().as_str() {
                ID_NAME => id_col = Some(idx),
                TIME_NAME => time_col = Some(idx),
                TXN_ID_COL => txn_id_col = Some(idx),
                TXN_FINISHED_COL => txn_finished_col = Some(idx),
                GROUP_ID_COL => group_id_col = Some(idx),
                name => {
                    let Some(ty) = attr_type_of(field.data_type()) else {
                        warn!(topic, column = name, "ignoring column with foreign type");
                        continue;
                    };
                    match name.strip_prefix(TXN_ATTR_PREFIX) {
                        Some(attr) => txn_attrs.push((attr.to_string(), idx, ty)),
                        None => event_attrs.push((name.to_string(), idx, ty)),
                    }
                }
            }
        }

        let (Some(id_col), Some(time_col)) = (id_col, time_col) else {
            return Err(Error::serialization(topic, "payload lacks id/time columns"));
        };

        let mut table = Self {
            topic: topic.to_string(),
            kind,
            batch,
            bounds: Vec::new(),
            id_col,
            time_col,
            txn_id_col,
            txn_finished_col,
            group_id_col,
            event_attrs,
            txn_attrs,
        };
        table.bounds = table.build_bounds()?;
        Ok(table)
    }

    /// Row ranges of the top-level records, in persisted order. Events are
    /// one row each; transactions split on `txn_id` changes; groups on
    /// `group_id` changes.
    fn build_bounds(&self) -> Result<Vec<(usize, usize)>> {
        let rows = self.batch.num_rows();
        let boundary_col = match self.kind {
            TopicKind::Event => {
                return Ok((0..rows).map(|i| (i, i + 1)).collect());
            }
            TopicKind::Transaction => self.require(self.txn_id_col, TXN_ID_COL)?,
            TopicKind::Group => self.require(self.group_id_col, GROUP_ID_COL)?,
        };
        Ok(split_on_change(self.u64_column(boundary_col)?, 0, rows))
    }

    fn require(&self, col: Option<usize>, name: &str) -> Result<usize> {
        col.ok_or_else(|| Error::serialization(&self.topic, format!("missing {name} column")))
    }

    fn u64_column(&self, col: usize) -> Result<&UInt64Array> {
        self.batch
            .column(col)
            .as_any()
            .downcast_ref::<UInt64Array>()
            .ok_or_else(|| Error::serialization(&self.topic, "unexpected column type"))
    }

    fn bool_column(&self, col: usize) -> Result<&BooleanArray> {
        self.batch
            .column(col)
            .as_any()
            .downcast_ref::<BooleanArray>()
            .ok_or_else(|| Error::serialization(&self.topic, "unexpected column type"))
    }

    fn attr_at(&self, col: usize, ty: AttrType, row: usize) -> Option<AttrValue> {
        let array = self.batch.column(col);
        if array.is_null(row) {
            return None;
        }
        match ty {
            AttrType::UInt => array
                .as_any()
                .downcast_ref::<UInt64Array>()
                .map(|a| AttrValue::UInt(a.value(row))),
            AttrType::Bool => array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .map(|a| AttrValue::Bool(a.value(row))),
            AttrType::Str => array
                .as_any()
                .downcast_ref::<StringArray>()
                .map(|a| AttrValue::Str(a.value(row).to_string())),
        }
    }

    pub(crate) fn kind(&self) -> TopicKind {
        self.kind
    }

    pub(crate) fn record_count(&self) -> usize {
        self.bounds.len()
    }

    fn decode_event(&self, row: usize) -> Result<Event> {
        let id = self.u64_column(self.id_col)?.value(row);
        let time = self.u64_column(self.time_col)?.value(row);
        let mut values = AttrMap::new();
        for (name, col, ty) in &self.event_attrs {
            if let Some(value) = self.attr_at(*col, *ty, row) {
                values.set(name.clone(), value);
            }
        }
        Ok(Event::from_parts(id, time, values))
    }

    fn decode_transaction(&self, start: usize, end: usize) -> Result<Transaction> {
        let txn_id_col = self.require(self.txn_id_col, TXN_ID_COL)?;
        let id = self.u64_column(txn_id_col)?.value(start);
        let finished = match self.txn_finished_col {
            Some(col) => self.bool_column(col)?.value(start),
            None => true,
        };
        let mut values = AttrMap::new();
        for (name, col, ty) in &self.txn_attrs {
            if let Some(value) = self.attr_at(*col, *ty, start) {
                values.set(name.clone(), value);
            }
        }
        let mut events = Vec::with_capacity(end - start);
        for row in start..end {
            events.push(Arc::new(self.decode_event(row)?));
        }
        Ok(Transaction::from_parts(
            id,
            self.topic.clone(),
            values,
            events,
            finished,
        ))
    }

    fn decode_group(&self, start: usize, end: usize) -> Result<TransactionGroup> {
        let group_id_col = self.require(self.group_id_col, GROUP_ID_COL)?;
        let id = self.u64_column(group_id_col)?.value(start);
        let txn_id_col = self.require(self.txn_id_col, TXN_ID_COL)?;
        let mut transactions = Vec::new();
        for (txn_start, txn_end) in split_on_change(self.u64_column(txn_id_col)?, start, end) {
            transactions.push(Arc::new(self.decode_transaction(txn_start, txn_end)?));
        }
        Ok(TransactionGroup::from_parts(
            id,
            self.topic.clone(),
            transactions,
        ))
    }

    /// Decode the `index`-th top-level record. Only the rows of that record
    /// are touched.
    pub(crate) fn decode(&self, index: usize) -> Result<Record> {
        let (start, end) = self.bounds[index];
        match self.kind {
            TopicKind::Event => Ok(Record::Event(Arc::new(self.decode_event(start)?))),
            TopicKind::Transaction => Ok(Record::Transaction(Arc::new(
                self.decode_transaction(start, end)?,
            ))),
            TopicKind::Group => Ok(Record::Group(Arc::new(self.decode_group(start, end)?))),
        }
    }
}

/// Split `[start, end)` into runs of equal values.
fn split_on_change(ids: &UInt64Array, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut run_start = start;
    for row in start..end {
        if row > start && ids.value(row) != ids.value(row - 1) {
            bounds.push((run_start, row));
            run_start = row;
        }
    }
    if run_start < end {
        bounds.push((run_start, end));
    }
    bounds
}

/// One indexed topic: its sidecar plus the lazily decoded payload.
pub(crate) struct TopicEntry {
    pub(crate) meta: TopicMeta,
    kind: TopicKind,
    payload_path: PathBuf,
    table: Mutex<Option<Arc<TopicTable>>>,
}

impl TopicEntry {
    pub(crate) fn kind(&self) -> TopicKind {
        self.kind
    }

    /// Decode the payload on first access; later calls share the table.
    pub(crate) fn table(&self) -> Result<Arc<TopicTable>> {
        let mut slot = self.table.lock().unwrap();
        if let Some(table) = slot.as_ref() {
            return Ok(table.clone());
        }
        let file = File::open(&self.payload_path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let reader = builder.build()?;
        let mut batches = Vec::new();
        for batch in reader {
            batches.push(batch?);
        }
        let batch = if batches.is_empty() {
            RecordBatch::new_empty(schema)
        } else {
            concat_batches(&schema, &batches)?
        };
        let table = Arc::new(TopicTable::from_batch(&self.meta.name, self.kind, batch)?);
        *slot = Some(table.clone());
        Ok(table)
    }
}

/// Metadata-indexed reader over one storage location.
pub struct Loader {
    #[allow(dead_code)]
    storage: StorageHandle,
    topics: HashMap<String, Arc<TopicEntry>>,
}

impl Loader {
    /// Scan `options` for metadata sidecars and build the topic index.
    pub fn new(options: StorageOptions) -> Result<Self> {
        let storage = StorageHandle::open_existing(&options)?;
        let mut topics = HashMap::new();

        let mut paths: Vec<PathBuf> = fs::read_dir(storage.root())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let body = match fs::read_to_string(&path) {
                Ok(body) => body,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unreadable sidecar");
                    continue;
                }
            };
            let meta: TopicMeta = match serde_json::from_str(&body) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping malformed sidecar");
                    continue;
                }
            };
            if meta.name.is_empty() {
                return Err(Error::InvalidTopicName { path });
            }
            let Some(kind) = meta.kind() else {
                warn!(path = %path.display(), meta_type = %meta.meta_type,
                      "skipping sidecar with unknown record type");
                continue;
            };
            let payload_path = storage.path_for(&meta.parquet);
            if !payload_path.is_file() {
                warn!(path = %path.display(), payload = %meta.parquet,
                      "skipping sidecar whose payload is missing");
                continue;
            }
            if topics.contains_key(&meta.name) {
                warn!(topic = %meta.name, "duplicate sidecar for topic, keeping first");
                continue;
            }
            topics.insert(
                meta.name.clone(),
                Arc::new(TopicEntry {
                    kind,
                    payload_path,
                    table: Mutex::new(None),
                    meta,
                }),
            );
        }

        Ok(Self { storage, topics })
    }

    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::new(StorageOptions::local(path))
    }

    /// Topic names in the index, sorted.
    pub fn topics(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.topics.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn metadata(&self, topic: &str) -> Option<&TopicMeta> {
        self.topics.get(topic).map(|entry| &entry.meta)
    }

    fn entry(&self, topic: &str) -> Result<&Arc<TopicEntry>> {
        self.topics.get(topic).ok_or_else(|| Error::UnknownTopic {
            topic: topic.to_string(),
        })
    }

    /// Stored event attribute schema for a topic, for diagnostics and
    /// tooling.
    pub fn event_schema(&self, topic: &str) -> Result<AttrSchema> {
        Ok(self.entry(topic)?.meta.event_schema())
    }

    /// Stream over a transaction-bearing topic. Flat event topics are not
    /// streamable; fetch those with [`Loader::events`].
    pub fn stream(&self, topic: &str) -> Result<Stream> {
        let entry = self.entry(topic)?;
        if entry.kind() == TopicKind::Event {
            return Err(Error::NotTransactionTopic {
                topic: topic.to_string(),
            });
        }
        Ok(Stream::whole(entry.clone()))
    }

    /// Stream restricted to the half-open record range `[start, end)`.
    pub fn stream_range(&self, topic: &str, start: usize, end: usize) -> Result<Stream> {
        let stream = self.stream(topic)?;
        Ok(stream.range(start, end))
    }

    /// Materialize every persisted event row of a topic, in persisted
    /// order. For transaction and group topics this flattens the nesting.
    pub fn events(&self, topic: &str) -> Result<EventBatch> {
        let entry = self.entry(topic)?;
        let table = entry.table()?;
        let mut batch = EventBatch::named(topic);
        for row in 0..table.batch.num_rows() {
            batch.append(table.decode_event(row)?);
        }
        Ok(batch)
    }
}
