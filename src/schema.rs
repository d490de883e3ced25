//! Topic schemas and metadata sidecars.
//!
//! Each persisted topic is a Parquet payload plus one JSON sidecar. The
//! sidecar names the topic, its record kind, the payload file, and the
//! union of event attribute names/types observed during the run — enough
//! for a loader to size streams and prune time-window queries without
//! opening the payload.
//!
//! Payload column layout is flat and relational, one row per event:
//!
//! - event topic:        `id`, `time`, one nullable column per attribute
//! - transaction topic:  `txn_id`, `txn_finished`, the event columns, and
//!   transaction attributes as `txn.<name>` (repeated on every row)
//! - group topic:        a leading `group_id` column

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::event::{ID_NAME, TIME_NAME};
use crate::value::AttrType;

pub(crate) const TXN_ID_COL: &str = "txn_id";
pub(crate) const GROUP_ID_COL: &str = "group_id";
pub(crate) const TXN_FINISHED_COL: &str = "txn_finished";
pub(crate) const TXN_ATTR_PREFIX: &str = "txn.";

const RESERVED: &[&str] = &[ID_NAME, TIME_NAME, TXN_ID_COL, GROUP_ID_COL, TXN_FINISHED_COL];

/// Record kind carried by a topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicKind {
    Event,
    Transaction,
    Group,
}

impl TopicKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TopicKind::Event => "event",
            TopicKind::Transaction => "transaction",
            TopicKind::Group => "group",
        }
    }

    /// Sidecar `type` value; groups are transaction-typed with the `group`
    /// discriminator set.
    fn meta_type(&self) -> &'static str {
        match self {
            TopicKind::Event => "event",
            TopicKind::Transaction | TopicKind::Group => "transaction",
        }
    }
}

/// Insertion-ordered attribute name→type union.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrSchema {
    fields: Vec<(String, AttrType)>,
}

impl AttrSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed attribute into the union. A name observed with
    /// two different types is a schema conflict.
    pub fn observe(&mut self, topic: &str, name: &str, ty: AttrType) -> Result<()> {
        if RESERVED.contains(&name) || name.starts_with(TXN_ATTR_PREFIX) {
            return Err(Error::SchemaMismatch {
                topic: topic.to_string(),
                attr: name.to_string(),
            });
        }
        match self.fields.iter().find(|(n, _)| n == name) {
            Some((_, existing)) if *existing != ty => Err(Error::SchemaMismatch {
                topic: topic.to_string(),
                attr: name.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.fields.push((name.to_string(), ty));
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn fields(&self) -> &[(String, AttrType)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn to_sidecar(&self) -> Vec<(String, String)> {
        self.fields
            .iter()
            .map(|(n, t)| (n.clone(), t.type_name().to_string()))
            .collect()
    }

    pub(crate) fn from_sidecar(entries: &[(String, String)]) -> Self {
        let fields = entries
            .iter()
            .filter_map(|(n, t)| AttrType::from_type_name(t).map(|ty| (n.clone(), ty)))
            .collect();
        Self { fields }
    }
}

fn attr_data_type(ty: AttrType) -> DataType {
    match ty {
        AttrType::UInt => DataType::UInt64,
        AttrType::Bool => DataType::Boolean,
        AttrType::Str => DataType::Utf8,
    }
}

/// Arrow schema for a topic's payload.
pub(crate) fn payload_schema(
    kind: TopicKind,
    events: &AttrSchema,
    txn_attrs: &AttrSchema,
) -> Arc<Schema> {
    let mut fields = Vec::new();
    if kind == TopicKind::Group {
        fields.push(Field::new(GROUP_ID_COL, DataType::UInt64, false));
    }
    if kind != TopicKind::Event {
        fields.push(Field::new(TXN_ID_COL, DataType::UInt64, false));
        fields.push(Field::new(TXN_FINISHED_COL, DataType::Boolean, false));
    }
    fields.push(Field::new(ID_NAME, DataType::UInt64, false));
    fields.push(Field::new(TIME_NAME, DataType::UInt64, false));
    for (name, ty) in events.fields() {
        fields.push(Field::new(name.as_str(), attr_data_type(*ty), true));
    }
    if kind != TopicKind::Event {
        for (name, ty) in txn_attrs.fields() {
            fields.push(Field::new(
                format!("{TXN_ATTR_PREFIX}{name}"),
                attr_data_type(*ty),
                true,
            ));
        }
    }
    Arc::new(Schema::new(fields))
}

/// One metadata sidecar: the JSON object written next to each payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopicMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub meta_type: String,
    pub parquet: String,
    #[serde(default)]
    pub group: bool,
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub min_time: u64,
    #[serde(default)]
    pub max_time: u64,
    pub schema: Vec<(String, String)>,
}

impl TopicMeta {
    pub(crate) fn new(
        topic: &str,
        kind: TopicKind,
        parquet: String,
        count: u64,
        min_time: u64,
        max_time: u64,
        events: &AttrSchema,
    ) -> Self {
        Self {
            name: topic.to_string(),
            meta_type: kind.meta_type().to_string(),
            parquet,
            group: kind == TopicKind::Group,
            count,
            min_time,
            max_time,
            schema: events.to_sidecar(),
        }
    }

    /// The topic kind, or `None` for an unrecognized `type` value.
    pub fn kind(&self) -> Option<TopicKind> {
        match (self.meta_type.as_str(), self.group) {
            ("event", false) => Some(TopicKind::Event),
            ("transaction", false) => Some(TopicKind::Transaction),
            ("transaction", true) => Some(TopicKind::Group),
            _ => None,
        }
    }

    pub fn event_schema(&self) -> AttrSchema {
        AttrSchema::from_sidecar(&self.schema)
    }
}
