//! Dynamically-typed attribute values.
//!
//! Events and transactions carry an ordered set of named scalar values. The
//! set of value types is closed (unsigned integer, boolean, string) so that
//! every attribute maps onto exactly one Arrow column type when a topic is
//! persisted.

use std::fmt;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::errors::{Error, Result};

/// A single tagged attribute scalar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    UInt(u64),
    Bool(bool),
    Str(String),
}

/// The column type an [`AttrValue`] persists as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    UInt,
    Bool,
    Str,
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::UInt(_) => AttrType::UInt,
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::Str(_) => AttrType::Str,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            AttrValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

impl AttrType {
    /// Stable name used in metadata sidecars.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrType::UInt => "uint",
            AttrType::Bool => "bool",
            AttrType::Str => "string",
        }
    }

    pub fn from_type_name(name: &str) -> Option<AttrType> {
        match name {
            "uint" => Some(AttrType::UInt),
            "bool" => Some(AttrType::Bool),
            "string" => Some(AttrType::Str),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::UInt(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
            AttrValue::Str(v) => write!(f, "{v}"),
        }
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::UInt(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::UInt(v as u64)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

/// Name→value mapping that preserves insertion order.
///
/// Attribute counts are small (a handful per event), so lookups walk the
/// backing vector rather than maintaining a side index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttrMap {
    entries: Vec<(String, AttrValue)>,
}

impl AttrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new attribute. Returns `false` without modifying the map if
    /// the name is already present.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.entries.push((name, value.into()));
        true
    }

    /// Insert or overwrite. An overwrite keeps the attribute's original
    /// position in the order.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) {
        let name = name.into();
        let value = value.into();
        for (existing, slot) in self.entries.iter_mut() {
            if *existing == name {
                *slot = value;
                return;
            }
        }
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Result<&AttrValue> {
        self.try_get(name).ok_or_else(|| Error::AttributeNotFound {
            name: name.to_string(),
        })
    }

    pub fn try_get(&self, name: &str) -> Option<&AttrValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AttrValue::UInt(v) => serializer.serialize_u64(*v),
            AttrValue::Bool(v) => serializer.serialize_bool(*v),
            AttrValue::Str(v) => serializer.serialize_str(v),
        }
    }
}

impl Serialize for AttrMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_rejects_duplicates() {
        let mut map = AttrMap::new();
        assert!(map.add("a", 1u64));
        assert!(!map.add("a", 2u64));
        assert_eq!(map.get("a").unwrap().as_uint(), Some(1));
    }

    #[test]
    fn set_keeps_position() {
        let mut map = AttrMap::new();
        map.add("a", 1u64);
        map.add("b", true);
        map.set("a", 3u64);
        let names: Vec<_> = map.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(map.get("a").unwrap().as_uint(), Some(3));
    }

    #[test]
    fn missing_attribute_is_an_error() {
        let map = AttrMap::new();
        match map.get("nope") {
            Err(Error::AttributeNotFound { name }) => assert_eq!(name, "nope"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn type_names_round_trip() {
        for ty in [AttrType::UInt, AttrType::Bool, AttrType::Str] {
            assert_eq!(AttrType::from_type_name(ty.type_name()), Some(ty));
        }
        assert_eq!(AttrType::from_type_name("float"), None);
    }
}
