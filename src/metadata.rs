//! Call metadata (request headers, response headers, trailers).
//!
//! Metadata is an ordered list; duplicate names are allowed and order is
//! preserved end to end. Keys ending in `-bin` conventionally carry binary
//! values, but the value kind is stored explicitly on every entry and the
//! wire format carries its own discriminator.

use bytes::Bytes;

/// Value of a metadata entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataValue {
    Text(String),
    Binary(Bytes),
}

/// A single `name: value` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    name: String,
    value: MetadataValue,
}

impl MetadataEntry {
    pub fn new(name: impl Into<String>, value: MetadataValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MetadataValue::Text(value.into()))
    }

    pub fn binary(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(name, MetadataValue::Binary(value.into()))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn value(&self) -> &MetadataValue {
        &self.value
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self.value, MetadataValue::Binary(_))
    }
}

/// Ordered collection of metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<MetadataEntry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text entry.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.entries.push(MetadataEntry::text(name, value));
        self
    }

    /// Append a binary entry.
    pub fn add_bytes(&mut self, name: impl Into<String>, value: impl Into<Bytes>) -> &mut Self {
        self.entries.push(MetadataEntry::binary(name, value));
        self
    }

    pub fn push(&mut self, entry: MetadataEntry) {
        self.entries.push(entry);
    }

    /// First entry with the given name.
    pub fn get(&self, name: &str) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// First text value with the given name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.entries.iter().find_map(|e| match &e.value {
            MetadataValue::Text(v) if e.name == name => Some(v.as_str()),
            _ => None,
        })
    }

    /// First binary value with the given name.
    pub fn get_bytes(&self, name: &str) -> Option<&Bytes> {
        self.entries.iter().find_map(|e| match &e.value {
            MetadataValue::Binary(v) if e.name == name => Some(v),
            _ => None,
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MetadataEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extend(&mut self, other: &Metadata) {
        self.entries.extend(other.entries.iter().cloned());
    }
}

impl FromIterator<MetadataEntry> for Metadata {
    fn from_iter<I: IntoIterator<Item = MetadataEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Metadata {
    type Item = &'a MetadataEntry;
    type IntoIter = std::slice::Iter<'a, MetadataEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Metadata {
    type Item = MetadataEntry;
    type IntoIter = std::vec::IntoIter<MetadataEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
