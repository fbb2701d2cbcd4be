//! Multi-value maps holding the parsed form.

use std::{fmt, slice, vec};

use crate::file::UploadedFile;

/// Decoded plain form fields.
pub type FieldMap = MultiValueMap<String>;

/// Uploaded files, keyed by form field name.
pub type FileMap = MultiValueMap<UploadedFile>;

/// Plain fields and uploaded files of a multipart request.
pub type ParsedForm = (FieldMap, FileMap);

/// An insertion-ordered map that keeps every value given for a repeated key.
pub struct MultiValueMap<V> {
    entries: Vec<(String, V)>,
}

impl<V> MultiValueMap<V> {
    /// Constructs an empty map.
    pub fn new() -> Self {
        MultiValueMap {
            entries: Vec::new(),
        }
    }

    /// Appends a value, keeping values already stored under `key`.
    pub fn append(&mut self, key: impl Into<String>, value: V) {
        self.entries.push((key.into(), value));
    }

    /// Returns the last value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Returns every value stored under `key`, in the order they were received.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a V> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Removes and returns every value stored under `key`.
    pub fn remove(&mut self, key: &str) -> Vec<V> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());

        for (k, v) in self.entries.drain(..) {
            if k == key {
                removed.push(v);
            } else {
                kept.push((k, v));
            }
        }

        self.entries = kept;
        removed
    }

    /// Returns true if at least one value is stored under `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Returns the number of stored values, counting repeats.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map holds no values.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all key-value pairs in insertion order.
    pub fn iter(&self) -> slice::Iter<'_, (String, V)> {
        self.entries.iter()
    }
}

impl<V> Default for MultiValueMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: fmt::Debug> fmt::Debug for MultiValueMap<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

impl<V> IntoIterator for MultiValueMap<V> {
    type Item = (String, V);
    type IntoIter = vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a, V> IntoIterator for &'a MultiValueMap<V> {
    type Item = &'a (String, V);
    type IntoIter = slice::Iter<'a, (String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for MultiValueMap<V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MultiValueMap {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
