//! The HPACK indexing tables (RFC 7541 §2.3).
//!
//! One logical index space: entries 1..=61 come from the constant static
//! table, entries 62.. from the dynamic table, newest first. The dynamic
//! table is a bounded ring: every entry is accounted as
//! `32 + |name| + |value|` octets and insertion evicts the oldest entries
//! until the accounted size fits the maximum again.

use std::collections::VecDeque;

use bytes::Bytes;

use super::DecoderError;

/// Per-entry overhead charged by RFC 7541 §4.1.
pub(crate) const ENTRY_OVERHEAD: usize = 32;

/// A decoded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: Bytes,
    pub value: Bytes,
    /// Carried the never-indexed literal representation; must not be
    /// stored in any table when re-encoded.
    pub sensitive: bool,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    #[must_use]
    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }

    /// The octets this field accounts for in a dynamic table.
    #[must_use]
    pub fn table_size(&self) -> usize {
        ENTRY_OVERHEAD + self.name.len() + self.value.len()
    }
}

/// RFC 7541 Appendix A.
#[rustfmt::skip]
pub(crate) const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// The bounded dynamic table.
#[derive(Debug)]
pub struct DynamicTable {
    /// Front is the most recently inserted entry.
    entries: VecDeque<Field>,
    /// Accounted octets currently stored.
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies a new maximum, evicting until the current contents fit.
    pub fn resize(&mut self, new_max: usize) {
        self.max_size = new_max;
        self.evict_to(new_max);
    }

    /// Inserts a field, evicting oldest entries to make room. A field
    /// larger than the whole table empties it and is not inserted
    /// (RFC 7541 §4.4).
    pub fn insert(&mut self, field: Field) {
        let needed = field.table_size();
        if needed > self.max_size {
            tracing::trace!(needed, max = self.max_size, "oversized entry clears table");
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - needed);
        self.size += needed;
        self.entries.push_front(field);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            let Some(evicted) = self.entries.pop_back() else {
                debug_assert!(self.size == 0);
                break;
            };
            self.size -= evicted.table_size();
        }
    }

    /// Looks up a 1-based index in the combined static + dynamic space.
    pub fn get(&self, index: usize) -> Result<Field, DecoderError> {
        if index == 0 {
            return Err(DecoderError::InvalidTableIndex);
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok(Field::new(
                Bytes::from_static(name.as_bytes()),
                Bytes::from_static(value.as_bytes()),
            ));
        }
        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(DecoderError::InvalidTableIndex)
    }

    /// Iterates dynamic entries, newest first, with their global indices.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &Field)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, f)| (STATIC_TABLE.len() + 1 + i, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        let table = DynamicTable::new(4096);
        let f = table.get(2).unwrap();
        assert_eq!(&f.name[..], b":method");
        assert_eq!(&f.value[..], b"GET");
        let f = table.get(61).unwrap();
        assert_eq!(&f.name[..], b"www-authenticate");
    }

    #[test]
    fn index_zero_and_past_end_fail() {
        let table = DynamicTable::new(4096);
        assert_eq!(table.get(0), Err(DecoderError::InvalidTableIndex));
        assert_eq!(table.get(62), Err(DecoderError::InvalidTableIndex));
    }

    #[test]
    fn dynamic_entries_index_newest_first() {
        let mut table = DynamicTable::new(4096);
        table.insert(Field::new(&b"a"[..], &b"1"[..]));
        table.insert(Field::new(&b"b"[..], &b"2"[..]));
        assert_eq!(&table.get(62).unwrap().name[..], b"b");
        assert_eq!(&table.get(63).unwrap().name[..], b"a");
        assert_eq!(table.size(), 2 * (32 + 2));
    }

    #[test]
    fn insert_evicts_oldest() {
        // Room for exactly two 34-octet entries.
        let mut table = DynamicTable::new(68);
        table.insert(Field::new(&b"a"[..], &b"1"[..]));
        table.insert(Field::new(&b"b"[..], &b"2"[..]));
        table.insert(Field::new(&b"c"[..], &b"3"[..]));
        assert_eq!(table.len(), 2);
        assert_eq!(&table.get(62).unwrap().name[..], b"c");
        assert_eq!(&table.get(63).unwrap().name[..], b"b");
        assert_eq!(table.get(64), Err(DecoderError::InvalidTableIndex));
    }

    #[test]
    fn oversized_entry_clears_without_inserting() {
        let mut table = DynamicTable::new(40);
        table.insert(Field::new(&b"a"[..], &b"1"[..]));
        let big_value = vec![b'x'; 64];
        table.insert(Field::new(&b"big"[..], big_value));
        assert!(table.is_empty());
        assert_eq!(table.size(), 0);
    }

    #[test]
    fn resize_evicts() {
        let mut table = DynamicTable::new(4096);
        table.insert(Field::new(&b"a"[..], &b"1"[..]));
        table.insert(Field::new(&b"b"[..], &b"2"[..]));
        table.resize(34);
        assert_eq!(table.len(), 1);
        assert_eq!(&table.get(62).unwrap().name[..], b"b");
        table.resize(0);
        assert!(table.is_empty());
    }
}
