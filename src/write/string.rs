use alloc::vec::Vec;

use indexmap::IndexMap;

type HashBuilder = hashbrown::DefaultHashBuilder;

/// A writer for string pool sections.
///
/// Strings are interned on first use and keep a stable byte offset from
/// then on. Offset 0 is always the empty string. Insertion order doubles
/// as the ordinal numbering used by the file name pool.
#[derive(Debug)]
pub(crate) struct StringTable {
    data: Vec<u8>,
    index: IndexMap<Vec<u8>, u32, HashBuilder>,
}

impl StringTable {
    pub(crate) fn new() -> Self {
        StringTable {
            data: vec![0],
            index: IndexMap::with_hasher(HashBuilder::default()),
        }
    }

    /// Intern a string and return its stable byte offset.
    pub(crate) fn add(&mut self, string: &[u8]) -> u32 {
        if string.is_empty() {
            return 0;
        }
        if let Some(&offset) = self.index.get(string) {
            return offset;
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(string);
        self.data.push(0);
        self.index.insert(string.to_vec(), offset);
        offset
    }

    /// Return the offset of an already interned string.
    pub(crate) fn offset_of(&self, string: &[u8]) -> Option<u32> {
        if string.is_empty() {
            return Some(0);
        }
        self.index.get(string).copied()
    }

    /// Return the ordinal of an interned string (position of first use).
    pub(crate) fn ordinal(&self, string: &[u8]) -> Option<usize> {
        self.index.get_index_of(string)
    }

    /// Return the interned string with the given ordinal.
    pub(crate) fn get_ordinal(&self, ordinal: usize) -> Option<&[u8]> {
        self.index.get_index(ordinal).map(|(s, _)| s.as_slice())
    }

    /// The number of interned strings, not counting the implicit empty string.
    pub(crate) fn count(&self) -> usize {
        self.index.len()
    }

    /// The pool bytes, including the leading NUL for offset 0.
    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    /// The pool bytes without the leading NUL.
    ///
    /// The file name pool omits the implicit empty entry so that ordinals
    /// count real names.
    pub(crate) fn names_data(&self) -> &[u8] {
        &self.data[1..]
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}
