//! HPACK header compression, cf. <https://httpwg.org/specs/rfc7541.html>
//!
//! Encoder and decoder each own a [HeaderTable]: the fixed static table
//! followed by a size-bounded dynamic table. The two sides of a connection
//! stay in lock-step as long as every header block is processed in order.

use std::collections::VecDeque;

use tracing::trace;

pub mod decoder;
pub mod encoder;
pub mod huffman;

pub use decoder::{Decoder, DecoderError};
pub use encoder::Encoder;

/// Size every dynamic table entry costs on top of its name and value.
pub const ENTRY_OVERHEAD: usize = 32;

/// Default (and initial) maximum dynamic table size, in octets.
pub const DEFAULT_MAX_TABLE_SIZE: usize = 4096;

/// Size of a header as accounted by the dynamic table and by
/// `SETTINGS_MAX_HEADER_LIST_SIZE`.
pub fn entry_size(name: &[u8], value: &[u8]) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

pub(crate) type StaticTable<'a> = &'a [(&'a [u8], &'a [u8])];

/// The 61-entry static table, indexed from 1, cf. RFC 7541 Appendix A
pub static STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// The dynamic part of the header table: newest entries first.
pub struct DynamicTable {
    table: VecDeque<(Vec<u8>, Vec<u8>)>,
    size: usize,
    max_size: usize,
}

impl Default for DynamicTable {
    fn default() -> Self {
        Self::with_size(DEFAULT_MAX_TABLE_SIZE)
    }
}

impl DynamicTable {
    /// Creates an empty table with the given maximum size.
    pub fn with_size(max_size: usize) -> Self {
        Self {
            table: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Current size of the table, in octets (entry overhead included).
    pub fn get_size(&self) -> usize {
        self.size
    }

    pub fn get_max_table_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Iterates over entries, newest first.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.table.iter().map(|(n, v)| (&n[..], &v[..]))
    }

    /// Returns the entry at the given 0-based position, newest first.
    pub fn get(&self, index: usize) -> Option<(&[u8], &[u8])> {
        self.table.get(index).map(|(n, v)| (&n[..], &v[..]))
    }

    /// Changes the maximum size, evicting the oldest entries as needed.
    pub fn set_max_table_size(&mut self, new_max_size: usize) {
        self.max_size = new_max_size;
        self.consolidate_table();
    }

    /// Inserts a header, evicting the oldest entries until the table fits.
    ///
    /// An entry larger than the whole table empties the table and is not
    /// inserted.
    pub fn add_header(&mut self, name: Vec<u8>, value: Vec<u8>) {
        let size = entry_size(&name, &value);
        if size > self.max_size {
            trace!(%size, max_size = %self.max_size, "entry larger than table, clearing");
            self.table.clear();
            self.size = 0;
            return;
        }

        self.size += size;
        self.table.push_front((name, value));
        self.consolidate_table();
    }

    fn consolidate_table(&mut self) {
        while self.size > self.max_size {
            match self.table.pop_back() {
                Some((name, value)) => {
                    self.size -= entry_size(&name, &value);
                }
                None => {
                    // can't happen, size is zero when the table is empty
                    self.size = 0;
                }
            }
        }
    }
}

/// The combined static + dynamic table, 1-indexed: `1..=61` is the static
/// table, `62..` the dynamic table (newest entry at 62).
pub struct HeaderTable<'a> {
    static_table: StaticTable<'a>,
    pub dynamic_table: DynamicTable,
}

impl<'a> HeaderTable<'a> {
    pub(crate) fn with_static_table(static_table: StaticTable<'a>) -> HeaderTable<'a> {
        HeaderTable {
            static_table,
            dynamic_table: Default::default(),
        }
    }

    /// Returns the entry at the given 1-based index, if any.
    pub fn get_from_table(&self, index: usize) -> Option<(&[u8], &[u8])> {
        let real_index = index.checked_sub(1)?;

        if real_index < self.static_table.len() {
            Some(self.static_table[real_index])
        } else {
            self.dynamic_table.get(real_index - self.static_table.len())
        }
    }

    pub fn add_header(&mut self, name: Vec<u8>, value: Vec<u8>) {
        self.dynamic_table.add_header(name, value);
    }

    /// Finds the best match for the given header. Returns the 1-based index
    /// and whether the value matched too.
    ///
    /// Full matches win over name-only matches; within each kind the static
    /// table is searched before the dynamic one.
    pub fn find_header(&self, header: (&[u8], &[u8])) -> Option<(usize, bool)> {
        let (name, value) = header;
        let dynamic_offset = self.static_table.len() + 1;

        let full_static = self
            .static_table
            .iter()
            .position(|&(n, v)| n == name && v == value)
            .map(|i| i + 1);
        let full_dynamic = || {
            self.dynamic_table
                .iter()
                .position(|(n, v)| n == name && v == value)
                .map(|i| i + dynamic_offset)
        };
        if let Some(index) = full_static.or_else(full_dynamic) {
            return Some((index, true));
        }

        let name_static = self
            .static_table
            .iter()
            .position(|&(n, _)| n == name)
            .map(|i| i + 1);
        let name_dynamic = || {
            self.dynamic_table
                .iter()
                .position(|(n, _)| n == name)
                .map(|i| i + dynamic_offset)
        };
        name_static.or_else(name_dynamic).map(|index| (index, false))
    }
}
