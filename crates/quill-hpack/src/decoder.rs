//! Turns HPACK field blocks back into fields, cf. RFC 7541 sections 5 and 6.
//!
//! Names and values come out as raw octets. Whether they make valid HTTP
//! fields is up to the HTTP/2 engine.
//!
//! ```rust
//! use quill_hpack::Decoder;
//!
//! let mut decoder = Decoder::new();
//! // three fields straight out of the static table
//! let fields = decoder.decode(&[0x82, 0x87, 0x85]).unwrap();
//! assert_eq!(fields[1], (b":scheme".to_vec(), b"https".to_vec()));
//! assert_eq!(fields[2], (b":path".to_vec(), b"/index.html".to_vec()));
//! ```

use tracing::trace;

use crate::{
    entry_size,
    huffman::{HuffmanDecoder, HuffmanDecoderError},
    HeaderTable, STATIC_TABLE,
};

/// How many octets may follow an integer's prefix. Four keep any value
/// under 2^28.
const MAX_CONTINUATION_OCTETS: usize = 4;

/// Anything wrong with a field block. After any of these, our dynamic table
/// no longer matches the peer's, so the connection can't go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecoderError {
    #[error("field block ends in the middle of a representation")]
    Truncated,

    #[error("integer takes more than {MAX_CONTINUATION_OCTETS} octets past its prefix")]
    IntegerOverflow,

    #[error("index {0} is in neither the static nor the dynamic table")]
    BadIndex(usize),

    #[error("bad huffman-coded string: {0}")]
    Huffman(#[from] HuffmanDecoderError),

    #[error("dynamic table resized to {size}, above the {max} we allow")]
    TableSizeAboveLimit { size: usize, max: usize },

    #[error("dynamic table size update after a field")]
    LateTableSizeUpdate,

    #[error("field block ends with a dynamic table size update")]
    TrailingTableSizeUpdate,

    #[error("decoded fields take {size} bytes, over the {max} allowed")]
    HeaderListTooLarge { size: usize, max: usize },
}

/// What the first octet of a representation announces, cf. RFC 7541
/// section 6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    /// `1xxxxxxx`: a whole field from the table
    Indexed,
    /// `01xxxxxx`, `0001xxxx` or `0000xxxx`: a literal value, with its name
    /// either literal too or taken from the table
    Literal { index_bits: u8, add_to_table: bool },
    /// `001xxxxx`
    TableSizeUpdate,
}

impl Op {
    fn of(octet: u8) -> Self {
        match octet.leading_zeros() {
            0 => Self::Indexed,
            1 => Self::Literal {
                index_bits: 6,
                add_to_table: true,
            },
            2 => Self::TableSizeUpdate,
            // "never indexed" only matters to intermediaries re-encoding
            // the field, we treat it like "without indexing"
            _ => Self::Literal {
                index_bits: 4,
                add_to_table: false,
            },
        }
    }
}

/// Reads primitives off the front of a field block
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn octet(&mut self) -> Result<u8, DecoderError> {
        let (&octet, rest) = self.buf.split_first().ok_or(DecoderError::Truncated)?;
        self.buf = rest;
        Ok(octet)
    }

    /// An integer behind a `bits`-bit prefix (1 to 8), cf. RFC 7541
    /// section 5.1. Bits above the prefix are ignored.
    fn integer(&mut self, bits: u8) -> Result<usize, DecoderError> {
        let prefix_max = (1usize << bits) - 1;
        let mut value = usize::from(self.octet()?) & prefix_max;
        if value < prefix_max {
            return Ok(value);
        }
        for i in 0..MAX_CONTINUATION_OCTETS {
            let octet = self.octet()?;
            value += usize::from(octet & 0x7f) << (7 * i);
            if octet & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DecoderError::IntegerOverflow)
    }

    /// A string literal, cf. RFC 7541 section 5.2
    fn string(&mut self) -> Result<Vec<u8>, DecoderError> {
        let huffman = self.peek().is_some_and(|octet| octet & 0x80 != 0);
        let len = self.integer(7)?;
        if len > self.buf.len() {
            return Err(DecoderError::Truncated);
        }
        let (raw, rest) = self.buf.split_at(len);
        self.buf = rest;
        if huffman {
            Ok(HuffmanDecoder::new().decode(raw)?)
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// The receiving half of an HPACK context: one per connection, fed every
/// field block in the order they arrived.
pub struct Decoder {
    table: HeaderTable<'static>,

    /// What we advertised as SETTINGS_HEADER_TABLE_SIZE
    table_size_limit: Option<usize>,

    /// What we advertised as SETTINGS_MAX_HEADER_LIST_SIZE
    header_list_limit: Option<usize>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self {
            table: HeaderTable::with_static_table(STATIC_TABLE),
            table_size_limit: None,
            header_list_limit: None,
        }
    }
}

impl Decoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Size updates above this fail with [DecoderError::TableSizeAboveLimit]
    pub fn set_max_allowed_table_size(&mut self, max: usize) {
        self.table_size_limit = Some(max);
    }

    /// Blocks adding up to more than this (name + value + 32 per field)
    /// fail with [DecoderError::HeaderListTooLarge]
    pub fn set_max_header_list_size(&mut self, max: usize) {
        self.header_list_limit = Some(max);
    }

    pub fn header_table(&self) -> &HeaderTable<'static> {
        &self.table
    }

    /// Decodes a complete field block, i.e. a HEADERS payload with the
    /// payloads of its CONTINUATION frames appended, into `(name, value)`
    /// pairs.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DecoderError> {
        let mut r = Reader { buf: block };
        let mut fields = Vec::new();
        let mut list_size = 0;
        let mut last_op = None;

        while let Some(first) = r.peek() {
            let op = Op::of(first);
            last_op = Some(op);

            let (name, value) = match op {
                Op::TableSizeUpdate => {
                    // only allowed at the start of a block, cf. RFC 7541 section 4.2
                    if !fields.is_empty() {
                        return Err(DecoderError::LateTableSizeUpdate);
                    }
                    let size = r.integer(5)?;
                    self.resize_table(size)?;
                    continue;
                }
                Op::Indexed => {
                    let (name, value) = self.lookup(r.integer(7)?)?;
                    (name.to_vec(), value.to_vec())
                }
                Op::Literal {
                    index_bits,
                    add_to_table,
                } => {
                    let name = match r.integer(index_bits)? {
                        0 => r.string()?,
                        index => self.lookup(index)?.0.to_vec(),
                    };
                    let value = r.string()?;
                    if add_to_table {
                        self.table.add_header(name.clone(), value.clone());
                    }
                    (name, value)
                }
            };

            list_size += entry_size(&name, &value);
            if let Some(max) = self.header_list_limit.filter(|&max| list_size > max) {
                return Err(DecoderError::HeaderListTooLarge {
                    size: list_size,
                    max,
                });
            }
            fields.push((name, value));
        }

        if last_op == Some(Op::TableSizeUpdate) {
            return Err(DecoderError::TrailingTableSizeUpdate);
        }
        trace!(fields = fields.len(), list_size, "decoded field block");
        Ok(fields)
    }

    fn lookup(&self, index: usize) -> Result<(&[u8], &[u8]), DecoderError> {
        self.table
            .get_from_table(index)
            .ok_or(DecoderError::BadIndex(index))
    }

    fn resize_table(&mut self, size: usize) -> Result<(), DecoderError> {
        if let Some(max) = self.table_size_limit.filter(|&max| size > max) {
            return Err(DecoderError::TableSizeAboveLimit { size, max });
        }
        trace!(
            from = self.table.dynamic_table.get_max_table_size(),
            to = size,
            "peer resized the dynamic table"
        );
        self.table.dynamic_table.set_max_table_size(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{Decoder, DecoderError, Op, Reader};
    use crate::huffman::HuffmanDecoderError;

    fn fields(list: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
        list.iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_integers_from_rfc_appendix_c1() {
        // 10 and 1337 behind a 5-bit prefix, 42 on a whole octet
        let mut r = Reader {
            buf: &[0x0a, 0x1f, 0x9a, 0x0a, 0x2a, 0xff],
        };
        assert_eq!(r.integer(5), Ok(10));
        assert_eq!(r.integer(5), Ok(1337));
        assert_eq!(r.integer(8), Ok(42));
        assert_eq!(r.buf, [0xff]);

        // the three high bits belong to the representation
        let mut r = Reader { buf: &[0xea] };
        assert_eq!(r.integer(5), Ok(10));
    }

    #[test]
    fn test_integer_length_limits() {
        let mut r = Reader {
            buf: &[0xff, 0xff, 0xff, 0xff, 0x7f],
        };
        assert_eq!(r.integer(8), Ok(255 + (1 << 28) - 1));

        let mut r = Reader {
            buf: &[0xff, 0xff, 0xff, 0xff, 0xff, 0x00],
        };
        assert_eq!(r.integer(8), Err(DecoderError::IntegerOverflow));

        let mut r = Reader { buf: &[0x1f, 0x9a] };
        assert_eq!(r.integer(5), Err(DecoderError::Truncated));
        let mut r = Reader { buf: &[] };
        assert_eq!(r.integer(7), Err(DecoderError::Truncated));
    }

    #[test]
    fn test_first_octet_picks_the_representation() {
        assert_eq!(Op::of(0x82), Op::Indexed);
        assert_eq!(
            Op::of(0x41),
            Op::Literal {
                index_bits: 6,
                add_to_table: true
            }
        );
        assert_eq!(Op::of(0x3f), Op::TableSizeUpdate);
        let without_indexing = Op::Literal {
            index_bits: 4,
            add_to_table: false,
        };
        assert_eq!(Op::of(0x10), without_indexing);
        assert_eq!(Op::of(0x04), without_indexing);
        assert_eq!(Op::of(0x00), without_indexing);
    }

    #[test]
    fn test_string_literals() {
        let mut r = Reader {
            buf: b"\x03abc\x00",
        };
        assert_eq!(r.string(), Ok(b"abc".to_vec()));
        assert_eq!(r.string(), Ok(vec![]));

        // "www.example.com", huffman-coded, cf. RFC 7541 C.4.1
        let block = hex::decode("8cf1e3c2e5f23a6ba0ab90f4ff").unwrap();
        let mut r = Reader { buf: &block };
        assert_eq!(r.string(), Ok(b"www.example.com".to_vec()));

        let mut r = Reader { buf: b"\x05abc" };
        assert_eq!(r.string(), Err(DecoderError::Truncated));

        // padding has to be the most significant bits of EOS
        let mut r = Reader {
            buf: &[0x81, 0b0001_1000],
        };
        assert_eq!(
            r.string(),
            Err(DecoderError::Huffman(HuffmanDecoderError::InvalidPadding))
        );
    }

    #[test]
    fn test_literal_representations() {
        let mut decoder = Decoder::new();

        // cf. RFC 7541 C.2.2, name from the static table, not indexed
        let block = hex::decode("040c2f73616d706c652f70617468").unwrap();
        assert_eq!(decoder.decode(&block), Ok(fields(&[(":path", "/sample/path")])));
        assert!(decoder.header_table().dynamic_table.is_empty());

        // cf. RFC 7541 C.2.3, never indexed
        let block = hex::decode("100870617373776f726406736563726574").unwrap();
        assert_eq!(decoder.decode(&block), Ok(fields(&[("password", "secret")])));
        assert!(decoder.header_table().dynamic_table.is_empty());

        // cf. RFC 7541 C.2.1, added to the table
        let block = hex::decode("400a637573746f6d2d6b65790d637573746f6d2d686561646572").unwrap();
        assert_eq!(
            decoder.decode(&block),
            Ok(fields(&[("custom-key", "custom-header")]))
        );
        assert_eq!(decoder.header_table().dynamic_table.get_size(), 55);

        // ...and usable right away: index 62 is the newest entry
        assert_eq!(
            decoder.decode(&[0xbe]),
            Ok(fields(&[("custom-key", "custom-header")]))
        );
    }

    #[test]
    fn test_requests_share_the_dynamic_table() {
        // cf. RFC 7541 C.3
        let requests = [
            ("828684410f7777772e6578616d706c652e636f6d", 57),
            ("828684be58086e6f2d6361636865", 110),
            (
                "828785bf400a637573746f6d2d6b65790c637573746f6d2d76616c7565",
                164,
            ),
        ];

        let mut decoder = Decoder::new();
        let mut decoded = vec![];
        for (block, table_size) in requests {
            decoded.push(decoder.decode(&hex::decode(block).unwrap()).unwrap());
            assert_eq!(decoder.header_table().dynamic_table.get_size(), table_size);
        }

        assert_eq!(
            decoded[1][3..],
            fields(&[(":authority", "www.example.com"), ("cache-control", "no-cache")])
        );
        assert_eq!(
            decoded[2],
            fields(&[
                (":method", "GET"),
                (":scheme", "https"),
                (":path", "/index.html"),
                (":authority", "www.example.com"),
                ("custom-key", "custom-value"),
            ])
        );
    }

    #[test]
    fn test_bad_index() {
        let mut decoder = Decoder::new();
        // 61 static entries and an empty dynamic table
        assert_eq!(decoder.decode(&[0xbe]), Err(DecoderError::BadIndex(62)));
        assert_eq!(decoder.decode(&[0x80]), Err(DecoderError::BadIndex(0)));
        // literal with an out of range name index
        assert_eq!(
            decoder.decode(&[0x0f, 0x30, 0x01, b'x']),
            Err(DecoderError::BadIndex(63))
        );
    }

    #[test]
    fn test_table_size_updates() {
        let mut decoder = Decoder::new();
        decoder.set_max_allowed_table_size(4096);

        // 0x3f 0xe1 0x1f is an update to 4096
        assert_eq!(
            decoder.decode(&[0x3f, 0xe1, 0x1f, 0x82]),
            Ok(fields(&[(":method", "GET")]))
        );
        assert_eq!(
            decoder.decode(&[0x3f, 0xe2, 0x1f, 0x82]),
            Err(DecoderError::TableSizeAboveLimit {
                size: 4097,
                max: 4096
            })
        );
        assert_eq!(
            decoder.decode(&[0x82, 0x20]),
            Err(DecoderError::LateTableSizeUpdate)
        );
        assert_eq!(
            decoder.decode(&[0x20]),
            Err(DecoderError::TrailingTableSizeUpdate)
        );

        // shrinking to zero evicts everything
        let mut decoder = Decoder::new();
        let block = hex::decode("400a637573746f6d2d6b65790d637573746f6d2d686561646572").unwrap();
        decoder.decode(&block).unwrap();
        assert_eq!(decoder.header_table().dynamic_table.len(), 1);
        decoder.decode(&[0x20, 0x82]).unwrap();
        assert!(decoder.header_table().dynamic_table.is_empty());
    }

    #[test]
    fn test_header_list_limit() {
        let mut decoder = Decoder::new();
        // ":method: GET" counts for 7 + 3 + 32 = 42
        decoder.set_max_header_list_size(84);
        assert!(decoder.decode(&[0x82, 0x82]).is_ok());
        assert_eq!(
            decoder.decode(&[0x82, 0x82, 0x82]),
            Err(DecoderError::HeaderListTooLarge { size: 126, max: 84 })
        );
    }
}
