//! HPACK header block encoding.
//!
//! Fields are represented, in order of preference, as an index into the
//! table (exact name and value match), a literal value with an indexed name,
//! or a fully literal field. The last two are added to the dynamic table,
//! except `set-cookie` which is never indexed: its values rarely repeat and
//! would only churn the table.

use std::io;

use tracing::trace;

use crate::huffman;
use crate::{HeaderTable, STATIC_TABLE};

/// Longest string the peer's decoder accepts: lengths above this need more
/// than five octets of integer representation.
const MAX_STRING_LEN: usize = 1 << 28;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EncoderError {
    #[error("string of {len} bytes is too long for an HPACK literal")]
    StringTooLong { len: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes `value` with a `prefix_size`-bit prefix. The bits above the prefix
/// in the first octet are taken from `leading_bits`.
pub fn encode_integer_into(value: usize, prefix_size: u8, leading_bits: u8, out: &mut Vec<u8>) {
    debug_assert!((1..=8).contains(&prefix_size));
    let mask = if prefix_size == 8 {
        0xFF
    } else {
        (1u8 << prefix_size) - 1
    };
    let leading_bits = leading_bits & !mask;

    if value < mask as usize {
        out.push(leading_bits | value as u8);
        return;
    }

    out.push(leading_bits | mask);
    let mut value = value - mask as usize;
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encodes `value` with a `prefix_size`-bit prefix into a fresh buffer, with
/// the bits above the prefix left unset.
pub fn encode_integer(value: usize, prefix_size: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    encode_integer_into(value, prefix_size, 0, &mut out);
    out
}

/// Encodes a string literal, Huffman-coded whenever that's shorter.
fn encode_string_into(s: &[u8], out: &mut Vec<u8>) -> Result<(), EncoderError> {
    if s.len() > MAX_STRING_LEN {
        return Err(EncoderError::StringTooLong { len: s.len() });
    }

    let huffman_len = huffman::encoded_len(s);
    if huffman_len < s.len() {
        encode_integer_into(huffman_len, 7, 0x80, out);
        huffman::encode_into(s, out);
    } else {
        encode_integer_into(s.len(), 7, 0, out);
        out.extend_from_slice(s);
    }
    Ok(())
}

/// Encodes header lists into HPACK header blocks. One instance per
/// connection: the peer's decoder mirrors our dynamic table, so every block
/// we produce must be sent, in order.
pub struct Encoder {
    header_table: HeaderTable<'static>,

    /// Size updates not yet signalled to the peer: the smallest size the
    /// table went through, and the latest one.
    pending_size_update: Option<(usize, usize)>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self {
            header_table: HeaderTable::with_static_table(STATIC_TABLE),
            pending_size_update: None,
        }
    }
}

impl Encoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn header_table(&self) -> &HeaderTable<'static> {
        &self.header_table
    }

    /// Changes the size of our dynamic table. The change is announced at the
    /// start of the next header block.
    pub fn set_max_table_size(&mut self, new_max_size: usize) {
        if new_max_size == self.header_table.dynamic_table.get_max_table_size()
            && self.pending_size_update.is_none()
        {
            return;
        }

        self.pending_size_update = Some(match self.pending_size_update {
            Some((smallest, _)) => (smallest.min(new_max_size), new_max_size),
            None => (new_max_size, new_max_size),
        });
        self.header_table
            .dynamic_table
            .set_max_table_size(new_max_size);
    }

    /// Encodes the given fields into a new header block.
    pub fn encode<'b>(
        &mut self,
        headers: impl IntoIterator<Item = (&'b [u8], &'b [u8])>,
    ) -> Result<Vec<u8>, EncoderError> {
        let mut out = Vec::new();
        self.encode_fields(headers, &mut out)?;
        Ok(out)
    }

    /// Encodes the given fields and writes the resulting header block to
    /// `writer`.
    pub fn encode_into<'b>(
        &mut self,
        headers: impl IntoIterator<Item = (&'b [u8], &'b [u8])>,
        writer: &mut impl io::Write,
    ) -> Result<(), EncoderError> {
        let block = self.encode(headers)?;
        writer.write_all(&block)?;
        Ok(())
    }

    fn encode_fields<'b>(
        &mut self,
        headers: impl IntoIterator<Item = (&'b [u8], &'b [u8])>,
        out: &mut Vec<u8>,
    ) -> Result<(), EncoderError> {
        if let Some((smallest, latest)) = self.pending_size_update.take() {
            if smallest < latest {
                encode_integer_into(smallest, 5, 0x20, out);
            }
            encode_integer_into(latest, 5, 0x20, out);
        }

        for (name, value) in headers {
            self.encode_field(name, value, out)?;
        }
        Ok(())
    }

    fn encode_field(
        &mut self,
        name: &[u8],
        value: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), EncoderError> {
        let found = self.header_table.find_header((name, value));

        if name == b"set-cookie" {
            // literal without indexing, `0000xxxx`
            match found {
                Some((index, _)) => encode_integer_into(index, 4, 0x00, out),
                None => {
                    out.push(0x00);
                    encode_string_into(name, out)?;
                }
            }
            return encode_string_into(value, out);
        }

        match found {
            Some((index, true)) => {
                trace!(%index, "indexed field");
                encode_integer_into(index, 7, 0x80, out);
                return Ok(());
            }
            Some((index, false)) => {
                encode_integer_into(index, 6, 0x40, out);
            }
            None => {
                out.push(0x40);
                encode_string_into(name, out)?;
            }
        }
        encode_string_into(value, out)?;
        self.header_table.add_header(name.to_vec(), value.to_vec());

        Ok(())
    }
}
