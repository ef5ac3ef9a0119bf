//! WebSocket frame layout, cf. RFC 6455 section 5.2
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! ```

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use super::WsError;
use crate::util::trace_partial;

const MAX_CONTROL_PAYLOAD: u64 = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn repr(self) -> u8 {
        self as u8
    }

    pub fn from_repr(op: u8) -> Option<Self> {
        Some(match op {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            _ => return None,
        })
    }

    pub fn is_control(self) -> bool {
        self.repr() & 0x8 != 0
    }
}

/// A frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy)]
struct Head {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

/// Where the parser is within the current frame. Each stage consumes its
/// bytes only once they're all there.
#[derive(Debug, Clone, Copy)]
enum Stage {
    /// FIN, RSV1-3, opcode
    First,
    /// MASK, 7-bit payload length
    Second { fin: bool, opcode: Opcode },
    /// 2 or 8 bytes of extended payload length
    ExtendedLength { head: Head, width: usize },
    MaskingKey { head: Head, len: u64 },
    Payload { head: Head, len: u64, mask: Option<[u8; 4]> },
}

/// Incremental frame parser. Feed it whatever was read, it hands out
/// frames as they complete and keeps its place across calls.
#[derive(Debug)]
pub struct FrameParser {
    stage: Stage,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self {
            stage: Stage::First,
        }
    }
}

impl FrameParser {
    /// Consumes frame bytes from `buf`. Returns `Ok(None)` when more bytes
    /// are needed.
    ///
    /// `budget` is how many more payload bytes the message in progress may
    /// take: a data frame declaring more is rejected before any of its
    /// payload is buffered.
    pub fn parse(&mut self, buf: &mut BytesMut, budget: u64) -> Result<Option<WsFrame>, WsError> {
        loop {
            match self.stage {
                Stage::First => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let b = buf.get_u8();
                    if b & 0x70 != 0 {
                        return Err(WsError::ReservedBitsSet);
                    }
                    let opcode =
                        Opcode::from_repr(b & 0x0f).ok_or(WsError::UnknownOpcode(b & 0x0f))?;
                    let fin = b & 0x80 != 0;
                    if opcode.is_control() && !fin {
                        return Err(WsError::FragmentedControlFrame);
                    }
                    self.stage = Stage::Second { fin, opcode };
                }
                Stage::Second { fin, opcode } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let b = buf.get_u8();
                    let head = Head {
                        fin,
                        opcode,
                        masked: b & 0x80 != 0,
                    };
                    self.stage = match b & 0x7f {
                        126 => Stage::ExtendedLength { head, width: 2 },
                        127 => Stage::ExtendedLength { head, width: 8 },
                        len => Self::length_known(head, len as u64, budget)?,
                    };
                }
                Stage::ExtendedLength { head, width } => {
                    if buf.len() < width {
                        trace_partial("ws extended length", buf);
                        return Ok(None);
                    }
                    let len = match width {
                        2 => BigEndian::read_u16(&buf[..2]) as u64,
                        // the most significant bit must be 0
                        _ => BigEndian::read_u64(&buf[..8]) & (u64::MAX >> 1),
                    };
                    buf.advance(width);
                    self.stage = Self::length_known(head, len, budget)?;
                }
                Stage::MaskingKey { head, len } => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let mut mask = [0u8; 4];
                    buf.copy_to_slice(&mut mask);
                    self.stage = Stage::Payload {
                        head,
                        len,
                        mask: Some(mask),
                    };
                }
                Stage::Payload { head, len, mask } => {
                    // `len` was checked against the budget, which is a usize
                    let len = len as usize;
                    if buf.len() < len {
                        return Ok(None);
                    }
                    let mut payload = buf.split_to(len);
                    if let Some(mask) = mask {
                        apply_mask(&mut payload, mask);
                    }
                    self.stage = Stage::First;
                    trace!(fin = %head.fin, opcode = ?head.opcode, %len, "ws frame");
                    return Ok(Some(WsFrame {
                        fin: head.fin,
                        opcode: head.opcode,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }

    fn length_known(head: Head, len: u64, budget: u64) -> Result<Stage, WsError> {
        if head.opcode.is_control() {
            if len > MAX_CONTROL_PAYLOAD {
                return Err(WsError::ControlFrameTooLarge { len });
            }
        } else if len > budget {
            return Err(WsError::MessageTooBig {
                size: len,
                max: budget as usize,
            });
        }

        Ok(if head.masked {
            Stage::MaskingKey { head, len }
        } else {
            Stage::Payload {
                head,
                len,
                mask: None,
            }
        })
    }
}

/// XORs `data` with the 4-byte masking key. Masking and unmasking are the
/// same operation.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// Appends a single frame. Server frames are never masked, `mask` is there
/// for the client side.
pub fn encode_frame(
    out: &mut BytesMut,
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) {
    let mut b0 = opcode.repr();
    if fin {
        b0 |= 0x80;
    }
    out.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len @ 0..=125 => out.put_u8(mask_bit | len as u8),
        len @ 126..=0xffff => {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        }
        len => {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }
    }

    match mask {
        Some(mask) => {
            out.put_slice(&mask);
            let start = out.len();
            out.put_slice(payload);
            apply_mask(&mut out[start..], mask);
        }
        None => out.put_slice(payload),
    }
}

/// Appends a whole message, split into frames of at most `max_frame`
/// payload bytes: the first frame carries the opcode, the following ones
/// are continuations, and only the last one has FIN set.
pub fn encode_message(out: &mut BytesMut, opcode: Opcode, payload: &[u8], max_frame: usize) {
    if payload.is_empty() {
        encode_frame(out, true, opcode, payload, None);
        return;
    }

    let mut chunks = payload.chunks(max_frame.max(1)).peekable();
    let mut opcode = opcode;
    while let Some(chunk) = chunks.next() {
        let fin = chunks.peek().is_none();
        encode_frame(out, fin, opcode, chunk, None);
        opcode = Opcode::Continuation;
    }
}
