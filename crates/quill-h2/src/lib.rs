//! HTTP/2 frames as they appear on the wire, cf. <https://httpwg.org/specs/rfc9113.html>
//!
//! The connection engine buffers a whole frame before looking at it, so
//! only [Frame::parse] deals with partial input. Payload decoders get the
//! complete payload and return `None` when its length is wrong for the
//! frame type.

use std::{fmt, ops::RangeInclusive};

use bytes::BufMut;
pub use enumflags2;
use enumflags2::{bitflags, BitFlags};
pub use nom;
use nom::{
    combinator::all_consuming,
    number::streaming::{be_u24, be_u32, be_u8},
    sequence::pair,
    IResult,
};

/// What a client sends first on a prior-knowledge HTTP/2 connection
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

pub const PING_PAYLOAD_LEN: usize = 8;

/// Whether the first bytes of a connection still agree with [PREFACE].
/// An empty prefix agrees with anything.
pub fn could_be_preface(prefix: &[u8]) -> bool {
    let n = prefix.len().min(PREFACE.len());
    prefix[..n] == PREFACE[..n]
}

/// Type codes, cf. RFC 9113 section 6
mod code {
    pub(crate) const DATA: u8 = 0x0;
    pub(crate) const HEADERS: u8 = 0x1;
    pub(crate) const PRIORITY: u8 = 0x2;
    pub(crate) const RST_STREAM: u8 = 0x3;
    pub(crate) const SETTINGS: u8 = 0x4;
    pub(crate) const PUSH_PROMISE: u8 = 0x5;
    pub(crate) const PING: u8 = 0x6;
    pub(crate) const GOAWAY: u8 = 0x7;
    pub(crate) const WINDOW_UPDATE: u8 = 0x8;
    pub(crate) const CONTINUATION: u8 = 0x9;
}

/// A frame type along with the flags defined for it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data(BitFlags<DataFlags>),
    Headers(BitFlags<HeadersFlags>),
    Priority,
    RstStream,
    Settings(BitFlags<SettingsFlags>),
    PushPromise,
    Ping(BitFlags<PingFlags>),
    GoAway,
    WindowUpdate,
    Continuation(BitFlags<ContinuationFlags>),
    /// Extension frames, which receivers ignore
    Unknown { ty: u8, flags: u8 },
}

impl FrameType {
    /// Reads the type and flags octets. Flags a known type doesn't define
    /// are dropped.
    pub fn from_wire(ty: u8, flags: u8) -> Self {
        match ty {
            code::DATA => Self::Data(BitFlags::from_bits_truncate(flags)),
            code::HEADERS => Self::Headers(BitFlags::from_bits_truncate(flags)),
            code::PRIORITY => Self::Priority,
            code::RST_STREAM => Self::RstStream,
            code::SETTINGS => Self::Settings(BitFlags::from_bits_truncate(flags)),
            code::PUSH_PROMISE => Self::PushPromise,
            code::PING => Self::Ping(BitFlags::from_bits_truncate(flags)),
            code::GOAWAY => Self::GoAway,
            code::WINDOW_UPDATE => Self::WindowUpdate,
            code::CONTINUATION => Self::Continuation(BitFlags::from_bits_truncate(flags)),
            _ => Self::Unknown { ty, flags },
        }
    }

    /// The type and flags octets
    pub fn to_wire(self) -> (u8, u8) {
        match self {
            Self::Data(f) => (code::DATA, f.bits()),
            Self::Headers(f) => (code::HEADERS, f.bits()),
            Self::Priority => (code::PRIORITY, 0),
            Self::RstStream => (code::RST_STREAM, 0),
            Self::Settings(f) => (code::SETTINGS, f.bits()),
            Self::PushPromise => (code::PUSH_PROMISE, 0),
            Self::Ping(f) => (code::PING, f.bits()),
            Self::GoAway => (code::GOAWAY, 0),
            Self::WindowUpdate => (code::WINDOW_UPDATE, 0),
            Self::Continuation(f) => (code::CONTINUATION, f.bits()),
            Self::Unknown { ty, flags } => (ty, flags),
        }
    }

    /// The name RFC 9113 uses, or "UNKNOWN"
    pub fn name(self) -> &'static str {
        match self {
            Self::Data(_) => "DATA",
            Self::Headers(_) => "HEADERS",
            Self::Priority => "PRIORITY",
            Self::RstStream => "RST_STREAM",
            Self::Settings(_) => "SETTINGS",
            Self::PushPromise => "PUSH_PROMISE",
            Self::Ping(_) => "PING",
            Self::GoAway => "GOAWAY",
            Self::WindowUpdate => "WINDOW_UPDATE",
            Self::Continuation(_) => "CONTINUATION",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown { ty, .. } => write!(f, "UNKNOWN({ty:#04x})"),
            known => f.write_str(known.name()),
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFlags {
    Padded = 0x08,
    EndStream = 0x01,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersFlags {
    Priority = 0x20,
    Padded = 0x08,
    EndHeaders = 0x04,
    EndStream = 0x01,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFlags {
    Ack = 0x01,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFlags {
    Ack = 0x01,
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationFlags {
    EndHeaders = 0x04,
}

/// A 31-bit stream identifier. Clients open odd ones, servers even ones,
/// and 0 is the connection itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    pub const CONNECTION: Self = Self(0);

    pub const MAX: u32 = 0x7fff_ffff;

    pub fn is_server_initiated(self) -> bool {
        self.0 != 0 && self.0 & 1 == 0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0} does not fit in 31 bits")]
pub struct StreamIdOutOfRange(pub u32);

impl TryFrom<u32> for StreamId {
    type Error = StreamIdOutOfRange;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > Self::MAX {
            return Err(StreamIdOutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A 31-bit value behind a flag bit: stream ids, PRIORITY dependencies and
/// WINDOW_UPDATE increments all look like this.
fn flagged_u31(i: &[u8]) -> IResult<&[u8], (bool, u32)> {
    let (i, raw) = be_u32(i)?;
    Ok((i, (raw >> 31 == 1, raw & StreamId::MAX)))
}

/// Bits above the 31st are dropped.
fn put_flagged_u31(out: &mut impl BufMut, flag: bool, value: u32) {
    out.put_u32(u32::from(flag) << 31 | (value & StreamId::MAX));
}

/// Runs `parser` over a complete payload, which it must consume entirely
fn exact<'a, T>(
    payload: &'a [u8],
    parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], T>,
) -> Option<T> {
    all_consuming(parser)(payload).ok().map(|(_, v)| v)
}

/// A frame header
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// The bit in front of the stream id. Senders leave it unset, receivers
    /// ignore it.
    pub reserved: bool,
    pub stream_id: StreamId,
    /// Payload length, 24 bits on the wire
    pub len: u32,
}

impl Frame {
    pub fn new(frame_type: FrameType, stream_id: StreamId) -> Self {
        Self {
            frame_type,
            reserved: false,
            stream_id,
            len: 0,
        }
    }

    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    /// Reads a frame header off the front of `i`.
    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, len) = be_u24(i)?;
        let (i, ty) = be_u8(i)?;
        let (i, flags) = be_u8(i)?;
        let (i, (reserved, stream_id)) = flagged_u31(i)?;
        Ok((
            i,
            Self {
                frame_type: FrameType::from_wire(ty, flags),
                reserved,
                stream_id: StreamId(stream_id),
                len,
            },
        ))
    }

    /// Appends the 9 header bytes. Only the low 24 bits of `len` are kept.
    pub fn encode(&self, out: &mut impl BufMut) {
        let (ty, flags) = self.frame_type.to_wire();
        out.put_uint(u64::from(self.len & 0x00ff_ffff), 3);
        out.put_u8(ty);
        out.put_u8(flags);
        put_flagged_u31(out, self.reserved, self.stream_id.0);
    }

    /// ACK on SETTINGS or PING
    pub fn is_ack(&self) -> bool {
        match self.frame_type {
            FrameType::Settings(f) => f.contains(SettingsFlags::Ack),
            FrameType::Ping(f) => f.contains(PingFlags::Ack),
            _ => false,
        }
    }

    /// END_HEADERS on HEADERS or CONTINUATION
    pub fn is_end_headers(&self) -> bool {
        match self.frame_type {
            FrameType::Headers(f) => f.contains(HeadersFlags::EndHeaders),
            FrameType::Continuation(f) => f.contains(ContinuationFlags::EndHeaders),
            _ => false,
        }
    }

    /// END_STREAM on DATA or HEADERS
    pub fn is_end_stream(&self) -> bool {
        match self.frame_type {
            FrameType::Data(f) => f.contains(DataFlags::EndStream),
            FrameType::Headers(f) => f.contains(HeadersFlags::EndStream),
            _ => false,
        }
    }
}

// e.g. `HEADERS#3 len=27 flags=0x05`
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (_, flags) = self.frame_type.to_wire();
        write!(f, "{}{:?} len={}", self.frame_type, self.stream_id, self.len)?;
        if flags != 0 {
            write!(f, " flags={flags:#04x}")?;
        }
        if self.reserved {
            f.write_str(" reserved")?;
        }
        Ok(())
    }
}

/// A padded payload whose pad length octet is missing, or claims more
/// bytes than there are.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{pad_len} bytes of padding don't fit in a {payload_len}-byte payload")]
pub struct PaddingTooLarge {
    pub pad_len: usize,
    pub payload_len: usize,
}

/// Returns the data of a padded DATA or HEADERS payload, without the pad
/// length octet or the padding.
pub fn strip_padding(payload: &[u8]) -> Result<&[u8], PaddingTooLarge> {
    let too_large = |pad_len| PaddingTooLarge {
        pad_len,
        payload_len: payload.len(),
    };
    let (&pad_len, rest) = payload.split_first().ok_or(too_large(0))?;
    let pad_len = usize::from(pad_len);
    let data_len = rest.len().checked_sub(pad_len).ok_or(too_large(pad_len))?;
    Ok(&rest[..data_len])
}

/// Stream dependency and weight, in PRIORITY frames and in HEADERS frames
/// with the PRIORITY flag. Parsed, then ignored: RFC 9113 deprecates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub stream_dependency: StreamId,
    /// One less than the actual weight
    pub weight: u8,
}

impl PrioritySpec {
    pub const LEN: usize = 5;

    fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, (exclusive, dep)) = flagged_u31(i)?;
        let (i, weight) = be_u8(i)?;
        Ok((
            i,
            Self {
                exclusive,
                stream_dependency: StreamId(dep),
                weight,
            },
        ))
    }

    /// A PRIORITY frame payload
    pub fn decode(payload: &[u8]) -> Option<Self> {
        exact(payload, Self::parse)
    }

    /// Splits the spec off the front of a HEADERS field block
    pub fn split_off(block: &[u8]) -> Option<(Self, &[u8])> {
        let (rest, spec) = Self::parse(block).ok()?;
        Some((spec, rest))
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        put_flagged_u31(out, self.exclusive, self.stream_dependency.0);
        out.put_u8(self.weight);
    }
}

/// Defines a wire enum along with its conversions from and to the raw code
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr($repr)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code,)*
        }

        impl $name {
            pub fn repr(self) -> $repr {
                self as $repr
            }

            pub fn from_repr(code: $repr) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// cf. RFC 9113 section 7
    KnownErrorCode(u32) {
        /// Graceful shutdown, or a stream no longer needed
        NoError = 0x00,
        ProtocolError = 0x01,
        InternalError = 0x02,
        FlowControlError = 0x03,
        SettingsTimeout = 0x04,
        /// A frame arrived for a half-closed or closed stream
        StreamClosed = 0x05,
        FrameSizeError = 0x06,
        /// Refused before any processing, safe to retry
        RefusedStream = 0x07,
        Cancel = 0x08,
        /// The HPACK context can't be kept in sync anymore
        CompressionError = 0x09,
        ConnectError = 0x0a,
        /// The peer is generating excessive load
        EnhanceYourCalm = 0x0b,
        InadequateSecurity = 0x0c,
        Http1_1Required = 0x0d,
    }
}

wire_enum! {
    /// SETTINGS identifiers, cf. RFC 9113 section 6.5.2
    Setting(u16) {
        HeaderTableSize = 0x01,
        EnablePush = 0x02,
        MaxConcurrentStreams = 0x03,
        InitialWindowSize = 0x04,
        MaxFrameSize = 0x05,
        MaxHeaderListSize = 0x06,
    }
}

/// An error code as received. Codes we don't know are kept as they are.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub fn known(self) -> Option<KnownErrorCode> {
        KnownErrorCode::from_repr(self.0)
    }
}

impl From<KnownErrorCode> for ErrorCode {
    fn from(e: KnownErrorCode) -> Self {
        Self(e.repr())
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.known() {
            Some(known) => fmt::Debug::fmt(&known, f),
            None => write!(f, "ErrorCode({:#04x})", self.0),
        }
    }
}

/// SETTINGS values in effect for one side of a connection.
/// [Settings::default] holds what both sides assume before any SETTINGS
/// frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// HPACK dynamic table size the sender can decode with
    pub header_table_size: u32,

    /// Never true for a server, and we never push anyway
    pub enable_push: bool,

    /// `None` means unlimited
    pub max_concurrent_streams: Option<u32>,

    pub initial_window_size: u32,

    pub max_frame_size: u32,

    /// Advisory cap on a decoded field section, with 32 bytes of overhead
    /// per field
    pub max_header_list_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Settings {
    pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

    pub const MAX_FRAME_SIZE_RANGE: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    /// Length of one identifier/value pair on the wire
    pub const PAIR_LEN: usize = 6;

    /// Updates one value, refusing the ones RFC 9113 section 6.5.2 rules
    /// out.
    pub fn apply(&mut self, setting: Setting, value: u32) -> Result<(), SettingsError> {
        match setting {
            Setting::HeaderTableSize => self.header_table_size = value,
            Setting::EnablePush => {
                self.enable_push = match value {
                    0 => false,
                    1 => true,
                    _ => return Err(SettingsError::EnablePushNotBoolean(value)),
                }
            }
            Setting::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            Setting::InitialWindowSize => {
                if value > Self::MAX_INITIAL_WINDOW_SIZE {
                    return Err(SettingsError::WindowTooLarge(value));
                }
                self.initial_window_size = value;
            }
            Setting::MaxFrameSize => {
                if !Self::MAX_FRAME_SIZE_RANGE.contains(&value) {
                    return Err(SettingsError::FrameSizeOutOfRange(value));
                }
                self.max_frame_size = value;
            }
            Setting::MaxHeaderListSize => self.max_header_list_size = value,
        }
        Ok(())
    }

    /// Walks a SETTINGS payload, calling `on_setting` for every known
    /// identifier in order. Unknown identifiers are skipped.
    pub fn parse<E>(
        payload: &[u8],
        mut on_setting: impl FnMut(Setting, u32) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<SettingsError>,
    {
        if payload.len() % Self::PAIR_LEN != 0 {
            return Err(SettingsError::Truncated(payload.len()).into());
        }
        for entry in payload.chunks_exact(Self::PAIR_LEN) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match Setting::from_repr(id) {
                Some(setting) => on_setting(setting, value)?,
                None => tracing::trace!(id, value, "skipping unknown setting"),
            }
        }
        Ok(())
    }

    /// Writes a SETTINGS payload
    pub fn encode_pairs(pairs: &[(Setting, u32)], out: &mut impl BufMut) {
        for &(setting, value) in pairs {
            out.put_u16(setting.repr());
            out.put_u32(value);
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SettingsError {
    #[error("SETTINGS_ENABLE_PUSH must be 0 or 1, not {0}")]
    EnablePushNotBoolean(u32),

    #[error("SETTINGS_INITIAL_WINDOW_SIZE of {0} is above 2^31-1")]
    WindowTooLarge(u32),

    #[error("SETTINGS_MAX_FRAME_SIZE of {0} is outside of 2^14..=2^24-1")]
    FrameSizeOutOfRange(u32),

    #[error("a SETTINGS payload of {0} bytes leaves a partial setting")]
    Truncated(usize),
}

/// A GOAWAY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoAway {
    pub last_stream_id: StreamId,
    pub error_code: ErrorCode,
    /// Opaque, we put the error message there
    pub debug_data: Vec<u8>,
}

impl GoAway {
    pub fn decode(payload: &[u8]) -> Option<Self> {
        let (debug_data, ((_, last_stream_id), error_code)) =
            pair(flagged_u31, be_u32)(payload).ok()?;
        Some(Self {
            last_stream_id: StreamId(last_stream_id),
            error_code: ErrorCode(error_code),
            debug_data: debug_data.to_vec(),
        })
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.debug_data.len()
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        put_flagged_u31(out, false, self.last_stream_id.0);
        out.put_u32(self.error_code.0);
        out.put_slice(&self.debug_data);
    }
}

/// A RST_STREAM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    pub error_code: ErrorCode,
}

impl RstStream {
    pub const LEN: usize = 4;

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let error_code = exact(payload, be_u32)?;
        Some(Self {
            error_code: ErrorCode(error_code),
        })
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32(self.error_code.0);
    }
}

/// A WINDOW_UPDATE payload. The reserved bit is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    pub increment: u32,
}

impl WindowUpdate {
    pub const LEN: usize = 4;

    pub fn decode(payload: &[u8]) -> Option<Self> {
        let (_, increment) = exact(payload, flagged_u31)?;
        Some(Self { increment })
    }

    pub fn encode(&self, out: &mut impl BufMut) {
        put_flagged_u31(out, false, self.increment);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_headers_frame_header_on_the_wire() {
        let frame = Frame::new(
            FrameType::Headers(HeadersFlags::EndHeaders | HeadersFlags::EndStream),
            StreamId(3),
        )
        .with_len(27);

        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(buf, [0, 0, 27, 0x01, 0x05, 0, 0, 0, 3]);
        assert_eq!(format!("{frame:?}"), "HEADERS#3 len=27 flags=0x05");

        let (rest, parsed) = Frame::parse(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, frame);
        assert!(parsed.is_end_headers());
        assert!(parsed.is_end_stream());
        assert!(!parsed.is_ack());
    }

    #[test]
    fn test_partial_frame_header_asks_for_more() {
        let buf = [0, 0, 8, 0x06, 0, 0, 0];
        assert!(matches!(Frame::parse(&buf), Err(nom::Err::Incomplete(_))));
    }

    #[test]
    fn test_reserved_bit_is_kept_apart_from_the_stream_id() {
        let (_, frame) = Frame::parse(&[0, 0, 4, 0x08, 0, 0x80, 0, 0, 5]).unwrap();
        assert_eq!(frame.frame_type, FrameType::WindowUpdate);
        assert!(frame.reserved);
        assert_eq!(frame.stream_id, StreamId(5));
        assert_eq!(format!("{frame:?}"), "WINDOW_UPDATE#5 len=4 reserved");
    }

    #[test]
    fn test_extension_frames_survive_parsing() {
        let (_, frame) = Frame::parse(&[0, 0, 0, 0xfa, 0xff, 0, 0, 0, 1]).unwrap();
        assert_eq!(
            frame.frame_type,
            FrameType::Unknown {
                ty: 0xfa,
                flags: 0xff
            }
        );
        assert_eq!(frame.frame_type.to_wire(), (0xfa, 0xff));
        assert_eq!(frame.frame_type.to_string(), "UNKNOWN(0xfa)");

        // PING only defines ACK, the other bits go away
        let (_, frame) = Frame::parse(&[0, 0, 8, 0x06, 0xff, 0, 0, 0, 0]).unwrap();
        assert_eq!(frame.frame_type, FrameType::Ping(PingFlags::Ack.into()));
        assert!(frame.is_ack());
    }

    #[test]
    fn test_could_be_preface() {
        assert!(could_be_preface(b""));
        assert!(could_be_preface(b"PRI * HT"));
        assert!(could_be_preface(PREFACE));
        assert!(could_be_preface(
            b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n\0\0\x12\x04"
        ));
        assert!(!could_be_preface(b"POST / HTTP/1.1\r\n"));
    }

    #[test]
    fn test_stream_id_limits() {
        assert_eq!(
            StreamId::try_from(StreamId::MAX),
            Ok(StreamId(StreamId::MAX))
        );
        assert_eq!(
            StreamId::try_from(1 << 31),
            Err(StreamIdOutOfRange(1 << 31))
        );
        assert!(!StreamId::CONNECTION.is_server_initiated());
        assert!(!StreamId(7).is_server_initiated());
        assert!(StreamId(2).is_server_initiated());
    }

    #[test]
    fn test_strip_padding() {
        assert_eq!(strip_padding(&[3, b'h', b'i', 0, 0, 0]), Ok(&b"hi"[..]));
        assert_eq!(strip_padding(&[0]), Ok(&b""[..]));
        assert_eq!(
            strip_padding(&[4, b'h', b'i', 0]),
            Err(PaddingTooLarge {
                pad_len: 4,
                payload_len: 4
            })
        );
        assert!(strip_padding(&[]).is_err());
    }

    #[test]
    fn test_settings_from_a_client() {
        let mut payload = Vec::new();
        Settings::encode_pairs(
            &[
                (Setting::HeaderTableSize, 0),
                (Setting::EnablePush, 0),
                (Setting::InitialWindowSize, 1 << 20),
            ],
            &mut payload,
        );
        assert_eq!(payload.len(), 3 * Settings::PAIR_LEN);
        // SETTINGS_NO_RFC7540_PRIORITIES, which we don't know about
        payload.extend_from_slice(&[0x00, 0x09, 0, 0, 0, 1]);

        let mut settings = Settings::default();
        Settings::parse(&payload, |setting, value| settings.apply(setting, value)).unwrap();
        assert_eq!(
            settings,
            Settings {
                header_table_size: 0,
                enable_push: false,
                initial_window_size: 1 << 20,
                ..Settings::default()
            }
        );
    }

    #[test]
    fn test_settings_out_of_range() {
        let mut settings = Settings::default();
        assert_eq!(
            settings.apply(Setting::EnablePush, 3),
            Err(SettingsError::EnablePushNotBoolean(3))
        );
        assert_eq!(
            settings.apply(Setting::MaxFrameSize, 1 << 24),
            Err(SettingsError::FrameSizeOutOfRange(1 << 24))
        );
        assert_eq!(
            settings.apply(Setting::InitialWindowSize, u32::MAX),
            Err(SettingsError::WindowTooLarge(u32::MAX))
        );
        assert_eq!(settings, Settings::default());

        let parsed = Settings::parse(&[0, 1, 0, 0], |setting, value| {
            settings.apply(setting, value)
        });
        assert_eq!(parsed, Err(SettingsError::Truncated(4)));
    }

    #[test]
    fn test_goaway_payload() {
        let goaway = GoAway {
            last_stream_id: StreamId(9),
            error_code: KnownErrorCode::EnhanceYourCalm.into(),
            debug_data: b"too many resets".to_vec(),
        };
        let mut buf = Vec::new();
        goaway.encode(&mut buf);
        assert_eq!(buf.len(), goaway.encoded_len());
        assert_eq!(buf[..8], [0, 0, 0, 9, 0, 0, 0, 0x0b]);
        assert_eq!(GoAway::decode(&buf), Some(goaway));

        assert_eq!(GoAway::decode(&buf[..7]), None);
    }

    #[test]
    fn test_fixed_size_payloads() {
        let rst = RstStream::decode(&[0, 0, 0, 0x08]).unwrap();
        assert_eq!(rst.error_code.known(), Some(KnownErrorCode::Cancel));
        assert_eq!(RstStream::decode(&[0, 0, 0, 0x08, 0]), None);

        // the reserved bit is not part of the increment
        let update = WindowUpdate::decode(&[0x80, 0, 0x10, 0]).unwrap();
        assert_eq!(update.increment, 4096);
        assert_eq!(WindowUpdate::decode(&[0, 0x10, 0]), None);

        assert_eq!(format!("{:?}", rst.error_code), "Cancel");
        assert_eq!(format!("{:?}", ErrorCode(0x1f)), "ErrorCode(0x1f)");
    }

    #[test]
    fn test_priority_in_headers_block() {
        let block = [0x80, 0, 0, 1, 0xff, 0x82, 0x84];
        let (spec, rest) = PrioritySpec::split_off(&block).unwrap();
        assert_eq!(
            spec,
            PrioritySpec {
                exclusive: true,
                stream_dependency: StreamId(1),
                weight: 255,
            }
        );
        assert_eq!(rest, [0x82, 0x84]);

        // a PRIORITY frame is exactly the spec
        assert_eq!(PrioritySpec::decode(&block), None);
        let mut buf = Vec::new();
        spec.encode(&mut buf);
        assert_eq!(PrioritySpec::decode(&buf), Some(spec));
    }
}
