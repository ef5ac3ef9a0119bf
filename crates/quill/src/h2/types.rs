use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use bytes::BytesMut;
use quill_h2::{
    ErrorCode, FrameType, KnownErrorCode, PaddingTooLarge, Settings, SettingsError, StreamId,
};
use quill_hpack::DecoderError;

use crate::types::{Method, Request, RequestBody, Response};

/// How many locally reset streams we remember, so that frames the peer
/// sent before seeing our RST_STREAM can be dropped quietly
const RESET_STREAMS_MEMORY: usize = 128;

#[derive(Default)]
pub(crate) struct ConnState {
    /// Open and half-closed streams. A stream missing from here is idle if
    /// above `last_stream_id`, closed otherwise.
    pub(crate) streams: HashMap<StreamId, StreamState>,
    pub(crate) last_stream_id: StreamId,

    /// Streams we sent RST_STREAM for, oldest first
    reset_streams: VecDeque<StreamId>,

    /// What we advertised
    pub(crate) self_settings: Settings,
    /// What the peer advertised
    pub(crate) peer_settings: Settings,
}

impl ConnState {
    pub(crate) fn remember_reset(&mut self, stream_id: StreamId) {
        if self.reset_streams.contains(&stream_id) {
            return;
        }
        if self.reset_streams.len() == RESET_STREAMS_MEMORY {
            self.reset_streams.pop_front();
        }
        self.reset_streams.push_back(stream_id);
    }

    /// cf. RFC 9113, 5.4.2: frames on a stream we reset are ignored
    pub(crate) fn was_reset(&self, stream_id: StreamId) -> bool {
        self.reset_streams.contains(&stream_id)
    }
}

// cf. RFC 9113, 5.1 Stream States. We never push, so streams are never
// reserved, and we only ever track:
//
//   idle --recv H--> open --recv ES--> half-closed (remote) --send ES--> closed
//
// with RST_STREAM (sent or received) going straight to closed. "Closed" is
// the absence of an entry in the map.
pub(crate) enum StreamState {
    /// We have received full HEADERS, the body is still coming
    Open {
        req: Box<Request>,
        body: Option<RequestBody>,
    },

    /// The request is complete, the response hasn't been fully sent
    HalfClosedRemote { method: Method },
}

impl fmt::Debug for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Open { body, .. } => f
                .debug_struct("Open")
                .field("body_len", &body.as_ref().map(|b| b.len()))
                .finish(),
            StreamState::HalfClosedRemote { method } => f
                .debug_struct("HalfClosedRemote")
                .field("method", method)
                .finish(),
        }
    }
}

/// A field block spread over HEADERS and CONTINUATION frames
pub(crate) struct PendingHeaders {
    pub(crate) stream_id: StreamId,
    pub(crate) end_stream: bool,
    pub(crate) fragments: BytesMut,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum HeadersOrTrailers {
    Headers,
    Trailers,
}

/// What [H2Conn::poll](super::H2Conn::poll) hands out
pub enum H2Event {
    /// A complete request. Its `stream_id` says which stream to respond on.
    Request(Request),

    /// A request we answer without the application, e.g. TRACE
    Respond {
        stream_id: StreamId,
        response: Response,
    },

    /// The peer reset a stream, anything still to be sent on it is dropped
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },

    /// The peer is going away: in-flight streams may finish, but no new
    /// stream will be accepted.
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
}

impl fmt::Debug for H2Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(req) => f.debug_tuple("Request").field(&req.stream_id).finish(),
            Self::Respond {
                stream_id,
                response,
            } => f
                .debug_struct("Respond")
                .field("stream_id", stream_id)
                .field("status", &response.status())
                .finish(),
            Self::StreamReset {
                stream_id,
                error_code,
            } => f
                .debug_struct("StreamReset")
                .field("stream_id", stream_id)
                .field("error_code", error_code)
                .finish(),
            Self::GoAway {
                last_stream_id,
                error_code,
            } => f
                .debug_struct("GoAway")
                .field("last_stream_id", last_stream_id)
                .field("error_code", error_code)
                .finish(),
        }
    }
}

/// Where an error lands: on the whole connection (GOAWAY) or on one
/// stream (RST_STREAM)
#[derive(Debug, thiserror::Error)]
pub(crate) enum H2ErrorLevel {
    #[error(transparent)]
    Connection(#[from] H2ConnectionError),

    #[error("on stream {stream_id}: {error}")]
    Stream {
        stream_id: StreamId,
        error: H2StreamError,
    },
}

/// Errors that end the connection, cf. RFC 9113 section 5.4.1
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2ConnectionError {
    #[error("connection does not start with the HTTP/2 client preface")]
    BadPreface,

    #[error("{frame_type} payload of {len} bytes is over our {max}-byte frame size limit")]
    FrameTooLarge {
        frame_type: FrameType,
        len: u32,
        max: u32,
    },

    #[error("{frame_type} payload of {len} bytes has the wrong length")]
    BadLength { frame_type: FrameType, len: u32 },

    #[error("{frame_type}: {source}")]
    BadPadding {
        frame_type: FrameType,
        source: PaddingTooLarge,
    },

    #[error("{frame_type} needs a stream, got it on the connection")]
    NeedsStream { frame_type: FrameType },

    #[error("{frame_type} is connection-level, got it on stream {stream_id}")]
    NeedsConnection {
        frame_type: FrameType,
        stream_id: StreamId,
    },

    #[error("stream {0} depends on itself")]
    SelfDependency(StreamId),

    #[error("stream {0} is even-numbered, clients open odd streams")]
    EvenStreamId(StreamId),

    #[error("stream {stream_id} opened after stream {last_stream_id}")]
    StreamIdRegression {
        stream_id: StreamId,
        last_stream_id: StreamId,
    },

    #[error("field block of stream {stream_id} interrupted by {frame_type} on stream {frame_stream_id}")]
    InterruptedFieldBlock {
        stream_id: StreamId,
        frame_type: FrameType,
        frame_stream_id: StreamId,
    },

    #[error("CONTINUATION on stream {0} with no field block in progress")]
    StrayContinuation(StreamId),

    #[error("field block of {size} bytes, we take at most {max}")]
    HeaderListTooLarge { size: usize, max: usize },

    #[error("field block does not decode: {0}")]
    Compression(DecoderError),

    #[error("clients may not send PUSH_PROMISE")]
    PushPromise,

    #[error("{frame_type} on stream {stream_id}, which is idle")]
    IdleStream {
        frame_type: FrameType,
        stream_id: StreamId,
    },

    #[error("frame on stream {0}, which is closed")]
    ClosedStream(StreamId),

    #[error("WINDOW_UPDATE with an increment of 0")]
    ZeroIncrement,

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("HTTP2-Settings header of an h2c upgrade is not a SETTINGS payload")]
    BadUpgradeSettings,
}

impl From<DecoderError> for H2ConnectionError {
    fn from(e: DecoderError) -> Self {
        match e {
            DecoderError::HeaderListTooLarge { size, max } => Self::HeaderListTooLarge { size, max },
            e => Self::Compression(e),
        }
    }
}

impl H2ConnectionError {
    /// The code sent in our GOAWAY
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        use H2ConnectionError as E;
        use KnownErrorCode as Code;

        match self {
            E::FrameTooLarge { .. } | E::BadLength { .. } => Code::FrameSizeError,
            E::Settings(SettingsError::Truncated(_)) => Code::FrameSizeError,
            E::Settings(SettingsError::WindowTooLarge(_)) => Code::FlowControlError,
            E::Compression(_) => Code::CompressionError,
            // more than we advertised in SETTINGS_MAX_HEADER_LIST_SIZE
            E::HeaderListTooLarge { .. } => Code::EnhanceYourCalm,
            E::ClosedStream(_) => Code::StreamClosed,
            _ => Code::ProtocolError,
        }
    }
}

/// Errors that only reset one stream, cf. RFC 9113 section 5.4.2
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2StreamError {
    #[error("trailers without END_STREAM")]
    OpenEndedTrailers,

    #[error("PRIORITY payload of {0} bytes, it takes exactly 5")]
    BadPriorityLength(u32),

    #[error("DATA after END_STREAM")]
    DataAfterEndStream,

    #[error("request body over {max} bytes")]
    BodyTooLarge { max: u64 },

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("response fields could not be encoded")]
    Unencodable,

    #[error("could not spool request body: {0}")]
    Spool(#[from] std::io::Error),
}

impl H2StreamError {
    /// The code sent in our RST_STREAM
    pub fn as_known_error_code(&self) -> KnownErrorCode {
        match self {
            Self::DataAfterEndStream => KnownErrorCode::StreamClosed,
            Self::BadPriorityLength(_) => KnownErrorCode::FrameSizeError,
            Self::BodyTooLarge { .. } => KnownErrorCode::EnhanceYourCalm,
            Self::Unencodable | Self::Spool(_) => KnownErrorCode::InternalError,
            Self::OpenEndedTrailers | Self::Malformed(_) => KnownErrorCode::ProtocolError,
        }
    }
}
