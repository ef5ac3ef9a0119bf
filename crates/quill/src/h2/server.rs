use std::rc::Rc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use bytes::{Buf, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::{header, HeaderName, StatusCode, Version};
use quill_h2::{
    could_be_preface, strip_padding, DataFlags, Frame, FrameType, GoAway, HeadersFlags,
    KnownErrorCode, PingFlags, PrioritySpec, RstStream, Setting, Settings, SettingsFlags,
    StreamId, WindowUpdate, FRAME_HEADER_LEN, PING_PAYLOAD_LEN, PREFACE,
};
use quill_hpack::{Decoder, Encoder};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    encode,
    types::{
        ConnState, H2ConnectionError, H2ErrorLevel, H2Event, H2StreamError, HeadersOrTrailers,
        PendingHeaders, StreamState,
    },
    ServerConf,
};
use crate::{
    h1,
    types::{
        is_connection_specific, is_valid_value, CookieConf, Method, Request, RequestBody,
        Response, ResponseBody,
    },
    util::trace_partial,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingPreface,
    Connected,
    Closed,
}

/// One HTTP/2 connection, minus the I/O: bytes go in with
/// [feed](H2Conn::feed), events come out of [poll](H2Conn::poll), and
/// everything to send piles up until [take_output](H2Conn::take_output).
///
/// Flow control is only acknowledged, never enforced: every DATA frame
/// received is immediately credited back to the peer, WINDOW_UPDATE frames
/// are validated then ignored, and outgoing DATA is never throttled.
/// SETTINGS_MAX_CONCURRENT_STREAMS is advertised but not enforced either.
pub struct H2Conn {
    conf: Rc<ServerConf>,
    phase: Phase,

    inbuf: BytesMut,
    out: BytesMut,

    hpack_dec: Decoder,
    hpack_enc: Encoder,

    state: ConnState,
    pending_headers: Option<PendingHeaders>,
    goaway_recv: bool,
}

impl H2Conn {
    /// Starts a connection. Our SETTINGS frame is queued right away, since
    /// the server preface doesn't have to wait for the client's.
    pub fn new(conf: Rc<ServerConf>) -> Self {
        let mut hpack_dec = Decoder::new();
        hpack_dec.set_max_allowed_table_size(conf.header_table_size as usize);
        hpack_dec.set_max_header_list_size(conf.max_header_list_size as usize);

        let mut state = ConnState::default();
        state.self_settings = Settings {
            header_table_size: conf.header_table_size,
            enable_push: false,
            max_concurrent_streams: Some(conf.max_concurrent_streams),
            initial_window_size: conf.initial_window_size,
            max_frame_size: conf.max_frame_size,
            max_header_list_size: conf.max_header_list_size,
        };

        let mut conn = Self {
            conf,
            phase: Phase::AwaitingPreface,
            inbuf: BytesMut::new(),
            out: BytesMut::new(),
            hpack_dec,
            hpack_enc: Encoder::new(),
            state,
            pending_headers: None,
            goaway_recv: false,
        };

        let s = conn.state.self_settings;
        let pairs = [
            (Setting::HeaderTableSize, s.header_table_size),
            (Setting::EnablePush, 0),
            (Setting::MaxConcurrentStreams, conn.conf.max_concurrent_streams),
            (Setting::InitialWindowSize, s.initial_window_size),
            (Setting::MaxFrameSize, s.max_frame_size),
            (Setting::MaxHeaderListSize, s.max_header_list_size),
        ];
        encode::write_settings(&mut conn.out, &pairs);
        conn
    }

    /// Starts a connection upgraded from HTTP/1.1 (`Upgrade: h2c`). The
    /// upgrading request becomes stream 1, which is half-closed since the
    /// request was fully received over HTTP/1.1. The client preface is
    /// still expected.
    pub fn new_upgraded(
        conf: Rc<ServerConf>,
        http2_settings: &[u8],
        mut req: Request,
    ) -> Result<(Self, Request), H2ConnectionError> {
        let payload = URL_SAFE_NO_PAD
            .decode(http2_settings.trim_ascii())
            .map_err(|_| H2ConnectionError::BadUpgradeSettings)?;

        let mut conn = Self::new(conf);
        conn.apply_peer_settings(&payload)?;

        let stream_id = StreamId(1);
        conn.state.last_stream_id = stream_id;
        conn.state
            .streams
            .insert(stream_id, StreamState::HalfClosedRemote { method: req.method });
        req.stream_id = Some(stream_id);
        debug!(method = %req.method, path = %req.path, "upgraded to h2c");
        Ok((conn, req))
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.inbuf.extend_from_slice(data);
    }

    /// Everything queued for the peer so far
    pub fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    /// True after a connection error: only the queued output (ending with
    /// GOAWAY) remains to be sent.
    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// True once the peer sent GOAWAY and no stream is left
    pub fn is_done(&self) -> bool {
        self.is_closed() || (self.goaway_recv && self.state.streams.is_empty())
    }

    /// How many streams are open or waiting for a response
    pub fn active_streams(&self) -> usize {
        self.state.streams.len()
    }

    pub fn peer_settings(&self) -> &Settings {
        &self.state.peer_settings
    }

    /// Processes buffered frames until one yields an event, or more input is
    /// needed. Stream errors are answered with RST_STREAM and processing
    /// goes on. Connection errors queue a GOAWAY and close the connection.
    pub fn poll(&mut self) -> Result<Option<H2Event>, H2ConnectionError> {
        match self.poll_inner() {
            Ok(ev) => Ok(ev),
            Err(e) => {
                let error_code = e.as_known_error_code();
                warn!(%e, ?error_code, "h2 connection error, going away");
                self.go_away(error_code, e.to_string().as_bytes());
                self.phase = Phase::Closed;
                Err(e)
            }
        }
    }

    fn poll_inner(&mut self) -> Result<Option<H2Event>, H2ConnectionError> {
        loop {
            match self.phase {
                Phase::Closed => return Ok(None),
                Phase::AwaitingPreface => {
                    if !could_be_preface(&self.inbuf) {
                        return Err(H2ConnectionError::BadPreface);
                    }
                    if self.inbuf.len() < PREFACE.len() {
                        trace_partial("client preface", &self.inbuf);
                        return Ok(None);
                    }
                    self.inbuf.advance(PREFACE.len());
                    debug!("read client preface");
                    self.phase = Phase::Connected;
                }
                Phase::Connected => {
                    if self.inbuf.len() < FRAME_HEADER_LEN {
                        return Ok(None);
                    }
                    // nine bytes always make a frame header
                    let Ok((_, frame)) = Frame::parse(&self.inbuf[..FRAME_HEADER_LEN]) else {
                        return Ok(None);
                    };

                    let max = self.state.self_settings.max_frame_size;
                    if frame.len > max {
                        return Err(H2ConnectionError::FrameTooLarge {
                            frame_type: frame.frame_type,
                            len: frame.len,
                            max,
                        });
                    }

                    // never interpret a partial frame
                    if self.inbuf.len() < FRAME_HEADER_LEN + frame.len as usize {
                        trace_partial("frame payload", &self.inbuf);
                        return Ok(None);
                    }
                    self.inbuf.advance(FRAME_HEADER_LEN);
                    let payload = self.inbuf.split_to(frame.len as usize).freeze();
                    trace!(?frame, "received frame");

                    match self.process_frame(frame, payload) {
                        Ok(Some(ev)) => return Ok(Some(ev)),
                        Ok(None) => {}
                        Err(H2ErrorLevel::Connection(e)) => return Err(e),
                        Err(H2ErrorLevel::Stream { stream_id, error }) => {
                            self.rst(stream_id, error);
                        }
                    }
                }
            }
        }
    }

    fn process_frame(
        &mut self,
        frame: Frame,
        payload: Bytes,
    ) -> Result<Option<H2Event>, H2ErrorLevel> {
        // cf. RFC 9113 section 6.10: nothing may come between the frames
        // of a field block
        if let Some(pending) = &self.pending_headers {
            let continues = matches!(frame.frame_type, FrameType::Continuation(_))
                && frame.stream_id == pending.stream_id;
            if !continues {
                return Err(H2ConnectionError::InterruptedFieldBlock {
                    stream_id: pending.stream_id,
                    frame_type: frame.frame_type,
                    frame_stream_id: frame.stream_id,
                }
                .into());
            }
        }

        let on_connection = frame.stream_id == StreamId::CONNECTION;
        let stream_level = matches!(
            frame.frame_type,
            FrameType::Data(_)
                | FrameType::Headers(_)
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::Continuation(_)
        );
        let connection_level = matches!(
            frame.frame_type,
            FrameType::Settings(_) | FrameType::Ping(_) | FrameType::GoAway
        );
        if stream_level && on_connection {
            return Err(H2ConnectionError::NeedsStream {
                frame_type: frame.frame_type,
            }
            .into());
        }
        if connection_level && !on_connection {
            return Err(H2ConnectionError::NeedsConnection {
                frame_type: frame.frame_type,
                stream_id: frame.stream_id,
            }
            .into());
        }

        match frame.frame_type {
            FrameType::Data(flags) => {
                let data = if flags.contains(DataFlags::Padded) {
                    unpad(&frame, &payload)?
                } else {
                    &payload[..]
                };

                // we don't do flow control, so give the credit right back
                if frame.len > 0 {
                    encode::write_window_update(&mut self.out, StreamId::CONNECTION, frame.len);
                }

                let (req, mut body) = match self.state.streams.remove(&frame.stream_id) {
                    Some(StreamState::Open { req, body }) => (req, body),
                    Some(half_closed @ StreamState::HalfClosedRemote { .. }) => {
                        debug!(stream_id = %frame.stream_id, "Received data for closed stream");
                        self.state.streams.insert(frame.stream_id, half_closed);
                        return Err(H2ErrorLevel::Stream {
                            stream_id: frame.stream_id,
                            error: H2StreamError::DataAfterEndStream,
                        });
                    }
                    None if self.state.was_reset(frame.stream_id) => {
                        // the connection window was credited above already
                        trace!(stream_id = %frame.stream_id, len = %frame.len, "dropping data for a stream we reset");
                        return Ok(None);
                    }
                    None => return Err(self.unknown_stream(&frame).into()),
                };

                if !data.is_empty() {
                    let body = body.get_or_insert_with(|| {
                        RequestBody::new(self.conf.body_memory_limit)
                    });
                    if body.len() + data.len() as u64 > self.conf.max_body_size {
                        return Err(H2ErrorLevel::Stream {
                            stream_id: frame.stream_id,
                            error: H2StreamError::BodyTooLarge {
                                max: self.conf.max_body_size,
                            },
                        });
                    }
                    body.write(data).map_err(|e| H2ErrorLevel::Stream {
                        stream_id: frame.stream_id,
                        error: e.into(),
                    })?;
                }

                if frame.is_end_stream() {
                    return Ok(Some(self.complete_request(frame.stream_id, req, body)));
                }
                if frame.len > 0 {
                    encode::write_window_update(&mut self.out, frame.stream_id, frame.len);
                }
                self.state
                    .streams
                    .insert(frame.stream_id, StreamState::Open { req, body });
            }
            FrameType::Headers(flags) => {
                let mut block = if flags.contains(HeadersFlags::Padded) {
                    unpad(&frame, &payload)?
                } else {
                    &payload[..]
                };

                if flags.contains(HeadersFlags::Priority) {
                    let (pri_spec, rest) =
                        PrioritySpec::split_off(block).ok_or(H2ConnectionError::BadLength {
                            frame_type: frame.frame_type,
                            len: frame.len,
                        })?;
                    trace!(?pri_spec, "ignoring priority in HEADERS");
                    if pri_spec.stream_dependency == frame.stream_id {
                        return Err(H2ConnectionError::SelfDependency(frame.stream_id).into());
                    }
                    block = rest;
                }

                let end_stream = flags.contains(HeadersFlags::EndStream);
                if flags.contains(HeadersFlags::EndHeaders) {
                    return self.on_field_block(frame.stream_id, end_stream, block);
                }
                self.pending_headers = Some(PendingHeaders {
                    stream_id: frame.stream_id,
                    end_stream,
                    fragments: BytesMut::from(block),
                });
            }
            FrameType::Continuation(_) => {
                let Some(mut pending) = self.pending_headers.take() else {
                    return Err(H2ConnectionError::StrayContinuation(frame.stream_id).into());
                };
                pending.fragments.extend_from_slice(&payload);

                // the decoder would catch it, but only once the block is complete
                let max = self.conf.max_header_list_size as usize;
                if pending.fragments.len() > max {
                    return Err(H2ConnectionError::HeaderListTooLarge {
                        size: pending.fragments.len(),
                        max,
                    }
                    .into());
                }

                if frame.is_end_headers() {
                    let block = pending.fragments.freeze();
                    return self.on_field_block(pending.stream_id, pending.end_stream, &block);
                }
                self.pending_headers = Some(pending);
            }
            FrameType::Priority => {
                let Some(pri_spec) = PrioritySpec::decode(&payload) else {
                    return Err(H2ErrorLevel::Stream {
                        stream_id: frame.stream_id,
                        error: H2StreamError::BadPriorityLength(frame.len),
                    });
                };
                trace!(?pri_spec, "ignoring PRIORITY");
                if pri_spec.stream_dependency == frame.stream_id {
                    return Err(H2ConnectionError::SelfDependency(frame.stream_id).into());
                }
            }
            // note: this always unconditionally transitions the stream to closed
            FrameType::RstStream => {
                let rst = RstStream::decode(&payload).ok_or(H2ConnectionError::BadLength {
                    frame_type: frame.frame_type,
                    len: frame.len,
                })?;

                match self.state.streams.remove(&frame.stream_id) {
                    Some(_) => {
                        debug!(
                            stream_id = %frame.stream_id,
                            error_code = ?rst.error_code,
                            streams = self.state.streams.len(),
                            "peer reset stream"
                        );
                        return Ok(Some(H2Event::StreamReset {
                            stream_id: frame.stream_id,
                            error_code: rst.error_code,
                        }));
                    }
                    None if frame.stream_id > self.state.last_stream_id => {
                        return Err(H2ConnectionError::IdleStream {
                            frame_type: frame.frame_type,
                            stream_id: frame.stream_id,
                        }
                        .into());
                    }
                    None => {
                        // we closed it first, that's fine
                    }
                }
            }
            FrameType::Settings(s) => {
                if s.contains(SettingsFlags::Ack) {
                    if !payload.is_empty() {
                        return Err(H2ConnectionError::BadLength {
                            frame_type: frame.frame_type,
                            len: frame.len,
                        }
                        .into());
                    }
                    debug!("peer acknowledged our settings");
                    return Ok(None);
                }
                self.apply_peer_settings(&payload)?;

                encode::write_frame(
                    &mut self.out,
                    Frame::new(
                        FrameType::Settings(SettingsFlags::Ack.into()),
                        StreamId::CONNECTION,
                    ),
                    &[],
                );
                debug!(peer_settings = ?self.state.peer_settings, "acknowledged peer settings");
            }
            FrameType::PushPromise => {
                return Err(H2ConnectionError::PushPromise.into());
            }
            FrameType::Ping(flags) => {
                if payload.len() != PING_PAYLOAD_LEN {
                    return Err(H2ConnectionError::BadLength {
                        frame_type: frame.frame_type,
                        len: frame.len,
                    }
                    .into());
                }
                if flags.contains(PingFlags::Ack) {
                    return Ok(None);
                }

                encode::write_frame(
                    &mut self.out,
                    Frame::new(FrameType::Ping(PingFlags::Ack.into()), StreamId::CONNECTION),
                    &payload,
                );
            }
            FrameType::GoAway => {
                let goaway = GoAway::decode(&payload).ok_or(H2ConnectionError::BadLength {
                    frame_type: frame.frame_type,
                    len: frame.len,
                })?;
                debug!(
                    last_stream_id = %goaway.last_stream_id,
                    error_code = ?goaway.error_code,
                    debug_data = %String::from_utf8_lossy(&goaway.debug_data),
                    "peer is going away"
                );
                self.goaway_recv = true;
                return Ok(Some(H2Event::GoAway {
                    last_stream_id: goaway.last_stream_id,
                    error_code: goaway.error_code,
                }));
            }
            FrameType::WindowUpdate => {
                let update = WindowUpdate::decode(&payload).ok_or(H2ConnectionError::BadLength {
                    frame_type: frame.frame_type,
                    len: frame.len,
                })?;
                if update.increment == 0 {
                    return Err(H2ConnectionError::ZeroIncrement.into());
                }
                if frame.stream_id > self.state.last_stream_id {
                    return Err(H2ConnectionError::IdleStream {
                        frame_type: frame.frame_type,
                        stream_id: frame.stream_id,
                    }
                    .into());
                }
                trace!(stream_id = %frame.stream_id, increment = %update.increment, "window update, not enforced");
            }
            FrameType::Unknown { ty, flags } => {
                trace!(ty, flags, "ignoring extension frame");
            }
        }

        Ok(None)
    }

    /// Handles a complete field block: the request head of a new stream, or
    /// the trailers of an open one.
    fn on_field_block(
        &mut self,
        stream_id: StreamId,
        end_stream: bool,
        block: &[u8],
    ) -> Result<Option<H2Event>, H2ErrorLevel> {
        let headers_or_trailers = match self.state.streams.get(&stream_id) {
            None if self.state.was_reset(stream_id) => {
                // still decoded, the dynamic table has to follow the peer's
                self.hpack_dec
                    .decode(block)
                    .map_err(H2ConnectionError::from)?;
                debug!(%stream_id, "dropping field block for a stream we reset");
                return Ok(None);
            }
            None => {
                if stream_id.is_server_initiated() {
                    return Err(H2ConnectionError::EvenStreamId(stream_id).into());
                }
                let last_stream_id = self.state.last_stream_id;
                if stream_id == last_stream_id {
                    // it was opened, then closed in-between
                    return Err(H2ConnectionError::ClosedStream(stream_id).into());
                }
                if stream_id < last_stream_id {
                    return Err(H2ConnectionError::StreamIdRegression {
                        stream_id,
                        last_stream_id,
                    }
                    .into());
                }
                self.state.last_stream_id = stream_id;
                HeadersOrTrailers::Headers
            }
            Some(StreamState::Open { .. }) => HeadersOrTrailers::Trailers,
            Some(StreamState::HalfClosedRemote { .. }) => {
                return Err(H2ConnectionError::ClosedStream(stream_id).into());
            }
        };

        // decoding has to happen no matter what, to keep the dynamic table
        // in sync with the peer's
        let fields = self
            .hpack_dec
            .decode(block)
            .map_err(H2ConnectionError::from)?;
        debug!(%stream_id, ?headers_or_trailers, fields = fields.len(), "decoded field block");

        let stream_err = |error| H2ErrorLevel::Stream { stream_id, error };
        match headers_or_trailers {
            HeadersOrTrailers::Headers => {
                let mut req = request_from_fields(fields).map_err(stream_err)?;
                req.stream_id = Some(stream_id);
                req.complete_headers();

                let req = Box::new(req);
                if end_stream {
                    return Ok(Some(self.complete_request(stream_id, req, None)));
                }
                self.state
                    .streams
                    .insert(stream_id, StreamState::Open { req, body: None });
                Ok(None)
            }
            HeadersOrTrailers::Trailers => {
                if !end_stream {
                    return Err(stream_err(H2StreamError::OpenEndedTrailers));
                }
                let Some(StreamState::Open { mut req, body }) =
                    self.state.streams.remove(&stream_id)
                else {
                    return Ok(None);
                };
                for (name, value) in fields {
                    if name.starts_with(b":") {
                        return Err(stream_err(H2StreamError::Malformed(
                            "pseudo-header fields are not allowed in trailers",
                        )));
                    }
                    let name = regular_field_name(&name, &value).map_err(stream_err)?;
                    let value = Bytes::from(value);
                    req.trailers.append(name.clone(), value.clone());
                    req.headers.append(name, value);
                }
                Ok(Some(self.complete_request(stream_id, req, body)))
            }
        }
    }

    fn complete_request(
        &mut self,
        stream_id: StreamId,
        mut req: Box<Request>,
        body: Option<RequestBody>,
    ) -> H2Event {
        req.complete_body(body);
        self.state.streams.insert(
            stream_id,
            StreamState::HalfClosedRemote { method: req.method },
        );

        match req.method {
            Method::Trace => {
                debug!(%stream_id, "refusing TRACE");
                let mut response = Response::error(StatusCode::METHOD_NOT_ALLOWED);
                // cannot fail on a fresh response
                let _ = response.insert_header(header::ALLOW, Method::ALLOWED);
                H2Event::Respond {
                    stream_id,
                    response,
                }
            }
            Method::Options => H2Event::Respond {
                stream_id,
                response: h1::options_response(),
            },
            _ => H2Event::Request(*req),
        }
    }

    fn unknown_stream(&self, frame: &Frame) -> H2ConnectionError {
        if frame.stream_id > self.state.last_stream_id {
            H2ConnectionError::IdleStream {
                frame_type: frame.frame_type,
                stream_id: frame.stream_id,
            }
        } else {
            H2ConnectionError::ClosedStream(frame.stream_id)
        }
    }

    fn apply_peer_settings(&mut self, payload: &[u8]) -> Result<(), H2ConnectionError> {
        let s = &mut self.state.peer_settings;
        let hpack_enc = &mut self.hpack_enc;
        let our_table_size = self.conf.header_table_size;

        Settings::parse(payload, |code, value| -> Result<(), H2ConnectionError> {
            s.apply(code, value)?;
            if let Setting::HeaderTableSize = code {
                // we may use less than the peer allows
                hpack_enc.set_max_table_size(value.min(our_table_size) as usize);
            }
            Ok(())
        })
    }

    /// Resets one stream, the connection goes on.
    fn rst(&mut self, stream_id: StreamId, e: H2StreamError) {
        self.state.streams.remove(&stream_id);
        self.state.remember_reset(stream_id);

        let error_code = e.as_known_error_code();
        debug!(%stream_id, ?error_code, %e, "resetting stream");
        encode::write_rst(&mut self.out, stream_id, error_code.into());
    }

    /// Queues a GOAWAY. With [KnownErrorCode::NoError], streams already
    /// accepted may still complete.
    pub fn go_away(&mut self, error_code: KnownErrorCode, debug_data: &[u8]) {
        encode::write_goaway(
            &mut self.out,
            &GoAway {
                last_stream_id: self.state.last_stream_id,
                error_code: error_code.into(),
                debug_data: debug_data.to_vec(),
            },
        );
    }

    /// Queues the response to the request on `stream_id`. A body known up
    /// front is queued too, and the stream ends. For a streamed body the
    /// receiving end is handed back: pass each chunk to
    /// [send_data](Self::send_data), then end the stream.
    ///
    /// Returns `None` without queuing anything if the stream is gone, e.g.
    /// the peer reset it.
    pub fn send_response(
        &mut self,
        stream_id: StreamId,
        res: &mut Response,
        cookie_conf: &CookieConf,
        now: DateTime<Utc>,
    ) -> Option<mpsc::Receiver<Bytes>> {
        let method = match self.state.streams.get(&stream_id) {
            Some(StreamState::HalfClosedRemote { method }) => *method,
            _ => {
                debug!(%stream_id, "stream is gone, dropping response");
                return None;
            }
        };

        let fields = encode::response_fields(res, cookie_conf, now);
        res.mark_headers_sent();
        let status = res.status();
        let body = match res.take_body() {
            _ if method == Method::Head
                || status == StatusCode::NO_CONTENT
                || status == StatusCode::NOT_MODIFIED =>
            {
                ResponseBody::Empty
            }
            ResponseBody::Full(bytes) if bytes.is_empty() => ResponseBody::Empty,
            body => body,
        };

        let block = match self
            .hpack_enc
            .encode(fields.iter().map(|(n, v)| (&n[..], &v[..])))
        {
            Ok(block) => block,
            Err(e) => {
                warn!(%stream_id, %e, "could not encode response headers");
                self.rst(stream_id, H2StreamError::Unencodable);
                return None;
            }
        };

        let max_frame_size = self.state.peer_settings.max_frame_size as usize;
        match body {
            ResponseBody::Empty => {
                encode::write_headers(&mut self.out, stream_id, &block, true, max_frame_size);
                self.state.streams.remove(&stream_id);
                None
            }
            ResponseBody::Full(bytes) => {
                encode::write_headers(&mut self.out, stream_id, &block, false, max_frame_size);
                encode::write_data(&mut self.out, stream_id, &bytes, true, max_frame_size);
                res.record_written(bytes.len());
                self.state.streams.remove(&stream_id);
                None
            }
            ResponseBody::Stream(rx) => {
                encode::write_headers(&mut self.out, stream_id, &block, false, max_frame_size);
                Some(rx)
            }
        }
    }

    /// Queues body data for a response sent with
    /// [send_response](Self::send_response). Returns false if the stream
    /// is gone.
    pub fn send_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) -> bool {
        if !self.state.streams.contains_key(&stream_id) {
            return false;
        }
        let max_frame_size = self.state.peer_settings.max_frame_size as usize;
        encode::write_data(&mut self.out, stream_id, data, end_stream, max_frame_size);
        if end_stream {
            self.state.streams.remove(&stream_id);
        }
        true
    }
}

/// Strips padding off a DATA or HEADERS payload.
fn unpad<'a>(frame: &Frame, payload: &'a [u8]) -> Result<&'a [u8], H2ConnectionError> {
    if payload.is_empty() {
        return Err(H2ConnectionError::BadLength {
            frame_type: frame.frame_type,
            len: frame.len,
        });
    }
    strip_padding(payload).map_err(|source| H2ConnectionError::BadPadding {
        frame_type: frame.frame_type,
        source,
    })
}

/// Validates a regular (non-pseudo) field, cf. RFC 9113 section 8.2
fn regular_field_name(name: &[u8], value: &[u8]) -> Result<HeaderName, H2StreamError> {
    // An implementation that validates fields according to the definitions in
    // Sections 5.1 and 5.5 of HTTP only needs an additional check that field
    // names do not include uppercase characters.
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(H2StreamError::Malformed(
            "field names must not contain uppercase characters",
        ));
    }
    let name = HeaderName::from_bytes(name)
        .map_err(|_| H2StreamError::Malformed("invalid field name"))?;
    if is_connection_specific(&name) {
        return Err(H2StreamError::Malformed(
            "connection-specific fields are forbidden",
        ));
    }
    if name == header::TE && value != b"trailers" {
        return Err(H2StreamError::Malformed(
            "te must not contain anything but 'trailers'",
        ));
    }
    if !is_valid_value(value) {
        return Err(H2StreamError::Malformed(
            "field values must not contain CR, LF or NUL",
        ));
    }
    Ok(name)
}

/// Builds a request out of a decoded field block: pseudo-headers first,
/// each at most once, then regular fields.
fn request_from_fields(fields: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Request, H2StreamError> {
    let mut method: Option<String> = None;
    let mut scheme: Option<String> = None;
    let mut path: Option<String> = None;
    let mut authority: Option<String> = None;

    let mut saw_regular_field = false;
    let mut regular = Vec::with_capacity(fields.len());
    let mut cookies: Vec<Vec<u8>> = Vec::new();

    for (name, value) in fields {
        if let Some(pseudo) = name.strip_prefix(b":") {
            if saw_regular_field {
                return Err(H2StreamError::Malformed(
                    "pseudo-header fields must come before regular fields",
                ));
            }
            let slot = match pseudo {
                b"method" => &mut method,
                b"scheme" => &mut scheme,
                b"path" => &mut path,
                b"authority" => &mut authority,
                _ => return Err(H2StreamError::Malformed("unknown pseudo-header field")),
            };
            let value = String::from_utf8(value)
                .map_err(|_| H2StreamError::Malformed("pseudo-header value is not utf-8"))?;
            if slot.replace(value).is_some() {
                return Err(H2StreamError::Malformed("duplicate pseudo-header field"));
            }
        } else {
            saw_regular_field = true;
            let name = regular_field_name(&name, &value)?;
            if name == header::COOKIE {
                cookies.push(value);
            } else {
                regular.push((name, value));
            }
        }
    }

    let method = method.ok_or(H2StreamError::Malformed("missing :method"))?;
    let method = Method::from_bytes(method.as_bytes())
        .ok_or(H2StreamError::Malformed("unknown method"))?;
    let path = path
        .filter(|p| !p.is_empty())
        .ok_or(H2StreamError::Malformed("missing :path"))?;

    let mut req = Request::new(method, &path, Version::HTTP_2);
    if let Some(scheme) = scheme {
        req.scheme = scheme
            .parse()
            .map_err(|_| H2StreamError::Malformed("invalid :scheme"))?;
    }
    for (name, value) in regular {
        req.headers.append(name, Bytes::from(value));
    }
    if let Some(authority) = authority {
        req.headers.insert(header::HOST, Bytes::from(authority));
    }
    // cf. RFC 9113 section 8.2.3
    if !cookies.is_empty() {
        req.headers
            .insert(header::COOKIE, Bytes::from(cookies.join(&b"; "[..])));
    }
    Ok(req)
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use bytes::{Bytes, BytesMut};
    use chrono::Utc;
    use http::{header, StatusCode, Version};
    use pretty_assertions::assert_eq;
    use quill_h2::{
        enumflags2::BitFlags, ContinuationFlags, DataFlags, ErrorCode, Frame, FrameType, GoAway,
        HeadersFlags, KnownErrorCode, PingFlags, RstStream, Setting, Settings, StreamId,
        FRAME_HEADER_LEN, PREFACE,
    };
    use quill_hpack::{Decoder, Encoder};

    use super::{H2Conn, H2Event};
    use crate::{
        h2::{encode::write_frame, H2ConnectionError, ServerConf},
        types::{CookieConf, HeadersExt, Method, Response},
    };

    fn frame(frame_type: FrameType, stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_frame(&mut out, Frame::new(frame_type, StreamId(stream_id)), payload);
        out.to_vec()
    }

    fn parse_frames(mut buf: &[u8]) -> Vec<(Frame, Bytes)> {
        let mut frames = vec![];
        while !buf.is_empty() {
            let (_, frame) = Frame::parse(buf).unwrap();
            let end = FRAME_HEADER_LEN + frame.len as usize;
            frames.push((frame, Bytes::copy_from_slice(&buf[FRAME_HEADER_LEN..end])));
            buf = &buf[end..];
        }
        frames
    }

    struct Client {
        conn: H2Conn,
        enc: Encoder,
    }

    impl Client {
        fn connect(conf: ServerConf) -> Self {
            let mut conn = H2Conn::new(Rc::new(conf));
            conn.feed(PREFACE);
            conn.feed(&frame(FrameType::Settings(BitFlags::default()), 0, &[]));
            assert!(conn.poll().unwrap().is_none());

            let frames = parse_frames(&conn.take_output());
            assert!(matches!(frames[0].0.frame_type, FrameType::Settings(_)));
            assert!(!frames[0].0.is_ack());
            assert!(frames[1].0.is_ack());
            Self {
                conn,
                enc: Encoder::new(),
            }
        }

        fn block(&mut self, fields: &[(&str, &str)]) -> Vec<u8> {
            self.enc
                .encode(fields.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())))
                .unwrap()
        }

        fn headers(&mut self, stream_id: u32, fields: &[(&str, &str)], end_stream: bool) {
            let block = self.block(fields);
            let mut flags = BitFlags::from(HeadersFlags::EndHeaders);
            if end_stream {
                flags |= HeadersFlags::EndStream;
            }
            self.conn
                .feed(&frame(FrameType::Headers(flags), stream_id, &block));
        }

        fn poll_request(&mut self) -> crate::types::Request {
            match self.conn.poll().unwrap() {
                Some(H2Event::Request(req)) => req,
                other => panic!("expected a request, got {other:?}"),
            }
        }
    }

    fn get(path: &str) -> Vec<(&'static str, String)> {
        vec![
            (":method", "GET".into()),
            (":scheme", "https".into()),
            (":path", path.into()),
            (":authority", "example.com".into()),
        ]
    }

    fn fields<'a>(f: &'a [(&'static str, String)]) -> Vec<(&'a str, &'a str)> {
        f.iter().map(|(n, v)| (*n, v.as_str())).collect()
    }

    #[test]
    fn test_simple_request() {
        let mut client = Client::connect(Default::default());
        let mut f = get("/a?x=1&y[]=2&y[]=3");
        f.push(("cookie", "a=1".into()));
        f.push(("cookie", "b=2".into()));
        client.headers(1, &fields(&f), true);

        let req = client.poll_request();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.version, Version::HTTP_2);
        assert_eq!(req.path, "/a");
        assert_eq!(req.query, "x=1&y[]=2&y[]=3");
        assert_eq!(req.host(), Some("example.com"));
        assert_eq!(req.stream_id, Some(StreamId(1)));
        assert_eq!(&req.headers[header::COOKIE][..], b"a=1; b=2");
        assert_eq!(req.cookies.len(), 2);
        assert!(req.body_complete());
        assert_eq!(client.conn.active_streams(), 1);
    }

    #[test]
    fn test_continuation_and_data() {
        let mut client = Client::connect(Default::default());
        let mut f = get("/upload");
        f[0].1 = "POST".into();
        f.push(("x-long", "v".repeat(100)));
        let block = client.block(&fields(&f));
        let (first, rest) = block.split_at(10);

        client
            .conn
            .feed(&frame(FrameType::Headers(BitFlags::default()), 3, first));
        client.conn.feed(&frame(
            FrameType::Continuation(ContinuationFlags::EndHeaders.into()),
            3,
            rest,
        ));
        assert!(client.conn.poll().unwrap().is_none());

        client
            .conn
            .feed(&frame(FrameType::Data(BitFlags::default()), 3, b"hello "));
        // padded: pad length 2, then data, then padding
        client.conn.feed(&frame(
            FrameType::Data(DataFlags::Padded | DataFlags::EndStream),
            3,
            b"\x02world\0\0",
        ));
        let req = client.poll_request();
        assert_eq!(&req.body_bytes().unwrap()[..], b"hello world");
        assert_eq!(req.headers.get_str("x-long").map(str::len), Some(100));

        // received data is credited back
        let frames = parse_frames(&client.conn.take_output());
        assert!(frames
            .iter()
            .all(|(f, _)| f.frame_type == FrameType::WindowUpdate));
        assert!(!frames.is_empty());
    }

    #[test]
    fn test_trailers_are_merged() {
        let mut client = Client::connect(Default::default());
        let mut f = get("/t");
        f[0].1 = "POST".into();
        client.headers(1, &fields(&f), false);
        client
            .conn
            .feed(&frame(FrameType::Data(BitFlags::default()), 1, b"body"));
        client.headers(1, &[("x-checksum", "abc")], true);

        let req = client.poll_request();
        assert_eq!(&req.trailers["x-checksum"][..], b"abc");
        assert_eq!(&req.headers["x-checksum"][..], b"abc");
    }

    #[test]
    fn test_ping_is_echoed() {
        let mut client = Client::connect(Default::default());
        client
            .conn
            .feed(&frame(FrameType::Ping(BitFlags::default()), 0, b"12345678"));
        assert!(client.conn.poll().unwrap().is_none());

        let frames = parse_frames(&client.conn.take_output());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.frame_type, FrameType::Ping(PingFlags::Ack.into()));
        assert_eq!(&frames[0].1[..], b"12345678");
    }

    #[test]
    fn test_invalid_preface() {
        let mut conn = H2Conn::new(Rc::new(ServerConf::default()));
        conn.take_output();
        conn.feed(b"PRI * HTTP/2.0\r\n\r\nXX");
        assert!(matches!(conn.poll(), Err(H2ConnectionError::BadPreface)));
        assert!(conn.is_closed());

        let frames = parse_frames(&conn.take_output());
        let goaway = GoAway::decode(&frames[0].1).unwrap();
        assert_eq!(goaway.error_code, ErrorCode::from(KnownErrorCode::ProtocolError));
    }

    #[test]
    fn test_stream_id_discipline() {
        let mut client = Client::connect(Default::default());
        client.headers(2, &fields(&get("/")), true);
        assert!(matches!(
            client.conn.poll(),
            Err(H2ConnectionError::EvenStreamId(StreamId(2)))
        ));

        let mut client = Client::connect(Default::default());
        client.headers(5, &fields(&get("/")), true);
        client.poll_request();
        client.headers(3, &fields(&get("/")), true);
        assert!(matches!(
            client.conn.poll(),
            Err(H2ConnectionError::StreamIdRegression { .. })
        ));
    }

    #[test]
    fn test_malformed_request_resets_stream() {
        let mut client = Client::connect(Default::default());
        let mut f = get("/");
        f.push(("X-Upper", "1".into()));
        client.headers(1, &fields(&f), true);
        assert!(client.conn.poll().unwrap().is_none());

        let frames = parse_frames(&client.conn.take_output());
        assert_eq!(frames[0].0.frame_type, FrameType::RstStream);
        assert_eq!(frames[0].0.stream_id, StreamId(1));
        let rst = RstStream::decode(&frames[0].1).unwrap();
        assert_eq!(rst.error_code, ErrorCode::from(KnownErrorCode::ProtocolError));

        // the connection carries on, and the hpack state is still in sync
        client.headers(3, &fields(&get("/next")), true);
        assert_eq!(client.poll_request().path, "/next");

        // pseudo-header after a regular one
        let f = [
            (":method", "GET"),
            ("x-a", "1"),
            (":path", "/"),
            (":scheme", "http"),
        ];
        client.headers(5, &f, true);
        assert!(client.conn.poll().unwrap().is_none());
        let frames = parse_frames(&client.conn.take_output());
        assert_eq!(frames[0].0.frame_type, FrameType::RstStream);
    }

    #[test]
    fn test_header_list_too_large() {
        let mut client = Client::connect(ServerConf {
            max_header_list_size: 200,
            ..Default::default()
        });
        let mut f = get("/");
        f.push(("x-big", "v".repeat(300)));
        client.headers(1, &fields(&f), true);
        let err = client.conn.poll().unwrap_err();
        assert_eq!(err.as_known_error_code(), KnownErrorCode::EnhanceYourCalm);
    }

    #[test]
    fn test_body_too_large() {
        let mut client = Client::connect(ServerConf {
            max_body_size: 4,
            ..Default::default()
        });
        let mut f = get("/");
        f[0].1 = "PUT".into();
        client.headers(1, &fields(&f), false);
        client
            .conn
            .feed(&frame(FrameType::Data(DataFlags::EndStream.into()), 1, b"12345"));
        assert!(client.conn.poll().unwrap().is_none());

        let frames = parse_frames(&client.conn.take_output());
        let (rst, payload) = frames
            .iter()
            .find(|(f, _)| f.frame_type == FrameType::RstStream)
            .unwrap();
        assert_eq!(rst.stream_id, StreamId(1));
        let rst = RstStream::decode(payload).unwrap();
        assert_eq!(rst.error_code, ErrorCode::from(KnownErrorCode::EnhanceYourCalm));
    }

    #[test]
    fn test_frames_after_local_reset_are_ignored() {
        let mut client = Client::connect(ServerConf {
            max_body_size: 4,
            ..Default::default()
        });
        let mut f = get("/upload");
        f[0].1 = "PUT".into();
        client.headers(1, &fields(&f), false);
        client
            .conn
            .feed(&frame(FrameType::Data(BitFlags::default()), 1, b"12345"));
        assert!(client.conn.poll().unwrap().is_none());
        let frames = parse_frames(&client.conn.take_output());
        assert!(frames
            .iter()
            .any(|(f, _)| f.frame_type == FrameType::RstStream && f.stream_id == StreamId(1)));

        // already in flight when we reset the stream
        client
            .conn
            .feed(&frame(FrameType::Data(DataFlags::EndStream.into()), 1, b"678"));
        client.headers(1, &[("x-checksum", "abc")], true);
        assert!(client.conn.poll().unwrap().is_none());
        assert!(!client.conn.is_closed());

        // the dropped data is still credited to the connection, and nothing
        // else is said about stream 1
        let frames = parse_frames(&client.conn.take_output());
        assert!(frames.iter().all(|(f, _)| f.frame_type == FrameType::WindowUpdate
            && f.stream_id == StreamId::CONNECTION));
        assert_eq!(frames.len(), 1);

        // the trailers went through the decoder, so the tables are in sync
        client.headers(3, &fields(&get("/after")), true);
        let req = client.poll_request();
        assert_eq!(req.path, "/after");
        assert_eq!(req.stream_id, Some(StreamId(3)));
    }

    #[test]
    fn test_frames_on_the_wrong_level() {
        let mut client = Client::connect(Default::default());
        client
            .conn
            .feed(&frame(FrameType::Ping(BitFlags::default()), 1, b"12345678"));
        assert!(matches!(
            client.conn.poll(),
            Err(H2ConnectionError::NeedsConnection {
                frame_type: FrameType::Ping(_),
                stream_id: StreamId(1),
            })
        ));

        let mut client = Client::connect(Default::default());
        client
            .conn
            .feed(&frame(FrameType::Data(DataFlags::EndStream.into()), 0, b"x"));
        let err = client.conn.poll().unwrap_err();
        assert!(matches!(err, H2ConnectionError::NeedsStream { .. }));
        assert_eq!(err.as_known_error_code(), KnownErrorCode::ProtocolError);
    }

    #[test]
    fn test_interrupted_field_block() {
        let mut client = Client::connect(Default::default());
        let block = client.block(&fields(&get("/")));
        client.conn.feed(&frame(
            FrameType::Headers(HeadersFlags::EndStream.into()),
            1,
            &block[..2],
        ));
        client
            .conn
            .feed(&frame(FrameType::Ping(BitFlags::default()), 0, b"12345678"));
        let err = client.conn.poll().unwrap_err();
        assert!(matches!(
            err,
            H2ConnectionError::InterruptedFieldBlock {
                stream_id: StreamId(1),
                frame_type: FrameType::Ping(_),
                frame_stream_id: StreamId::CONNECTION,
            }
        ));

        // CONTINUATION with nothing to continue
        let mut client = Client::connect(Default::default());
        client.conn.feed(&frame(
            FrameType::Continuation(ContinuationFlags::EndHeaders.into()),
            1,
            &block,
        ));
        assert!(matches!(
            client.conn.poll(),
            Err(H2ConnectionError::StrayContinuation(StreamId(1)))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let mut client = Client::connect(Default::default());
        client.conn.feed(&frame(
            FrameType::Data(BitFlags::default()),
            1,
            &vec![0u8; (1 << 14) + 1],
        ));
        let err = client.conn.poll().unwrap_err();
        assert_eq!(err.as_known_error_code(), KnownErrorCode::FrameSizeError);
    }

    #[test]
    fn test_send_response() {
        let mut client = Client::connect(Default::default());
        client.headers(1, &fields(&get("/")), true);
        client.poll_request();

        let mut res = Response::text(StatusCode::OK, "x".repeat(20_000));
        res.insert_header(header::HeaderName::from_static("x-a"), "b")
            .unwrap();
        let rx = client
            .conn
            .send_response(StreamId(1), &mut res, &CookieConf::default(), Utc::now());
        assert!(rx.is_none());
        assert!(res.headers_sent());
        assert_eq!(client.conn.active_streams(), 0);

        let frames = parse_frames(&client.conn.take_output());
        assert!(matches!(frames[0].0.frame_type, FrameType::Headers(_)));
        assert!(frames[0].0.is_end_headers());
        let fields = Decoder::new().decode(&frames[0].1).unwrap();
        assert_eq!(fields[0], (b":status".to_vec(), b"200".to_vec()));
        assert!(fields.contains(&(b"content-length".to_vec(), b"20000".to_vec())));

        // split by the peer's max frame size
        let data: Vec<_> = frames[1..].iter().map(|(f, _)| f.len).collect();
        assert_eq!(data, vec![16384, 20_000 - 16384]);
        assert!(frames.last().unwrap().0.is_end_stream());

        // late responses for gone streams are dropped
        let mut res = Response::default();
        assert!(client
            .conn
            .send_response(StreamId(1), &mut res, &CookieConf::default(), Utc::now())
            .is_none());
        assert!(!client.conn.has_output());
    }

    #[test]
    fn test_streamed_response_and_reset() {
        let mut client = Client::connect(Default::default());
        client.headers(1, &fields(&get("/")), true);
        client.poll_request();

        let mut res = Response::default();
        let _tx = res.stream().unwrap();
        let rx = client
            .conn
            .send_response(StreamId(1), &mut res, &CookieConf::default(), Utc::now());
        assert!(rx.is_some());
        assert!(client.conn.send_data(StreamId(1), b"chunk", false));

        let mut payload = Vec::new();
        RstStream {
            error_code: KnownErrorCode::Cancel.into(),
        }
        .encode(&mut payload);
        client.conn.feed(&frame(FrameType::RstStream, 1, &payload));
        assert!(matches!(
            client.conn.poll().unwrap(),
            Some(H2Event::StreamReset { stream_id: StreamId(1), .. })
        ));
        assert!(!client.conn.send_data(StreamId(1), b"more", true));
    }

    #[test]
    fn test_trace_and_options_answered_locally() {
        let mut client = Client::connect(Default::default());
        let mut f = get("/");
        f[0].1 = "TRACE".into();
        client.headers(1, &fields(&f), true);
        match client.conn.poll().unwrap() {
            Some(H2Event::Respond { stream_id, response }) => {
                assert_eq!(stream_id, StreamId(1));
                assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            }
            other => panic!("expected a local response, got {other:?}"),
        }
    }

    #[test]
    fn test_h2c_upgrade() {
        let mut settings = Vec::new();
        Settings::encode_pairs(&[(Setting::MaxFrameSize, 1 << 15)], &mut settings);
        let encoded = URL_SAFE_NO_PAD.encode(&settings);

        let req = crate::types::Request::new(Method::Get, "/up", Version::HTTP_11);
        let (mut conn, req) =
            H2Conn::new_upgraded(Rc::new(ServerConf::default()), encoded.as_bytes(), req)
                .unwrap();
        assert_eq!(req.stream_id, Some(StreamId(1)));
        assert_eq!(conn.peer_settings().max_frame_size, 1 << 15);

        let mut res = Response::text(StatusCode::OK, "upgraded");
        assert!(conn
            .send_response(StreamId(1), &mut res, &CookieConf::default(), Utc::now())
            .is_none());
        let frames = parse_frames(&conn.take_output());
        assert!(matches!(frames[0].0.frame_type, FrameType::Settings(_)));
        assert!(matches!(frames[1].0.frame_type, FrameType::Headers(_)));
        assert_eq!(frames[1].0.stream_id, StreamId(1));

        assert!(H2Conn::new_upgraded(
            Rc::new(ServerConf::default()),
            b"not base64!",
            crate::types::Request::default()
        )
        .is_err());
    }
}
