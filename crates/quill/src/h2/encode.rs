//! Outbound frames: everything is appended to the connection's output
//! buffer, so a multi-frame unit (HEADERS + CONTINUATION, a run of DATA) is
//! always contiguous.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use http::{header, StatusCode};
use quill_h2::{
    enumflags2::BitFlags, ContinuationFlags, DataFlags, ErrorCode, Frame, FrameType, GoAway,
    HeadersFlags, RstStream, Setting, Settings, StreamId, WindowUpdate, FRAME_HEADER_LEN,
};

use crate::types::{http_date, is_connection_specific, CookieConf, Response};

/// Appends a frame header for `payload`, then `payload` itself.
pub(crate) fn write_frame(out: &mut BytesMut, frame: Frame, payload: &[u8]) {
    out.reserve(FRAME_HEADER_LEN + payload.len());
    frame.with_len(payload.len() as u32).encode(out);
    out.put_slice(payload);
}

/// Like [write_frame], for a payload `encode` writes straight into `out`
fn write_frame_with(out: &mut BytesMut, frame: Frame, encode: impl FnOnce(&mut BytesMut)) {
    let mut payload = BytesMut::with_capacity(64);
    encode(&mut payload);
    write_frame(out, frame, &payload);
}

pub(crate) fn write_settings(out: &mut BytesMut, pairs: &[(Setting, u32)]) {
    write_frame_with(
        out,
        Frame::new(FrameType::Settings(Default::default()), StreamId::CONNECTION),
        |payload| Settings::encode_pairs(pairs, payload),
    );
}

pub(crate) fn write_rst(out: &mut BytesMut, stream_id: StreamId, error_code: ErrorCode) {
    write_frame_with(out, Frame::new(FrameType::RstStream, stream_id), |payload| {
        RstStream { error_code }.encode(payload)
    });
}

pub(crate) fn write_goaway(out: &mut BytesMut, goaway: &GoAway) {
    write_frame_with(
        out,
        Frame::new(FrameType::GoAway, StreamId::CONNECTION),
        |payload| goaway.encode(payload),
    );
}

pub(crate) fn write_window_update(out: &mut BytesMut, stream_id: StreamId, increment: u32) {
    write_frame_with(
        out,
        Frame::new(FrameType::WindowUpdate, stream_id),
        |payload| WindowUpdate { increment }.encode(payload),
    );
}

/// Writes an encoded field block as one HEADERS frame, followed by as many
/// CONTINUATION frames as `max_frame_size` requires.
pub(crate) fn write_headers(
    out: &mut BytesMut,
    stream_id: StreamId,
    block: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    let mut fragments = block.chunks(max_frame_size.max(1)).peekable();
    let first = fragments.next().unwrap_or_default();

    let mut flags = BitFlags::<HeadersFlags>::default();
    if end_stream {
        flags |= HeadersFlags::EndStream;
    }
    if fragments.peek().is_none() {
        flags |= HeadersFlags::EndHeaders;
    }
    write_frame(out, Frame::new(FrameType::Headers(flags), stream_id), first);

    while let Some(fragment) = fragments.next() {
        let flags = if fragments.peek().is_none() {
            ContinuationFlags::EndHeaders.into()
        } else {
            BitFlags::default()
        };
        write_frame(
            out,
            Frame::new(FrameType::Continuation(flags), stream_id),
            fragment,
        );
    }
}

/// Writes `data` as DATA frames no larger than `max_frame_size`. Only the
/// last one carries END_STREAM. Empty data still makes one frame when it
/// ends the stream.
pub(crate) fn write_data(
    out: &mut BytesMut,
    stream_id: StreamId,
    data: &[u8],
    end_stream: bool,
    max_frame_size: usize,
) {
    if data.is_empty() {
        if end_stream {
            write_frame(
                out,
                Frame::new(FrameType::Data(DataFlags::EndStream.into()), stream_id),
                &[],
            );
        }
        return;
    }

    let mut chunks = data.chunks(max_frame_size.max(1)).peekable();
    while let Some(chunk) = chunks.next() {
        let flags = if end_stream && chunks.peek().is_none() {
            DataFlags::EndStream.into()
        } else {
            BitFlags::default()
        };
        write_frame(out, Frame::new(FrameType::Data(flags), stream_id), chunk);
    }
}

/// The field list for a response head: `:status` first, then `date` (if
/// the response doesn't set one), the response headers minus the
/// connection-specific ones, `content-length` when known, and cookies.
pub(crate) fn response_fields(
    res: &Response,
    cookie_conf: &CookieConf,
    now: DateTime<Utc>,
) -> Vec<(Vec<u8>, Vec<u8>)> {
    let status = res.status();
    let mut fields = vec![(b":status".to_vec(), status.as_str().as_bytes().to_vec())];

    if !res.headers().contains_key(header::DATE) {
        fields.push((b"date".to_vec(), http_date(now).into_bytes()));
    }
    for (name, value) in res.headers() {
        if is_connection_specific(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        fields.push((name.as_str().as_bytes().to_vec(), value.to_vec()));
    }

    let bodiless = status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED;
    if !bodiless {
        if let Some(len) = res.body_len() {
            fields.push((b"content-length".to_vec(), len.to_string().into_bytes()));
        }
    }
    for cookie in res.cookies() {
        fields.push((b"set-cookie".to_vec(), cookie.serialize(cookie_conf).into_bytes()));
    }
    fields
}
