//! HTTP/1.1 response serialization

use std::fmt::Write;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use http::{header, StatusCode, Version};
use tokio::sync::mpsc;

use super::{H1Error, ServerConf};
use crate::types::{http_date, CookieConf, HeadersExt, Method, Response, ResponseBody};

/// Interim response for `Expect: 100-continue`
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Terminates a chunked body (we never send trailers)
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// What the engine remembers about a request while its response is being
/// written.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeInfo {
    pub method: Method,
    pub version: Version,
    /// Whether the client is fine with reusing the connection: the default
    /// for HTTP/1.1, opt-in for HTTP/1.0
    pub client_keep_alive: bool,
}

impl Default for ExchangeInfo {
    fn default() -> Self {
        Self {
            method: Method::Get,
            version: Version::HTTP_11,
            client_keep_alive: false,
        }
    }
}

/// How the body of a response must be written after its head
pub enum BodyPlan {
    None,
    Full(Bytes),
    /// Every chunk goes through [encode_chunk], then [LAST_CHUNK]
    Chunked(mpsc::Receiver<Bytes>),
}

pub struct ResponsePlan {
    pub keep_alive: bool,
    pub body: BodyPlan,
}

/// Writes the status line and headers of `res` into `out`, and takes its
/// body out. The response can't be changed afterwards.
pub fn encode_response_head(
    res: &mut Response,
    info: &ExchangeInfo,
    conf: &ServerConf,
    cookie_conf: &CookieConf,
    now: DateTime<Utc>,
    out: &mut BytesMut,
) -> ResponsePlan {
    let status = res.status();
    let bodiless_status = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let is_head = info.method == Method::Head;
    let streaming = matches!(res.body(), ResponseBody::Stream(_));

    let keep_alive = info.client_keep_alive
        && res.keep_alive()
        && !res.headers().is_connection_close()
        && !streaming;

    write_status_line(status, out);
    if !res.headers().contains_key(header::DATE) {
        write_header(out, b"date", http_date(now).as_bytes());
    }
    for (name, value) in res.headers() {
        // framing is ours to decide
        if name == header::CONTENT_LENGTH
            || name == header::TRANSFER_ENCODING
            || name == header::CONNECTION
        {
            continue;
        }
        write_header(out, name.as_str().as_bytes(), value);
    }
    if !res.headers().contains_key(header::CACHE_CONTROL) {
        if let Some(cc) = &conf.cache_control {
            write_header(out, b"cache-control", cc.as_bytes());
        }
    }

    if !bodiless_status {
        match res.body_len() {
            Some(len) => write_header(out, b"content-length", len.to_string().as_bytes()),
            None => write_header(out, b"transfer-encoding", b"chunked"),
        }
    }
    if !keep_alive {
        write_header(out, b"connection", b"close");
    } else if info.version == Version::HTTP_10 {
        write_header(out, b"connection", b"keep-alive");
    }

    for cookie in res.cookies() {
        write_header(out, b"set-cookie", cookie.serialize(cookie_conf).as_bytes());
    }
    out.put_slice(b"\r\n");
    res.mark_headers_sent();

    let body = match res.take_body() {
        _ if is_head || bodiless_status => BodyPlan::None,
        ResponseBody::Empty => BodyPlan::None,
        ResponseBody::Full(bytes) => BodyPlan::Full(bytes),
        ResponseBody::Stream(rx) => BodyPlan::Chunked(rx),
    };
    ResponsePlan { keep_alive, body }
}

/// Frames one chunk of a chunked body. Empty chunks are skipped, since
/// they would end the body.
pub fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    let _ = write!(out, "{:x}\r\n", data.len());
    out.put_slice(data);
    out.put_slice(b"\r\n");
}

/// A complete response for a request we refuse. It always closes the
/// connection.
pub fn encode_error(err: &H1Error, now: DateTime<Utc>, out: &mut BytesMut) {
    let status = err.status();
    let body = status.canonical_reason().unwrap_or("Error");

    write_status_line(status, out);
    write_header(out, b"date", http_date(now).as_bytes());
    if let H1Error::TraceNotAllowed = err {
        write_header(out, b"allow", Method::ALLOWED.as_bytes());
    }
    write_header(out, b"content-type", b"text/plain; charset=utf-8");
    let _ = write!(out, "content-length: {}\r\n", body.len());
    write_header(out, b"connection", b"close");
    out.put_slice(b"\r\n");
    out.put_slice(body.as_bytes());
}

/// `101 Switching Protocols`, with the given extra headers
pub fn encode_switching_protocols(upgrade: &str, extra: &[(&str, &[u8])], out: &mut BytesMut) {
    write_status_line(StatusCode::SWITCHING_PROTOCOLS, out);
    write_header(out, b"connection", b"Upgrade");
    write_header(out, b"upgrade", upgrade.as_bytes());
    for (name, value) in extra {
        write_header(out, name.as_bytes(), value);
    }
    out.put_slice(b"\r\n");
}

/// The reply to `OPTIONS`, sent without involving the application
pub fn options_response() -> Response {
    let mut res = Response::with_status(StatusCode::OK);
    // cannot fail on a fresh response
    let _ = res.insert_header(header::ALLOW, Method::ALLOWED);
    res
}

fn write_status_line(status: StatusCode, out: &mut BytesMut) {
    let _ = write!(
        out,
        "HTTP/1.1 {} {}\r\n",
        status.as_str(),
        status.canonical_reason().unwrap_or("Unknown")
    );
}

fn write_header(out: &mut BytesMut, name: &[u8], value: &[u8]) {
    out.put_slice(name);
    out.put_slice(b": ");
    out.put_slice(value);
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use chrono::{TimeZone, Utc};
    use http::{header, StatusCode, Version};
    use pretty_assertions::assert_eq;

    use super::{
        encode_chunk, encode_error, encode_response_head, options_response, BodyPlan,
        ExchangeInfo,
    };
    use crate::{
        h1::{H1Error, ServerConf},
        types::{CookieConf, Method, Response, SetCookie},
    };

    fn encode(res: &mut Response, info: ExchangeInfo) -> (String, super::ResponsePlan) {
        let now = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        let mut out = BytesMut::new();
        let plan = encode_response_head(
            res,
            &info,
            &ServerConf::default(),
            &CookieConf::default(),
            now,
            &mut out,
        );
        (String::from_utf8(out.to_vec()).unwrap(), plan)
    }

    fn http11() -> ExchangeInfo {
        ExchangeInfo {
            method: Method::Get,
            version: Version::HTTP_11,
            client_keep_alive: true,
        }
    }

    #[test]
    fn test_full_response_head() {
        let mut res = Response::text(StatusCode::OK, "hello");
        res.set_cookie(SetCookie::new("a", "1").unwrap()).unwrap();
        let (head, plan) = encode(&mut res, http11());
        assert_eq!(
            head,
            "HTTP/1.1 200 OK\r\n\
date: Sun, 06 Nov 1994 08:49:37 GMT\r\n\
content-type: text/plain; charset=utf-8\r\n\
cache-control: max-age=0, no-cache\r\n\
content-length: 5\r\n\
set-cookie: a=1\r\n\
\r\n"
        );
        assert!(plan.keep_alive);
        assert!(matches!(plan.body, BodyPlan::Full(b) if b == Bytes::from_static(b"hello")));
        assert!(res.headers_sent());
    }

    #[test]
    fn test_head_keeps_content_length() {
        let mut res = Response::text(StatusCode::OK, "hello");
        let info = ExchangeInfo {
            method: Method::Head,
            ..http11()
        };
        let (head, plan) = encode(&mut res, info);
        assert!(head.contains("content-length: 5\r\n"));
        assert!(matches!(plan.body, BodyPlan::None));
    }

    #[test]
    fn test_streaming_forces_close() {
        let mut res = Response::default();
        let _tx = res.stream().unwrap();
        let (head, plan) = encode(&mut res, http11());
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(!plan.keep_alive);
        assert!(matches!(plan.body, BodyPlan::Chunked(_)));
    }

    #[test]
    fn test_http10_keep_alive() {
        let mut res = Response::default();
        res.insert_header(header::CACHE_CONTROL, "no-store").unwrap();
        let info = ExchangeInfo {
            version: Version::HTTP_10,
            ..http11()
        };
        let (head, plan) = encode(&mut res, info);
        assert!(head.contains("connection: keep-alive\r\n"));
        assert!(head.contains("cache-control: no-store\r\n"));
        assert!(!head.contains("max-age=0"));
        assert!(plan.keep_alive);

        let mut res = Response::default();
        res.set_keep_alive(false).unwrap();
        let (head, plan) = encode(&mut res, http11());
        assert!(head.contains("connection: close\r\n"));
        assert!(!plan.keep_alive);
    }

    #[test]
    fn test_options_and_no_content() {
        let mut res = options_response();
        let (head, _) = encode(&mut res, http11());
        assert!(head.contains("allow: GET, HEAD, POST, PUT, DELETE, OPTIONS, CONNECT, PATCH\r\n"));

        let mut res = Response::with_status(StatusCode::NO_CONTENT);
        let (head, _) = encode(&mut res, http11());
        assert!(!head.contains("content-length"));
    }

    #[test]
    fn test_chunk_and_error_encoding() {
        let mut out = BytesMut::new();
        encode_chunk(b"hello world, this is sixteen+", &mut out);
        encode_chunk(b"", &mut out);
        assert_eq!(&out[..], b"1d\r\nhello world, this is sixteen+\r\n");

        let mut out = BytesMut::new();
        let now = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        encode_error(&H1Error::UriTooLong { max: 10 }, now, &mut out);
        let text = String::from_utf8(out.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 414 URI Too Long\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nURI Too Long"));
    }
}
