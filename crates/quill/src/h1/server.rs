use std::rc::Rc;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use http::{header, Version};
use tracing::{debug, trace};

use super::{
    body::{BodyDecoder, Decoded},
    encode::{self, ExchangeInfo, ResponsePlan},
    parse::{self, VersionError},
    H1Error, ServerConf,
};
use crate::{
    types::{from_digits, CookieConf, HeadersExt, Method, Request, RequestBody, Response},
    util::trace_partial,
};

/// Room for the method and version around the request target
const REQUEST_LINE_SLACK: usize = 64;

/// What [H1Conn::poll] found in the buffered input
#[derive(Debug)]
pub enum H1Event {
    /// Nothing more to do until more bytes arrive
    NeedMore,

    /// The client waits for [encode::CONTINUE] before sending its body
    Continue,

    /// A complete request, to be handed to the application
    Request(Request),

    /// A request we answer ourselves (OPTIONS)
    Respond(Response),
}

struct PartialRequest {
    req: Request,
    header_count: usize,
    header_bytes: usize,
}

enum ReadState {
    RequestLine,
    Headers(Box<PartialRequest>),
    Body(Box<PartialRequest>, BodyDecoder, RequestBody),
    /// A request is out, its response hasn't been written yet
    Exchange(ExchangeInfo),
    Closed,
}

/// One HTTP/1.1 connection, minus the I/O: bytes go in with
/// [feed](H1Conn::feed), requests come out of [poll](H1Conn::poll).
///
/// Requests are handled one at a time. Pipelined bytes stay buffered until
/// the current response is written and [finish_exchange] is called.
///
/// [finish_exchange]: H1Conn::finish_exchange
pub struct H1Conn {
    conf: Rc<ServerConf>,
    buf: BytesMut,
    state: ReadState,
}

impl H1Conn {
    pub fn new(conf: Rc<ServerConf>) -> Self {
        Self {
            conf,
            buf: BytesMut::new(),
            state: ReadState::RequestLine,
        }
    }

    pub fn conf(&self) -> &ServerConf {
        &self.conf
    }

    /// Buffers bytes read off the connection.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not consumed yet
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Hands over buffered bytes, e.g. when the connection switches
    /// protocols.
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buf.split()
    }

    /// True once the connection must not carry any more requests
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReadState::Closed)
    }

    /// True if a request was started but not completed
    pub fn is_mid_request(&self) -> bool {
        match self.state {
            ReadState::RequestLine => !self.buf.is_empty(),
            ReadState::Headers(_) | ReadState::Body(..) => true,
            ReadState::Exchange(_) | ReadState::Closed => false,
        }
    }

    /// Makes as much progress as the buffered input allows. After an error,
    /// the connection is closed: reply with [encode::encode_error] and hang
    /// up.
    pub fn poll(&mut self) -> Result<H1Event, H1Error> {
        loop {
            match std::mem::replace(&mut self.state, ReadState::Closed) {
                ReadState::RequestLine => {
                    parse::skip_empty_lines(&mut self.buf);
                    let limit = self.conf.max_uri_len + REQUEST_LINE_SLACK;
                    let line = match parse::take_line(&mut self.buf, limit) {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            trace_partial("request line", &self.buf);
                            self.state = ReadState::RequestLine;
                            return Ok(H1Event::NeedMore);
                        }
                        Err(_) => {
                            return Err(H1Error::UriTooLong {
                                max: self.conf.max_uri_len,
                            })
                        }
                    };
                    let req = self.start_request(&line)?;
                    self.state = ReadState::Headers(Box::new(PartialRequest {
                        req,
                        header_count: 0,
                        header_bytes: 0,
                    }));
                }
                ReadState::Headers(mut partial) => {
                    let limit = self
                        .conf
                        .max_header_bytes
                        .saturating_sub(partial.header_bytes);
                    let line = match parse::take_line(&mut self.buf, limit) {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            trace_partial("headers", &self.buf);
                            self.state = ReadState::Headers(partial);
                            return Ok(H1Event::NeedMore);
                        }
                        Err(_) => {
                            return Err(H1Error::HeadersTooLarge {
                                max: self.conf.max_header_bytes,
                            })
                        }
                    };

                    if line.is_empty() {
                        if let Some(event) = self.finish_head(partial)? {
                            return Ok(event);
                        }
                        continue;
                    }

                    partial.header_count += 1;
                    partial.header_bytes += line.len() + 2;
                    if partial.header_count > self.conf.max_header_count {
                        return Err(H1Error::TooManyHeaders {
                            max: self.conf.max_header_count,
                        });
                    }
                    if partial.header_bytes > self.conf.max_header_bytes {
                        return Err(H1Error::HeadersTooLarge {
                            max: self.conf.max_header_bytes,
                        });
                    }
                    if line.starts_with(b" ") || line.starts_with(b"\t") {
                        // obsolete line folding, cf. RFC 9112 section 5.2
                        return Err(H1Error::BadHeader);
                    }

                    let (_, (name, value)) =
                        parse::header_line(&line).map_err(|_| H1Error::BadHeader)?;
                    partial
                        .req
                        .push_header(name, value)
                        .map_err(|_| H1Error::BadHeader)?;
                    self.state = ReadState::Headers(partial);
                }
                ReadState::Body(mut partial, mut decoder, mut body) => {
                    let decoded = decoder.decode(
                        &mut self.buf,
                        &mut body,
                        &mut partial.req.trailers,
                        &self.conf,
                    )?;
                    match decoded {
                        Decoded::NeedMore => {
                            self.state = ReadState::Body(partial, decoder, body);
                            return Ok(H1Event::NeedMore);
                        }
                        Decoded::Done => {
                            trace!(len = body.len(), "request body complete");
                            return Ok(self.complete(partial, Some(body)));
                        }
                    }
                }
                state @ (ReadState::Exchange(_) | ReadState::Closed) => {
                    self.state = state;
                    return Ok(H1Event::NeedMore);
                }
            }
        }
    }

    fn start_request(&self, line: &[u8]) -> Result<Request, H1Error> {
        let (_, (method, target, version)) =
            parse::request_line(line).map_err(|_| H1Error::BadRequestLine)?;
        if target.len() > self.conf.max_uri_len {
            return Err(H1Error::UriTooLong {
                max: self.conf.max_uri_len,
            });
        }
        let version = parse::http_version(version).map_err(|e| match e {
            VersionError::Malformed => H1Error::BadRequestLine,
            VersionError::Unsupported => H1Error::UnsupportedVersion,
        })?;
        let method = Method::from_bytes(method).ok_or(H1Error::UnknownMethod)?;
        if method == Method::Trace {
            return Err(H1Error::TraceNotAllowed);
        }
        // the target grammar only allows ASCII
        let target = std::str::from_utf8(target).map_err(|_| H1Error::BadRequestLine)?;

        debug!(%method, %target, ?version, "request line");
        Ok(Request::new(method, target, version))
    }

    /// Picks how the body is framed once the blank line is seen. Returns
    /// an event if there's one to report right away.
    fn finish_head(&mut self, mut partial: Box<PartialRequest>) -> Result<Option<H1Event>, H1Error> {
        partial.req.complete_headers();
        let headers = &partial.req.headers;

        let decoder = if headers.contains_key(header::TRANSFER_ENCODING) {
            if headers.is_chunked_transfer_encoding() {
                Some(BodyDecoder::chunked())
            } else {
                debug!("unrecognized transfer-encoding, reading no body");
                None
            }
        } else if headers.contains_key(header::CONTENT_LENGTH) {
            let mut lengths = headers
                .get_all(header::CONTENT_LENGTH)
                .iter()
                .map(|v| from_digits(v));
            let len = match lengths.next() {
                Some(Some(len)) => len,
                _ => return Err(H1Error::BadContentLength),
            };
            // repeated content-length must agree
            if lengths.any(|other| other != Some(len)) {
                return Err(H1Error::BadContentLength);
            }
            if len > self.conf.max_body_size {
                return Err(H1Error::BodyTooLarge {
                    max: self.conf.max_body_size,
                });
            }
            (len > 0).then(|| BodyDecoder::content_length(len))
        } else if headers.contains_key(header::CONTENT_TYPE) && partial.req.method.may_have_body()
        {
            Some(BodyDecoder::UntilBlankLine)
        } else {
            None
        };

        match decoder {
            None => Ok(Some(self.complete(partial, None))),
            Some(decoder) => {
                let wants_continue = partial.req.version == Version::HTTP_11
                    && partial.req.headers.expects_100_continue();
                let body = RequestBody::new(self.conf.body_memory_limit);
                self.state = ReadState::Body(partial, decoder, body);
                Ok(wants_continue.then_some(H1Event::Continue))
            }
        }
    }

    fn complete(&mut self, partial: Box<PartialRequest>, body: Option<RequestBody>) -> H1Event {
        let mut req = partial.req;
        req.complete_body(body);

        let client_keep_alive = match req.version {
            Version::HTTP_10 => req.headers.is_connection_keep_alive(),
            _ => !req.headers.is_connection_close(),
        };
        self.state = ReadState::Exchange(ExchangeInfo {
            method: req.method,
            version: req.version,
            client_keep_alive,
        });

        if req.method == Method::Options {
            debug!(path = %req.path, "answering OPTIONS");
            return H1Event::Respond(encode::options_response());
        }
        H1Event::Request(req)
    }

    /// What we know of the request being answered
    pub fn exchange(&self) -> ExchangeInfo {
        match &self.state {
            ReadState::Exchange(info) => *info,
            _ => ExchangeInfo::default(),
        }
    }

    /// Writes the head of the response to the current request into `out`.
    pub fn encode_response_head(
        &mut self,
        res: &mut Response,
        cookie_conf: &CookieConf,
        now: DateTime<Utc>,
        out: &mut BytesMut,
    ) -> ResponsePlan {
        let info = self.exchange();
        encode::encode_response_head(res, &info, &self.conf, cookie_conf, now, out)
    }

    /// Called once a response is fully written. The connection is ready for
    /// the next request, or closed.
    pub fn finish_exchange(&mut self, keep_alive: bool) {
        self.state = if keep_alive {
            ReadState::RequestLine
        } else {
            ReadState::Closed
        };
    }
}
