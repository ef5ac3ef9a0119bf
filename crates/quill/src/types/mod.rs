use std::{fmt, io};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, uri::Scheme, HeaderName, Version};
use quill_h2::StreamId;
use tracing::debug;

mod headers;
pub use headers::*;

mod method;
pub use method::*;

mod body;
pub use body::*;

pub mod cookies;
pub use cookies::{CookieConf, Cookies, SetCookie};

pub mod multipart;

pub mod params;
pub use params::{Param, Params, SpooledFile};

mod response;
pub use response::*;

/// Formats a timestamp the way `Date` and `Expires` want it, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeaderError {
    /// The blank line (or END_HEADERS) was already seen
    #[error("headers are complete, no more can be added")]
    HeadersComplete,

    #[error("invalid header name")]
    InvalidName,

    #[error("invalid header value")]
    InvalidValue,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BodyParamsError {
    #[error("reading request body: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Multipart(#[from] multipart::MultipartError),
}

/// An HTTP request, as assembled by one of the protocol engines.
pub struct Request {
    pub method: Method,

    /// Path part of the target, not percent-decoded
    pub path: String,

    /// Everything after the first `?`, not percent-decoded
    pub query: String,

    /// The HTTP version used
    pub version: Version,

    pub scheme: Scheme,

    /// Request headers
    pub headers: Headers,

    /// Fields received after the body (chunked trailers, HTTP/2 trailing
    /// HEADERS)
    pub trailers: Headers,

    /// Parsed from every `Cookie` header once the headers are complete
    pub cookies: Cookies,

    pub body: Option<RequestBody>,

    /// Set for requests received over HTTP/2
    pub stream_id: Option<StreamId>,

    pub received_at: DateTime<Utc>,

    headers_complete: bool,
    body_complete: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self::new(Method::Get, "/", Version::HTTP_11)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("version", &self.version)
            .finish()?;

        for (name, value) in &self.headers {
            debug!(%name, value = ?std::str::from_utf8(value), "header");
        }

        Ok(())
    }
}

impl Request {
    /// Starts a request whose headers are still to come.
    pub fn new(method: Method, target: &str, version: Version) -> Self {
        let mut req = Self {
            method,
            path: String::new(),
            query: String::new(),
            version,
            scheme: Scheme::HTTP,
            headers: Default::default(),
            trailers: Default::default(),
            cookies: Default::default(),
            body: None,
            stream_id: None,
            received_at: Utc::now(),
            headers_complete: false,
            body_complete: false,
        };
        req.set_target(target);
        req
    }

    /// Splits a request target at the first `?`.
    pub fn set_target(&mut self, target: &str) {
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_owned();
                self.query = query.to_owned();
            }
            None => {
                self.path = target.to_owned();
                self.query.clear();
            }
        }
    }

    /// The path, percent-decoded (`+` stays as-is)
    pub fn decoded_path(&self) -> String {
        params::decode_path(&self.path).into_owned()
    }

    pub fn headers_complete(&self) -> bool {
        self.headers_complete
    }

    pub fn body_complete(&self) -> bool {
        self.body_complete
    }

    /// Adds a header received from the wire. Names are lowercased, repeated
    /// names accumulate values.
    pub fn push_header(&mut self, name: &[u8], value: &[u8]) -> Result<(), HeaderError> {
        if self.headers_complete {
            return Err(HeaderError::HeadersComplete);
        }
        let name = HeaderName::from_bytes(name).map_err(|_| HeaderError::InvalidName)?;
        if !is_valid_value(value) {
            return Err(HeaderError::InvalidValue);
        }
        self.headers.append(name, Bytes::copy_from_slice(value));
        Ok(())
    }

    /// Seals the header map and fills the cookie jar.
    pub fn complete_headers(&mut self) {
        self.headers_complete = true;
        for value in self.headers.get_all(header::COOKIE) {
            cookies::parse_cookie_header(value, &mut self.cookies);
        }
    }

    pub(crate) fn complete_body(&mut self, body: Option<RequestBody>) {
        self.body = body.filter(|b| !b.is_empty());
        self.body_complete = true;
    }

    /// The `Host` header, which HTTP/2 fills from `:authority`
    pub fn host(&self) -> Option<&str> {
        self.headers.get_str(header::HOST)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get_str(header::CONTENT_TYPE)
    }

    /// The whole body, read into memory
    pub fn body_bytes(&self) -> io::Result<Bytes> {
        match &self.body {
            Some(body) => body.to_bytes(),
            None => Ok(Bytes::new()),
        }
    }

    /// Parameters from the query string
    pub fn params(&self) -> Params {
        params::parse_query(&self.query)
    }

    /// Parameters from the query string, then from an urlencoded or
    /// multipart body. Body values win over query values.
    pub fn params_with_body(&self) -> Result<Params, BodyParamsError> {
        let mut params = self.params();
        let Some(content_type) = self.content_type() else {
            return Ok(params);
        };
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "application/x-www-form-urlencoded" => {
                params.extend_from_urlencoded(&self.body_bytes()?);
            }
            "multipart/form-data" => {
                // file parts spool past the same threshold as the body
                let file_memory_limit = self
                    .body
                    .as_ref()
                    .map_or(usize::MAX, RequestBody::memory_limit);
                multipart::parse_multipart(
                    &self.body_bytes()?,
                    content_type,
                    file_memory_limit,
                    &mut params,
                )?;
            }
            _ => {}
        }
        Ok(params)
    }
}
