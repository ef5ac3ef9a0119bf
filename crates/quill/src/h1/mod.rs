//! HTTP/1.1 engine: request parsing, body decoding and response
//! serialization, without any I/O.

use std::io;

use http::StatusCode;

mod body;
mod encode;
pub(crate) mod parse;

mod server;
pub use encode::*;
pub use server::*;

/// Limits and defaults for HTTP/1.1 connections
#[derive(Debug, Clone)]
pub struct ServerConf {
    /// Longest request target accepted, past that we reply 414
    pub max_uri_len: usize,

    /// Most header lines (trailers included) a request may have
    pub max_header_count: usize,

    /// Most bytes the header section (trailers included) may take
    pub max_header_bytes: usize,

    /// Largest request body accepted, past that we reply 413
    pub max_body_size: u64,

    /// Bodies larger than this are spooled to a temporary file
    pub body_memory_limit: usize,

    /// `Cache-Control` added to responses that don't set one
    pub cache_control: Option<String>,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            max_uri_len: 16 * 1024,
            max_header_count: 2048,
            max_header_bytes: 256 * 1024,
            max_body_size: 50 * 1024 * 1024,
            body_memory_limit: 64 * 1024,
            cache_control: Some("max-age=0, no-cache".into()),
        }
    }
}

/// Anything that makes us reject a request. The connection is closed after
/// replying with [H1Error::status].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H1Error {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("unknown method")]
    UnknownMethod,

    #[error("unsupported HTTP version")]
    UnsupportedVersion,

    #[error("request target longer than {max} bytes")]
    UriTooLong { max: usize },

    #[error("more than {max} header lines")]
    TooManyHeaders { max: usize },

    #[error("header section larger than {max} bytes")]
    HeadersTooLarge { max: usize },

    #[error("malformed header line")]
    BadHeader,

    #[error("invalid content-length")]
    BadContentLength,

    #[error("malformed chunked body: {0}")]
    BadChunk(&'static str),

    #[error("request body larger than {max} bytes")]
    BodyTooLarge { max: u64 },

    #[error("TRACE requests are not allowed")]
    TraceNotAllowed,

    #[error("could not buffer request body: {0}")]
    Spool(#[from] io::Error),
}

impl H1Error {
    pub fn status(&self) -> StatusCode {
        match self {
            H1Error::BadRequestLine
            | H1Error::UnknownMethod
            | H1Error::BadHeader
            | H1Error::BadContentLength
            | H1Error::BadChunk(_) => StatusCode::BAD_REQUEST,
            H1Error::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            H1Error::UriTooLong { .. } => StatusCode::URI_TOO_LONG,
            H1Error::TooManyHeaders { .. } | H1Error::HeadersTooLarge { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            H1Error::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            H1Error::TraceNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            H1Error::Spool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
