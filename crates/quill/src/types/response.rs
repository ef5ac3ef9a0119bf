use std::fmt;

use bytes::Bytes;
use http::{header, HeaderName, StatusCode};
use tokio::sync::mpsc;

use super::{
    cookies::{CookieError, SetCookie},
    headers::{is_valid_value, Headers},
};

/// How many chunks a streaming body may have in flight before
/// [BodySender::send] waits for the connection to catch up.
const STREAM_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ResponseError {
    /// The status line and headers have already been written to the wire
    #[error("headers already sent")]
    HeadersAlreadySent,

    #[error("invalid value for header {name}")]
    InvalidHeaderValue { name: HeaderName },

    #[error(transparent)]
    Cookie(#[from] CookieError),
}

/// The body of a [Response]
#[derive(Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Full(Bytes),
    /// Chunks produced by a [BodySender]. The body ends when every sender
    /// is dropped.
    Stream(mpsc::Receiver<Bytes>),
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(b) => f.debug_tuple("Full").field(&b.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Returned by [BodySender::send] once the connection went away
#[derive(Debug, thiserror::Error)]
#[error("response body receiver is gone")]
pub struct BodyClosed;

/// Feeds a streaming response body
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
}

impl BodySender {
    pub async fn send(&self, chunk: impl Into<Bytes>) -> Result<(), BodyClosed> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx.send(chunk).await.map_err(|_| BodyClosed)
    }
}

/// An HTTP response.
///
/// Status, headers and cookies can be changed until the head goes out on
/// the wire. After that every mutator fails with
/// [ResponseError::HeadersAlreadySent].
pub struct Response {
    status: StatusCode,
    headers: Headers,
    cookies: Vec<SetCookie>,
    body: ResponseBody,
    keep_alive: bool,
    bytes_written: u64,
    headers_sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::with_status(StatusCode::OK)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("cookies", &self.cookies.len())
            .field("body", &self.body)
            .finish()
    }
}

impl Response {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            headers: Default::default(),
            cookies: Default::default(),
            body: ResponseBody::Empty,
            keep_alive: true,
            bytes_written: 0,
            headers_sent: false,
        }
    }

    /// A `text/plain` response
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut res = Self::with_status(status);
        res.headers.insert(
            header::CONTENT_TYPE,
            Bytes::from_static(b"text/plain; charset=utf-8"),
        );
        res.body = ResponseBody::Full(body.into());
        res
    }

    /// A response carrying the status' canonical reason as its body
    pub fn error(status: StatusCode) -> Self {
        Self::text(status, status.canonical_reason().unwrap_or("Error"))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn cookies(&self) -> &[SetCookie] {
        &self.cookies
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Body bytes written to the wire so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    fn check_mutable(&self) -> Result<(), ResponseError> {
        if self.headers_sent {
            Err(ResponseError::HeadersAlreadySent)
        } else {
            Ok(())
        }
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), ResponseError> {
        self.check_mutable()?;
        self.status = status;
        Ok(())
    }

    /// Replaces every value of `name`
    pub fn insert_header(
        &mut self,
        name: HeaderName,
        value: impl Into<Bytes>,
    ) -> Result<(), ResponseError> {
        self.check_mutable()?;
        let value = value.into();
        if !is_valid_value(&value) {
            return Err(ResponseError::InvalidHeaderValue { name });
        }
        self.headers.insert(name, value);
        Ok(())
    }

    /// Adds a value for `name`, keeping existing ones
    pub fn append_header(
        &mut self,
        name: HeaderName,
        value: impl Into<Bytes>,
    ) -> Result<(), ResponseError> {
        self.check_mutable()?;
        let value = value.into();
        if !is_valid_value(&value) {
            return Err(ResponseError::InvalidHeaderValue { name });
        }
        self.headers.append(name, value);
        Ok(())
    }

    pub fn remove_header(&mut self, name: &HeaderName) -> Result<(), ResponseError> {
        self.check_mutable()?;
        self.headers.remove(name);
        Ok(())
    }

    /// Queues a cookie. A cookie with the same name queued earlier is
    /// replaced.
    pub fn set_cookie(&mut self, cookie: SetCookie) -> Result<(), ResponseError> {
        self.check_mutable()?;
        cookie.validate()?;
        self.cookies.retain(|c| c.name() != cookie.name());
        self.cookies.push(cookie);
        Ok(())
    }

    /// Tells the client to forget the cookie `name`
    pub fn delete_cookie(&mut self, name: &str) -> Result<(), ResponseError> {
        self.set_cookie(SetCookie::removal(name)?)
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) -> Result<(), ResponseError> {
        self.check_mutable()?;
        self.body = ResponseBody::Full(body.into());
        Ok(())
    }

    /// Switches to a streaming body. Chunks sent through the returned
    /// sender are written as they come; the body ends once it's dropped.
    ///
    /// On HTTP/1.1 this means chunked transfer-encoding and no further
    /// requests on the connection.
    pub fn stream(&mut self) -> Result<BodySender, ResponseError> {
        self.check_mutable()?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        self.body = ResponseBody::Stream(rx);
        Ok(BodySender { tx })
    }

    /// Asks for the connection to be closed after this response
    pub fn set_keep_alive(&mut self, keep_alive: bool) -> Result<(), ResponseError> {
        self.check_mutable()?;
        self.keep_alive = keep_alive;
        Ok(())
    }

    pub(crate) fn mark_headers_sent(&mut self) {
        self.headers_sent = true;
    }

    pub(crate) fn take_body(&mut self) -> ResponseBody {
        std::mem::take(&mut self.body)
    }

    pub(crate) fn record_written(&mut self, n: usize) {
        self.bytes_written += n as u64;
    }

    /// Length of the body, if known up front
    pub(crate) fn body_len(&self) -> Option<u64> {
        match &self.body {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(b) => Some(b.len() as u64),
            ResponseBody::Stream(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{header, StatusCode};

    use super::{Response, ResponseBody, ResponseError};
    use crate::types::cookies::{CookieError, SetCookie};

    #[test]
    fn test_mutators_fail_after_headers_sent() {
        let mut res = Response::default();
        res.set_status(StatusCode::CREATED).unwrap();
        res.insert_header(header::CONTENT_TYPE, "text/html").unwrap();
        res.set_cookie(SetCookie::new("a", "1").unwrap()).unwrap();

        res.mark_headers_sent();
        assert!(matches!(
            res.set_status(StatusCode::OK),
            Err(ResponseError::HeadersAlreadySent)
        ));
        assert!(matches!(
            res.insert_header(header::SERVER, "quill"),
            Err(ResponseError::HeadersAlreadySent)
        ));
        assert!(matches!(
            res.delete_cookie("a"),
            Err(ResponseError::HeadersAlreadySent)
        ));
        assert!(matches!(res.stream(), Err(ResponseError::HeadersAlreadySent)));
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(res.cookies().len(), 1);
    }

    #[test]
    fn test_header_values_are_checked() {
        let mut res = Response::default();
        assert!(matches!(
            res.insert_header(header::LOCATION, "/a\r\nx-injected: 1"),
            Err(ResponseError::InvalidHeaderValue { .. })
        ));
    }

    #[test]
    fn test_cookie_replacement() {
        let mut res = Response::default();
        res.set_cookie(SetCookie::new("a", "1").unwrap()).unwrap();
        res.set_cookie(SetCookie::new("a", "2").unwrap()).unwrap();
        assert_eq!(res.cookies().len(), 1);
        assert_eq!(res.cookies()[0].value(), "2");

        let mut cookie = SetCookie::new("b", "1").unwrap();
        cookie.path = Some("/\r\nx-injected: evil".into());
        assert!(matches!(
            res.set_cookie(cookie),
            Err(ResponseError::Cookie(CookieError::InvalidAttribute { .. }))
        ));
        assert_eq!(res.cookies().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_body() {
        let mut res = Response::default();
        let tx = res.stream().unwrap();
        assert_eq!(res.body_len(), None);
        tx.send("one").await.unwrap();
        tx.send(Bytes::new()).await.unwrap();
        drop(tx);

        let ResponseBody::Stream(mut rx) = res.take_body() else {
            panic!("expected a streaming body");
        };
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"one")));
        assert_eq!(rx.recv().await, None);
    }
}
