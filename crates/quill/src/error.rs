use crate::{h1::H1Error, h2::H2ConnectionError, types::cookies::CookieError, ws::WsError};

/// Why [serve](crate::serve) gave up on a connection. Whenever the protocol
/// allowed it, the peer was told before the connection was dropped.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Reading from or writing to the peer failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The HTTP/1.1 request was rejected
    #[error("HTTP/1.1 error: {0}")]
    H1(#[from] H1Error),

    /// An error occurred while handling an HTTP/2 connection
    #[error("HTTP/2 connection error: {0}")]
    H2ConnectionError(#[from] H2ConnectionError),

    /// The WebSocket peer broke the protocol
    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    /// [Conf::cookies](crate::Conf::cookies) can't be put on the wire
    #[error("invalid cookie configuration: {0}")]
    CookieConf(#[from] CookieError),

    /// Nothing was read or written for too long
    #[error("connection idle for too long")]
    IdleTimeout,
}
