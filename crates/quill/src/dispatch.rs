use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use http::{header, StatusCode};
use tracing::{debug, warn};

use crate::{types::Request, Response, ServerDriver};

/// What a handler returns, on top of whatever it did to the [Response]
/// it was given.
pub enum Reply<W> {
    /// Send the response as the handler left it
    Done,

    /// Shorthand for a `200` with a `text/plain` body
    Text(String),

    /// `true` sends the response as-is, `false` turns it into a
    /// `404 Not Found`
    Status(bool),

    /// Take over the connection as a WebSocket. Only honored for a valid
    /// WebSocket handshake, anything else gets a `400`.
    WebSocket(W),
}

pub(crate) enum Outcome<W> {
    Respond(Response),
    Upgrade(W),
}

/// Runs the handler. Its errors and panics never reach the protocol
/// engines: they turn into a `500`.
pub(crate) async fn dispatch<D: ServerDriver>(
    driver: &D,
    req: Request,
    websocket_handshake: bool,
) -> Outcome<D::WebSocket> {
    let method = req.method;
    let path = req.path.clone();
    let mut res = Response::default();

    let reply = AssertUnwindSafe(driver.handle(req, &mut res))
        .catch_unwind()
        .await;
    let reply = match reply {
        Ok(Ok(reply)) => reply,
        Ok(Err(e)) => {
            warn!(%method, %path, "handler error: {e}");
            return Outcome::Respond(Response::error(StatusCode::INTERNAL_SERVER_ERROR));
        }
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("(non-string payload)");
            warn!(%method, %path, "handler panicked: {msg}");
            return Outcome::Respond(Response::error(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };

    match reply {
        Reply::Done | Reply::Status(true) => Outcome::Respond(res),
        Reply::Status(false) => Outcome::Respond(Response::error(StatusCode::NOT_FOUND)),
        Reply::Text(text) => {
            if !res.headers().contains_key(header::CONTENT_TYPE) {
                // cannot fail, the head isn't sent yet
                let _ = res.insert_header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
            }
            let _ = res.set_body(text);
            Outcome::Respond(res)
        }
        Reply::WebSocket(handler) if websocket_handshake => {
            debug!(%path, "upgrading to websocket");
            Outcome::Upgrade(handler)
        }
        Reply::WebSocket(_) => {
            warn!(%method, %path, "handler wants a websocket, but this is no handshake");
            Outcome::Respond(Response::error(StatusCode::BAD_REQUEST))
        }
    }
}

/// Same as [dispatch], for when upgrading is out of the question
pub(crate) async fn respond<D: ServerDriver>(driver: &D, req: Request) -> Response {
    match dispatch(driver, req, false).await {
        Outcome::Respond(res) => res,
        Outcome::Upgrade(_) => Response::error(StatusCode::BAD_REQUEST),
    }
}
