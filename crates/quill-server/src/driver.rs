use std::time::Duration;

use bytes::Bytes;
use http::{header, StatusCode};
use quill::{
    ws::{Message, WebSocketHandler, WsSender},
    Reply, Request, Response, ServerDriver,
};
use tracing::debug;

const ROUTES: &str = r#"This server serves the following routes:

  /echo            echoes the request body, with its content-type
  /status/{code}   an empty response with the given status
  /stream/{n}      n blocks of text, streamed
  /params          the query and form parameters, as parsed
  /ws              a WebSocket that echoes every message
"#;

/// Largest `n` accepted by `/stream/{n}`
const MAX_BLOCKS: usize = 10_000;

pub(crate) struct DemoDriver;

impl ServerDriver for DemoDriver {
    type Error = Box<dyn std::error::Error>;
    type WebSocket = WsEcho;

    async fn handle(
        &self,
        req: Request,
        res: &mut Response,
    ) -> Result<Reply<WsEcho>, Self::Error> {
        debug!(method = %req.method, path = %req.path, "handling request");

        let path = req.decoded_path();
        let mut segments = path.trim_start_matches('/').split('/');
        match (segments.next().unwrap_or_default(), segments.next()) {
            ("", None) => Ok(Reply::Text(ROUTES.into())),
            ("echo", None) => {
                if let Some(content_type) = req.content_type() {
                    res.insert_header(header::CONTENT_TYPE, content_type.to_owned())?;
                }
                res.set_body(req.body_bytes()?)?;
                Ok(Reply::Done)
            }
            ("status", Some(code)) => {
                let Some(status) = code.parse().ok().and_then(|c| StatusCode::from_u16(c).ok())
                else {
                    *res = Response::text(StatusCode::BAD_REQUEST, "bad status code\n");
                    return Ok(Reply::Done);
                };
                res.set_status(status)?;
                Ok(Reply::Done)
            }
            ("stream", Some(n)) => {
                let Some(n) = n.parse::<usize>().ok().filter(|n| *n <= MAX_BLOCKS) else {
                    *res = Response::text(StatusCode::BAD_REQUEST, "bad block count\n");
                    return Ok(Reply::Done);
                };
                res.insert_header(header::CONTENT_TYPE, "text/plain; charset=utf-8")?;
                let tx = res.stream()?;
                tokio::task::spawn_local(async move {
                    for i in 0..n {
                        let block = Bytes::from(format!("block {i} of {n}\n"));
                        if tx.send(block).await.is_err() {
                            debug!(%i, "client went away mid-stream");
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                });
                Ok(Reply::Done)
            }
            ("params", None) => {
                let params = req.params_with_body()?;
                Ok(Reply::Text(format!("{params:#?}\n")))
            }
            ("ws", None) => Ok(Reply::WebSocket(WsEcho { received: 0 })),
            _ => Ok(Reply::Status(false)),
        }
    }
}

pub(crate) struct WsEcho {
    received: usize,
}

impl WebSocketHandler for WsEcho {
    async fn on_open(&mut self, _ws: &WsSender) {
        debug!("websocket open");
    }

    async fn on_message(&mut self, ws: &WsSender, msg: Message) {
        self.received += 1;
        if ws.send(msg).is_err() {
            debug!("websocket closed before we could echo");
        }
    }

    async fn on_close(&mut self, code: Option<u16>, reason: &str) {
        debug!(?code, %reason, received = %self.received, "websocket closed");
    }
}
