use http::{header, HeaderName, StatusCode};
use quill::{
    cookies::CookieError,
    ws::{Message, WebSocketHandler, WsSender},
    BodyParamsError, Reply, Request, Response, ResponseError, ServerDriver, SetCookie,
};

#[derive(Debug, thiserror::Error)]
pub(crate) enum DriverError {
    #[error("response error: {0}")]
    Response(#[from] ResponseError),

    #[error("body params error: {0}")]
    Params(#[from] BodyParamsError),

    #[error("cookie error: {0}")]
    Cookie(#[from] CookieError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("asked to fail")]
    Fail,
}

/// Echoes every message back, closes when told `bye`
pub(crate) struct Echo;

impl WebSocketHandler for Echo {
    async fn on_open(&mut self, ws: &WsSender) {
        let _ = ws.send_text("welcome");
    }

    async fn on_message(&mut self, ws: &WsSender, msg: Message) {
        if msg == Message::Text("bye".into()) {
            let _ = ws.close(quill::ws::CloseCode::Normal, "see you");
            return;
        }
        let _ = ws.send(msg);
    }
}

pub(crate) struct TestDriver;

impl ServerDriver for TestDriver {
    type Error = DriverError;
    type WebSocket = Echo;

    async fn handle(&self, req: Request, res: &mut Response) -> Result<Reply<Echo>, DriverError> {
        let path = req.path.clone();
        let mut segments = path.trim_start_matches('/').split('/');

        match segments.next().unwrap_or_default() {
            "hello" => Ok(Reply::Text("hello world".into())),
            "echo" => {
                if let Some(ct) = req.content_type() {
                    res.insert_header(header::CONTENT_TYPE, ct.to_owned())?;
                }
                for (name, value) in &req.trailers {
                    res.insert_header(
                        HeaderName::from_bytes(format!("x-trailer-{name}").as_bytes())
                            .unwrap(),
                        value.clone(),
                    )?;
                }
                res.set_body(req.body_bytes()?)?;
                Ok(Reply::Done)
            }
            "status" => {
                let code: u16 = segments.next().and_then(|s| s.parse().ok()).unwrap_or(200);
                res.set_status(StatusCode::from_u16(code).unwrap_or(StatusCode::OK))?;
                Ok(Reply::Done)
            }
            "stream" => {
                let chunks: usize = segments.next().and_then(|s| s.parse().ok()).unwrap_or(3);
                let tx = res.stream()?;
                tokio::task::spawn_local(async move {
                    for i in 0..chunks {
                        if tx.send(format!("chunk {i}\n")).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(Reply::Done)
            }
            "params" => {
                let params = req.params_with_body()?;
                Ok(Reply::Text(format!("{params:?}")))
            }
            "cookies" => {
                let seen = req
                    .cookies
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(";");
                res.set_cookie(SetCookie::new("visited", "yes please")?)?;
                Ok(Reply::Text(seen))
            }
            "ws" => Ok(Reply::WebSocket(Echo)),
            "missing" => Ok(Reply::Status(false)),
            "fail" => Err(DriverError::Fail),
            "panic" => panic!("handler blew up"),
            _ => Ok(Reply::Status(false)),
        }
    }
}
