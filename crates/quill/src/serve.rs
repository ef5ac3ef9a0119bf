//! Drives the protocol engines over an actual connection.
//!
//! Each connection is served by a single task: read, let the engine make
//! progress, run the handler, write. Nothing is ever written concurrently
//! on the same connection, so frames and chunks can't interleave.

use std::{rc::Rc, time::Duration};

use bytes::BytesMut;
use chrono::Utc;
use http::StatusCode;
use quill_h2::{could_be_preface, StreamId, PREFACE};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
};
use tracing::{debug, trace, warn};

use crate::{
    dispatch::{dispatch, respond, Outcome},
    error::ServeError,
    h1::{self, BodyPlan, H1Conn, H1Event},
    h2::{self, H2Conn, H2Event},
    types::{CookieConf, HeadersExt, Request, Response},
    util::Activity,
    ws::{self, Command, WebSocketHandler, WsConf, WsEvent, WsSender, WsSession},
    ServerDriver,
};

const READ_BUF_SIZE: usize = 16 * 1024;

/// Everything [serve] needs to know
#[derive(Debug, Clone)]
pub struct Conf {
    pub h1: h1::ServerConf,
    pub h2: h2::ServerConf,
    pub ws: WsConf,
    pub cookies: CookieConf,

    /// HTTP connections that neither read nor write for this long are
    /// closed. WebSocket connections use [WsConf::ping_interval] instead.
    pub idle_timeout: Duration,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            h1: Default::default(),
            h2: Default::default(),
            ws: Default::default(),
            cookies: Default::default(),
            idle_timeout: Duration::from_secs(40),
        }
    }
}

/// Which engine a connection starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http1,
    Http2,
    /// Look at the first bytes: the HTTP/2 client preface means HTTP/2
    /// with prior knowledge, anything else is HTTP/1.1
    Detect,
}

impl Protocol {
    /// Picks the engine from what TLS negotiated
    pub fn from_alpn(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(b"h2") => Protocol::Http2,
            Some(b"http/1.1") => Protocol::Http1,
            _ => Protocol::Detect,
        }
    }
}

struct Transport<IO> {
    rd: ReadHalf<IO>,
    wr: WriteHalf<IO>,
    buf: Box<[u8]>,
    activity: Activity,
}

impl<IO> Transport<IO>
where
    IO: AsyncRead + AsyncWrite,
{
    /// Reads whatever is available. An empty slice means the peer is done
    /// sending.
    async fn read(&mut self) -> std::io::Result<&[u8]> {
        let n = self.rd.read(&mut self.buf).await?;
        if n > 0 {
            self.activity.touch();
        }
        trace!(%n, "read");
        Ok(&self.buf[..n])
    }

    /// Same as [Transport::read], unless the connection stays idle past its
    /// deadline.
    async fn read_or_idle(&mut self) -> Result<&[u8], ServeError> {
        let deadline = self.activity.deadline();
        match tokio::time::timeout_at(deadline, self.read()).await {
            Ok(res) => Ok(res?),
            Err(_) => {
                debug!("connection idle, closing");
                Err(ServeError::IdleTimeout)
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.wr.write_all(data).await?;
        self.activity.touch();
        Ok(())
    }

    async fn shutdown(&mut self) {
        // the peer may be long gone, nothing to do about it
        let _ = self.wr.shutdown().await;
    }
}

/// Serves one connection until the peer goes away, the connection is done
/// or a protocol error occurs. Protocol errors are answered (status code,
/// GOAWAY or close frame) before they're returned.
pub async fn serve<IO, D>(
    io: IO,
    conf: Rc<Conf>,
    driver: Rc<D>,
    protocol: Protocol,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
    D: ServerDriver,
{
    conf.cookies.validate()?;

    let (rd, wr) = tokio::io::split(io);
    let mut t = Transport {
        rd,
        wr,
        buf: vec![0u8; READ_BUF_SIZE].into_boxed_slice(),
        activity: Activity::new(conf.idle_timeout),
    };

    let mut sniffed = BytesMut::new();
    let protocol = match protocol {
        Protocol::Detect => loop {
            if !could_be_preface(&sniffed) {
                break Protocol::Http1;
            }
            if sniffed.len() >= PREFACE.len() {
                break Protocol::Http2;
            }
            let data = t.read_or_idle().await?;
            if data.is_empty() {
                return Ok(());
            }
            sniffed.extend_from_slice(data);
        },
        protocol => protocol,
    };
    debug!(?protocol, "serving connection");

    let res = match protocol {
        Protocol::Http2 => {
            let mut conn = H2Conn::new(Rc::new(conf.h2.clone()));
            conn.feed(&sniffed);
            serve_h2(&mut t, &conf, driver.as_ref(), conn, None).await
        }
        _ => {
            let mut conn = H1Conn::new(Rc::new(conf.h1.clone()));
            conn.feed(&sniffed);
            serve_h1(&mut t, &conf, driver.as_ref(), conn).await
        }
    };
    t.shutdown().await;
    res
}

async fn serve_h1<IO, D>(
    t: &mut Transport<IO>,
    conf: &Conf,
    driver: &D,
    mut conn: H1Conn,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
    D: ServerDriver,
{
    let mut out = BytesMut::new();

    loop {
        let ev = match conn.poll() {
            Ok(ev) => ev,
            Err(e) => {
                warn!(%e, status = %e.status(), "rejecting request");
                out.clear();
                h1::encode_error(&e, Utc::now(), &mut out);
                t.write(&out).await?;
                return Err(e.into());
            }
        };

        match ev {
            H1Event::NeedMore => {
                if conn.is_closed() {
                    return Ok(());
                }
                let data = t.read_or_idle().await?;
                if data.is_empty() {
                    if conn.is_mid_request() {
                        debug!("peer hung up mid-request");
                    }
                    return Ok(());
                }
                conn.feed(data);
            }
            H1Event::Continue => {
                t.write(h1::CONTINUE).await?;
            }
            H1Event::Respond(res) => {
                write_h1_response(t, &mut conn, res, &conf.cookies, &mut out).await?;
            }
            H1Event::Request(req) => {
                if req.headers.upgrade_is("h2c") {
                    if let Some(settings) = req.headers.get("http2-settings") {
                        let settings = settings.clone();
                        let h2_conf = Rc::new(conf.h2.clone());
                        match H2Conn::new_upgraded(h2_conf, &settings, req) {
                            Ok((mut h2, req)) => {
                                out.clear();
                                h1::encode_switching_protocols("h2c", &[], &mut out);
                                t.write(&out).await?;
                                h2.feed(&conn.take_buffered());
                                return serve_h2(t, conf, driver, h2, Some(req)).await;
                            }
                            Err(e) => {
                                debug!(%e, "refusing h2c upgrade");
                                let res = Response::error(StatusCode::BAD_REQUEST);
                                write_h1_response(t, &mut conn, res, &conf.cookies, &mut out)
                                    .await?;
                                continue;
                            }
                        }
                    }
                }

                if ws::wants_websocket(&req) {
                    let accept = match ws::check_handshake(&req) {
                        Ok(accept) => accept,
                        Err(e) => {
                            debug!(%e, "bad websocket handshake");
                            write_h1_response(t, &mut conn, e.response(), &conf.cookies, &mut out)
                                .await?;
                            continue;
                        }
                    };
                    match dispatch(driver, req, true).await {
                        Outcome::Upgrade(handler) => {
                            out.clear();
                            h1::encode_switching_protocols(
                                "websocket",
                                &[("sec-websocket-accept", accept.as_bytes())],
                                &mut out,
                            );
                            t.write(&out).await?;
                            let leftover = conn.take_buffered();
                            return serve_ws(t, &conf.ws, handler, leftover).await;
                        }
                        Outcome::Respond(res) => {
                            write_h1_response(t, &mut conn, res, &conf.cookies, &mut out).await?;
                        }
                    }
                    continue;
                }

                let res = respond(driver, req).await;
                write_h1_response(t, &mut conn, res, &conf.cookies, &mut out).await?;
            }
        }
    }
}

async fn write_h1_response<IO>(
    t: &mut Transport<IO>,
    conn: &mut H1Conn,
    mut res: Response,
    cookie_conf: &CookieConf,
    out: &mut BytesMut,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
{
    out.clear();
    let plan = conn.encode_response_head(&mut res, cookie_conf, Utc::now(), out);
    debug!(status = %res.status(), keep_alive = %plan.keep_alive, "writing response");

    match plan.body {
        BodyPlan::None => t.write(&out[..]).await?,
        BodyPlan::Full(body) => {
            out.extend_from_slice(&body);
            t.write(&out[..]).await?;
            res.record_written(body.len());
        }
        BodyPlan::Chunked(mut rx) => {
            t.write(&out[..]).await?;
            while let Some(chunk) = rx.recv().await {
                out.clear();
                h1::encode_chunk(&chunk, out);
                t.write(&out[..]).await?;
                res.record_written(chunk.len());
            }
            t.write(h1::LAST_CHUNK).await?;
        }
    }
    trace!(bytes_written = %res.bytes_written(), "response done");

    conn.finish_exchange(plan.keep_alive);
    Ok(())
}

async fn serve_h2<IO, D>(
    t: &mut Transport<IO>,
    conf: &Conf,
    driver: &D,
    mut conn: H2Conn,
    upgraded: Option<Request>,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
    D: ServerDriver,
{
    // server preface
    t.write(&conn.take_output()).await?;

    if let Some(req) = upgraded {
        let res = respond(driver, req).await;
        send_h2_response(t, &mut conn, StreamId(1), res, &conf.cookies).await?;
    }

    loop {
        let ev = match conn.poll() {
            Ok(ev) => ev,
            Err(e) => {
                // the GOAWAY is in there
                t.write(&conn.take_output()).await?;
                return Err(e.into());
            }
        };

        match ev {
            Some(H2Event::Request(req)) => {
                let Some(stream_id) = req.stream_id else {
                    continue;
                };
                t.write(&conn.take_output()).await?;
                let res = respond(driver, req).await;
                send_h2_response(t, &mut conn, stream_id, res, &conf.cookies).await?;
            }
            Some(H2Event::Respond {
                stream_id,
                response,
            }) => {
                send_h2_response(t, &mut conn, stream_id, response, &conf.cookies).await?;
            }
            Some(H2Event::StreamReset {
                stream_id,
                error_code,
            }) => {
                debug!(%stream_id, ?error_code, "peer reset stream");
            }
            Some(H2Event::GoAway { .. }) => {
                if conn.is_done() {
                    t.write(&conn.take_output()).await?;
                    return Ok(());
                }
            }
            None => {
                t.write(&conn.take_output()).await?;
                if conn.is_done() {
                    return Ok(());
                }
                let data = t.read_or_idle().await?;
                if data.is_empty() {
                    debug!("peer hung up");
                    return Ok(());
                }
                conn.feed(data);
            }
        }
    }
}

async fn send_h2_response<IO>(
    t: &mut Transport<IO>,
    conn: &mut H2Conn,
    stream_id: StreamId,
    mut res: Response,
    cookie_conf: &CookieConf,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
{
    debug!(%stream_id, status = %res.status(), "writing response");
    if let Some(mut rx) = conn.send_response(stream_id, &mut res, cookie_conf, Utc::now()) {
        t.write(&conn.take_output()).await?;
        while let Some(chunk) = rx.recv().await {
            if !conn.send_data(stream_id, &chunk, false) {
                break;
            }
            res.record_written(chunk.len());
            t.write(&conn.take_output()).await?;
        }
        conn.send_data(stream_id, &[], true);
    }
    t.write(&conn.take_output()).await?;
    Ok(())
}

async fn serve_ws<IO, H>(
    t: &mut Transport<IO>,
    conf: &WsConf,
    mut handler: H,
    leftover: BytesMut,
) -> Result<(), ServeError>
where
    IO: AsyncRead + AsyncWrite,
    H: WebSocketHandler,
{
    let mut session = WsSession::new(Rc::new(conf.clone()));
    session.feed(&leftover);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sender = WsSender::new(tx);
    handler.on_open(&sender).await;

    t.activity = Activity::new(conf.ping_interval);
    let mut pinged = false;

    loop {
        // everything buffered first, then what handlers queued
        let mut closed = None;
        loop {
            match session.poll() {
                Ok(Some(WsEvent::Message(msg))) => handler.on_message(&sender, msg).await,
                Ok(Some(WsEvent::Closed { code, reason })) => {
                    closed = Some((code, reason));
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    t.write(&session.take_output()).await?;
                    handler.on_close(None, "").await;
                    return Err(e.into());
                }
            }
        }
        while let Ok(cmd) = rx.try_recv() {
            apply(&mut session, cmd);
        }
        t.write(&session.take_output()).await?;

        if let Some((code, reason)) = closed {
            handler.on_close(code, &reason).await;
            break Ok(());
        }

        let deadline = t.activity.deadline();
        tokio::select! {
            data = t.read() => {
                let data = data?;
                if data.is_empty() {
                    debug!("websocket peer hung up");
                    handler.on_close(None, "").await;
                    break Ok(());
                }
                pinged = false;
                session.feed(data);
            }
            Some(cmd) = rx.recv() => {
                apply(&mut session, cmd);
            }
            _ = tokio::time::sleep_until(deadline) => {
                if pinged {
                    debug!("websocket peer did not answer our ping, closing");
                    handler.on_close(None, "").await;
                    break Err(ServeError::IdleTimeout);
                }
                trace!("websocket idle, pinging");
                session.ping(b"");
                pinged = true;
                // writing the ping touched the activity
            }
        }
    }
}

fn apply(session: &mut WsSession, cmd: Command) {
    match cmd {
        Command::Send(msg) => session.send(&msg),
        Command::Close(code, reason) => session.close(code, &reason),
    }
}
