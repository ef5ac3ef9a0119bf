use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use super::{
    frame::{encode_frame, encode_message, FrameParser, Opcode, WsFrame},
    CloseCode, Message, WsConf, WsError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    Open,
    /// We sent a close frame, waiting for the peer's
    CloseSent,
    Closed,
}

/// What [WsSession::poll] hands out. Control frames are dealt with
/// internally and never show up here.
#[derive(Debug, PartialEq, Eq)]
pub enum WsEvent {
    Message(Message),

    /// The closing handshake is over: the connection should be dropped once
    /// the output is flushed.
    Closed { code: Option<u16>, reason: String },
}

/// One WebSocket connection, minus the I/O. Same shape as the HTTP engines:
/// [feed](WsSession::feed) bytes in, [poll](WsSession::poll) events out,
/// [take_output](WsSession::take_output) what must be written.
pub struct WsSession {
    conf: Rc<WsConf>,
    parser: FrameParser,
    inbuf: BytesMut,
    out: BytesMut,

    /// A fragmented message being reassembled
    message: Option<(Opcode, BytesMut)>,
    state: WsState,
}

impl WsSession {
    pub fn new(conf: Rc<WsConf>) -> Self {
        Self {
            conf,
            parser: Default::default(),
            inbuf: BytesMut::new(),
            out: BytesMut::new(),
            message: None,
            state: WsState::Open,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.inbuf.extend_from_slice(data);
    }

    pub fn take_output(&mut self) -> BytesMut {
        self.out.split()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.state == WsState::Closed
    }

    /// Whether we may still send messages
    pub fn is_open(&self) -> bool {
        self.state == WsState::Open
    }

    /// Processes buffered frames until a message completes or the closing
    /// handshake is over. Pings are answered on the way.
    ///
    /// On a protocol violation a close frame carrying
    /// [WsError::close_code] is queued and the session is closed.
    pub fn poll(&mut self) -> Result<Option<WsEvent>, WsError> {
        match self.poll_inner() {
            Ok(ev) => Ok(ev),
            Err(e) => {
                let code = e.close_code();
                warn!(%e, ?code, "websocket protocol error, closing");
                if self.state == WsState::Open {
                    let payload = close_payload(code.repr(), "");
                    encode_frame(&mut self.out, true, Opcode::Close, &payload, None);
                }
                self.state = WsState::Closed;
                Err(e)
            }
        }
    }

    fn poll_inner(&mut self) -> Result<Option<WsEvent>, WsError> {
        loop {
            if self.state == WsState::Closed {
                return Ok(None);
            }

            let in_progress = self.message.as_ref().map_or(0, |(_, buf)| buf.len());
            let budget = self.conf.max_message_size.saturating_sub(in_progress) as u64;
            let frame = match self.parser.parse(&mut self.inbuf, budget) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(WsError::MessageTooBig { size, .. }) => {
                    return Err(WsError::MessageTooBig {
                        size: size + in_progress as u64,
                        max: self.conf.max_message_size,
                    })
                }
                Err(e) => return Err(e),
            };

            if let Some(ev) = self.on_frame(frame)? {
                return Ok(Some(ev));
            }
        }
    }

    fn on_frame(&mut self, frame: WsFrame) -> Result<Option<WsEvent>, WsError> {
        if self.state == WsState::CloseSent && frame.opcode != Opcode::Close {
            // data may still be in flight, the peer hasn't seen our close yet
            trace!(opcode = ?frame.opcode, "ignoring frame while closing");
            return Ok(None);
        }

        match frame.opcode {
            Opcode::Ping => {
                encode_frame(&mut self.out, true, Opcode::Pong, &frame.payload, None);
                Ok(None)
            }
            Opcode::Pong => {
                trace!("got pong");
                Ok(None)
            }
            Opcode::Close => self.on_close(&frame.payload).map(Some),
            Opcode::Text | Opcode::Binary => {
                if self.message.is_some() {
                    return Err(WsError::MessageInProgress);
                }
                if frame.fin {
                    return finish_message(frame.opcode, frame.payload).map(Some);
                }
                self.message = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                Ok(None)
            }
            Opcode::Continuation => {
                let Some((opcode, mut buf)) = self.message.take() else {
                    return Err(WsError::UnexpectedContinuation);
                };
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    return finish_message(opcode, buf.freeze()).map(Some);
                }
                self.message = Some((opcode, buf));
                Ok(None)
            }
        }
    }

    fn on_close(&mut self, payload: &[u8]) -> Result<WsEvent, WsError> {
        let (code, reason) = match payload.len() {
            0 => (None, String::new()),
            1 => return Err(WsError::ClosePayloadTooShort),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::is_valid_on_wire(code) {
                    return Err(WsError::InvalidCloseCode(code));
                }
                let reason =
                    std::str::from_utf8(&payload[2..]).map_err(|_| WsError::InvalidUtf8)?;
                (Some(code), reason.to_owned())
            }
        };
        debug!(?code, %reason, "peer closed");

        if self.state == WsState::Open {
            // echo the status code back
            let echo = match code {
                Some(code) => close_payload(code, ""),
                None => Vec::new(),
            };
            encode_frame(&mut self.out, true, Opcode::Close, &echo, None);
        }
        self.state = WsState::Closed;
        Ok(WsEvent::Closed { code, reason })
    }

    /// Queues a message. Does nothing once closing has started.
    pub fn send(&mut self, msg: &Message) {
        if self.state != WsState::Open {
            debug!("not sending message, connection is closing");
            return;
        }
        let (opcode, payload) = match msg {
            Message::Text(text) => (Opcode::Text, text.as_bytes()),
            Message::Binary(data) => (Opcode::Binary, &data[..]),
        };
        encode_message(&mut self.out, opcode, payload, self.conf.max_outbound_frame);
    }

    pub fn ping(&mut self, payload: &[u8]) {
        if self.state == WsState::Open {
            encode_frame(&mut self.out, true, Opcode::Ping, payload, None);
        }
    }

    /// Starts the closing handshake. The session is closed once the peer
    /// answers with its own close frame.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        if self.state != WsState::Open {
            return;
        }
        // control frame payloads are limited to 125 bytes
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        encode_frame(
            &mut self.out,
            true,
            Opcode::Close,
            &close_payload(code.repr(), &reason[..end]),
            None,
        );
        self.state = WsState::CloseSent;
    }
}

fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

fn finish_message(opcode: Opcode, payload: Bytes) -> Result<WsEvent, WsError> {
    let msg = match opcode {
        Opcode::Text => {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| WsError::InvalidUtf8)?;
            Message::Text(text)
        }
        _ => Message::Binary(payload),
    };
    Ok(WsEvent::Message(msg))
}
