//! Just enough of a client to talk to the server in tests

use bytes::{Bytes, BytesMut};
use quill::ws::{
    frame::{encode_frame, FrameParser},
    Opcode, WsFrame,
};
use quill_h2::{Frame, FRAME_HEADER_LEN};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::BoxError;

#[derive(Debug)]
pub(crate) struct H1Response {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl H1Response {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

pub(crate) struct Client<IO> {
    pub(crate) io: IO,
    pub(crate) buf: BytesMut,
}

impl<IO> Client<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: IO) -> Self {
        Self {
            io,
            buf: BytesMut::new(),
        }
    }

    pub(crate) async fn send(&mut self, data: impl AsRef<[u8]>) -> Result<(), BoxError> {
        self.io.write_all(data.as_ref()).await?;
        Ok(())
    }

    /// Reads more. `false` means the server closed the connection.
    pub(crate) async fn fill(&mut self) -> Result<bool, BoxError> {
        Ok(self.io.read_buf(&mut self.buf).await? > 0)
    }

    pub(crate) async fn take(&mut self, n: usize) -> Result<Bytes, BoxError> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Err(format!("eof, wanted {n} bytes, have {}", self.buf.len()).into());
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    async fn line(&mut self) -> Result<String, BoxError> {
        loop {
            if let Some(pos) = memchr::memmem::find(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos + 2);
                return Ok(String::from_utf8(line[..pos].to_vec())?);
            }
            if !self.fill().await? {
                return Err("eof in the middle of a line".into());
            }
        }
    }

    /// Reads a status line and headers, never a body
    pub(crate) async fn read_head(&mut self) -> Result<H1Response, BoxError> {
        let status_line = self.line().await?;
        let status = status_line
            .split(' ')
            .nth(1)
            .ok_or("no status code")?
            .parse()?;

        let mut headers = vec![];
        loop {
            let line = self.line().await?;
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').ok_or("malformed header")?;
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_owned()));
        }

        Ok(H1Response {
            status,
            headers,
            body: vec![],
        })
    }

    /// Reads a whole response. Bodies without framing are assumed empty.
    pub(crate) async fn read_response(&mut self) -> Result<H1Response, BoxError> {
        let mut res = self.read_head().await?;
        if res.header("transfer-encoding") == Some("chunked") {
            loop {
                let size = usize::from_str_radix(self.line().await?.trim(), 16)?;
                if size == 0 {
                    // no trailers from us
                    self.line().await?;
                    break;
                }
                res.body.extend_from_slice(&self.take(size).await?);
                self.take(2).await?;
            }
        } else if let Some(len) = res.header("content-length") {
            let len: usize = len.parse()?;
            res.body = self.take(len).await?.to_vec();
        }
        Ok(res)
    }

    /// Waits for the server to hang up, returns anything it still sent
    pub(crate) async fn read_to_eof(&mut self) -> Result<Bytes, BoxError> {
        while self.fill().await? {}
        Ok(self.buf.split().freeze())
    }

    pub(crate) async fn send_ws(
        &mut self,
        fin: bool,
        opcode: Opcode,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        let mut out = BytesMut::new();
        encode_frame(&mut out, fin, opcode, payload, Some([0x12, 0x34, 0x56, 0x78]));
        self.send(&out).await
    }

    pub(crate) async fn read_ws(&mut self) -> Result<WsFrame, BoxError> {
        let mut parser = FrameParser::default();
        loop {
            if let Some(frame) = parser.parse(&mut self.buf, u64::MAX)? {
                return Ok(frame);
            }
            if !self.fill().await? {
                return Err("eof while reading a websocket frame".into());
            }
        }
    }

    pub(crate) async fn send_h2(
        &mut self,
        frame: Frame,
        payload: &[u8],
    ) -> Result<(), BoxError> {
        let mut out = Vec::new();
        frame.with_len(payload.len() as u32).encode(&mut out);
        out.extend_from_slice(payload);
        self.send(&out).await
    }

    pub(crate) async fn read_h2(&mut self) -> Result<(Frame, Bytes), BoxError> {
        let head = self.take(FRAME_HEADER_LEN).await?;
        let (_, frame) = Frame::parse(&head).map_err(|e| format!("bad frame header: {e:?}"))?;
        let payload = self.take(frame.len as usize).await?;
        Ok((frame, payload))
    }
}
