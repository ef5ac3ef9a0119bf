//! Request body framing: content-length, chunked, or read up to a blank
//! line when there's a content-type but nothing tells us the length.

use bytes::{Buf, BytesMut};
use http::HeaderName;
use memchr::memmem;

use super::{parse, H1Error, ServerConf};
use crate::{
    types::{Headers, RequestBody},
    util::trace_partial,
};

/// Longest chunk-size line we accept (extensions included)
const MAX_CHUNK_SIZE_LINE: usize = 1024;

#[derive(Debug)]
pub(crate) enum BodyDecoder {
    ContentLength { remaining: u64 },
    Chunked(ChunkedState),
    UntilBlankLine,
}

#[derive(Debug)]
pub(crate) struct ChunkedState {
    stage: ChunkStage,
    trailer_count: usize,
    trailer_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
enum ChunkStage {
    Size,
    Data { remaining: u64 },
    DataEnd,
    Trailers,
}

pub(crate) enum Decoded {
    NeedMore,
    Done,
}

impl BodyDecoder {
    pub(crate) fn content_length(len: u64) -> Self {
        BodyDecoder::ContentLength { remaining: len }
    }

    pub(crate) fn chunked() -> Self {
        BodyDecoder::Chunked(ChunkedState {
            stage: ChunkStage::Size,
            trailer_count: 0,
            trailer_bytes: 0,
        })
    }

    /// Moves whatever body bytes `buf` holds into `body`. Never consumes
    /// bytes past the end of the body, so pipelined requests stay in `buf`.
    pub(crate) fn decode(
        &mut self,
        buf: &mut BytesMut,
        body: &mut RequestBody,
        trailers: &mut Headers,
        conf: &ServerConf,
    ) -> Result<Decoded, H1Error> {
        match self {
            BodyDecoder::ContentLength { remaining } => {
                let n = std::cmp::min(*remaining, buf.len() as u64) as usize;
                if n > 0 {
                    body.write(&buf.split_to(n))?;
                    *remaining -= n as u64;
                }
                if *remaining == 0 {
                    Ok(Decoded::Done)
                } else {
                    Ok(Decoded::NeedMore)
                }
            }
            BodyDecoder::Chunked(state) => state.decode(buf, body, trailers, conf),
            BodyDecoder::UntilBlankLine => match memmem::find(buf, b"\r\n\r\n") {
                Some(end) => {
                    if end as u64 > conf.max_body_size {
                        return Err(H1Error::BodyTooLarge {
                            max: conf.max_body_size,
                        });
                    }
                    body.write(&buf[..end])?;
                    buf.advance(end + 4);
                    Ok(Decoded::Done)
                }
                None => {
                    // the sentinel may straddle reads, hence the slack
                    if buf.len() as u64 > conf.max_body_size + 3 {
                        return Err(H1Error::BodyTooLarge {
                            max: conf.max_body_size,
                        });
                    }
                    Ok(Decoded::NeedMore)
                }
            },
        }
    }
}

impl ChunkedState {
    fn decode(
        &mut self,
        buf: &mut BytesMut,
        body: &mut RequestBody,
        trailers: &mut Headers,
        conf: &ServerConf,
    ) -> Result<Decoded, H1Error> {
        loop {
            match self.stage {
                ChunkStage::Size => {
                    let line = match parse::take_line(buf, MAX_CHUNK_SIZE_LINE) {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            trace_partial("chunk size", buf);
                            return Ok(Decoded::NeedMore);
                        }
                        Err(_) => return Err(H1Error::BadChunk("chunk size line too long")),
                    };
                    let (_, size) = parse::chunk_size(&line)
                        .map_err(|_| H1Error::BadChunk("invalid chunk size"))?;

                    if size == 0 {
                        self.stage = ChunkStage::Trailers;
                        continue;
                    }
                    if body.len().saturating_add(size) > conf.max_body_size {
                        return Err(H1Error::BodyTooLarge {
                            max: conf.max_body_size,
                        });
                    }
                    self.stage = ChunkStage::Data { remaining: size };
                }
                ChunkStage::Data { remaining } => {
                    let n = std::cmp::min(remaining, buf.len() as u64) as usize;
                    if n == 0 {
                        return Ok(Decoded::NeedMore);
                    }
                    body.write(&buf.split_to(n))?;
                    let remaining = remaining - n as u64;
                    self.stage = if remaining == 0 {
                        ChunkStage::DataEnd
                    } else {
                        ChunkStage::Data { remaining }
                    };
                }
                ChunkStage::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(Decoded::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(H1Error::BadChunk("missing CRLF after chunk data"));
                    }
                    buf.advance(2);
                    self.stage = ChunkStage::Size;
                }
                ChunkStage::Trailers => {
                    let limit = conf.max_header_bytes.saturating_sub(self.trailer_bytes);
                    let line = match parse::take_line(buf, limit) {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(Decoded::NeedMore),
                        Err(_) => {
                            return Err(H1Error::HeadersTooLarge {
                                max: conf.max_header_bytes,
                            })
                        }
                    };
                    if line.is_empty() {
                        return Ok(Decoded::Done);
                    }

                    self.trailer_count += 1;
                    self.trailer_bytes += line.len() + 2;
                    if self.trailer_count > conf.max_header_count {
                        return Err(H1Error::TooManyHeaders {
                            max: conf.max_header_count,
                        });
                    }
                    let (_, (name, value)) =
                        parse::header_line(&line).map_err(|_| H1Error::BadHeader)?;
                    let name = HeaderName::from_bytes(name).map_err(|_| H1Error::BadHeader)?;
                    trailers.append(name, bytes::Bytes::copy_from_slice(value));
                }
            }
        }
    }
}
