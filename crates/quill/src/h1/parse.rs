//! HTTP/1.1 parser
//!
//! HTTP/1.1 https://httpwg.org/specs/rfc9112.html
//! HTTP semantics https://httpwg.org/specs/rfc9110.html
//!
//! Lines are cut out of the input buffer first (so limits can be enforced
//! before anything is parsed), then parsed whole.

use bytes::{Buf, Bytes, BytesMut};
use http::Version;
use nom::{
    bytes::complete::{tag, take_while, take_while1, take_while_m_n},
    combinator::{all_consuming, map_res, opt},
    sequence::{preceded, terminated, tuple},
    IResult,
};

/// A line went past its size limit before a line feed showed up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LineTooLong;

/// Takes one line off the front of `buf`, without its line terminator
/// (CRLF, or a lone LF). Returns `None` if no complete line is buffered.
pub(crate) fn take_line(buf: &mut BytesMut, limit: usize) -> Result<Option<Bytes>, LineTooLong> {
    let Some(nl) = memchr::memchr(b'\n', buf) else {
        if buf.len() > limit {
            return Err(LineTooLong);
        }
        return Ok(None);
    };
    if nl > limit {
        return Err(LineTooLong);
    }

    let mut line = buf.split_to(nl + 1);
    line.truncate(nl);
    if line.last() == Some(&b'\r') {
        line.truncate(nl - 1);
    }
    Ok(Some(line.freeze()))
}

/// Drops empty lines preceding a request line, cf. RFC 9112 section 2.2
pub(crate) fn skip_empty_lines(buf: &mut BytesMut) {
    loop {
        if buf.starts_with(b"\r\n") {
            buf.advance(2);
        } else if buf.starts_with(b"\n") {
            buf.advance(1);
        } else {
            return;
        }
    }
}

/// Looks like `GET /path HTTP/1.1` (line terminator already stripped).
/// Returns method, target and version, unvalidated.
pub(crate) fn request_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8], &[u8])> {
    all_consuming(tuple((
        terminated(token, space1),
        terminated(take_while1(is_uri_char), space1),
        take_while1(|c: u8| c.is_ascii_graphic()),
    )))(i)
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum VersionError {
    Malformed,
    Unsupported,
}

/// Parses `HTTP/x.y`. Only 1.0 and 1.1 are supported, other well-formed
/// versions are reported as such.
pub(crate) fn http_version(i: &[u8]) -> Result<Version, VersionError> {
    fn digit(i: &[u8]) -> IResult<&[u8], &[u8]> {
        take_while_m_n(1, 1, |c: u8| c.is_ascii_digit())(i)
    }
    let res: IResult<&[u8], (&[u8], &[u8])> = all_consuming(preceded(
        tag(&b"HTTP/"[..]),
        tuple((digit, preceded(tag(&b"."[..]), digit))),
    ))(i);

    match res {
        Ok((_, (b"1", b"1"))) => Ok(Version::HTTP_11),
        Ok((_, (b"1", b"0"))) => Ok(Version::HTTP_10),
        Ok(_) => Err(VersionError::Unsupported),
        Err(_) => Err(VersionError::Malformed),
    }
}

/// Parses a single header line into name and value. The value has its
/// surrounding whitespace trimmed.
pub(crate) fn header_line(i: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (i, name) = terminated(token, tag(&b":"[..]))(i)?;
    let value = i.trim_ascii();
    Ok((&i[i.len()..], (name, value)))
}

/// Parses a chunk-size line: hex digits, then optional `;ext` we ignore.
pub(crate) fn chunk_size(i: &[u8]) -> IResult<&[u8], u64> {
    let (i, size) = map_res(take_while1(|c: u8| c.is_ascii_hexdigit()), |s: &[u8]| {
        // at most 16 hex digits fit in a u64
        if s.len() > 16 {
            return Err(());
        }
        let s = std::str::from_utf8(s).map_err(|_| ())?;
        u64::from_str_radix(s, 16).map_err(|_| ())
    })(i)?;
    let (i, _) = take_while(|c| c == b' ' || c == b'\t')(i)?;
    let (i, _) = opt(preceded(tag(&b";"[..]), take_while(|_| true)))(i)?;
    if !i.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            i,
            nom::error::ErrorKind::Eof,
        )));
    }
    Ok((i, size))
}

/// A short textual identifier that does not include whitspace or delimiters,
/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn token(i: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while1(is_tchar)(i)
}

/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn is_tchar(c: u8) -> bool {
    c.is_ascii_graphic() && !is_delimiter(c)
}

/// cf. https://httpwg.org/specs/rfc9110.html#rule.token.separators
fn is_delimiter(c: u8) -> bool {
    memchr::memchr(c, br#"(),/:;<=>?@[\]{}""#).is_some()
}

/// Returns true if `c` is a character that can be found in an URI
/// cf. https://stackoverflow.com/a/7109208
fn is_uri_char(c: u8) -> bool {
    memchr::memchr(
        c,
        br#"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-._~:/?#[]@!$&'()*+,;%="#,
    )
    .is_some()
}

/// Parse a single SP character
fn space1(i: &[u8]) -> IResult<&[u8], ()> {
    let (i, _) = tag(&b" "[..])(i)?;
    Ok((i, ()))
}
