//! `multipart/form-data` bodies, cf. https://www.rfc-editor.org/rfc/rfc7578
//!
//! The body is parsed from memory. File parts larger than the memory limit
//! are copied out to temporary files, everything else is kept as is.

use std::io;

use bytes::Bytes;
use memchr::memmem;

use super::{
    params::{Param, Params, SpooledFile},
    RequestBody,
};

/// Nested `multipart/mixed` parts deeper than this are rejected.
const MAX_DEPTH: usize = 4;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MultipartError {
    #[error("multipart content-type has no boundary")]
    MissingBoundary,

    #[error("malformed multipart body: {0}")]
    Malformed(&'static str),

    #[error("multipart parts nested deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("could not spool file part: {0}")]
    Spool(#[from] io::Error),
}

/// Extracts the `boundary` parameter from a content-type value.
pub(crate) fn boundary(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(v);
        (!v.is_empty()).then_some(v)
    })
}

/// Parses `body` and adds every part to `params`.
///
/// Simple parts become scalar values. Parts with a filename become
/// `name[data]`, `name[type]` and `name[file]`. `multipart/mixed` parts are
/// parsed recursively under the enclosing field name.
///
/// File contents over `file_memory_limit` bytes become [Param::File].
pub fn parse_multipart(
    body: &[u8],
    content_type: &str,
    file_memory_limit: usize,
    params: &mut Params,
) -> Result<(), MultipartError> {
    let boundary = boundary(content_type).ok_or(MultipartError::MissingBoundary)?;
    let mut cx = PartsCx {
        params,
        file_memory_limit,
    };
    parse_parts(body, boundary, None, &mut cx, 0)
}

struct PartsCx<'a> {
    params: &'a mut Params,
    file_memory_limit: usize,
}

fn parse_parts(
    body: &[u8],
    boundary: &str,
    outer_name: Option<&str>,
    cx: &mut PartsCx<'_>,
    depth: usize,
) -> Result<(), MultipartError> {
    if depth >= MAX_DEPTH {
        return Err(MultipartError::TooDeep);
    }

    let delimiter = format!("--{boundary}");
    let next_delimiter = format!("\r\n--{boundary}");
    let finder = memmem::Finder::new(next_delimiter.as_bytes());

    let start = memmem::find(body, delimiter.as_bytes())
        .ok_or(MultipartError::Malformed("no opening boundary"))?;
    let mut rest = &body[start + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            // closing delimiter, the epilogue is ignored
            return Ok(());
        }
        rest = skip_line(rest).ok_or(MultipartError::Malformed("boundary line not terminated"))?;

        let end = finder
            .find(rest)
            .ok_or(MultipartError::Malformed("part not terminated"))?;
        let part = &rest[..end];
        rest = &rest[end + next_delimiter.len()..];

        handle_part(part, outer_name, cx, depth)?;
    }
}

fn handle_part(
    part: &[u8],
    outer_name: Option<&str>,
    cx: &mut PartsCx<'_>,
    depth: usize,
) -> Result<(), MultipartError> {
    let (head, data) = match memmem::find(part, b"\r\n\r\n") {
        Some(i) => (&part[..i], &part[i + 4..]),
        // no headers at all
        None if part.starts_with(b"\r\n") => (&b""[..], &part[2..]),
        None => return Err(MultipartError::Malformed("part headers not terminated")),
    };

    let mut name = None;
    let mut filename = None;
    let mut content_type = None;
    for line in head.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(line.trim_ascii());
        let Some((k, v)) = line.split_once(':') else {
            continue;
        };
        let v = v.trim();
        if k.trim().eq_ignore_ascii_case("content-disposition") {
            name = disposition_param(v, "name");
            filename = disposition_param(v, "filename");
        } else if k.trim().eq_ignore_ascii_case("content-type") {
            content_type = Some(v.to_owned());
        }
    }

    let Some(name) = name.or_else(|| outer_name.map(str::to_owned)) else {
        // nameless parts carry nothing we can address
        return Ok(());
    };

    if let Some(ct) = content_type.as_deref() {
        if ct.len() >= 15 && ct.as_bytes()[..15].eq_ignore_ascii_case(b"multipart/mixed") {
            let inner = boundary(ct).ok_or(MultipartError::MissingBoundary)?;
            return parse_parts(data, inner, Some(&name), cx, depth + 1);
        }
    }

    match filename {
        Some(filename) => {
            let contents = if data.len() > cx.file_memory_limit {
                let mut file = RequestBody::new(cx.file_memory_limit);
                file.write(data)?;
                Param::File(SpooledFile::new(file))
            } else {
                Param::Bytes(Bytes::copy_from_slice(data))
            };
            let params = &mut *cx.params;
            params.insert(&format!("{name}[data]"), contents);
            params.insert(
                &format!("{name}[type]"),
                Param::Str(content_type.unwrap_or_else(|| "application/octet-stream".into())),
            );
            params.insert(&format!("{name}[file]"), Param::Str(filename));
        }
        None => {
            let value = String::from_utf8_lossy(data).into_owned();
            cx.params.insert(&name, Param::coerce(value));
        }
    }
    Ok(())
}

fn skip_line(input: &[u8]) -> Option<&[u8]> {
    let nl = memchr::memchr(b'\n', input)?;
    Some(&input[nl + 1..])
}

/// Finds `key=value` (quoted or not) in a content-disposition value.
fn disposition_param(value: &str, key: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(v);
        Some(v.to_owned())
    })
}
