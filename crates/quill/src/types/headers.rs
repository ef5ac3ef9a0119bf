//! Types for HTTP headers

use bytes::Bytes;
use http::{header, HeaderMap};

/// Header names are case-insensitive and a name may carry several values,
/// in the order they were received.
pub type Headers = HeaderMap<Bytes>;

pub trait HeadersExt {
    /// Returns the content-length header
    fn content_length(&self) -> Option<u64>;

    /// Returns true if we have a `connection: close` header
    fn is_connection_close(&self) -> bool;

    /// Returns true if we have a `connection: keep-alive` header
    fn is_connection_keep_alive(&self) -> bool;

    /// Returns true if we have a `transfer-encoding: chunked` header
    fn is_chunked_transfer_encoding(&self) -> bool;

    /// Returns true if the client expects a `100-continue` response
    fn expects_100_continue(&self) -> bool;

    /// Returns true if the `connection` header lists `token`
    fn connection_has(&self, token: &str) -> bool;

    /// Returns true if the `upgrade` header lists `protocol`
    fn upgrade_is(&self, protocol: &str) -> bool;

    /// Returns the first value for `name` as a string, if it is valid UTF-8
    fn get_str(&self, name: impl header::AsHeaderName) -> Option<&str>;
}

impl HeadersExt for Headers {
    fn content_length(&self) -> Option<u64> {
        self.get(header::CONTENT_LENGTH)
            .and_then(|s| from_digits(s))
    }

    fn is_connection_close(&self) -> bool {
        self.connection_has("close")
    }

    fn is_connection_keep_alive(&self) -> bool {
        self.connection_has("keep-alive")
    }

    fn is_chunked_transfer_encoding(&self) -> bool {
        self.get_all(header::TRANSFER_ENCODING)
            .iter()
            .flat_map(|v| comma_list(v))
            .last()
            .map_or(false, |value| value.eq_ignore_ascii_case(b"chunked"))
    }

    fn expects_100_continue(&self) -> bool {
        self.get(header::EXPECT)
            .map_or(false, |value| value.eq_ignore_ascii_case(b"100-continue"))
    }

    fn connection_has(&self, token: &str) -> bool {
        self.get_all(header::CONNECTION)
            .iter()
            .flat_map(|v| comma_list(v))
            .any(|t| t.eq_ignore_ascii_case(token.as_bytes()))
    }

    fn upgrade_is(&self, protocol: &str) -> bool {
        self.get_all(header::UPGRADE)
            .iter()
            .flat_map(|v| comma_list(v))
            .any(|t| t.eq_ignore_ascii_case(protocol.as_bytes()))
    }

    fn get_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Splits a comma-separated header value into trimmed, non-empty items.
pub(crate) fn comma_list(value: &[u8]) -> impl Iterator<Item = &[u8]> {
    value
        .split(|&b| b == b',')
        .map(|item| item.trim_ascii())
        .filter(|item| !item.is_empty())
}

/// Parses a run of ASCII digits. Signs, whitespace and overflow are all
/// rejected.
pub(crate) fn from_digits(bytes: &[u8]) -> Option<u64> {
    // cannot use FromStr for u64, since it allows a signed prefix
    let mut result = 0u64;
    const RADIX: u64 = 10;

    if bytes.is_empty() {
        return None;
    }

    for &b in bytes {
        // can't use char::to_digit, since we haven't verified these bytes
        // are utf-8.
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(RADIX)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => {
                // not a DIGIT, get outta here!
                return None;
            }
        }
    }

    Some(result)
}

/// Returns true for header fields that only make sense on a single HTTP/1.1
/// hop, and are therefore forbidden in HTTP/2.
pub(crate) fn is_connection_specific(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "proxy-connection" | "transfer-encoding" | "upgrade"
    )
}

/// Values may not carry CR, LF or NUL, whichever protocol they came from.
pub(crate) fn is_valid_value(value: &[u8]) -> bool {
    !value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header;

    use super::{from_digits, Headers, HeadersExt};

    #[test]
    fn test_from_digits() {
        assert_eq!(from_digits(b"0"), Some(0));
        assert_eq!(from_digits(b"1234"), Some(1234));
        assert_eq!(from_digits(b""), None);
        assert_eq!(from_digits(b"+12"), None);
        assert_eq!(from_digits(b"12 "), None);
        assert_eq!(from_digits(b"99999999999999999999999"), None);
    }

    #[test]
    fn test_multi_value_headers() {
        let mut headers = Headers::default();
        headers.append(header::ACCEPT, Bytes::from_static(b"text/html"));
        headers.append("Accept", Bytes::from_static(b"application/json"));
        let values: Vec<_> = headers.get_all("ACCEPT").iter().cloned().collect();
        assert_eq!(
            values,
            vec![
                Bytes::from_static(b"text/html"),
                Bytes::from_static(b"application/json")
            ]
        );
    }

    #[test]
    fn test_connection_tokens() {
        let mut headers = Headers::default();
        headers.insert(header::CONNECTION, Bytes::from_static(b"keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, Bytes::from_static(b"h2c"));
        assert!(headers.connection_has("upgrade"));
        assert!(headers.is_connection_keep_alive());
        assert!(!headers.is_connection_close());
        assert!(headers.upgrade_is("H2C"));
    }

    #[test]
    fn test_chunked_must_be_last() {
        let mut headers = Headers::default();
        headers.insert(
            header::TRANSFER_ENCODING,
            Bytes::from_static(b"gzip, chunked"),
        );
        assert!(headers.is_chunked_transfer_encoding());
        headers.insert(
            header::TRANSFER_ENCODING,
            Bytes::from_static(b"chunked, gzip"),
        );
        assert!(!headers.is_chunked_transfer_encoding());
    }
}
