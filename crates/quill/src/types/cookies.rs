//! Cookies in both directions: the `Cookie` request header is read into a
//! jar, and cookies set on a response are serialized as `Set-Cookie`.

use std::{collections::BTreeMap, fmt::Write as _};

use chrono::{DateTime, Utc};

use super::{headers::is_valid_value, params::decode_form};

/// Cookies sent by the client, by name
pub type Cookies = BTreeMap<String, String>;

/// Adds the pairs of a `Cookie` header value to `jar`. Later values win.
pub(crate) fn parse_cookie_header(value: &[u8], jar: &mut Cookies) {
    for pair in value.split(|&b| b == b';') {
        let pair = pair.trim_ascii();
        let Some(eq) = memchr::memchr(b'=', pair) else {
            continue;
        };
        let name = pair[..eq].trim_ascii();
        if name.is_empty() {
            continue;
        }
        let mut value = pair[eq + 1..].trim_ascii();
        if value.len() >= 2 && value.starts_with(b"\"") && value.ends_with(b"\"") {
            value = &value[1..value.len() - 1];
        }
        jar.insert(
            String::from_utf8_lossy(name).into_owned(),
            decode_form(value).into_owned(),
        );
    }
}

/// Attributes applied to every cookie written, unless the cookie sets its
/// own.
#[derive(Debug, Clone, Default)]
pub struct CookieConf {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl CookieConf {
    pub fn validate(&self) -> Result<(), CookieError> {
        check_attribute("Path", self.path.as_deref())?;
        check_attribute("Domain", self.domain.as_deref())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CookieError {
    #[error("invalid cookie name {name:?}")]
    InvalidName { name: String },

    #[error("invalid cookie attribute {attribute}={value:?}")]
    InvalidAttribute {
        attribute: &'static str,
        value: String,
    },
}

/// A cookie queued on a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    name: String,
    value: String,
    pub path: Option<String>,
    pub domain: Option<String>,
    pub max_age: Option<i64>,
    pub expires: Option<DateTime<Utc>>,
    pub secure: Option<bool>,
    pub http_only: Option<bool>,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, CookieError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(CookieError::InvalidName { name });
        }
        Ok(Self {
            name,
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            expires: None,
            secure: None,
            http_only: None,
        })
    }

    /// A cookie that tells the client to forget `name`.
    pub fn removal(name: impl Into<String>) -> Result<Self, CookieError> {
        let mut cookie = Self::new(name, "")?;
        cookie.max_age = Some(0);
        cookie.expires = DateTime::from_timestamp(0, 0);
        Ok(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Checks the attributes set after construction, see
    /// [Response::set_cookie](super::Response::set_cookie)
    pub fn validate(&self) -> Result<(), CookieError> {
        check_attribute("Path", self.path.as_deref())?;
        check_attribute("Domain", self.domain.as_deref())
    }

    /// Renders the `Set-Cookie` value, falling back on `conf` for
    /// attributes this cookie doesn't set.
    pub fn serialize(&self, conf: &CookieConf) -> String {
        let mut out = format!("{}={}", self.name, urlencoding::encode(&self.value));

        if let Some(max_age) = self.max_age.or(conf.max_age) {
            let _ = write!(out, "; Max-Age={max_age}");
        }
        if let Some(expires) = self.expires.or(conf.expires) {
            let _ = write!(out, "; Expires={}", super::http_date(expires));
        }
        // attributes that would break out of the header are left out
        if let Some(path) = self.path.as_ref().or(conf.path.as_ref()) {
            if is_valid_attribute(path) {
                let _ = write!(out, "; Path={path}");
            }
        }
        if let Some(domain) = self.domain.as_ref().or(conf.domain.as_ref()) {
            if is_valid_attribute(domain) {
                let _ = write!(out, "; Domain={domain}");
            }
        }
        if self.secure.unwrap_or(conf.secure) {
            out.push_str("; Secure");
        }
        if self.http_only.unwrap_or(conf.http_only) {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Cookie names are RFC 6265 tokens: no controls, whitespace or separators.
fn is_valid_name(name: &str) -> bool {
    const BANNED: &[u8] = b"()<>@,;:\\\"/[]?={} \t";
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b > 0x1f && b < 0x7f && !BANNED.contains(&b))
}

/// Attribute values end at `;`, and may not end the header line either
fn is_valid_attribute(value: &str) -> bool {
    is_valid_value(value.as_bytes()) && !value.bytes().any(|b| b == b';' || b.is_ascii_control())
}

fn check_attribute(attribute: &'static str, value: Option<&str>) -> Result<(), CookieError> {
    match value {
        Some(value) if !is_valid_attribute(value) => Err(CookieError::InvalidAttribute {
            attribute,
            value: value.to_owned(),
        }),
        _ => Ok(()),
    }
}
