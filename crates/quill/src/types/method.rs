use std::fmt;

/// Declares [Method] from one row per method: variant, name on the wire,
/// and whether a request may carry a body without saying so.
macro_rules! methods {
    ($($variant:ident = $name:literal, implicit_body: $body:literal;)*) => {
        /// An HTTP method, cf. <https://httpwg.org/specs/rfc9110.html#methods>.
        /// Anything else off the wire is a bad request.
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)*
        }

        impl Method {
            pub const ALL: &'static [Method] = &[$(Method::$variant,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Method::$variant => $name,)*
                }
            }

            pub(crate) fn may_have_body(&self) -> bool {
                match self {
                    $(Method::$variant => $body,)*
                }
            }
        }
    };
}

methods! {
    Get = "GET", implicit_body: false;
    Head = "HEAD", implicit_body: false;
    Post = "POST", implicit_body: true;
    Put = "PUT", implicit_body: true;
    Delete = "DELETE", implicit_body: false;
    Trace = "TRACE", implicit_body: false;
    Options = "OPTIONS", implicit_body: false;
    Connect = "CONNECT", implicit_body: false;
    Patch = "PATCH", implicit_body: true;
}

impl Method {
    /// What OPTIONS replies put in `Allow`: everything but TRACE
    pub const ALLOWED: &'static str = "GET, HEAD, POST, PUT, DELETE, OPTIONS, CONNECT, PATCH";

    /// Case-sensitive, as method names are
    pub fn from_bytes(name: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().as_bytes() == name)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}
