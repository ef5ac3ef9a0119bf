//! Query-string and form parameters, expanded Rails-style: `a[b][]=1`
//! becomes `{a: {b: [1]}}`.

use std::{borrow::Cow, collections::BTreeMap, fmt, io, path::Path, sync::Arc};

use bytes::Bytes;

use super::RequestBody;

/// A single parameter value
#[derive(Clone, PartialEq)]
pub enum Param {
    Bool(bool),
    Int(i64),
    Str(String),
    /// Raw contents of an uploaded file
    Bytes(Bytes),
    /// An uploaded file too large to keep in memory
    File(SpooledFile),
    List(Vec<Param>),
    Map(BTreeMap<String, Param>),
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Bool(b) => write!(f, "{b}"),
            Param::Int(n) => write!(f, "{n}"),
            Param::Str(s) => write!(f, "{s:?}"),
            Param::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Param::File(file) => write!(f, "<{} bytes on disk>", file.len()),
            Param::List(l) => f.debug_list().entries(l).finish(),
            Param::Map(m) => f.debug_map().entries(m).finish(),
        }
    }
}

impl Param {
    /// Turns `"true"`, `"false"` and canonical integers into their typed
    /// counterparts. Everything else stays a string.
    pub fn coerce(s: String) -> Param {
        match s.as_str() {
            "true" => return Param::Bool(true),
            "false" => return Param::Bool(false),
            _ => {}
        }
        match s.parse::<i64>() {
            // "007" and "+7" stay strings
            Ok(n) if n.to_string() == s => Param::Int(n),
            _ => Param::Str(s),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Param::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Param::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Param]> {
        match self {
            Param::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Param> {
        match self {
            Param::Map(m) => m.get(key),
            _ => None,
        }
    }
}

/// Contents of an uploaded file, spooled to a temporary file. The file is
/// deleted once the last clone is dropped.
#[derive(Clone)]
pub struct SpooledFile(Arc<RequestBody>);

impl SpooledFile {
    pub(crate) fn new(contents: RequestBody) -> Self {
        Self(Arc::new(contents))
    }

    pub fn len(&self) -> u64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.0.path()
    }

    /// Reads the whole file back into memory.
    pub fn to_bytes(&self) -> io::Result<Bytes> {
        self.0.to_bytes()
    }
}

// identity, the contents are never read back to compare
impl PartialEq for SpooledFile {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The parameter tree of a request
#[derive(Clone, Default, PartialEq)]
pub struct Params {
    root: BTreeMap<String, Param>,
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(&self.root).finish()
    }
}

impl Params {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<&Param> {
        self.root.get(key)
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Param)> {
        self.root.iter()
    }

    pub fn into_inner(self) -> BTreeMap<String, Param> {
        self.root
    }

    /// Inserts `value` under a possibly bracketed key. `a[]` appends to a
    /// list, `a[b]` nests a map. A later scalar for the same key wins.
    pub fn insert(&mut self, key: &str, value: Param) {
        let (base, path) = split_key(key);
        if base.is_empty() {
            return;
        }
        insert_into_map(&mut self.root, base, &path, value);
    }

    /// Adds every pair of an `application/x-www-form-urlencoded` string
    /// (query strings use the same syntax).
    pub fn extend_from_urlencoded(&mut self, input: &[u8]) {
        for pair in input.split(|&b| b == b'&') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match memchr::memchr(b'=', pair) {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, &b""[..]),
            };
            let key = decode_form(key);
            let value = decode_form(value);
            self.insert(&key, Param::coerce(value.into_owned()));
        }
    }
}

/// Parses a query string into a parameter tree.
pub fn parse_query(query: &str) -> Params {
    let mut params = Params::new();
    params.extend_from_urlencoded(query.as_bytes());
    params
}

/// Percent-decodes form data, where `+` stands for a space.
pub fn decode_form(input: &[u8]) -> Cow<'_, str> {
    if input.contains(&b'+') {
        let spaced: Vec<u8> = input
            .iter()
            .map(|&b| if b == b'+' { b' ' } else { b })
            .collect();
        let decoded = urlencoding::decode_binary(&spaced);
        Cow::Owned(String::from_utf8_lossy(&decoded).into_owned())
    } else {
        match urlencoding::decode_binary(input) {
            Cow::Borrowed(b) => String::from_utf8_lossy(b),
            Cow::Owned(b) => Cow::Owned(String::from_utf8_lossy(&b).into_owned()),
        }
    }
}

/// Percent-decodes a path segment: `+` is kept as-is.
pub fn decode_path(input: &str) -> Cow<'_, str> {
    match urlencoding::decode_binary(input.as_bytes()) {
        Cow::Borrowed(_) => Cow::Borrowed(input),
        Cow::Owned(b) => Cow::Owned(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// Deepest bracket nesting expanded, deeper keys are used verbatim
pub const MAX_KEY_DEPTH: usize = 32;

/// Splits `a[b][]` into `("a", ["b", ""])`. Keys that don't follow the
/// bracket syntax, or nest deeper than [MAX_KEY_DEPTH], are used verbatim.
fn split_key(key: &str) -> (&str, Vec<&str>) {
    let Some(open) = key.find('[') else {
        return (key, Vec::new());
    };
    if open == 0 {
        return (key, Vec::new());
    }

    let base = &key[..open];
    let mut path = Vec::new();
    let mut rest = &key[open..];
    while let Some(inner) = rest.strip_prefix('[') {
        let Some(close) = inner.find(']') else {
            return (key, Vec::new());
        };
        if path.len() == MAX_KEY_DEPTH {
            return (key, Vec::new());
        }
        path.push(&inner[..close]);
        rest = &inner[close + 1..];
    }
    if !rest.is_empty() {
        // trailing junk like `a[b]c`
        return (key, Vec::new());
    }
    (base, path)
}

fn insert_into_map(map: &mut BTreeMap<String, Param>, key: &str, rest: &[&str], value: Param) {
    match rest.split_first() {
        None => {
            map.insert(key.to_owned(), value);
        }
        Some((&"", tail)) => {
            let slot = map
                .entry(key.to_owned())
                .or_insert_with(|| Param::List(Vec::new()));
            if !matches!(slot, Param::List(_)) {
                *slot = Param::List(Vec::new());
            }
            if let Param::List(list) = slot {
                push_into_list(list, tail, value);
            }
        }
        Some((next, tail)) => {
            let slot = map
                .entry(key.to_owned())
                .or_insert_with(|| Param::Map(BTreeMap::new()));
            if !matches!(slot, Param::Map(_)) {
                *slot = Param::Map(BTreeMap::new());
            }
            if let Param::Map(inner) = slot {
                insert_into_map(inner, next, tail, value);
            }
        }
    }
}

fn push_into_list(list: &mut Vec<Param>, rest: &[&str], value: Param) {
    match rest.split_first() {
        None => list.push(value),
        Some((&"", tail)) => {
            let mut inner = Vec::new();
            push_into_list(&mut inner, tail, value);
            list.push(Param::List(inner));
        }
        Some((next, tail)) => {
            // `a[][x]=1&a[][y]=2` fills one map, a repeated `x` starts the
            // next one
            let reuse = matches!(list.last(), Some(Param::Map(m)) if !m.contains_key(*next));
            if !reuse {
                list.push(Param::Map(BTreeMap::new()));
            }
            if let Some(Param::Map(m)) = list.last_mut() {
                insert_into_map(m, next, tail, value);
            }
        }
    }
}
