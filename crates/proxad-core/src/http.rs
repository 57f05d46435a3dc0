//! HTTP/1.x message model shared by the engine and HTTP-mode filters.
//!
//! Header names keep their original wire casing and order so an untouched
//! response re-serializes byte-identically; lookups are case-insensitive.
//! Bodies are always the decoded payload — transfer framing is an engine
//! concern and never leaks into filter-visible types.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// HTTP protocol version of a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    V10,
    #[default]
    V11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Version::V10 => "HTTP/1.0",
            Version::V11 => "HTTP/1.1",
        }
    }

    /// From the minor version digit `httparse` reports.
    pub fn from_minor(minor: u8) -> Self {
        if minor == 0 { Version::V10 } else { Version::V11 }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered multimap of header entries, one per wire line.
///
/// Stores `(original-case name, value)` pairs in arrival order; all lookups
/// fold case. [`HeaderMap::get`] joins repeated fields with `", "` per
/// RFC 7230 §3.2.2, while serialization walks the entries untouched.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(Bytes, Bytes)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
    }

    /// The field value: the single stored value, or repeated values joined
    /// with `", "`.
    pub fn get(&self, name: &str) -> Option<Bytes> {
        let mut values = self.get_all(name);
        let first = values.next()?.clone();
        let mut joined: Option<BytesMut> = None;
        for value in values {
            let buf = joined.get_or_insert_with(|| BytesMut::from(&first[..]));
            buf.put_slice(b", ");
            buf.put_slice(value);
        }
        Some(match joined {
            Some(buf) => buf.freeze(),
            None => first,
        })
    }

    /// Lossy UTF-8 view of [`HeaderMap::get`].
    pub fn get_str(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|v| String::from_utf8_lossy(&v).into_owned())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Bytes> {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| v)
    }

    /// Replace the value of `name`, keeping the stored casing and position of
    /// its first occurrence and dropping the rest. Appends when absent.
    pub fn set(&mut self, name: &str, value: impl Into<Bytes>) {
        let value = value.into();
        let mut iter = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, (n, _))| n.eq_ignore_ascii_case(name.as_bytes()))
            .map(|(i, _)| i);
        match iter.next() {
            Some(first) => {
                let rest: Vec<usize> = iter.collect();
                self.entries[first].1 = value;
                for i in rest.into_iter().rev() {
                    self.entries.remove(i);
                }
            }
            None => self.append(name.as_bytes().to_vec(), value),
        }
    }

    /// Append an entry without touching existing ones of the same name.
    pub fn append(&mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every occurrence of `name`; returns how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|(n, _)| !n.eq_ignore_ascii_case(name.as_bytes()));
        before - self.entries.len()
    }

    /// Serialize as `Name: value\r\n` lines in stored order.
    pub fn write_to(&self, out: &mut BytesMut) {
        for (name, value) in &self.entries {
            out.put_slice(name);
            out.put_slice(b": ");
            out.put_slice(value);
            out.put_slice(b"\r\n");
        }
    }

    /// True when any comma-separated token of `name`'s values equals `token`
    /// (case-insensitive). Used for `Connection` and `Transfer-Encoding`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|v| {
            v.split(|&b| b == b',')
                .any(|t| t.trim_ascii().eq_ignore_ascii_case(token.as_bytes()))
        })
    }
}

impl<N: Into<Bytes>, V: Into<Bytes>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// Decomposed request target.
///
/// `params` preserves parameter order and duplicate names; both names and
/// values are percent-decoded (`+` decodes to space, as form encoding does).
#[derive(Debug, Clone)]
pub struct Uri {
    pub raw: Bytes,
    pub path: Bytes,
    pub query: Bytes,
    pub params: Vec<(String, Vec<String>)>,
}

impl Uri {
    pub fn parse(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let (path, query) = match raw.iter().position(|&b| b == b'?') {
            Some(i) => (raw.slice(..i), raw.slice(i + 1..)),
            None => (raw.clone(), Bytes::new()),
        };
        let mut params: Vec<(String, Vec<String>)> = Vec::new();
        if !query.is_empty() {
            for segment in query.split(|&b| b == b'&') {
                if segment.is_empty() {
                    continue;
                }
                let (name, value) = match segment.iter().position(|&b| b == b'=') {
                    Some(i) => (&segment[..i], &segment[i + 1..]),
                    None => (segment, &segment[segment.len()..]),
                };
                let name = percent_decode(name);
                let value = percent_decode(value);
                match params.iter_mut().find(|(n, _)| *n == name) {
                    Some((_, values)) => values.push(value),
                    None => params.push((name, vec![value])),
                }
            }
        }
        Self {
            raw,
            path,
            query,
            params,
        }
    }

    /// All decoded values of `name`, in arrival order.
    pub fn param(&self, name: &str) -> Option<&[String]> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Re-encode `params` as a query string, preserving order and duplicates.
    pub fn encode_query(&self) -> String {
        let mut out = String::new();
        for (name, values) in &self.params {
            for value in values {
                if !out.is_empty() {
                    out.push('&');
                }
                out.push_str(&percent_encode(name));
                out.push('=');
                out.push_str(&percent_encode(value));
            }
        }
        out
    }
}

/// Decode `%XX` escapes and `+` into the bytes they stand for; invalid
/// escapes pass through verbatim. Lossy UTF-8 at the end.
pub fn percent_decode(input: &[u8]) -> String {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' if i + 2 < input.len() => {
                let hi = hex_val(input[i + 1]);
                let lo = hex_val(input[i + 2]);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Encode everything outside the query-safe unreserved set.
pub fn percent_encode(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0xf) as usize] as char);
            }
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// A fully parsed request. `raw` holds the exact wire bytes (start line,
/// headers, and body with its original framing) for filter inspection;
/// `body` is the decoded payload.
#[derive(Debug, Clone)]
pub struct HttpReq {
    pub method: Bytes,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub raw: Bytes,
}

impl HttpReq {
    pub fn is_head(&self) -> bool {
        self.method.eq_ignore_ascii_case(b"HEAD")
    }
}

/// A parsed (or filter-built) response. `reason` keeps the upstream's
/// phrase so an untouched response round-trips byte-identically.
#[derive(Debug, Clone)]
pub struct HttpResp {
    pub version: Version,
    pub status: u16,
    pub reason: Bytes,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResp {
    /// Build a response from scratch, e.g. a filter's replacement page.
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            version: Version::V11,
            status,
            reason: Bytes::from_static(canonical_reason(status).as_bytes()),
            headers,
            body: body.into(),
        }
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Status codes that never carry a body (RFC 7230 §3.3.3).
    pub fn forbids_body(&self) -> bool {
        matches!(self.status, 100..=199 | 204 | 304)
    }
}

/// Standard reason phrase for `status`; empty for unassigned codes.
pub fn canonical_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_folds_case() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Type", "text/html");
        assert_eq!(headers.get("content-type").unwrap(), "text/html");
        assert_eq!(headers.get("CONTENT-TYPE").unwrap(), "text/html");
        assert!(headers.contains("Content-type"));
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn repeated_fields_join_with_comma() {
        let mut headers = HeaderMap::new();
        headers.append("Accept", "text/html");
        headers.append("accept", "application/json");
        assert_eq!(headers.get("Accept").unwrap(), "text/html, application/json");
        assert_eq!(headers.get_all("accept").count(), 2);
    }

    #[test]
    fn set_keeps_original_casing_and_position() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Length", "10");
        headers.append("Server", "x");
        headers.append("content-length", "999");
        headers.set("CONTENT-LENGTH", "42");

        let entries: Vec<_> = headers.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].0[..], b"Content-Length");
        assert_eq!(&entries[0].1[..], b"42");
        assert_eq!(&entries[1].0[..], b"Server");
    }

    #[test]
    fn connection_tokens_are_scanned() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("Connection", "keep-alive"));
        assert!(!headers.has_token("Connection", "close"));
    }

    #[test]
    fn uri_params_preserve_duplicates_and_order() {
        let uri = Uri::parse(&b"/submit?a=1&b=x%20y&a=2&c"[..]);
        assert_eq!(&uri.path[..], b"/submit");
        assert_eq!(&uri.query[..], b"a=1&b=x%20y&a=2&c");
        assert_eq!(uri.params.len(), 3);
        assert_eq!(uri.param("a").unwrap(), ["1", "2"]);
        assert_eq!(uri.param("b").unwrap(), ["x y"]);
        assert_eq!(uri.param("c").unwrap(), [""]);
    }

    #[test]
    fn query_round_trip_keeps_duplicates() {
        let uri = Uri::parse(&b"/p?k=v1&k=v2&other=a+b"[..]);
        assert_eq!(uri.encode_query(), "k=v1&k=v2&other=a%20b");
        let again = Uri::parse(format!("/p?{}", uri.encode_query()).into_bytes());
        assert_eq!(again.params, uri.params);
    }

    #[test]
    fn plus_and_percent_decode() {
        assert_eq!(percent_decode(b"a+b%21"), "a b!");
        assert_eq!(percent_decode(b"100%"), "100%");
        assert_eq!(percent_decode(b"%zz"), "%zz");
    }

    #[test]
    fn built_responses_get_canonical_reasons() {
        let resp = HttpResp::new(502, HeaderMap::new(), "");
        assert_eq!(&resp.reason[..], b"Bad Gateway");
        assert!(!resp.forbids_body());
        assert!(HttpResp::new(204, HeaderMap::new(), "").forbids_body());
    }
}
