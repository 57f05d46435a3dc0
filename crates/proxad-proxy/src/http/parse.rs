//! Incremental HTTP/1.x message parsing.
//!
//! Heads are parsed with `httparse`, re-trying as bytes arrive until the
//! blank line shows up; body framing (chunked with trailers,
//! content-length, no-body defaults, until-close) is handled here. Every
//! parsed message also carries its exact wire bytes: requests are
//! forwarded upstream verbatim and filters get the raw view.

use bytes::{Bytes, BytesMut};
use proxad_core::http::{HeaderMap, HttpReq, HttpResp, Uri, Version};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Heads larger than this are rejected rather than buffered forever.
const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;
const READ_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub(crate) enum ParseError {
    #[error("malformed message head: {0}")]
    Head(httparse::Error),
    #[error("message head too large")]
    HeadTooLarge,
    #[error("invalid content-length")]
    InvalidContentLength,
    #[error("invalid chunked framing")]
    InvalidChunk,
    #[error("connection closed mid-message")]
    UnexpectedEof,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    /// Transport failure rather than peer-sent garbage; decides between
    /// ERRORED close and a synthesized 400/502.
    pub(crate) fn is_io(&self) -> bool {
        matches!(self, ParseError::Io(_))
    }
}

/// A parsed response plus what the engine needs to forward it.
#[derive(Debug)]
pub(crate) struct RespMessage {
    pub resp: HttpResp,
    /// Exact wire bytes, for the flow history.
    pub raw: Bytes,
    /// Body was delimited by connection close; the flow cannot persist.
    pub until_close: bool,
}

enum BodyKind {
    Empty,
    Length(usize),
    Chunked,
    UntilClose,
}

pub(crate) struct MessageReader<R> {
    rd: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub(crate) fn new(rd: R) -> Self {
        Self {
            rd,
            buf: BytesMut::with_capacity(READ_SIZE),
        }
    }

    async fn fill(&mut self) -> std::io::Result<usize> {
        self.buf.reserve(READ_SIZE);
        self.rd.read_buf(&mut self.buf).await
    }

    /// Buffer at least `n` bytes, then consume exactly `n`.
    async fn take_exact(&mut self, n: usize) -> Result<Bytes, ParseError> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Consume up to and including the next LF.
    async fn take_line(&mut self) -> Result<Bytes, ParseError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                return Ok(self.buf.split_to(pos + 1).freeze());
            }
            if self.buf.len() > MAX_HEAD {
                return Err(ParseError::InvalidChunk);
            }
            if self.fill().await? == 0 {
                return Err(ParseError::UnexpectedEof);
            }
        }
    }

    /// Next request on the stream. `Ok(None)` is a clean EOF at a message
    /// boundary (keep-alive ended).
    pub(crate) async fn read_request(&mut self) -> Result<Option<HttpReq>, ParseError> {
        let head = loop {
            if let Some(head) = parse_request_head(&self.buf)? {
                break head;
            }
            if self.buf.len() > MAX_HEAD {
                return Err(ParseError::HeadTooLarge);
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ParseError::UnexpectedEof)
                };
            }
        };

        let kind = request_body_kind(&head.headers)?;
        let mut raw = BytesMut::from(&self.buf.split_to(head.len)[..]);
        let body = match kind {
            BodyKind::Empty => Bytes::new(),
            BodyKind::Length(n) => {
                let data = self.take_exact(n).await?;
                raw.extend_from_slice(&data);
                data
            }
            BodyKind::Chunked => self.read_chunked(&mut raw).await?,
            BodyKind::UntilClose => unreachable!("requests are never until-close"),
        };

        Ok(Some(HttpReq {
            method: head.method,
            uri: Uri::parse(head.target),
            version: head.version,
            headers: head.headers,
            body,
            raw: raw.freeze(),
        }))
    }

    /// Next response on the stream. `head_request` suppresses the body per
    /// RFC 7230 §3.3.3.
    pub(crate) async fn read_response(
        &mut self,
        head_request: bool,
    ) -> Result<Option<RespMessage>, ParseError> {
        let head = loop {
            if let Some(head) = parse_response_head(&self.buf)? {
                break head;
            }
            if self.buf.len() > MAX_HEAD {
                return Err(ParseError::HeadTooLarge);
            }
            if self.fill().await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(ParseError::UnexpectedEof)
                };
            }
        };

        let forbids_body = head_request || matches!(head.status, 100..=199 | 204 | 304);
        let kind = if forbids_body {
            BodyKind::Empty
        } else {
            response_body_kind(&head.headers)?
        };

        let mut raw = BytesMut::from(&self.buf.split_to(head.len)[..]);
        let mut until_close = false;
        let body = match kind {
            BodyKind::Empty => Bytes::new(),
            BodyKind::Length(n) => {
                let data = self.take_exact(n).await?;
                raw.extend_from_slice(&data);
                data
            }
            BodyKind::Chunked => self.read_chunked(&mut raw).await?,
            BodyKind::UntilClose => {
                until_close = true;
                let data = self.read_to_end().await?;
                raw.extend_from_slice(&data);
                data
            }
        };

        Ok(Some(RespMessage {
            resp: HttpResp {
                version: head.version,
                status: head.status,
                reason: head.reason,
                headers: head.headers,
                body,
            },
            raw: raw.freeze(),
            until_close,
        }))
    }

    /// Decode a chunked body, appending the wire framing (sizes, data,
    /// trailers) to `raw` and returning the concatenated chunk payloads.
    async fn read_chunked(&mut self, raw: &mut BytesMut) -> Result<Bytes, ParseError> {
        let mut body = BytesMut::new();
        loop {
            let size_line = self.take_line().await?;
            raw.extend_from_slice(&size_line);
            let size = chunk_size(&size_line)?;
            if size == 0 {
                // Trailer section runs until a blank line; trailers stay in
                // the raw bytes and are forwarded after the body.
                loop {
                    let line = self.take_line().await?;
                    raw.extend_from_slice(&line);
                    if line.len() <= 2 {
                        break;
                    }
                }
                return Ok(body.freeze());
            }
            let data = self.take_exact(size).await?;
            raw.extend_from_slice(&data);
            body.extend_from_slice(&data);
            let crlf = self.take_exact(2).await?;
            if &crlf[..] != b"\r\n" {
                return Err(ParseError::InvalidChunk);
            }
            raw.extend_from_slice(&crlf);
        }
    }

    async fn read_to_end(&mut self) -> Result<Bytes, ParseError> {
        while self.fill().await? != 0 {}
        Ok(self.buf.split().freeze())
    }
}

struct RequestHead {
    len: usize,
    method: Bytes,
    target: Bytes,
    version: Version,
    headers: HeaderMap,
}

struct ResponseHead {
    len: usize,
    version: Version,
    status: u16,
    reason: Bytes,
    headers: HeaderMap,
}

fn copy_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    parsed
        .iter()
        .map(|h| {
            (
                Bytes::copy_from_slice(h.name.as_bytes()),
                Bytes::copy_from_slice(h.value),
            )
        })
        .collect()
}

fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut slots);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(RequestHead {
            len,
            method: Bytes::copy_from_slice(req.method.unwrap_or("").as_bytes()),
            target: Bytes::copy_from_slice(req.path.unwrap_or("/").as_bytes()),
            version: Version::from_minor(req.version.unwrap_or(1)),
            headers: copy_headers(req.headers),
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(ParseError::Head(err)),
    }
}

fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, ParseError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut slots);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => Ok(Some(ResponseHead {
            len,
            version: Version::from_minor(resp.version.unwrap_or(1)),
            status: resp.code.unwrap_or(200),
            reason: Bytes::copy_from_slice(resp.reason.unwrap_or("").as_bytes()),
            headers: copy_headers(resp.headers),
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(err) => Err(ParseError::Head(err)),
    }
}

/// Body length priority: chunked, then content-length, then none.
fn request_body_kind(headers: &HeaderMap) -> Result<BodyKind, ParseError> {
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(BodyKind::Chunked);
    }
    match headers.get("content-length") {
        Some(value) => Ok(BodyKind::Length(parse_content_length(&value)?)),
        None => Ok(BodyKind::Empty),
    }
}

/// As above, with the response-only fallback of reading until close.
fn response_body_kind(headers: &HeaderMap) -> Result<BodyKind, ParseError> {
    if headers.has_token("transfer-encoding", "chunked") {
        return Ok(BodyKind::Chunked);
    }
    match headers.get("content-length") {
        Some(value) => Ok(BodyKind::Length(parse_content_length(&value)?)),
        None => Ok(BodyKind::UntilClose),
    }
}

fn parse_content_length(value: &[u8]) -> Result<usize, ParseError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or(ParseError::InvalidContentLength)
}

fn chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let hex = line
        .split(|&b| b == b';')
        .next()
        .unwrap_or(b"")
        .trim_ascii();
    if hex.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    let mut size = 0usize;
    for &b in hex {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::InvalidChunk),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as usize))
            .ok_or(ParseError::InvalidChunk)?;
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn request(wire: &[u8]) -> HttpReq {
        MessageReader::new(wire).read_request().await.unwrap().unwrap()
    }

    async fn response(wire: &[u8], head_request: bool) -> RespMessage {
        MessageReader::new(wire)
            .read_response(head_request)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn request_with_content_length() {
        let wire = b"POST /submit?a=1 HTTP/1.1\r\nHost: svc\r\nContent-Length: 5\r\n\r\nhello";
        let req = request(wire).await;
        assert_eq!(&req.method[..], b"POST");
        assert_eq!(&req.uri.path[..], b"/submit");
        assert_eq!(req.uri.param("a").unwrap(), ["1"]);
        assert_eq!(&req.body[..], b"hello");
        assert_eq!(&req.raw[..], wire);
    }

    #[tokio::test]
    async fn request_without_body() {
        let req = request(b"GET / HTTP/1.1\r\nHost: svc\r\n\r\n").await;
        assert!(req.body.is_empty());
        assert_eq!(req.version, Version::V11);
    }

    #[tokio::test]
    async fn chunked_request_keeps_trailers_in_raw() {
        let wire = b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                     4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\n";
        let req = request(wire).await;
        assert_eq!(&req.body[..], b"Wikipedia");
        assert_eq!(&req.raw[..], &wire[..]);
        let raw = req.raw;
        assert!(raw.windows(10).any(|w| w == b"X-Checksum"));
    }

    #[tokio::test]
    async fn pipelined_requests_parse_in_order() {
        let wire = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        let first = reader.read_request().await.unwrap().unwrap();
        let second = reader.read_request().await.unwrap().unwrap();
        assert_eq!(&first.uri.path[..], b"/a");
        assert_eq!(&second.uri.path[..], b"/b");
        assert!(reader.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_is_none_mid_message_is_error() {
        let mut reader = MessageReader::new(&b""[..]);
        assert!(reader.read_request().await.unwrap().is_none());

        let mut reader = MessageReader::new(&b"GET / HT"[..]);
        assert!(matches!(
            reader.read_request().await.unwrap_err(),
            ParseError::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn garbage_is_a_head_error() {
        let mut reader = MessageReader::new(&b"\x00\x01\x02 nonsense\r\n\r\n"[..]);
        let err = reader.read_request().await.unwrap_err();
        assert!(matches!(err, ParseError::Head(_)));
        assert!(!err.is_io());
    }

    #[tokio::test]
    async fn response_with_content_length() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc";
        let msg = response(wire, false).await;
        assert_eq!(msg.resp.status, 200);
        assert_eq!(&msg.resp.reason[..], b"OK");
        assert_eq!(&msg.resp.body[..], b"abc");
        assert!(!msg.until_close);
        assert_eq!(&msg.raw[..], wire);
    }

    #[tokio::test]
    async fn response_until_close() {
        let wire = b"HTTP/1.0 200 OK\r\nServer: old\r\n\r\neverything until eof";
        let msg = response(wire, false).await;
        assert_eq!(&msg.resp.body[..], b"everything until eof");
        assert!(msg.until_close);
        assert_eq!(msg.resp.version, Version::V10);
    }

    #[tokio::test]
    async fn head_response_has_no_body() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let msg = response(wire, true).await;
        assert!(msg.resp.body.is_empty());
        assert_eq!(msg.resp.headers.get_str("content-length").unwrap(), "100");
    }

    #[tokio::test]
    async fn no_body_statuses_have_no_body() {
        let wire = b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n";
        let msg = response(wire, false).await;
        assert!(msg.resp.body.is_empty());
        assert!(!msg.until_close);
    }

    #[tokio::test]
    async fn chunked_response_decodes() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                     6\r\nchunk1\r\n6\r\nchunk2\r\n0\r\n\r\n";
        let msg = response(wire, false).await;
        assert_eq!(&msg.resp.body[..], b"chunk1chunk2");
        assert_eq!(&msg.raw[..], &wire[..]);
    }

    #[tokio::test]
    async fn bad_chunk_size_is_rejected() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        assert!(matches!(
            reader.read_response(false).await.unwrap_err(),
            ParseError::InvalidChunk
        ));
    }

    #[tokio::test]
    async fn bad_content_length_is_rejected() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n";
        let mut reader = MessageReader::new(&wire[..]);
        assert!(matches!(
            reader.read_response(false).await.unwrap_err(),
            ParseError::InvalidContentLength
        ));
    }
}
