//! Response re-serialization and engine-synthesized responses.

use bytes::{BufMut, Bytes, BytesMut};
use proxad_core::http::{HeaderMap, HttpResp};

/// Reconstruct the wire form of `resp`: start line, header block in stored
/// order and casing, CRLF, body.
///
/// For body-bearing responses the framing is normalized: the body has been
/// decoded, so `Transfer-Encoding` is dropped and `Content-Length` is
/// recomputed from the final body (in place, keeping the original header's
/// casing and position). HEAD responses and no-body statuses keep their
/// headers untouched and emit no body.
pub(crate) fn serialize_response(resp: &HttpResp, head_request: bool) -> Bytes {
    let body_allowed = !head_request && !resp.forbids_body();

    let mut reframed;
    let headers: &HeaderMap = if body_allowed {
        reframed = resp.headers.clone();
        reframed.remove("transfer-encoding");
        reframed.set("content-length", resp.body.len().to_string());
        &reframed
    } else {
        &resp.headers
    };

    let mut out = BytesMut::with_capacity(64 + resp.headers.len() * 32 + resp.body.len());
    out.put_slice(resp.version.as_str().as_bytes());
    out.put_slice(b" ");
    out.put_slice(resp.status.to_string().as_bytes());
    out.put_slice(b" ");
    out.put_slice(&resp.reason);
    out.put_slice(b"\r\n");
    headers.write_to(&mut out);
    out.put_slice(b"\r\n");
    if body_allowed {
        out.put_slice(&resp.body);
    }
    out.freeze()
}

/// Engine-generated error response (400 on a bad request, 502 on a bad or
/// unreachable upstream). Never passes through filters.
pub(crate) fn synthesize(status: u16, body: &'static str) -> HttpResp {
    let mut headers = HeaderMap::new();
    headers.append("Content-Type", "text/plain; charset=utf-8");
    headers.append("Connection", "close");
    HttpResp::new(status, headers, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::parse::MessageReader;

    #[tokio::test]
    async fn untouched_response_round_trips_byte_identically() {
        let wire = b"HTTP/1.1 200 OK\r\nServer: CTF-svc/1.0\r\nContent-Length: 5\r\nX-MiXeD-CaSe: yes\r\n\r\nhello";
        let msg = MessageReader::new(&wire[..])
            .read_response(false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&serialize_response(&msg.resp, false)[..], &wire[..]);
    }

    #[tokio::test]
    async fn changed_body_recomputes_content_length_in_place() {
        let wire = b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\nServer: x\r\n\r\nflag";
        let mut msg = MessageReader::new(&wire[..])
            .read_response(false)
            .await
            .unwrap()
            .unwrap();
        msg.resp.set_body("GRAZIEDARIO");

        let out = serialize_response(&msg.resp, false);
        let text = std::str::from_utf8(&out).unwrap();
        // Original casing and position survive the recompute.
        assert!(text.contains("content-length: 11\r\nServer: x"));
        assert!(text.ends_with("GRAZIEDARIO"));
    }

    #[tokio::test]
    async fn chunked_framing_is_replaced_by_content_length() {
        let wire =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nchunk1\r\n0\r\n\r\n";
        let msg = MessageReader::new(&wire[..])
            .read_response(false)
            .await
            .unwrap()
            .unwrap();

        let out = serialize_response(&msg.resp, false);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(!text.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(text.contains("content-length: 6"));
        assert!(text.ends_with("\r\n\r\nchunk1"));
    }

    #[tokio::test]
    async fn head_and_no_body_responses_keep_their_framing() {
        let wire = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let msg = MessageReader::new(&wire[..])
            .read_response(true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&serialize_response(&msg.resp, true)[..], &wire[..]);

        let wire = b"HTTP/1.1 304 Not Modified\r\nETag: \"v2\"\r\n\r\n";
        let msg = MessageReader::new(&wire[..])
            .read_response(false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&serialize_response(&msg.resp, false)[..], &wire[..]);
    }

    #[test]
    fn synthesized_responses_close_the_connection() {
        let resp = synthesize(502, "upstream unreachable");
        assert_eq!(resp.status, 502);
        assert_eq!(&resp.reason[..], b"Bad Gateway");
        assert!(resp.headers.has_token("connection", "close"));

        let out = serialize_response(&resp, false);
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("content-length: 20"));
    }
}
