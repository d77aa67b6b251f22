//! HTTP framing: the presentation plugin and a small request/response
//! exchange used by the HTTP-speaking application plugins.
//!
//! Responses are read into a bounded buffer and never trusted: a status line
//! must match the grammar before anything else is parsed, and header or body
//! bytes past the read limit are dropped.

use super::{PresentationDiscovery, PresentationProtocol, PresentationVerdict, Verdict};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::session::{self, SessionHandle};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::borrow::Cow;

/// Read limit for the presentation probe
pub const STATUS_READ_LIMIT: usize = 1024;

/// Read limit for a full exchange
pub const RESPONSE_READ_LIMIT: usize = 64 * 1024;

static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^HTTP/(\d+\.\d+) (\d{3})(?: [^\r\n]*)?\r\n").expect("valid status line pattern")
});

/// Version token and status code from the start of a response
pub fn parse_status_line(data: &[u8]) -> Option<(String, u16)> {
    let caps = STATUS_LINE.captures(data)?;
    let version = std::str::from_utf8(caps.get(1)?.as_bytes()).ok()?.to_string();
    let status = std::str::from_utf8(caps.get(2)?.as_bytes()).ok()?.parse().ok()?;
    Some((version, status))
}

fn header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// A parsed HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: String,
    pub status: u16,
    /// Header names are lowercased
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn parse(data: &[u8]) -> DiscoveryResult<Self> {
        let (version, status) = parse_status_line(data)
            .ok_or_else(|| DiscoveryError::mismatch("no HTTP status line"))?;

        let (head, body) = match header_end(data) {
            Some(end) => (&data[..end], &data[end + 4..]),
            None => (data, &[][..]),
        };

        let headers: Vec<(String, String)> = String::from_utf8_lossy(head)
            .split("\r\n")
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
            .collect();

        let mut response = Self {
            version,
            status,
            headers,
            body: Vec::new(),
        };
        response.body = if response.is_chunked() {
            decode_chunked(body)
        } else {
            match response.content_length() {
                Some(len) => body[..len.min(body.len())].to_vec(),
                None => body.to_vec(),
            }
        };
        Ok(response)
    }

    /// First header with this name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.parse().ok()
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Whether a buffered response is complete per its framing headers
fn response_complete(data: &[u8]) -> bool {
    let Some(end) = header_end(data) else {
        return false;
    };
    let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
    let body = &data[end + 4..];

    if head.contains("transfer-encoding: chunked") {
        return body.ends_with(b"0\r\n\r\n");
    }
    head.split("\r\n")
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|len| len.trim().parse::<usize>().ok())
        .map(|len| body.len() >= len)
        .unwrap_or(false)
}

/// Decode a chunked body, stopping at the last chunk or at malformed framing
fn decode_chunked(mut data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(line_end) = data.windows(2).position(|w| w == b"\r\n") {
        let size_line = String::from_utf8_lossy(&data[..line_end]);
        let size_token = size_line.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_token, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let Some(end) = start.checked_add(size) else {
            break;
        };
        let end = end.min(data.len());
        body.extend_from_slice(&data[start..end]);
        if end + 2 > data.len() {
            break;
        }
        data = &data[end + 2..];
    }
    body
}

fn request(method: &str, path: &str, host: &str) -> String {
    format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: strata\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        method, path, host
    )
}

/// Send one GET request on a fresh connection and parse the response
pub async fn get(handle: &mut dyn SessionHandle, path: &str) -> DiscoveryResult<HttpResponse> {
    let host = handle.host().to_string();
    let mut conn = session::open(handle).await?;
    conn.write_all(request("GET", path, &host).as_bytes()).await?;
    let data = conn.read_bounded(RESPONSE_READ_LIMIT, &response_complete).await?;
    HttpResponse::parse(&data)
}

/// Detects HTTP by its status line.
///
/// Properties: `version` ("1.1"), `status`, and `server` when the header is
/// present.
#[derive(Debug, Clone, Default)]
pub struct HttpDiscovery;

impl HttpDiscovery {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PresentationDiscovery for HttpDiscovery {
    fn protocol(&self) -> PresentationProtocol {
        PresentationProtocol::Http
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
    ) -> DiscoveryResult<PresentationVerdict> {
        let host = handle.host().to_string();
        let mut conn = session::open(handle).await?;
        conn.write_all(request("GET", "/", &host).as_bytes()).await?;
        let data = conn
            .read_bounded(STATUS_READ_LIMIT, &|buf: &[u8]| header_end(buf).is_some())
            .await?;

        let Ok(response) = HttpResponse::parse(&data) else {
            log::debug!("{}:{} sent no HTTP status line", host, conn.port());
            return Ok(Verdict::not_detected(PresentationProtocol::Http));
        };

        let mut verdict = Verdict::detected(PresentationProtocol::Http)
            .with("version", response.version.as_str())
            .with("status", response.status);
        if let Some(server) = response.header("server") {
            verdict.set("server", server);
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_line_grammar() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n\r\n"), Some(("1.1".into(), 200)));
        assert_eq!(parse_status_line(b"HTTP/1.0 404\r\n"), Some(("1.0".into(), 404)));
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH_9.3\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 20 OK\r\n"), None);
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK"), None);
        assert_eq!(parse_status_line(b"xHTTP/1.1 200 OK\r\n"), None);
    }

    #[test]
    fn test_parse_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Length: 5\r\n\r\nhello trailing";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("SERVER"), Some("nginx"));
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn test_parse_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        assert!(response_complete(raw));
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.body_text(), "Wikipedia");
    }

    #[test]
    fn test_malformed_chunk_sizes_stop_decoding() {
        assert_eq!(decode_chunked(b"zz\r\nabc\r\n"), Vec::<u8>::new());
        assert_eq!(decode_chunked(b"ffff\r\nabc"), b"abc".to_vec());
    }

    #[test]
    fn test_huge_chunk_size_is_clamped() {
        assert_eq!(decode_chunked(b"ffffffffffffffff\r\nabc"), b"abc".to_vec());
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "abc");
    }

    #[test]
    fn test_response_completion() {
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\n"));
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab"));
        assert!(response_complete(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nab"));
        assert!(!response_complete(b"HTTP/1.1 200 OK\r\n\r\nuntil close"));
    }

    #[test]
    fn test_non_http_rejected() {
        let err = HttpResponse::parse(b"+PONG\r\n").unwrap_err();
        assert!(matches!(err, DiscoveryError::ProtocolMismatch(_)));
    }
}
