//! Redis, identified by the `redis_version` field of an `INFO` reply.
//!
//! Properties: `version`, `mode`, `os`, `auth_required`. Finding:
//! `unauthenticated-info`.

use super::speaks_http;
use crate::discovery::{
    ApplicationDiscovery, ApplicationProtocol, ApplicationVerdict, Exposure, Finding,
    PresentationVerdict, Verdict,
};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::session::{self, SessionHandle};
use async_trait::async_trait;
use std::collections::HashMap;

const INFO_COMMAND: &[u8] = b"*1\r\n$4\r\nINFO\r\n";

/// Cap on the INFO reply; real replies are a few KiB
const INFO_READ_LIMIT: usize = 16 * 1024;

/// A decoded reply to `INFO`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoReply {
    Info(HashMap<String, String>),
    /// `-NOAUTH` or another error that means credentials are needed
    AuthRequired,
    Error(String),
}

/// Parse colon-delimited `key:value` lines, skipping `#` section headers
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Decode a RESP reply to `INFO`: a bulk string (`$len`), a simple string
/// (`+`), or an error (`-`)
pub fn parse_reply(data: &[u8]) -> DiscoveryResult<InfoReply> {
    let line_end = data
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| DiscoveryError::mismatch("no RESP line"))?;
    let first = String::from_utf8_lossy(&data[..line_end]);
    let rest = &data[line_end + 2..];

    match first.chars().next() {
        Some('$') => {
            let len: usize = first[1..]
                .parse()
                .map_err(|_| DiscoveryError::mismatch("bad bulk length"))?;
            let body = &rest[..len.min(rest.len())];
            Ok(InfoReply::Info(parse_info(&String::from_utf8_lossy(body))))
        }
        Some('+') => {
            let mut text = first[1..].to_string();
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(rest));
            Ok(InfoReply::Info(parse_info(&text)))
        }
        Some('-') => {
            let message = first[1..].to_string();
            if message.starts_with("NOAUTH") || message.contains("Authentication required") {
                Ok(InfoReply::AuthRequired)
            } else {
                Ok(InfoReply::Error(message))
            }
        }
        _ => Err(DiscoveryError::mismatch("not a RESP reply")),
    }
}

/// Whether the buffered reply is complete
fn reply_complete(data: &[u8]) -> bool {
    let Some(line_end) = data.windows(2).position(|w| w == b"\r\n") else {
        return false;
    };
    if data[0] != b'$' {
        return true;
    }
    std::str::from_utf8(&data[1..line_end])
        .ok()
        .and_then(|len| len.parse::<usize>().ok())
        .map(|len| data.len() >= line_end + 2 + len)
        .unwrap_or(true)
}

#[derive(Debug, Clone, Default)]
pub struct RedisDiscovery;

impl RedisDiscovery {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ApplicationDiscovery for RedisDiscovery {
    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Redis
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict> {
        if speaks_http(presentation) {
            return Ok(Verdict::not_detected(ApplicationProtocol::Redis));
        }

        let mut conn = session::open(handle).await?;
        conn.write_all(INFO_COMMAND).await?;
        let data = conn.read_bounded(INFO_READ_LIMIT, &reply_complete).await?;

        match parse_reply(&data)? {
            InfoReply::Info(info) => {
                let Some(version) = info.get("redis_version") else {
                    return Ok(Verdict::not_detected(ApplicationProtocol::Redis));
                };
                let mut verdict = Verdict::detected(ApplicationProtocol::Redis)
                    .with("version", version.as_str())
                    .with("auth_required", false);
                if let Some(mode) = info.get("redis_mode") {
                    verdict.set("mode", mode.as_str());
                }
                if let Some(os) = info.get("os") {
                    verdict.set("os", os.as_str());
                }
                let exposure = Exposure::Vulnerable {
                    evidence: "INFO answered without authentication".to_string(),
                };
                Ok(verdict.with_finding(Finding::new("unauthenticated-info", exposure)))
            }
            InfoReply::AuthRequired => {
                Ok(Verdict::not_detected(ApplicationProtocol::Redis).with("auth_required", true))
            }
            InfoReply::Error(message) => {
                log::debug!("{}:{} INFO refused: {}", conn.host(), conn.port(), message);
                Ok(Verdict::not_detected(ApplicationProtocol::Redis))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bulk_reply() {
        let body =
            "# Server\r\nredis_version:7.0.5\r\nredis_mode:standalone\r\nos:Linux 6.1 x86_64\r\n";
        let raw = format!("${}\r\n{}\r\n", body.len(), body);
        assert!(reply_complete(raw.as_bytes()));
        let InfoReply::Info(info) = parse_reply(raw.as_bytes()).unwrap() else {
            panic!("expected INFO");
        };
        assert_eq!(info["redis_version"], "7.0.5");
        assert_eq!(info["redis_mode"], "standalone");
        assert_eq!(info["os"], "Linux 6.1 x86_64");
        assert!(!info.contains_key("# Server"));
    }

    #[test]
    fn test_partial_bulk_reply_not_complete() {
        assert!(!reply_complete(b"$100\r\nredis_version:7"));
        assert!(!reply_complete(b"$10"));
        assert!(reply_complete(b"-ERR\r\n"));
    }

    #[test]
    fn test_simple_and_error_replies() {
        let InfoReply::Info(info) = parse_reply(b"+redis_version:6.2.1\r\n").unwrap() else {
            panic!("expected INFO");
        };
        assert_eq!(info["redis_version"], "6.2.1");
        assert_eq!(
            parse_reply(b"-NOAUTH Authentication required.\r\n").unwrap(),
            InfoReply::AuthRequired
        );
        assert_eq!(
            parse_reply(b"-ERR unknown command\r\n").unwrap(),
            InfoReply::Error("ERR unknown command".into())
        );
        assert!(parse_reply(b"HTTP/1.1 400 Bad Request\r\n").is_err());
    }

    proptest! {
        #[test]
        fn prop_info_lines_roundtrip(
            entries in proptest::collection::hash_map("[a-z_]{1,12}", "[a-zA-Z0-9.]{0,12}", 0..16)
        ) {
            let text: String = entries.iter().map(|(k, v)| format!("{}:{}\r\n", k, v)).collect();
            prop_assert_eq!(parse_info(&text), entries);
        }

        #[test]
        fn prop_reply_parser_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = parse_reply(&data);
            let _ = reply_complete(&data);
        }
    }
}
