//! PostgreSQL over its native frontend/backend protocol.
//!
//! The plugin sends a startup message, answers trust, cleartext or MD5
//! authentication with the configured credentials, and runs
//! `SELECT version()`. It is detected only once a version string is obtained.
//! SCRAM and other methods are recorded but not attempted.
//!
//! Properties: `version`, `version_string`, `auth_method`, `auth_required`,
//! `error_code`. Findings: `passwordless-login`, `default-credentials`.

use super::speaks_http;
use crate::discovery::{
    ApplicationDiscovery, ApplicationProtocol, ApplicationVerdict, Exposure, Finding,
    PresentationVerdict, Verdict,
};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::session::{self, SessionHandle};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use openssl::hash::{hash, MessageDigest};
use serde::{Deserialize, Serialize};

/// Protocol version 3.0
const PROTOCOL_VERSION: i32 = 196_608;

/// Backend messages larger than this are not PostgreSQL replies we expect
const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Bound on messages read before giving up on a conversation
const MAX_MESSAGES: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresCredentials {
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

impl Default for PostgresCredentials {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: None,
            database: None,
        }
    }
}

/// One backend message: type byte and payload
#[derive(Debug, Clone, PartialEq, Eq)]
struct Message {
    tag: u8,
    body: BytesMut,
}

fn startup_message(credentials: &PostgresCredentials) -> BytesMut {
    let database = credentials.database.as_deref().unwrap_or(&credentials.user);
    let mut params = BytesMut::new();
    params.put_i32(PROTOCOL_VERSION);
    for (key, value) in [
        ("user", credentials.user.as_str()),
        ("database", database),
        ("application_name", "strata"),
    ] {
        put_cstr(&mut params, key);
        put_cstr(&mut params, value);
    }
    params.put_u8(0);

    let mut message = BytesMut::with_capacity(params.len() + 4);
    message.put_i32((params.len() + 4) as i32);
    message.extend_from_slice(&params);
    message
}

fn frontend_message(tag: u8, body: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(body.len() + 5);
    message.put_u8(tag);
    message.put_i32((body.len() + 4) as i32);
    message.extend_from_slice(body);
    message
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

fn take_cstr(buf: &mut BytesMut) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Some(s)
}

fn md5_hex(data: &[u8]) -> DiscoveryResult<String> {
    let digest = hash(MessageDigest::md5(), data)?;
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// `md5` + md5(md5(password + user) + salt), as hex
pub fn md5_password(user: &str, password: &str, salt: &[u8]) -> DiscoveryResult<String> {
    let inner = md5_hex(format!("{}{}", password, user).as_bytes())?;
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    Ok(format!("md5{}", md5_hex(&outer)?))
}

/// Fields of an ErrorResponse
fn error_fields(mut body: BytesMut) -> (Option<String>, Option<String>) {
    let (mut code, mut message) = (None, None);
    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let Some(value) = take_cstr(&mut body) else {
            break;
        };
        match field {
            b'C' => code = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }
    (code, message)
}

/// First column of a DataRow
fn first_column(mut body: BytesMut) -> Option<String> {
    if body.remaining() < 2 || body.get_i16() < 1 || body.remaining() < 4 {
        return None;
    }
    let len = body.get_i32();
    if len < 0 || len as usize > body.remaining() {
        return None;
    }
    Some(String::from_utf8_lossy(&body[..len as usize]).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMethod {
    Trust,
    Cleartext,
    Md5,
    Sasl,
    Other(i32),
}

impl AuthMethod {
    fn from_code(code: i32) -> Self {
        match code {
            0 => AuthMethod::Trust,
            3 => AuthMethod::Cleartext,
            5 => AuthMethod::Md5,
            10 => AuthMethod::Sasl,
            other => AuthMethod::Other(other),
        }
    }

    fn name(&self) -> String {
        match self {
            AuthMethod::Trust => "trust".to_string(),
            AuthMethod::Cleartext => "password".to_string(),
            AuthMethod::Md5 => "md5".to_string(),
            AuthMethod::Sasl => "scram-sha-256".to_string(),
            AuthMethod::Other(code) => format!("unsupported({})", code),
        }
    }
}

/// What a conversation with the server established
#[derive(Debug, Default)]
struct Conversation {
    auth: Option<AuthMethod>,
    authenticated: bool,
    server_version: Option<String>,
    version_string: Option<String>,
    error_code: Option<String>,
}

async fn read_message(conn: &mut dyn SessionHandle) -> DiscoveryResult<Message> {
    let mut header = [0u8; 5];
    conn.read_exact(&mut header).await?;
    let tag = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if !tag.is_ascii_uppercase() || len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(DiscoveryError::mismatch("not a PostgreSQL backend message"));
    }
    let mut body = BytesMut::zeroed(len as usize - 4);
    conn.read_exact(&mut body).await?;
    Ok(Message { tag, body })
}

#[derive(Debug, Clone, Default)]
pub struct PostgresDiscovery {
    credentials: PostgresCredentials,
}

impl PostgresDiscovery {
    pub fn new(credentials: PostgresCredentials) -> Self {
        Self { credentials }
    }

    async fn converse(&self, conn: &mut dyn SessionHandle) -> DiscoveryResult<Conversation> {
        let mut state = Conversation::default();
        conn.write_all(&startup_message(&self.credentials)).await?;

        let first = read_message(conn).await?;
        if first.tag != b'R' && first.tag != b'E' {
            return Err(DiscoveryError::mismatch("unexpected first backend message"));
        }

        let mut pending = Some(first);
        let mut queried = false;
        for _ in 0..MAX_MESSAGES {
            let mut message = match pending.take() {
                Some(message) => message,
                None => read_message(conn).await?,
            };

            match message.tag {
                b'R' => {
                    if message.body.remaining() < 4 {
                        return Err(DiscoveryError::mismatch("short authentication request"));
                    }
                    let code = message.body.get_i32();
                    if code == 0 {
                        state.authenticated = true;
                        state.auth.get_or_insert(AuthMethod::Trust);
                        continue;
                    }
                    let method = AuthMethod::from_code(code);
                    state.auth = Some(method);
                    let Some(password) = self.credentials.password.as_deref() else {
                        break;
                    };
                    let reply = match method {
                        AuthMethod::Cleartext => password.to_string(),
                        AuthMethod::Md5 if message.body.remaining() >= 4 => {
                            md5_password(&self.credentials.user, password, &message.body[..4])?
                        }
                        _ => break,
                    };
                    let mut body = BytesMut::new();
                    put_cstr(&mut body, &reply);
                    conn.write_all(&frontend_message(b'p', &body)).await?;
                }
                b'S' => {
                    let name = take_cstr(&mut message.body);
                    let value = take_cstr(&mut message.body);
                    if let (Some("server_version"), Some(value)) = (name.as_deref(), value) {
                        state.server_version = Some(value);
                    }
                }
                b'Z' if !queried && state.authenticated => {
                    queried = true;
                    let mut body = BytesMut::new();
                    put_cstr(&mut body, "SELECT version()");
                    conn.write_all(&frontend_message(b'Q', &body)).await?;
                }
                b'Z' => break,
                b'D' => {
                    if let Some(version) = first_column(message.body) {
                        state.version_string = Some(version);
                    }
                }
                b'E' => {
                    let (code, text) = error_fields(message.body);
                    log::debug!("PostgreSQL error {:?}: {:?}", code, text);
                    state.error_code = code;
                    if !queried {
                        break;
                    }
                }
                // BackendKeyData, NoticeResponse, RowDescription, CommandComplete
                _ => {}
            }
        }

        let _ = conn.write_all(&frontend_message(b'X', &[])).await;
        Ok(state)
    }
}

#[async_trait]
impl ApplicationDiscovery for PostgresDiscovery {
    fn protocol(&self) -> ApplicationProtocol {
        ApplicationProtocol::Postgres
    }

    async fn discover(
        &self,
        handle: &mut dyn SessionHandle,
        presentation: Option<&PresentationVerdict>,
    ) -> DiscoveryResult<ApplicationVerdict> {
        if speaks_http(presentation) {
            return Ok(Verdict::not_detected(ApplicationProtocol::Postgres));
        }

        let mut conn = session::open(handle).await?;
        let state = self.converse(&mut *conn).await?;

        let identified = state
            .version_string
            .as_deref()
            .map(|v| v.contains("PostgreSQL"))
            .unwrap_or(false)
            || state.server_version.is_some();

        let mut verdict = if identified {
            Verdict::detected(ApplicationProtocol::Postgres)
        } else {
            Verdict::not_detected(ApplicationProtocol::Postgres)
        };
        if let Some(method) = state.auth {
            verdict.set("auth_method", method.name());
            verdict.set("auth_required", method != AuthMethod::Trust);
        }
        if let Some(code) = state.error_code {
            verdict.set("error_code", code);
        }
        if let Some(version) = state.server_version {
            verdict.set("version", version);
        }
        if let Some(version_string) = state.version_string {
            verdict.set("version_string", version_string);
        }

        if identified && state.authenticated {
            let finding = match state.auth {
                Some(AuthMethod::Trust) => Finding::new(
                    "passwordless-login",
                    Exposure::Vulnerable {
                        evidence: format!(
                            "logged in as {} without a password",
                            self.credentials.user
                        ),
                    },
                ),
                _ => Finding::new(
                    "default-credentials",
                    Exposure::Vulnerable {
                        evidence: format!(
                            "logged in as {} with configured credentials",
                            self.credentials.user
                        ),
                    },
                ),
            };
            verdict = verdict.with_finding(finding);
        }
        Ok(verdict)
    }
}
