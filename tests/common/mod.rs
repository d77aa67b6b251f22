//! Loopback stub servers shared by the integration tests

#![allow(dead_code)]

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use std::pin::Pin;
use strata::discovery::application::postgres::md5_password;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_openssl::SslStream;

pub const TIMEOUT: Duration = Duration::from_secs(2);

pub const HTTP_OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Read one request, answer it, close. Every accepted connection is served.
async fn serve(listener: TcpListener, responder: Responder) {
    while let Ok((socket, _)) = listener.accept().await {
        let responder = responder.clone();
        tokio::spawn(answer_once(socket, responder));
    }
}

async fn answer_once(mut socket: TcpStream, responder: Responder) {
    let mut buf = vec![0u8; 4096];
    let mut request = match socket.read(&mut buf).await {
        Ok(0) | Err(_) => return,
        Ok(n) => buf[..n].to_vec(),
    };
    // An HTTP request body may arrive after its headers
    while let Some(missing) = unread_body(&request) {
        if missing == 0 {
            break;
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    let _ = socket.write_all(&responder(&request)).await;
    let _ = socket.shutdown().await;
}

/// Bytes of a declared HTTP request body not yet received
fn unread_body(request: &[u8]) -> Option<usize> {
    let head_end = request.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&request[..head_end]).to_ascii_lowercase();
    let length: usize = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))?
        .trim()
        .parse()
        .ok()?;
    Some(length.saturating_sub(request.len() - head_end - 4))
}

pub async fn bind_any() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Answers any bytes with a fixed response
pub async fn fixed_stub(reply: &'static [u8]) -> u16 {
    let (listener, port) = bind_any().await;
    tokio::spawn(serve(listener, Arc::new(move |_| reply.to_vec())));
    port
}

/// Minimal HTTP server on `listener`
pub fn spawn_http(listener: TcpListener) {
    tokio::spawn(serve(listener, Arc::new(|_| HTTP_OK.to_vec())));
}

pub async fn http_stub() -> u16 {
    let (listener, port) = bind_any().await;
    spawn_http(listener);
    port
}

/// Answers only `INFO` with a bulk reply; anything else gets `-ERR`
pub async fn redis_stub(version: &'static str) -> u16 {
    let (listener, port) = bind_any().await;
    tokio::spawn(serve(
        listener,
        Arc::new(move |request: &[u8]| {
            let info = request.windows(4).any(|w| w.eq_ignore_ascii_case(b"INFO"));
            if info && !request.starts_with(b"GET ") {
                let body = format!(
                    "# Server\r\nredis_version:{}\r\nredis_mode:standalone\r\nos:Linux\r\n",
                    version
                );
                format!("${}\r\n{}\r\n", body.len(), body).into_bytes()
            } else {
                b"-ERR unknown command\r\n".to_vec()
            }
        }),
    ));
    port
}

fn request_path(request: &[u8]) -> String {
    let text = String::from_utf8_lossy(request);
    text.split_whitespace().nth(1).unwrap_or("").to_string()
}

fn http_reply(status: &str, headers: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        headers,
        body.len(),
        body
    )
    .into_bytes()
}

fn http_json(status: &str, body: &str) -> Vec<u8> {
    http_reply(
        status,
        "Server: Kubernetes\r\nContent-Type: application/json\r\n",
        body,
    )
}

fn not_found() -> Vec<u8> {
    http_reply("404 Not Found", "", "404 page not found")
}

/// etcd look-alike: `/version` plus an open v3 JSON gateway
pub async fn etcd_stub() -> u16 {
    let (listener, port) = bind_any().await;
    tokio::spawn(serve(
        listener,
        Arc::new(|request: &[u8]| match request_path(request).as_str() {
            "/version" => http_reply(
                "200 OK",
                "Content-Type: application/json\r\n",
                r#"{"etcdserver":"3.5.9","etcdcluster":"3.5.0"}"#,
            ),
            "/v3/kv/range" => http_reply(
                "200 OK",
                "Content-Type: application/json\r\n",
                r#"{"header":{"revision":"7"},"kvs":[{"key":"L2E="},{"key":"L2I="}],"count":"2"}"#,
            ),
            _ => not_found(),
        }),
    ));
    port
}

/// Node-agent look-alike answering `/healthz` and an anonymous `/pods`.
/// With `audited` every reply carries the `Audit-Id` header the API server
/// adds.
pub async fn kubelet_stub(audited: bool) -> u16 {
    let (listener, port) = bind_any().await;
    let audit = if audited { "Audit-Id: 2d1f0c9e\r\n" } else { "" };
    tokio::spawn(serve(
        listener,
        Arc::new(move |request: &[u8]| match request_path(request).as_str() {
            "/healthz" => http_reply("200 OK", audit, "ok"),
            "/pods" => http_reply(
                "200 OK",
                "Content-Type: application/json\r\n",
                r#"{"kind":"PodList","items":[{"metadata":{"name":"a"}},{"metadata":{"name":"b"}}]}"#,
            ),
            _ => not_found(),
        }),
    ));
    port
}

/// Authentication a PostgreSQL stub demands
#[derive(Debug, Clone, Copy)]
pub enum PgAuth {
    Trust,
    Md5 { password: &'static str },
}

pub const PG_SALT: [u8; 4] = [0x1a, 0x2b, 0x3c, 0x4d];

fn backend(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut message = vec![tag];
    message.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    message.extend_from_slice(body);
    message
}

async fn read_frontend(socket: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 5];
    socket.read_exact(&mut header).await.ok()?;
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if !(4..=8192).contains(&len) {
        return None;
    }
    let mut body = vec![0u8; len as usize - 4];
    socket.read_exact(&mut body).await.ok()?;
    Some((header[0], body))
}

async fn pg_session(mut socket: TcpStream, auth: PgAuth) -> Option<()> {
    let mut len = [0u8; 4];
    socket.read_exact(&mut len).await.ok()?;
    let len = i32::from_be_bytes(len);
    // Startup packets are small; anything else is another protocol
    if !(8..=8192).contains(&len) {
        return None;
    }
    let mut startup = vec![0u8; len as usize - 4];
    socket.read_exact(&mut startup).await.ok()?;
    if startup[..4] != 196_608i32.to_be_bytes() {
        return None;
    }

    if let PgAuth::Md5 { password } = auth {
        let mut request = 5i32.to_be_bytes().to_vec();
        request.extend_from_slice(&PG_SALT);
        socket.write_all(&backend(b'R', &request)).await.ok()?;

        let (tag, body) = read_frontend(&mut socket).await?;
        let expected = md5_password("postgres", password, &PG_SALT).ok()?;
        let mut wanted = expected.into_bytes();
        wanted.push(0);
        if tag != b'p' || body != wanted {
            let error = b"SFATAL\0C28P01\0Mpassword authentication failed\0\0";
            socket.write_all(&backend(b'E', error)).await.ok()?;
            return None;
        }
    }

    let mut ready = backend(b'R', &0i32.to_be_bytes());
    ready.extend(backend(b'S', b"server_version\016.1\0"));
    ready.extend(backend(b'K', &[0, 0, 0, 7, 0, 0, 0, 9]));
    ready.extend(backend(b'Z', b"I"));
    socket.write_all(&ready).await.ok()?;

    let (tag, _) = read_frontend(&mut socket).await?;
    if tag != b'Q' {
        return None;
    }
    let version = b"PostgreSQL 16.1 on x86_64-pc-linux-gnu";
    let mut row = 1i16.to_be_bytes().to_vec();
    row.extend_from_slice(&(version.len() as i32).to_be_bytes());
    row.extend_from_slice(version);
    let mut reply = backend(b'D', &row);
    reply.extend(backend(b'C', b"SELECT 1\0"));
    reply.extend(backend(b'Z', b"I"));
    socket.write_all(&reply).await.ok()?;

    let _ = read_frontend(&mut socket).await;
    Some(())
}

/// PostgreSQL backend that answers one `SELECT version()` per connection
pub async fn postgres_stub(auth: PgAuth) -> u16 {
    let (listener, port) = bind_any().await;
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(pg_session(socket, auth));
        }
    });
    port
}

/// Control-plane look-alike that allows anonymous reads
pub async fn kube_stub() -> u16 {
    let (listener, port) = bind_any().await;
    tokio::spawn(serve(
        listener,
        Arc::new(|request: &[u8]| match request_path(request).as_str() {
            "/version" => http_json(
                "200 OK",
                r#"{"gitVersion":"v1.28.3","platform":"linux/amd64","goVersion":"go1.20.10"}"#,
            ),
            "/api/v1/namespaces" => http_json(
                "200 OK",
                r#"{"kind":"NamespaceList","items":[{"metadata":{"name":"default"}}]}"#,
            ),
            _ => http_json("404 Not Found", r#"{"kind":"Status","code":404}"#),
        }),
    ));
    port
}

pub fn self_signed() -> (PKey<Private>, X509) {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "stub.strata.test").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(42).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(30).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

/// TLS server with a self-signed certificate that answers one HTTP request
/// per connection
pub async fn tls_http_stub() -> u16 {
    let (key, cert) = self_signed();
    let mut acceptor = SslAcceptor::mozilla_intermediate(SslMethod::tls()).unwrap();
    acceptor.set_private_key(&key).unwrap();
    acceptor.set_certificate(&cert).unwrap();
    let acceptor = acceptor.build();

    let (listener, port) = bind_any().await;
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let Ok(ssl) = Ssl::new(acceptor.context()) else {
                continue;
            };
            let Ok(mut stream) = SslStream::new(ssl, socket) else {
                continue;
            };
            tokio::spawn(async move {
                if Pin::new(&mut stream).accept().await.is_err() {
                    return;
                }
                let mut buf = [0u8; 2048];
                if let Ok(n) = stream.read(&mut buf).await {
                    if n > 0 {
                        let _ = stream.write_all(HTTP_OK).await;
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}

/// UDP socket that echoes every datagram back
pub async fn udp_echo() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    port
}

/// Bound UDP socket that never answers; kept alive by the returned value
pub async fn udp_silent() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

/// A TCP port with nothing listening on it
pub async fn closed_port() -> u16 {
    let (listener, port) = bind_any().await;
    drop(listener);
    port
}
