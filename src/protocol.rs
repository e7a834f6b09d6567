use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// upper bound on the http head of a handshake, request or response
const MAX_HANDSHAKE_SIZE: usize = 8192;

const MAX_HEADERS: usize = 64;

/// scheme of the connect target
#[derive(Debug, PartialEq, Eq)]
pub enum Mode {
    /// plaintext websocket
    Ws,
    /// websocket over tls
    Wss,
}

impl Mode {
    /// default tcp port of the scheme
    pub fn default_port(&self) -> u16 {
        match self {
            Mode::Ws => 80,
            Mode::Wss => 443,
        }
    }
}

/// close codes an endpoint may put on the wire
///
/// 1000..=1003 and 1007..=1011 are the defined protocol codes, 3000..=4999
/// belong to applications. 1005/1006/1015 are local-only signals and the
/// rest of the space is a protocol error in either direction.
pub fn close_code_permitted(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

pub(crate) fn gen_key() -> String {
    let nonce: [u8; 16] = rand::random();
    B64.encode(nonce)
}

pub(crate) fn cal_accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    B64.encode(sha1.finalize())
}

/// position one past the CRLFCRLF terminating the head, if present
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// accumulate bytes until the blank line, enforcing the size cap
async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<usize>, WsError> {
    loop {
        if let Some(end) = head_end(buf) {
            if end > MAX_HANDSHAKE_SIZE {
                return Ok(None);
            }
            return Ok(Some(end));
        }
        if buf.len() >= MAX_HANDSHAKE_SIZE {
            return Ok(None);
        }
        if stream.read_buf(buf).await? == 0 {
            return Err(WsError::HandshakeFailed(
                "connection closed before handshake completed".into(),
            ));
        }
    }
}

fn header_value<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

/// `Connection` may carry several comma separated tokens
fn connection_contains_upgrade(value: &[u8]) -> bool {
    std::str::from_utf8(value)
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false)
}

fn is_websocket_upgrade(value: &[u8]) -> bool {
    std::str::from_utf8(value)
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// outcome of a server side handshake
#[derive(Debug)]
pub(crate) struct ServerHandshake {
    /// request path, informational
    pub path: String,
    /// subprotocol chosen from the caller's candidates
    pub subprotocol: Option<String>,
    /// bytes read past the request head, already frame data
    pub remain: BytesMut,
}

async fn reject<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status_line: &str,
    extra_header: Option<&str>,
    body: &str,
) -> Result<(), WsError> {
    let mut lines = vec![
        status_line.to_string(),
        format!("Content-Length: {}", body.len()),
        "Connection: close".to_string(),
    ];
    if let Some(header) = extra_header {
        lines.push(header.to_string());
    }
    lines.push(format!("\r\n{body}"));
    stream.write_all(lines.join("\r\n").as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// wait for protocol handshake from client, validate it and answer
///
/// every validation failure answers 400 (426 for a version mismatch)
/// before surfacing as [`WsError::HandshakeFailed`].
pub(crate) async fn handle_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    subprotocols: &[String],
) -> Result<ServerHandshake, WsError> {
    let mut buf = BytesMut::with_capacity(1024);
    let Some(end) = read_head(stream, &mut buf).await? else {
        reject(
            stream,
            "HTTP/1.1 400 Bad Request",
            None,
            "request head too large",
        )
        .await?;
        return Err(WsError::HandshakeFailed("request head too large".into()));
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let parsed = req.parse(&buf[..end]);
    let fail = |reason: &str| -> Option<String> { Some(reason.to_string()) };
    let mut version_mismatch = false;
    let mut error = match parsed {
        Err(_) | Ok(httparse::Status::Partial) => fail("malformed http request"),
        Ok(httparse::Status::Complete(_)) => None,
    };
    if error.is_none() && req.method != Some("GET") {
        error = fail("handshake request must use GET");
    }
    if error.is_none() && req.version != Some(1) {
        error = fail("handshake requires HTTP/1.1");
    }
    if error.is_none() {
        match header_value(req.headers, "upgrade") {
            Some(v) if is_websocket_upgrade(v) => {}
            _ => error = fail("missing upgrade header or invalid header value"),
        }
    }
    if error.is_none() {
        match header_value(req.headers, "connection") {
            Some(v) if connection_contains_upgrade(v) => {}
            _ => error = fail("connection header does not request an upgrade"),
        }
    }
    if error.is_none() {
        match header_value(req.headers, "sec-websocket-version") {
            Some(b"13") => {}
            _ => {
                version_mismatch = true;
                error = fail("unsupported websocket version");
            }
        }
    }
    let mut accept_key = String::new();
    if error.is_none() {
        let key = header_value(req.headers, "sec-websocket-key")
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim);
        match key {
            Some(key) if B64.decode(key).map(|k| k.len() == 16).unwrap_or(false) => {
                accept_key = cal_accept_key(key);
            }
            _ => error = fail("sec-websocket-key missing or not 16 bytes"),
        }
    }

    if let Some(reason) = error {
        if version_mismatch {
            reject(
                stream,
                "HTTP/1.1 426 Upgrade Required",
                Some("Sec-WebSocket-Version: 13"),
                &reason,
            )
            .await?;
        } else {
            reject(stream, "HTTP/1.1 400 Bad Request", None, &reason).await?;
        }
        return Err(WsError::HandshakeFailed(reason));
    }

    // first client offer, in the client's preference order, that the
    // caller also supports
    let offered: Vec<String> = req
        .headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("sec-websocket-protocol"))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    let subprotocol = offered
        .into_iter()
        .find(|offer| subprotocols.iter().any(|c| c == offer));

    let path = req.path.unwrap_or("/").to_string();

    let mut resp_lines = vec![
        "HTTP/1.1 101 Switching Protocols".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Accept: {accept_key}"),
    ];
    if let Some(proto) = &subprotocol {
        resp_lines.push(format!("Sec-WebSocket-Protocol: {proto}"));
    }
    resp_lines.push("\r\n".to_string());
    stream.write_all(resp_lines.join("\r\n").as_bytes()).await?;
    stream.flush().await?;
    tracing::debug!(%path, ?subprotocol, "server handshake complete");

    let mut remain = buf;
    let _head = remain.split_to(end);
    Ok(ServerHandshake {
        path,
        subprotocol,
        remain,
    })
}

/// outcome of a client side handshake
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    /// parsed 101 response
    pub response: http::Response<()>,
    /// subprotocol the server selected, if any
    pub subprotocol: Option<String>,
    /// bytes read past the response head, already frame data
    pub remain: BytesMut,
}

/// perform http upgrade against a server
pub(crate) async fn req_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    uri: &http::Uri,
    mode: &Mode,
    protocols: &[String],
    origin: Option<&str>,
    extra_headers: &HashMap<String, String>,
) -> Result<ClientHandshake, WsError> {
    let key = gen_key();
    let accept_key = cal_accept_key(&key);

    let mut req_builder = http::Request::builder()
        .uri(uri)
        .header(
            "Host",
            format!(
                "{}:{}",
                uri.host().unwrap_or_default(),
                uri.port_u16().unwrap_or_else(|| mode.default_port())
            ),
        )
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", &key)
        .header("Sec-WebSocket-Version", "13");
    if !protocols.is_empty() {
        req_builder = req_builder.header("Sec-WebSocket-Protocol", protocols.join(", "));
    }
    if let Some(origin) = origin {
        req_builder = req_builder.header("Origin", origin);
    }
    for (name, value) in extra_headers {
        req_builder = req_builder.header(name, value);
    }
    let req = req_builder
        .body(())
        .map_err(|e| WsError::HandshakeFailed(e.to_string()))?;
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or_default()))
        .collect::<Vec<String>>()
        .join("\r\n");
    let req_str = format!(
        "GET {path} HTTP/1.1\r\n{headers}\r\n\r\n",
        path = uri
            .path_and_query()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "/".to_string()),
    );
    stream.write_all(req_str.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    let Some(end) = read_head(stream, &mut buf).await? else {
        return Err(WsError::HandshakeFailed("response head too large".into()));
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(&buf[..end]) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return Err(WsError::HandshakeFailed("malformed http response".into())),
    }
    if resp.code != Some(101) {
        return Err(WsError::HandshakeFailed(format!(
            "expect 101 response, got {:?} {:?}",
            resp.code, resp.reason
        )));
    }
    match header_value(resp.headers, "upgrade") {
        Some(v) if is_websocket_upgrade(v) => {}
        _ => {
            return Err(WsError::HandshakeFailed(
                "response missing websocket upgrade header".into(),
            ))
        }
    }
    match header_value(resp.headers, "connection") {
        Some(v) if connection_contains_upgrade(v) => {}
        _ => {
            return Err(WsError::HandshakeFailed(
                "response connection header does not confirm the upgrade".into(),
            ))
        }
    }
    match header_value(resp.headers, "sec-websocket-accept") {
        Some(v) if v == accept_key.as_bytes() => {}
        other => {
            return Err(WsError::HandshakeFailed(format!(
                "mismatch accept key, expect {accept_key}, got {other:?}"
            )))
        }
    }
    let subprotocol = match header_value(resp.headers, "sec-websocket-protocol") {
        Some(v) => {
            let name = std::str::from_utf8(v)
                .map(|s| s.trim().to_string())
                .map_err(|_| WsError::HandshakeFailed("invalid subprotocol header".into()))?;
            if !protocols.iter().any(|p| p == &name) {
                return Err(WsError::HandshakeFailed(format!(
                    "server selected subprotocol `{name}` that was not offered"
                )));
            }
            Some(name)
        }
        None => None,
    };

    let mut response = http::Response::builder().status(101);
    for header in resp.headers.iter() {
        response = response.header(header.name, header.value);
    }
    let response = response
        .body(())
        .map_err(|e| WsError::HandshakeFailed(e.to_string()))?;
    tracing::debug!(?subprotocol, "client handshake complete");

    let mut remain = buf;
    let _head = remain.split_to(end);
    Ok(ClientHandshake {
        response,
        subprotocol,
        remain,
    })
}
