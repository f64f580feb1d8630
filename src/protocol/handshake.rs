//! HTTP upgrade handshake
//!
//! Builds and parses the HTTP/1.1 Upgrade exchange that turns a raw stream
//! into a WebSocket session, for both the accepting and the dialing side.

use std::collections::HashMap;

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// GUID appended to the client key when deriving Sec-WebSocket-Accept
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version sent in Sec-WebSocket-Version
pub const WS_VERSION: u8 = 13;

/// Upper bound on the size of an HTTP request/response head
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Number of random bytes in a generated Sec-WebSocket-Key
const KEY_BYTES: usize = 8;

/// Errors that can occur during the upgrade handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Connection closed before handshake completed")]
    ConnectionClosed,

    #[error("HTTP head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("Malformed HTTP message: {0}")]
    Malformed(String),

    #[error("Missing or invalid header: {0}")]
    MissingHeader(&'static str),

    #[error("Unexpected HTTP status {0}, expected 101")]
    UnexpectedStatus(u16),

    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptMismatch { expected: String, actual: String },
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Compute the Sec-WebSocket-Accept value for a client key
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generate a fresh Sec-WebSocket-Key
pub fn generate_key() -> String {
    let mut nonce = [0u8; KEY_BYTES];
    rand::rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Pick the first requested subprotocol the server supports
pub fn negotiate_protocol(requested: &[String], supported: &[String]) -> Option<String> {
    requested
        .iter()
        .find(|req| supported.iter().any(|s| s.eq_ignore_ascii_case(req)))
        .cloned()
}

/// Parsed or outgoing upgrade request
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request method
    pub method: String,
    /// Request target
    pub path: String,
    /// Host header
    pub host: Option<String>,
    /// Sec-WebSocket-Key header
    pub key: String,
    /// Sec-WebSocket-Version header, if present and numeric
    pub version: Option<u8>,
    /// Offered subprotocols, in preference order
    pub protocols: Vec<String>,
    /// All headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Build a client request with a freshly generated key
    pub fn new(host: impl Into<String>, path: impl Into<String>, protocol: Option<&str>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            host: Some(host.into()),
            key: generate_key(),
            version: Some(WS_VERSION),
            protocols: protocol.map(|p| vec![p.to_string()]).unwrap_or_default(),
            headers: HashMap::new(),
        }
    }

    /// Parse and validate an upgrade request head
    pub fn parse(head: &str) -> HandshakeResult<Self> {
        let mut lines = head.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::Malformed("empty request".to_string()))?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
            return Err(HandshakeError::Malformed(format!(
                "invalid request line: {}",
                request_line
            )));
        }

        let method = parts[0].to_string();
        if method != "GET" {
            return Err(HandshakeError::Malformed(format!("expected GET, got {}", method)));
        }

        let headers = parse_headers(lines)?;

        let upgrade = headers.get("upgrade").map(|s| s.to_ascii_lowercase());
        if upgrade.as_deref() != Some("websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }

        if !headers
            .get("connection")
            .is_some_and(|c| has_token(c, "upgrade"))
        {
            return Err(HandshakeError::MissingHeader("Connection"));
        }

        let key = headers
            .get("sec-websocket-key")
            .filter(|k| !k.is_empty())
            .cloned()
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;

        let version = headers
            .get("sec-websocket-version")
            .and_then(|v| v.parse().ok());

        let protocols = headers
            .get("sec-websocket-protocol")
            .map(|p| split_list(p))
            .unwrap_or_default();

        Ok(Self {
            method,
            path: parts[1].to_string(),
            host: headers.get("host").cloned(),
            key,
            version,
            protocols,
            headers,
        })
    }

    /// Serialize the request head
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut request = format!("{} {} HTTP/1.1\r\n", self.method, self.path);
        if let Some(ref host) = self.host {
            request.push_str(&format!("Host: {}\r\n", host));
        }
        request.push_str("Upgrade: websocket\r\n");
        request.push_str("Connection: Upgrade\r\n");
        request.push_str(&format!("Sec-WebSocket-Key: {}\r\n", self.key));
        request.push_str(&format!(
            "Sec-WebSocket-Version: {}\r\n",
            self.version.unwrap_or(WS_VERSION)
        ));
        if !self.protocols.is_empty() {
            request.push_str(&format!(
                "Sec-WebSocket-Protocol: {}\r\n",
                self.protocols.join(", ")
            ));
        }
        request.push_str("\r\n");
        request.into_bytes()
    }
}

/// Parsed or outgoing upgrade response
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    /// HTTP status code
    pub status: u16,
    /// Reason phrase
    pub reason: String,
    /// Sec-WebSocket-Accept header
    pub accept: Option<String>,
    /// Selected subprotocol
    pub protocol: Option<String>,
    /// All headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl UpgradeResponse {
    /// Build the 101 response for an accepted request
    pub fn switching_protocols(request: &UpgradeRequest, protocol: Option<String>) -> Self {
        Self {
            status: 101,
            reason: "Switching Protocols".to_string(),
            accept: Some(compute_accept_key(&request.key)),
            protocol,
            headers: HashMap::new(),
        }
    }

    /// Parse a response head
    pub fn parse(head: &str) -> HandshakeResult<Self> {
        let mut lines = head.lines();
        let status_line = lines
            .next()
            .ok_or_else(|| HandshakeError::Malformed("empty response".to_string()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::Malformed(format!(
                "invalid status line: {}",
                status_line
            )));
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HandshakeError::Malformed(format!("invalid status line: {}", status_line)))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let headers = parse_headers(lines)?;

        Ok(Self {
            status,
            reason,
            accept: headers.get("sec-websocket-accept").cloned(),
            protocol: headers.get("sec-websocket-protocol").cloned(),
            headers,
        })
    }

    /// Serialize the response head
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut response = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        response.push_str("Upgrade: websocket\r\n");
        response.push_str("Connection: Upgrade\r\n");
        if let Some(ref accept) = self.accept {
            response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", accept));
        }
        if let Some(ref protocol) = self.protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", protocol));
        }
        response.push_str("\r\n");
        response.into_bytes()
    }
}

/// Build a plain error response for a refused upgrade
pub fn error_response(status: u16, reason: &str) -> Vec<u8> {
    let status_text = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        426 => "Upgrade Required",
        _ => "Error",
    };

    format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {reason}",
        reason.len()
    )
    .into_bytes()
}

/// Read an HTTP head (start line plus headers) up to the blank line.
///
/// Bytes after the blank line stay buffered in `reader`.
pub async fn read_http_head<R>(reader: &mut R) -> HandshakeResult<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::new();

    loop {
        let remaining = MAX_HEAD_SIZE.saturating_sub(head.len());
        if remaining == 0 {
            return Err(HandshakeError::HeadTooLarge);
        }

        let start = head.len();
        let read = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;

        if read == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }

        let line = &head[start..];
        if !line.ends_with(b"\n") {
            if head.len() >= MAX_HEAD_SIZE {
                return Err(HandshakeError::HeadTooLarge);
            }
            return Err(HandshakeError::ConnectionClosed);
        }

        if line == b"\r\n" || line == b"\n" {
            break;
        }
    }

    String::from_utf8(head).map_err(|_| HandshakeError::Malformed("head is not valid UTF-8".to_string()))
}

/// Outcome of the accepting side of the handshake
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// The client's request
    pub request: UpgradeRequest,
    /// Subprotocol echoed back to the client
    pub protocol: Option<String>,
}

/// Run the server side of the handshake.
///
/// Reads the client's request, answers with `101 Switching Protocols`, and
/// returns what was agreed. A request that fails validation gets a
/// best-effort `400 Bad Request` before the error is returned.
///
/// With an empty `supported` list the first offered subprotocol is echoed.
pub async fn accept_upgrade<R, W>(
    reader: &mut R,
    writer: &mut W,
    supported: &[String],
) -> HandshakeResult<Negotiated>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let head = read_http_head(reader).await?;

    let request = match UpgradeRequest::parse(&head) {
        Ok(request) => request,
        Err(e) => {
            let _ = writer.write_all(&error_response(400, &e.to_string())).await;
            let _ = writer.flush().await;
            return Err(e);
        }
    };

    let protocol = if supported.is_empty() {
        request.protocols.first().cloned()
    } else {
        negotiate_protocol(&request.protocols, supported)
    };

    let response = UpgradeResponse::switching_protocols(&request, protocol.clone());
    writer.write_all(&response.to_bytes()).await?;
    writer.flush().await?;

    debug!("Upgraded request for {} (protocol: {:?})", request.path, protocol);
    Ok(Negotiated { request, protocol })
}

/// Run the client side of the handshake.
///
/// Sends `request`, reads the response and checks for status 101. With
/// `verify_accept` the Sec-WebSocket-Accept header must match the key.
pub async fn request_upgrade<R, W>(
    reader: &mut R,
    writer: &mut W,
    request: &UpgradeRequest,
    verify_accept: bool,
) -> HandshakeResult<UpgradeResponse>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&request.to_bytes()).await?;
    writer.flush().await?;

    let head = read_http_head(reader).await?;
    let response = UpgradeResponse::parse(&head)?;

    if response.status != 101 {
        return Err(HandshakeError::UnexpectedStatus(response.status));
    }

    if verify_accept {
        let expected = compute_accept_key(&request.key);
        let actual = response
            .accept
            .clone()
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Accept"))?;
        if actual != expected {
            return Err(HandshakeError::AcceptMismatch { expected, actual });
        }
    }

    Ok(response)
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> HandshakeResult<HashMap<String, String>> {
    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("invalid header line: {}", line)))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        // Repeated headers fold into a comma separated list
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    Ok(headers)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn has_token(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const SAMPLE_REQUEST: &str = "GET /ws HTTP/1.1\r\n\
                                  Host: example.com\r\n\
                                  Upgrade: websocket\r\n\
                                  Connection: keep-alive, Upgrade\r\n\
                                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                                  Sec-WebSocket-Version: 13\r\n\
                                  \r\n";

    #[test]
    fn test_compute_accept_key() {
        // Test vector from RFC 6455
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_base64_of_eight_bytes() {
        let key = generate_key();
        let decoded = base64::engine::general_purpose::STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), KEY_BYTES);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn test_parse_upgrade_request() {
        let req = UpgradeRequest::parse(SAMPLE_REQUEST).unwrap();
        assert_eq!(req.path, "/ws");
        assert_eq!(req.host.as_deref(), Some("example.com"));
        assert_eq!(req.key, "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(req.version, Some(13));
        assert!(req.protocols.is_empty());
    }

    #[test]
    fn test_parse_request_missing_key() {
        let request = "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(matches!(
            UpgradeRequest::parse(request),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        ));
    }

    #[test]
    fn test_parse_request_not_upgrade() {
        let request = "GET / HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
        assert!(UpgradeRequest::parse(request).is_err());

        let request = "POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        assert!(matches!(
            UpgradeRequest::parse(request),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_client_request_round_trips_through_parser() {
        let request = UpgradeRequest::new("localhost:7331", "/ws", Some("chat"));
        let bytes = request.to_bytes();
        let parsed = UpgradeRequest::parse(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.key, request.key);
        assert_eq!(parsed.protocols, vec!["chat"]);
        assert_eq!(parsed.host.as_deref(), Some("localhost:7331"));
    }

    #[test]
    fn test_response_build_and_parse() {
        let request = UpgradeRequest::parse(SAMPLE_REQUEST).unwrap();
        let response = UpgradeResponse::switching_protocols(&request, Some("chat".to_string()));
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));

        let parsed = UpgradeResponse::parse(&text).unwrap();
        assert_eq!(parsed.status, 101);
        assert_eq!(parsed.accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
        assert_eq!(parsed.protocol.as_deref(), Some("chat"));
    }

    #[test]
    fn test_negotiate_protocol() {
        let requested = vec!["graphql-ws".to_string(), "json".to_string()];
        let supported = vec!["JSON".to_string()];
        assert_eq!(negotiate_protocol(&requested, &supported), Some("json".to_string()));
        assert_eq!(negotiate_protocol(&requested, &[]), None);
    }

    #[tokio::test]
    async fn test_read_http_head_leaves_trailing_bytes() {
        let mut data = SAMPLE_REQUEST.as_bytes().to_vec();
        data.extend_from_slice(&[0x82, 0x00]);
        let mut reader = BufReader::new(std::io::Cursor::new(data));

        let head = read_http_head(&mut reader).await.unwrap();
        assert_eq!(head, SAMPLE_REQUEST);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![0x82, 0x00]);
    }

    #[tokio::test]
    async fn test_read_http_head_too_large() {
        let mut data = b"GET / HTTP/1.1\r\n".to_vec();
        data.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE));
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        assert!(matches!(
            read_http_head(&mut reader).await,
            Err(HandshakeError::HeadTooLarge)
        ));
    }

    #[tokio::test]
    async fn test_read_http_head_closed_early() {
        let mut reader = BufReader::new(std::io::Cursor::new(b"GET / HTTP/1.1\r\n".to_vec()));
        assert!(matches!(
            read_http_head(&mut reader).await,
            Err(HandshakeError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            accept_upgrade(&mut reader, &mut server_write, &[]).await
        });

        let request = UpgradeRequest::new("localhost", "/ws", Some("chat"));
        let mut reader = BufReader::new(client_read);
        let response = request_upgrade(&mut reader, &mut client_write, &request, true)
            .await
            .unwrap();
        assert_eq!(response.protocol.as_deref(), Some("chat"));

        let negotiated = server_task.await.unwrap().unwrap();
        assert_eq!(negotiated.request.key, request.key);
        assert_eq!(negotiated.protocol.as_deref(), Some("chat"));
    }

    #[tokio::test]
    async fn test_bad_request_gets_400() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        client_write
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut reader = BufReader::new(server_read);
        let result = accept_upgrade(&mut reader, &mut server_write, &[]).await;
        assert!(result.is_err());
        drop(server_write);

        let mut reader = BufReader::new(client_read);
        let head = read_http_head(&mut reader).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 400 Bad Request"));
    }

    #[tokio::test]
    async fn test_accept_mismatch_detected() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, mut client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            let _ = read_http_head(&mut reader).await;
            let bogus = "HTTP/1.1 101 Switching Protocols\r\n\
                         Upgrade: websocket\r\n\
                         Connection: Upgrade\r\n\
                         Sec-WebSocket-Accept: bm9wZQ==\r\n\r\n";
            server_write.write_all(bogus.as_bytes()).await.unwrap();
        });

        let request = UpgradeRequest::new("localhost", "/ws", None);
        let mut reader = BufReader::new(client_read);
        let result = request_upgrade(&mut reader, &mut client_write, &request, true).await;
        assert!(matches!(result, Err(HandshakeError::AcceptMismatch { .. })));
    }
}
