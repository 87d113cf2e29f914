//! WebSocket handshake implementation
//!
//! Builds, parses and validates the HTTP/1.1 upgrade exchange from RFC 6455
//! section 4. Everything here works on byte slices; the adapters own the
//! reading and writing. Parsing is incremental: `parse` returns `Ok(None)`
//! until the blank line ending the head has arrived, and reports how many
//! bytes the head used so that anything after it can seed the frame stream.

use crate::error::{HandshakeError, Result};
use crate::protocol::constants::{
    MAX_HEADERS, MAX_HEADER_SIZE, WEBSOCKET_GUID, WEBSOCKET_KEY_LEN, WEBSOCKET_VERSION,
};
use crate::protocol::http_header::*;
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use sha1::{Digest, Sha1};

/// Ordered header list; lookups are case-insensitive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing one with the same name
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether the comma-separated value of `name` contains `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .flat_map(|(_, value)| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    }

    /// Iterate over headers in the order they were received or added
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_parsed(headers: &[httparse::Header<'_>]) -> Result<Self> {
        let mut parsed = Headers::new();
        for header in headers {
            let value = std::str::from_utf8(header.value).map_err(|_| {
                HandshakeError::Malformed(format!("non UTF-8 value for {}", header.name))
            })?;
            parsed.push(header.name, value.trim());
        }
        Ok(parsed)
    }

    fn write_to(&self, buf: &mut BytesMut) {
        for (name, value) in &self.entries {
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// WebSocket handshake request information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// HTTP method (must be GET)
    pub method: String,
    /// Request target
    pub resource: String,
    /// HTTP headers in order
    pub headers: Headers,
}

/// WebSocket handshake response information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// HTTP headers in order
    pub headers: Headers,
}

/// What a completed upgrade exchange tells the application
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Request target of the upgrade request
    pub resource: String,
    /// Headers the peer sent: the request on a server, the response on a client
    pub headers: Headers,
}

impl HandshakeInfo {
    /// Metadata a server keeps from an accepted request
    pub fn from_request(request: HandshakeRequest) -> Self {
        Self {
            resource: request.resource,
            headers: request.headers,
        }
    }

    /// Metadata a client keeps from a validated response
    pub fn from_response(resource: &str, response: HandshakeResponse) -> Self {
        Self {
            resource: resource.to_string(),
            headers: response.headers,
        }
    }
}

/// Generate a random WebSocket key
pub fn generate_key() -> String {
    use rand::RngCore;
    let mut key_bytes = [0u8; WEBSOCKET_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    general_purpose::STANDARD.encode(key_bytes)
}

/// Compute the Sec-WebSocket-Accept value for a client key
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate WebSocket key format: base64 of exactly 16 bytes
pub fn validate_key(key: &str) -> bool {
    key.len() == 24
        && general_purpose::STANDARD
            .decode(key)
            .map(|raw| raw.len() == WEBSOCKET_KEY_LEN)
            .unwrap_or(false)
}

impl HandshakeRequest {
    /// Build a client upgrade request
    ///
    /// Required headers come first, then `extra_headers` in order.
    pub fn client(host: &str, resource: &str, key: &str, extra_headers: &[(String, String)]) -> Self {
        let mut headers = Headers::new();
        headers.push("Host", host);
        headers.push("Upgrade", "websocket");
        headers.push("Connection", "Upgrade");
        headers.push("Sec-WebSocket-Key", key);
        headers.push("Sec-WebSocket-Version", WEBSOCKET_VERSION);
        for (name, value) in extra_headers {
            headers.push(name.clone(), value.clone());
        }

        Self {
            method: "GET".to_string(),
            resource: resource.to_string(),
            headers,
        }
    }

    /// Parse a request head from the front of `buf`
    ///
    /// Returns the request and the number of bytes it occupied, or `None` when
    /// the head is not complete yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);

        let len = match request.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return partial(buf),
            Err(err) => return Err(HandshakeError::Malformed(err.to_string()).into()),
        };
        if len > MAX_HEADER_SIZE {
            return Err(HandshakeError::HeadTooLarge {
                max: MAX_HEADER_SIZE,
            }
            .into());
        }
        if request.version != Some(1) {
            return Err(HandshakeError::Malformed("HTTP/1.1 required".to_string()).into());
        }

        let parsed = Self {
            method: request.method.unwrap_or_default().to_string(),
            resource: request.path.unwrap_or_default().to_string(),
            headers: Headers::from_parsed(request.headers)?,
        };
        Ok(Some((parsed, len)))
    }

    /// Validate a client upgrade request, returning its key
    pub fn validate(&self) -> Result<&str> {
        if self.method != "GET" {
            return Err(HandshakeError::InvalidMethod(self.method.clone()).into());
        }

        let upgrade = self
            .headers
            .get(UPGRADE)
            .ok_or(HandshakeError::MissingHeader(UPGRADE))?;
        if !self.headers.has_token(UPGRADE, "websocket") {
            return Err(HandshakeError::InvalidHeader {
                header: UPGRADE,
                value: upgrade.to_string(),
            }
            .into());
        }

        let connection = self
            .headers
            .get(CONNECTION)
            .ok_or(HandshakeError::MissingHeader(CONNECTION))?;
        if !self.headers.has_token(CONNECTION, "upgrade") {
            return Err(HandshakeError::InvalidHeader {
                header: CONNECTION,
                value: connection.to_string(),
            }
            .into());
        }

        let version = self
            .headers
            .get(SEC_WEBSOCKET_VERSION)
            .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_VERSION))?;
        if version != WEBSOCKET_VERSION {
            return Err(HandshakeError::UnsupportedVersion(version.to_string()).into());
        }

        let key = self
            .headers
            .get(SEC_WEBSOCKET_KEY)
            .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_KEY))?;
        if !validate_key(key) {
            return Err(HandshakeError::InvalidKey.into());
        }

        Ok(key)
    }

    /// Serialize the request head
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.resource.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        self.headers.write_to(&mut buf);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// First value of a request header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

impl HandshakeResponse {
    /// Build the 101 response for a validated client key
    pub fn accept(client_key: &str, extra_headers: &[(String, String)]) -> Self {
        let mut headers = Headers::new();
        headers.push("Upgrade", "websocket");
        headers.push("Connection", "Upgrade");
        headers.push("Sec-WebSocket-Accept", compute_accept_key(client_key));
        for (name, value) in extra_headers {
            headers.push(name.clone(), value.clone());
        }

        Self {
            status: StatusCode::SWITCHING_PROTOCOLS,
            headers,
        }
    }

    /// Build the rejection response for a failed upgrade request
    ///
    /// A version mismatch answers 426 and advertises version 13, everything
    /// else answers 400.
    pub fn reject(error: &HandshakeError) -> Self {
        let mut headers = Headers::new();
        let status = match error {
            HandshakeError::UnsupportedVersion(_) => {
                headers.push("Sec-WebSocket-Version", WEBSOCKET_VERSION);
                StatusCode::UPGRADE_REQUIRED
            }
            _ => StatusCode::BAD_REQUEST,
        };
        headers.push("Connection", "close");
        headers.push("Content-Length", "0");

        Self { status, headers }
    }

    /// Parse a response head from the front of `buf`
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        let len = match response.parse(buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => return partial(buf),
            Err(err) => return Err(HandshakeError::Malformed(err.to_string()).into()),
        };
        if len > MAX_HEADER_SIZE {
            return Err(HandshakeError::HeadTooLarge {
                max: MAX_HEADER_SIZE,
            }
            .into());
        }

        let code = response.code.unwrap_or_default();
        let status = StatusCode::from_u16(code)
            .map_err(|_| HandshakeError::Malformed(format!("invalid status code {}", code)))?;

        let parsed = Self {
            status,
            headers: Headers::from_parsed(response.headers)?,
        };
        Ok(Some((parsed, len)))
    }

    /// Validate a server response against the key we sent
    pub fn validate(&self, client_key: &str) -> Result<()> {
        if self.status != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::UnexpectedStatus(self.status.as_u16()).into());
        }

        let upgrade = self
            .headers
            .get(UPGRADE)
            .ok_or(HandshakeError::MissingHeader(UPGRADE))?;
        if !self.headers.has_token(UPGRADE, "websocket") {
            return Err(HandshakeError::InvalidHeader {
                header: UPGRADE,
                value: upgrade.to_string(),
            }
            .into());
        }

        let connection = self
            .headers
            .get(CONNECTION)
            .ok_or(HandshakeError::MissingHeader(CONNECTION))?;
        if !self.headers.has_token(CONNECTION, "upgrade") {
            return Err(HandshakeError::InvalidHeader {
                header: CONNECTION,
                value: connection.to_string(),
            }
            .into());
        }

        let accept = self
            .headers
            .get(SEC_WEBSOCKET_ACCEPT)
            .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_ACCEPT))?;
        let expected = compute_accept_key(client_key);
        if accept != expected {
            return Err(HandshakeError::AcceptMismatch {
                expected,
                received: accept.to_string(),
            }
            .into());
        }

        Ok(())
    }

    /// Serialize the response head
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(b"HTTP/1.1 ");
        buf.put_slice(self.status.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        buf.put_slice(b"\r\n");
        self.headers.write_to(&mut buf);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// First value of a response header
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

fn partial<T>(buf: &[u8]) -> Result<Option<T>> {
    if buf.len() >= MAX_HEADER_SIZE {
        return Err(HandshakeError::HeadTooLarge {
            max: MAX_HEADER_SIZE,
        }
        .into());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn handshake_error(result: Result<impl std::fmt::Debug>) -> HandshakeError {
        match result {
            Err(Error::Handshake(err)) => err,
            other => panic!("expected handshake error, got {:?}", other),
        }
    }

    fn request_without(header: &str) -> HandshakeRequest {
        let (mut request, _) = HandshakeRequest::parse(SAMPLE_REQUEST.as_bytes())
            .unwrap()
            .unwrap();
        request.headers = request
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(header))
            .collect();
        request
    }

    #[test]
    fn test_key_generation() {
        let key = generate_key();
        assert_eq!(key.len(), 24);
        assert!(validate_key(&key));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn test_accept_key_calculation() {
        assert_eq!(compute_accept_key(SAMPLE_KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_request_parsing() {
        let (request, len) = HandshakeRequest::parse(SAMPLE_REQUEST.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(len, SAMPLE_REQUEST.len());
        assert_eq!(request.method, "GET");
        assert_eq!(request.resource, "/chat");
        assert_eq!(request.header("HOST"), Some("example.com"));
        assert_eq!(request.validate().unwrap(), SAMPLE_KEY);
    }

    #[test]
    fn test_request_partial_and_leftover() {
        let bytes = SAMPLE_REQUEST.as_bytes();
        assert!(HandshakeRequest::parse(&bytes[..bytes.len() - 1])
            .unwrap()
            .is_none());

        let mut with_frame = bytes.to_vec();
        with_frame.extend_from_slice(&[0x81, 0x80]);
        let (_, len) = HandshakeRequest::parse(&with_frame).unwrap().unwrap();
        assert_eq!(&with_frame[len..], &[0x81, 0x80]);
    }

    #[test]
    fn test_request_too_large() {
        let mut head = b"GET / HTTP/1.1\r\nX-Padding: ".to_vec();
        head.resize(MAX_HEADER_SIZE + 1, b'a');
        let err = handshake_error(HandshakeRequest::parse(&head));
        assert_eq!(err, HandshakeError::HeadTooLarge { max: MAX_HEADER_SIZE });
    }

    #[test]
    fn test_missing_required_headers() {
        for header in [UPGRADE, CONNECTION, SEC_WEBSOCKET_VERSION, SEC_WEBSOCKET_KEY] {
            let request = request_without(header);
            let err = handshake_error(request.validate());
            assert_eq!(err, HandshakeError::MissingHeader(header));
        }
    }

    #[test]
    fn test_invalid_request_values() {
        let mut request = request_without(SEC_WEBSOCKET_VERSION);
        request.headers.push("Sec-WebSocket-Version", "8");
        let err = handshake_error(request.validate());
        assert_eq!(err, HandshakeError::UnsupportedVersion("8".to_string()));
        assert_eq!(
            HandshakeResponse::reject(&err).status,
            StatusCode::UPGRADE_REQUIRED
        );

        let mut request = request_without(SEC_WEBSOCKET_KEY);
        request.headers.push("Sec-WebSocket-Key", "short");
        let err = handshake_error(request.validate());
        assert_eq!(err, HandshakeError::InvalidKey);
        assert_eq!(HandshakeResponse::reject(&err).status, StatusCode::BAD_REQUEST);

        let mut request = request_without(UPGRADE);
        request.headers.push("Upgrade", "h2c");
        assert!(matches!(
            handshake_error(request.validate()),
            HandshakeError::InvalidHeader { header: UPGRADE, .. }
        ));

        let mut request = request_without("");
        request.method = "POST".to_string();
        assert_eq!(
            handshake_error(request.validate()),
            HandshakeError::InvalidMethod("POST".to_string())
        );
    }

    #[test]
    fn test_client_request_roundtrip() {
        let extra = vec![("X-Token".to_string(), "abc".to_string())];
        let request = HandshakeRequest::client("localhost:8765", "/echo", SAMPLE_KEY, &extra);
        let bytes = request.to_bytes();
        assert!(bytes.starts_with(b"GET /echo HTTP/1.1\r\nHost: localhost:8765\r\n"));

        let (parsed, _) = HandshakeRequest::parse(&bytes).unwrap().unwrap();
        assert_eq!(parsed, request);
        assert_eq!(parsed.validate().unwrap(), SAMPLE_KEY);
        let names: Vec<&str> = parsed.headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names.last(), Some(&"X-Token"));
    }

    #[test]
    fn test_response_accept_and_validate() {
        let response = HandshakeResponse::accept(SAMPLE_KEY, &[]);
        let bytes = response.to_bytes();
        assert!(bytes.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

        let (parsed, len) = HandshakeResponse::parse(&bytes).unwrap().unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(
            parsed.header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
        assert!(parsed.validate(SAMPLE_KEY).is_ok());

        let err = handshake_error(parsed.validate(&generate_key()));
        assert!(matches!(err, HandshakeError::AcceptMismatch { .. }));
    }

    #[test]
    fn test_response_wrong_status() {
        let bytes = HandshakeResponse::reject(&HandshakeError::InvalidKey).to_bytes();
        let (parsed, _) = HandshakeResponse::parse(&bytes).unwrap().unwrap();
        assert_eq!(
            handshake_error(parsed.validate(SAMPLE_KEY)),
            HandshakeError::UnexpectedStatus(400)
        );
    }
}
