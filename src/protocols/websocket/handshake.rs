//! HTTP/1.1 upgrade handshake.

use crate::error::CodecError;
use crate::protocols::{Decode, DecodeResult};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

/// Appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
/// Upper bound for a request or response head.
pub const MAX_HANDSHAKE_SIZE: usize = 8192;

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.trim().as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

/// Fresh random `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Start line plus headers of an HTTP message.
struct Head<'a> {
    start: &'a str,
    headers: Vec<(&'a str, &'a str)>,
}

impl<'a> Head<'a> {
    fn parse(data: &'a [u8]) -> DecodeResult<Head<'a>> {
        let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") else {
            if data.len() > MAX_HANDSHAKE_SIZE {
                return Err(CodecError::Overflow {
                    what: "websocket handshake",
                    size: data.len(),
                    limit: MAX_HANDSHAKE_SIZE,
                });
            }
            return Ok(Decode::Incomplete);
        };

        let text = std::str::from_utf8(&data[..end])
            .map_err(|_| CodecError::malformed("websocket handshake", "head is not UTF-8"))?;
        let mut lines = text.split("\r\n");
        let start = lines.next().unwrap_or_default();
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                CodecError::malformed("websocket handshake", format!("bad header line {line:?}"))
            })?;
            headers.push((name.trim(), value.trim()));
        }

        Ok(Decode::Complete {
            value: Head { start, headers },
            consumed: end + 4,
        })
    }

    fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// Both `Connection: Upgrade` and `Upgrade: websocket` are present.
    fn is_upgrade(&self) -> bool {
        let mut matches = 0;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection")
                && value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            {
                matches |= 1;
            }
            if name.eq_ignore_ascii_case("upgrade") && value.eq_ignore_ascii_case("websocket") {
                matches |= 2;
            }
        }
        matches == 3
    }
}

/// A client's opening request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub host: Option<String>,
    pub key: String,
    pub protocol: Option<String>,
}

impl UpgradeRequest {
    /// The `101 Switching Protocols` answer.
    pub fn response(&self) -> String {
        let mut out = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            accept_key(&self.key)
        );
        if let Some(protocol) = &self.protocol {
            // Echo the first offered subprotocol.
            let first = protocol.split(',').next().unwrap_or_default().trim();
            out.push_str(&format!("Sec-WebSocket-Protocol: {first}\r\n"));
        }
        out.push_str("\r\n");
        out
    }
}

pub fn parse_request(data: &[u8]) -> DecodeResult<UpgradeRequest> {
    let (head, consumed) = match Head::parse(data)? {
        Decode::Complete { value, consumed } => (value, consumed),
        Decode::Incomplete => return Ok(Decode::Incomplete),
    };

    let mut parts = head.start.split_whitespace();
    let (Some(method), Some(path), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(CodecError::malformed(
            "websocket handshake",
            format!("bad request line {:?}", head.start),
        ));
    };
    if method != "GET" || !version.starts_with("HTTP/1.1") {
        return Err(CodecError::malformed(
            "websocket handshake",
            format!("unsupported request {method} {version}"),
        ));
    }
    if !head.is_upgrade() {
        return Err(CodecError::malformed(
            "websocket handshake",
            "missing upgrade headers",
        ));
    }
    let key = head
        .header("sec-websocket-key")
        .ok_or_else(|| CodecError::malformed("websocket handshake", "missing key"))?;

    Ok(Decode::Complete {
        value: UpgradeRequest {
            path: path.to_string(),
            host: head.header("host").map(str::to_string),
            key: key.to_string(),
            protocol: head.header("sec-websocket-protocol").map(str::to_string),
        },
        consumed,
    })
}

/// Opening request for an outbound connection.
pub fn request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Check the server's answer against the key sent in [`request`].
pub fn parse_response(data: &[u8], key: &str) -> DecodeResult<()> {
    let (head, consumed) = match Head::parse(data)? {
        Decode::Complete { value, consumed } => (value, consumed),
        Decode::Incomplete => return Ok(Decode::Incomplete),
    };

    let status = head.start.split_whitespace().nth(1);
    if status != Some("101") {
        return Err(CodecError::malformed(
            "websocket handshake",
            format!("unexpected status line {:?}", head.start),
        ));
    }
    if !head.is_upgrade() {
        return Err(CodecError::malformed(
            "websocket handshake",
            "missing upgrade headers",
        ));
    }
    if head.header("sec-websocket-accept") != Some(accept_key(key).as_str()) {
        return Err(CodecError::malformed(
            "websocket handshake",
            "accept value does not match key",
        ));
    }

    Ok(Decode::Complete {
        value: (),
        consumed,
    })
}
