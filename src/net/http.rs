//! Response framing for outbound writes on HTTP/HTTPS connections.
//!
//! Request routing lives outside this crate; connections only need to wrap
//! a payload they send as a response.

use bytes::{BufMut, BytesMut};

pub trait HttpResponder {
    /// Append a complete response carrying `body` to `out`.
    fn respond(&self, body: &[u8], out: &mut BytesMut);
}

/// `200 OK` with a fixed content type and explicit length.
#[derive(Debug, Clone)]
pub struct PlainResponder {
    content_type: String,
    allow_origin: Option<String>,
}

impl Default for PlainResponder {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            allow_origin: None,
        }
    }
}

impl PlainResponder {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            allow_origin: None,
        }
    }

    /// Add `Access-Control-Allow-Origin` to every response.
    pub fn with_allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = Some(origin.into());
        self
    }
}

impl HttpResponder for PlainResponder {
    fn respond(&self, body: &[u8], out: &mut BytesMut) {
        let mut head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            self.content_type,
            body.len()
        );
        if let Some(origin) = &self.allow_origin {
            head.push_str(&format!("Access-Control-Allow-Origin: {origin}\r\n"));
        }
        head.push_str("\r\n");

        out.reserve(head.len() + body.len());
        out.put_slice(head.as_bytes());
        out.put_slice(body);
    }
}
