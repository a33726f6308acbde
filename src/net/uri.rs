//! `scheme://host[:port][/path]` endpoints.

use super::connection::{Schema, StreamType};
use crate::error::{Error, Result};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub schema: Schema,
    pub host: String,
    pub port: u16,
    /// Request path for WebSocket/HTTP, socket path for `unix`.
    pub path: String,
}

impl Uri {
    pub fn parse(input: &str) -> Result<Self> {
        let bad = |reason: &str| Error::Config(format!("invalid uri {input:?}: {reason}"));

        let (scheme, rest) = input.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        let schema = Schema::parse(scheme).ok_or_else(|| bad("unknown scheme"))?;
        // The protocol that decides ports and paths is the one behind the proxy.
        let effective = schema.inner().unwrap_or(schema.stream_type());

        if effective == StreamType::Unix {
            if rest.is_empty() {
                return Err(bad("missing socket path"));
            }
            return Ok(Self {
                schema,
                host: String::new(),
                port: 0,
                path: rest.to_string(),
            });
        }

        let (authority, path) = match rest.find('/') {
            Some(at) => (&rest[..at], rest[at..].to_string()),
            None => (rest, "/".to_string()),
        };

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, tail) = v6.split_once(']').ok_or_else(|| bad("unclosed '['"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(bad("missing host"));
        }

        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| bad("bad port"))?,
            None => effective
                .default_port()
                .ok_or_else(|| bad("port required for this scheme"))?,
        };

        Ok(Self {
            schema,
            host: host.to_string(),
            port,
            path,
        })
    }

    pub fn stream_type(&self) -> StreamType {
        self.schema.stream_type()
    }

    pub fn is_unix(&self) -> bool {
        self.host.is_empty() && self.port == 0
    }

    pub fn unix_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    /// Resolve host and port to the first socket address.
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Connect {
                uri: self.to_string(),
                reason: "host did not resolve".to_string(),
            })
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unix() {
            return write!(f, "{}://{}", self.schema, self.path);
        }
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}{}", self.schema, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}:{}{}", self.schema, self.host, self.port, self.path)
        }
    }
}
