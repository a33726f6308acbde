//! Per-connection WebSocket state.

use super::frame::{self, OpCode, MAX_CONTROL_PAYLOAD};
use super::handshake;
use crate::error::CodecError;
use crate::protocols::{Decode, DecodeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsStatus {
    Unconnected,
    /// Waiting for the client's upgrade request.
    PassiveOpening,
    /// Upgrade request sent, waiting for `101`.
    ActiveOpening,
    Connected,
    Closed,
}

/// One processed frame.
#[derive(Debug, PartialEq, Eq)]
pub enum WsEvent<'a> {
    /// A complete, unmasked, reassembled data message.
    Message { opcode: OpCode, payload: &'a [u8] },
    /// A non-final data frame was buffered.
    Fragment,
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

#[derive(Debug)]
pub struct WsSession {
    status: WsStatus,
    /// Reassembly buffer for the message in flight.
    message: Vec<u8>,
    /// Opcode of the first frame of the message in flight.
    message_opcode: Option<OpCode>,
    /// The last data frame completed a message that has been handed out.
    fin: bool,
    /// Key sent in our own opening request.
    client_key: Option<String>,
    limit: usize,
}

impl WsSession {
    /// A session whose frames and messages must stay below `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            status: WsStatus::Unconnected,
            message: Vec::new(),
            message_opcode: None,
            fin: false,
            client_key: None,
            limit,
        }
    }

    pub fn status(&self) -> WsStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == WsStatus::Connected
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Expect an upgrade request from the peer.
    pub fn accept(&mut self) {
        self.status = WsStatus::PassiveOpening;
    }

    /// Produce our own upgrade request.
    pub fn open(&mut self, host: &str, path: &str) -> String {
        let key = handshake::generate_key();
        let request = handshake::request(host, path, &key);
        self.client_key = Some(key);
        self.status = WsStatus::ActiveOpening;
        request
    }

    /// Feed handshake bytes. Passive sessions return the response to send.
    pub fn handshake(&mut self, data: &[u8]) -> DecodeResult<Option<String>> {
        let outcome = match (self.status, self.client_key.as_deref()) {
            (WsStatus::PassiveOpening, _) => {
                handshake::parse_request(data)?.map(|request| Some(request.response()))
            }
            (WsStatus::ActiveOpening, Some(key)) => {
                handshake::parse_response(data, key)?.map(|()| None)
            }
            (status, _) => {
                return Err(CodecError::malformed(
                    "websocket handshake",
                    format!("no handshake expected in state {status:?}"),
                ))
            }
        };
        if outcome.is_complete() {
            self.status = WsStatus::Connected;
            self.client_key = None;
        }
        Ok(outcome)
    }

    /// Decode one frame from the front of `data`.
    ///
    /// A returned message stays valid until the next call.
    pub fn process(&mut self, data: &[u8]) -> DecodeResult<WsEvent<'_>> {
        if self.status != WsStatus::Connected {
            return Err(CodecError::malformed(
                "websocket frame",
                format!("frame in state {:?}", self.status),
            ));
        }
        if self.fin {
            self.message.clear();
            self.fin = false;
        }

        let Some(header) = frame::parse_header(data)? else {
            return Ok(Decode::Incomplete);
        };
        let size = header.frame_len();
        if size >= self.limit as u64 {
            return Err(CodecError::Overflow {
                what: "websocket frame",
                size: size.min(usize::MAX as u64) as usize,
                limit: self.limit,
            });
        }
        let size = size as usize;
        if data.len() < size {
            return Ok(Decode::Incomplete);
        }
        let body = &data[header.header_len..size];

        if header.opcode.is_control() {
            if !header.fin || body.len() > MAX_CONTROL_PAYLOAD {
                return Err(CodecError::malformed(
                    "websocket frame",
                    "fragmented or oversized control frame",
                ));
            }
            let mut payload = body.to_vec();
            if let Some(key) = header.mask {
                frame::apply_mask(&mut payload, key);
            }
            let event = match header.opcode {
                OpCode::Ping => WsEvent::Ping(payload),
                OpCode::Pong => WsEvent::Pong(payload),
                _ => {
                    self.status = WsStatus::Closed;
                    close_event(&payload)
                }
            };
            return Ok(Decode::Complete {
                value: event,
                consumed: size,
            });
        }

        match (header.opcode, self.message_opcode) {
            (OpCode::Continuation, None) => {
                return Err(CodecError::malformed(
                    "websocket frame",
                    "continuation without a message",
                ))
            }
            (OpCode::Continuation, Some(_)) => {}
            (opcode, None) => self.message_opcode = Some(opcode),
            (_, Some(_)) => {
                return Err(CodecError::malformed(
                    "websocket frame",
                    "new message inside a fragmented one",
                ))
            }
        }

        let total = self.message.len() + body.len();
        if total >= self.limit {
            return Err(CodecError::Overflow {
                what: "websocket message",
                size: total,
                limit: self.limit,
            });
        }
        let start = self.message.len();
        self.message.extend_from_slice(body);
        if let Some(key) = header.mask {
            frame::apply_mask(&mut self.message[start..], key);
        }

        if !header.fin {
            return Ok(Decode::Complete {
                value: WsEvent::Fragment,
                consumed: size,
            });
        }

        self.fin = true;
        let opcode = self.message_opcode.take().unwrap_or(OpCode::Binary);
        Ok(Decode::Complete {
            value: WsEvent::Message {
                opcode,
                payload: &self.message,
            },
            consumed: size,
        })
    }
}

fn close_event(payload: &[u8]) -> WsEvent<'static> {
    if payload.len() < 2 {
        return WsEvent::Close {
            code: None,
            reason: String::new(),
        };
    }
    WsEvent::Close {
        code: Some(u16::from_be_bytes([payload[0], payload[1]])),
        reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::ScratchBuffer;

    const KEY: [u8; 4] = [1, 2, 3, 4];

    fn connected() -> WsSession {
        let mut session = WsSession::new(1024);
        session.accept();
        let request = handshake::request("localhost", "/", &handshake::generate_key());
        let outcome = session.handshake(request.as_bytes()).unwrap();
        assert!(matches!(outcome, Decode::Complete { value: Some(_), .. }));
        session
    }

    fn masked(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let fin_bit = if fin { 0x80 } else { 0 };
        let mut out = vec![fin_bit | opcode, 0x80 | payload.len() as u8];
        out.extend_from_slice(&KEY);
        let mut body = payload.to_vec();
        frame::apply_mask(&mut body, KEY);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_single_frame_message() {
        let mut session = connected();
        let data = masked(0x1, true, b"hello");

        let Decode::Complete { value, consumed } = session.process(&data).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(consumed, data.len());
        assert_eq!(
            value,
            WsEvent::Message {
                opcode: OpCode::Text,
                payload: b"hello"
            }
        );
    }

    #[test]
    fn test_fragments_reassembled_around_ping() {
        let mut session = connected();
        let mut data = masked(0x2, false, b"abc");
        data.extend(masked(0x9, true, b"hb"));
        data.extend(masked(0x0, false, b"def"));
        data.extend(masked(0x0, true, b"g"));

        let mut offset = 0;
        let mut events = Vec::new();
        while offset < data.len() {
            match session.process(&data[offset..]).unwrap() {
                Decode::Complete { value, consumed } => {
                    offset += consumed;
                    events.push(format!("{value:?}"));
                    if let WsEvent::Message { opcode, payload } = value {
                        assert_eq!(opcode, OpCode::Binary);
                        assert_eq!(payload, b"abcdefg");
                    }
                }
                Decode::Incomplete => panic!("frames are complete"),
            }
        }
        assert_eq!(events.len(), 4);
        assert_eq!(events[1], format!("{:?}", WsEvent::Ping(b"hb".to_vec())));

        // The next message starts from an empty buffer.
        let next = masked(0x1, true, b"z");
        let Decode::Complete { value, .. } = session.process(&next).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(
            value,
            WsEvent::Message {
                opcode: OpCode::Text,
                payload: b"z"
            }
        );
    }

    #[test]
    fn test_partial_frame_is_incomplete() {
        let mut session = connected();
        let data = masked(0x1, true, b"hello");
        assert_eq!(session.process(&data[..7]).unwrap(), Decode::Incomplete);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut session = connected();
        let mut out = ScratchBuffer::new(4096);
        frame::encode_frame(OpCode::Binary, &[0u8; 1100], KEY, &mut out).unwrap();

        assert!(matches!(
            session.process(&out.data()[..8]),
            Err(CodecError::Overflow { .. })
        ));
    }

    #[test]
    fn test_close_with_reason() {
        let mut session = connected();
        let body = frame::close_payload(Some(1001), "going away");
        let data = masked(0x8, true, &body);

        let Decode::Complete { value, .. } = session.process(&data).unwrap() else {
            panic!("expected a frame");
        };
        assert_eq!(
            value,
            WsEvent::Close {
                code: Some(1001),
                reason: "going away".to_string()
            }
        );
        assert_eq!(session.status(), WsStatus::Closed);
    }

    #[test]
    fn test_continuation_without_start() {
        let mut session = connected();
        assert!(session.process(&masked(0x0, true, b"x")).is_err());
    }

    #[test]
    fn test_active_handshake() {
        let mut client = WsSession::new(1024);
        let request = client.open("example.com", "/ws");
        assert_eq!(client.status(), WsStatus::ActiveOpening);

        let mut server = WsSession::new(1024);
        server.accept();
        let Decode::Complete {
            value: Some(response),
            ..
        } = server.handshake(request.as_bytes()).unwrap()
        else {
            panic!("server should answer");
        };

        let outcome = client.handshake(response.as_bytes()).unwrap();
        assert_eq!(
            outcome,
            Decode::Complete {
                value: None,
                consumed: response.len()
            }
        );
        assert!(client.is_connected());
    }
}
