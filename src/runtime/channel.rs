//! Typed, length-prefixed duplex message pipe between two reactors.
//!
//! A channel is a connected Unix socket pair. Each direction carries
//! envelopes:
//!
//! ```text
//! ┌────────────┬─────────┬────────────────────┐
//! │ size (u32) │ tag (1) │   payload (size)   │
//! └────────────┴─────────┴────────────────────┘
//! ```
//!
//! `size` is in host byte order; both ends live in the same process. This is
//! the only sanctioned path for data to cross between worker threads and the
//! main thread.

use super::buffer::ScratchBuffer;
use super::reactor::{EventHandler, Reactor};
use super::token::EventHandle;
use crate::error::{Error, Result};
use bytes::{Buf, BytesMut};
use mio::net::UnixStream;
use mio::Interest;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Upper bound (exclusive) on header plus payload of one envelope.
pub const MAX_ENVELOPE_SIZE: usize = 65535;

/// `size` plus `tag`.
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Payload kind of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Text = 1,
    Json = 2,
    Binary = 3,
}

impl TryFrom<u8> for Tag {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Tag::Text),
            2 => Ok(Tag::Json),
            3 => Ok(Tag::Binary),
            other => Err(Error::Channel(format!("unknown envelope tag {other}"))),
        }
    }
}

/// Which end of a channel. By convention the worker owns `Left` and the main
/// thread owns `Right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One decoded envelope, borrowing the reader's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub tag: Tag,
    pub payload: &'a [u8],
}

/// Append one envelope to `out`.
pub fn encode_envelope(tag: Tag, payload: &[u8], out: &mut BytesMut) -> Result<()> {
    if payload.len() + ENVELOPE_HEADER_SIZE >= MAX_ENVELOPE_SIZE {
        return Err(Error::Channel(format!(
            "payload of {} bytes exceeds envelope limit",
            payload.len()
        )));
    }
    out.reserve(ENVELOPE_HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    out.extend_from_slice(&[tag as u8]);
    out.extend_from_slice(payload);
    Ok(())
}

/// Reassembles envelopes from a byte stream.
pub struct EnvelopeReader {
    buf: ScratchBuffer,
}

impl Default for EnvelopeReader {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeReader {
    pub fn new() -> Self {
        Self {
            buf: ScratchBuffer::new(MAX_ENVELOPE_SIZE),
        }
    }

    /// Read once from `reader`. `Ok(0)` means EOF (the buffer cannot be full
    /// here, since a full buffer always holds a complete envelope).
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.buf.fill_from(reader)
    }

    /// Append raw bytes, as if they had been read.
    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf
            .extend(bytes)
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Bytes buffered but not yet returned.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete envelope, or `None` if one has not fully arrived.
    ///
    /// A partial envelope is never consumed. The returned payload is valid
    /// until the next call that touches this reader.
    pub fn read(&mut self) -> Result<Option<Envelope<'_>>> {
        let data = self.buf.data();
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Ok(None);
        }
        let size = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if size + ENVELOPE_HEADER_SIZE >= MAX_ENVELOPE_SIZE {
            return Err(Error::Channel(format!("envelope size {size} exceeds limit")));
        }
        let tag = Tag::try_from(data[4])?;
        if data.len() < ENVELOPE_HEADER_SIZE + size {
            return Ok(None);
        }

        let frame = self.buf.split_front(ENVELOPE_HEADER_SIZE + size);
        Ok(Some(Envelope {
            tag,
            payload: &frame[ENVELOPE_HEADER_SIZE..],
        }))
    }
}

/// A freshly created, unbound socket pair.
pub struct Channel {
    left: Endpoint,
    right: Endpoint,
}

impl Channel {
    /// Allocate the connected pair.
    pub fn create() -> io::Result<Self> {
        let (left, right) = UnixStream::pair()?;
        Ok(Self {
            left: Endpoint {
                side: Side::Left,
                stream: left,
            },
            right: Endpoint {
                side: Side::Right,
                stream: right,
            },
        })
    }

    /// Split into `(left, right)` so each side can move to its thread.
    pub fn into_endpoints(self) -> (Endpoint, Endpoint) {
        (self.left, self.right)
    }
}

/// One side of a channel, not yet attached to a reactor.
pub struct Endpoint {
    side: Side,
    stream: UnixStream,
}

impl Endpoint {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Wrap this side in a buffered socket on `reactor`. `handler` receives
    /// every complete envelope in arrival order.
    ///
    /// Envelopes the peer has not yet taken are queued up to the reactor's
    /// watermark; an empty queue always accepts one envelope.
    pub fn bind<H>(self, reactor: &mut Reactor, handler: H) -> io::Result<ChannelSender>
    where
        H: ChannelHandler + 'static,
    {
        let side = self.side;
        let limit = reactor.watermark().max(MAX_ENVELOPE_SIZE);
        let mut sender = None;
        reactor.register_with(
            self.stream,
            Interest::READABLE | Interest::WRITABLE,
            |stream, handle| {
                let stream = Rc::new(stream);
                let outbox = Rc::new(RefCell::new(Outbox {
                    stream: Rc::clone(&stream),
                    pending: BytesMut::new(),
                    limit,
                    closed: false,
                }));
                sender = Some(ChannelSender {
                    side,
                    handle,
                    outbox: Rc::clone(&outbox),
                });
                ChannelEvents {
                    side,
                    handle,
                    stream,
                    reader: EnvelopeReader::new(),
                    outbox,
                    handler,
                }
            },
        )?;
        sender.ok_or_else(|| io::Error::new(io::ErrorKind::Other, "channel bind produced no sender"))
    }
}

/// Receives envelopes arriving on a bound endpoint.
pub trait ChannelHandler {
    fn on_envelope(&mut self, reactor: &mut Reactor, envelope: Envelope<'_>);

    /// The other side went away.
    fn on_closed(&mut self, _reactor: &mut Reactor) {}
}

/// Adapter turning a closure into a [`ChannelHandler`].
pub struct EnvelopeFn<F>(F);

/// Handle envelopes with a closure; the peer closing is ignored.
pub fn envelope_fn<F>(f: F) -> EnvelopeFn<F>
where
    F: FnMut(&mut Reactor, Envelope<'_>),
{
    EnvelopeFn(f)
}

impl<F> ChannelHandler for EnvelopeFn<F>
where
    F: FnMut(&mut Reactor, Envelope<'_>),
{
    fn on_envelope(&mut self, reactor: &mut Reactor, envelope: Envelope<'_>) {
        (self.0)(reactor, envelope)
    }
}

struct Outbox {
    stream: Rc<UnixStream>,
    pending: BytesMut,
    /// Largest backlog `pending` may reach.
    limit: usize,
    closed: bool,
}

impl Outbox {
    fn flush(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match (&*self.stream).write(&self.pending) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.pending.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Write half of a bound endpoint. Cheap to clone; stays on the reactor's
/// thread.
#[derive(Clone)]
pub struct ChannelSender {
    side: Side,
    handle: EventHandle,
    outbox: Rc<RefCell<Outbox>>,
}

impl ChannelSender {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Reactor handle of the bound endpoint.
    pub fn handle(&self) -> EventHandle {
        self.handle
    }

    /// Send one envelope. Envelopes are delivered in write order.
    ///
    /// Fails without queueing anything if the backlog would pass the
    /// watermark.
    pub fn write(&self, tag: Tag, payload: &[u8]) -> Result<()> {
        let mut outbox = self.outbox.borrow_mut();
        if outbox.closed {
            return Err(Error::Channel("channel closed".into()));
        }
        let backlog = outbox.pending.len() + ENVELOPE_HEADER_SIZE + payload.len();
        if backlog > outbox.limit {
            return Err(Error::Channel(format!(
                "channel backlog of {backlog} bytes exceeds watermark {}",
                outbox.limit
            )));
        }
        encode_envelope(tag, payload, &mut outbox.pending)?;
        outbox.flush()?;
        trace!(side = ?self.side, ?tag, len = payload.len(), "Envelope sent");
        Ok(())
    }

    /// Bytes queued behind a full socket.
    pub fn pending(&self) -> usize {
        self.outbox.borrow().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.borrow().closed
    }

    /// Shut the socket down in both directions; the peer observes EOF.
    pub fn close(&self) {
        let mut outbox = self.outbox.borrow_mut();
        if !outbox.closed {
            if let Err(e) = outbox.flush() {
                debug!(
                    side = ?self.side,
                    error = %e,
                    dropped = outbox.pending.len(),
                    "Channel flush on close failed"
                );
            }
            outbox.closed = true;
            let _ = outbox.stream.shutdown(Shutdown::Both);
        }
    }
}

struct ChannelEvents<H> {
    side: Side,
    handle: EventHandle,
    stream: Rc<UnixStream>,
    reader: EnvelopeReader,
    outbox: Rc<RefCell<Outbox>>,
    handler: H,
}

impl<H: ChannelHandler> ChannelEvents<H> {
    fn shutdown(&mut self, reactor: &mut Reactor) {
        self.outbox.borrow_mut().closed = true;
        reactor.unregister(self.handle);
        self.handler.on_closed(reactor);
    }
}

impl<H: ChannelHandler> EventHandler for ChannelEvents<H> {
    fn on_readable(&mut self, reactor: &mut Reactor) {
        loop {
            let mut stream: &UnixStream = &self.stream;
            match self.reader.fill_from(&mut stream) {
                Ok(0) => {
                    debug!(side = ?self.side, "Channel peer closed");
                    return self.shutdown(reactor);
                }
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(side = ?self.side, error = %e, "Channel read failed");
                    return self.shutdown(reactor);
                }
            }

            loop {
                match self.reader.read() {
                    Ok(Some(envelope)) => self.handler.on_envelope(reactor, envelope),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(side = ?self.side, error = %e, "Corrupt channel stream");
                        return self.shutdown(reactor);
                    }
                }
            }
        }
    }

    fn on_writable(&mut self, reactor: &mut Reactor) {
        let result = self.outbox.borrow_mut().flush();
        if let Err(e) = result {
            warn!(side = ?self.side, error = %e, "Channel write failed");
            self.shutdown(reactor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn envelope_bytes(tag: Tag, payload: &[u8]) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode_envelope(tag, payload, &mut out).unwrap();
        out.to_vec()
    }

    #[test]
    fn test_read_waits_for_complete_envelope() {
        let mut reader = EnvelopeReader::new();
        let bytes = envelope_bytes(Tag::Json, br#"{"a":1}"#);

        reader.push(&bytes[..3]).unwrap();
        assert!(reader.read().unwrap().is_none());
        reader.push(&bytes[3..8]).unwrap();
        assert!(reader.read().unwrap().is_none());
        assert_eq!(reader.buffered(), 8);

        reader.push(&bytes[8..]).unwrap();
        let env = reader.read().unwrap().unwrap();
        assert_eq!(env.tag, Tag::Json);
        assert_eq!(env.payload, br#"{"a":1}"#);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_sequence_survives_arbitrary_splits() {
        let messages: Vec<(Tag, Vec<u8>)> = vec![
            (Tag::Text, b"hello".to_vec()),
            (Tag::Binary, vec![0xAB; 3000]),
            (Tag::Json, b"{}".to_vec()),
            (Tag::Binary, Vec::new()),
        ];
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|(tag, p)| envelope_bytes(*tag, p))
            .collect();

        for chunk in [1, 2, 7, 100, 4096] {
            let mut reader = EnvelopeReader::new();
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                reader.push(piece).unwrap();
                while let Some(env) = reader.read().unwrap() {
                    got.push((env.tag, env.payload.to_vec()));
                }
            }
            assert_eq!(got, messages, "chunk size {chunk}");
        }
    }

    #[test]
    fn test_write_rejects_oversized_payload() {
        let mut out = BytesMut::new();
        let limit = MAX_ENVELOPE_SIZE - ENVELOPE_HEADER_SIZE;
        assert!(encode_envelope(Tag::Binary, &vec![0; limit], &mut out).is_err());
        assert!(out.is_empty());
        assert!(encode_envelope(Tag::Binary, &vec![0; limit - 1], &mut out).is_ok());
    }

    #[test]
    fn test_unknown_tag_is_error() {
        let mut reader = EnvelopeReader::new();
        let mut bytes = envelope_bytes(Tag::Text, b"x");
        bytes[4] = 9;
        reader.push(&bytes).unwrap();
        assert!(reader.read().is_err());
    }

    #[test]
    fn test_bound_endpoints_deliver_in_order() {
        let mut reactor = Reactor::new().unwrap();
        let (left, right) = Channel::create().unwrap().into_endpoints();

        let received = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&received);
        let _right = right
            .bind(
                &mut reactor,
                envelope_fn(move |r, env| {
                    sink.borrow_mut().push((env.tag, env.payload.to_vec()));
                    if sink.borrow().len() == 3 {
                        r.stop();
                    }
                }),
            )
            .unwrap();
        let left = left
            .bind(&mut reactor, envelope_fn(|_, _| {}))
            .unwrap();

        left.write(Tag::Text, b"one").unwrap();
        left.write(Tag::Json, b"{\"two\":2}").unwrap();
        left.write(Tag::Binary, &[3u8; 40_000]).unwrap();

        reactor.stop_after(Duration::from_secs(5));
        reactor.run_until_stopped().unwrap();

        let received = received.borrow();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0], (Tag::Text, b"one".to_vec()));
        assert_eq!(received[1], (Tag::Json, b"{\"two\":2}".to_vec()));
        assert_eq!(received[2], (Tag::Binary, vec![3u8; 40_000]));
    }

    #[test]
    fn test_backlog_is_bounded_by_watermark() {
        let mut reactor = Reactor::new().unwrap();
        let (left, right) = Channel::create().unwrap().into_endpoints();
        let left = left
            .bind(&mut reactor, envelope_fn(|_, _| {}))
            .unwrap();
        let limit = reactor.watermark().max(MAX_ENVELOPE_SIZE);

        // Nobody reads the right side until the writer is turned away.
        let payload = vec![5u8; 60_000];
        let mut accepted = 0;
        let rejected = loop {
            match left.write(Tag::Binary, &payload) {
                Ok(()) => accepted += 1,
                Err(e) => break e,
            }
            assert!(accepted < 200, "backlog never hit the watermark");
        };
        assert!(matches!(rejected, Error::Channel(_)));
        assert!(left.pending() <= limit);

        // Everything accepted still arrives intact.
        let received = Rc::new(RefCell::new(0usize));
        let sink = Rc::clone(&received);
        let _right = right
            .bind(
                &mut reactor,
                envelope_fn(move |r, env| {
                    assert_eq!(env.payload.len(), 60_000);
                    *sink.borrow_mut() += 1;
                    if *sink.borrow() == accepted {
                        r.stop();
                    }
                }),
            )
            .unwrap();
        reactor.stop_after(Duration::from_secs(5));
        reactor.run_until_stopped().unwrap();

        assert_eq!(*received.borrow(), accepted);
        assert_eq!(left.pending(), 0);
        assert!(left.write(Tag::Binary, &payload).is_ok());
    }

    #[test]
    fn test_close_with_backlog_after_peer_left() {
        let mut reactor = Reactor::new().unwrap();
        let (left, right) = Channel::create().unwrap().into_endpoints();
        let left = left
            .bind(&mut reactor, envelope_fn(|_, _| {}))
            .unwrap();

        let payload = vec![1u8; 60_000];
        while left.write(Tag::Binary, &payload).is_ok() {}
        assert!(left.pending() > 0);
        drop(right);

        // The failed flush is logged; closing still completes.
        left.close();
        assert!(left.is_closed());
        assert!(left.write(Tag::Text, b"late").is_err());
    }

    #[test]
    fn test_close_is_observed_by_peer() {
        struct Watch(Rc<RefCell<bool>>);
        impl ChannelHandler for Watch {
            fn on_envelope(&mut self, _: &mut Reactor, _: Envelope<'_>) {}
            fn on_closed(&mut self, reactor: &mut Reactor) {
                *self.0.borrow_mut() = true;
                reactor.stop();
            }
        }

        let mut reactor = Reactor::new().unwrap();
        let (left, right) = Channel::create().unwrap().into_endpoints();
        let closed = Rc::new(RefCell::new(false));
        let left_sender = left.bind(&mut reactor, Watch(Rc::clone(&closed))).unwrap();
        let right_sender = right
            .bind(&mut reactor, envelope_fn(|_, _| {}))
            .unwrap();

        right_sender.close();
        assert!(right_sender.write(Tag::Text, b"late").is_err());

        reactor.stop_after(Duration::from_secs(5));
        reactor.run_until_stopped().unwrap();
        assert!(*closed.borrow());
        assert!(left_sender.is_closed());
    }
}
