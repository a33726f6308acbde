//! Buffered duplex byte streams.
//!
//! A `BufferedStream` owns one transport plus a bounded read buffer and a
//! bounded write backlog. Reads stop once the read buffer reaches the
//! watermark, leaving further bytes in the kernel so the peer is throttled by
//! the transport itself. Writes go straight to the socket when nothing is
//! queued and spill into the backlog otherwise.

use super::buffer::ScratchBuffer;
use super::tls::SecureStream;
use bytes::{Buf, BytesMut};
use mio::event::Source;
use mio::net::{TcpStream, UdpSocket, UnixStream};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

/// The byte source underneath a connection.
pub enum Transport {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// Connected datagram socket; each read or write is one datagram.
    Udp(UdpSocket),
    Tls(Box<dyn SecureStream>),
}

impl Transport {
    /// Remote address, if the transport has an IP peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(s) => s.peer_addr().ok(),
            Transport::Udp(s) => s.peer_addr().ok(),
            Transport::Unix(_) | Transport::Tls(_) => None,
        }
    }

    /// Pending socket error, used to detect a failed non-blocking connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Transport::Tcp(s) => s.take_error(),
            Transport::Unix(s) => s.take_error(),
            Transport::Udp(s) => s.take_error(),
            Transport::Tls(_) => Ok(None),
        }
    }

    /// Whether an outbound connect has completed.
    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Tcp(s) => s.peer_addr().is_ok(),
            Transport::Unix(s) => s.peer_addr().is_ok(),
            Transport::Udp(_) | Transport::Tls(_) => true,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        match self {
            Transport::Tcp(s) => Some(s.as_raw_fd()),
            Transport::Unix(s) => Some(s.as_raw_fd()),
            Transport::Udp(s) => Some(s.as_raw_fd()),
            Transport::Tls(_) => None,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            Transport::Unix(s) => s.read(buf),
            Transport::Udp(s) => s.recv(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            Transport::Unix(s) => s.write(buf),
            Transport::Udp(s) => s.send(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            Transport::Unix(s) => s.flush(),
            Transport::Udp(_) => Ok(()),
            Transport::Tls(s) => s.flush(),
        }
    }
}

impl Source for Transport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.register(registry, token, interests),
            Transport::Unix(s) => s.register(registry, token, interests),
            Transport::Udp(s) => s.register(registry, token, interests),
            Transport::Tls(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.reregister(registry, token, interests),
            Transport::Unix(s) => s.reregister(registry, token, interests),
            Transport::Udp(s) => s.reregister(registry, token, interests),
            Transport::Tls(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Transport::Tcp(s) => s.deregister(registry),
            Transport::Unix(s) => s.deregister(registry),
            Transport::Udp(s) => s.deregister(registry),
            Transport::Tls(s) => s.deregister(registry),
        }
    }
}

/// Outcome of draining the transport into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    /// Bytes appended by this call.
    pub read: usize,
    /// The peer closed its side.
    pub eof: bool,
}

/// Transport plus bounded read buffer and write backlog.
pub struct BufferedStream {
    transport: Transport,
    input: ScratchBuffer,
    output: BytesMut,
    watermark: usize,
}

impl BufferedStream {
    pub fn new(transport: Transport, watermark: usize) -> Self {
        Self {
            transport,
            input: ScratchBuffer::new(watermark),
            output: BytesMut::new(),
            watermark,
        }
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut Transport {
        &mut self.transport
    }

    /// Buffered, unconsumed input.
    pub fn input(&self) -> &[u8] {
        self.input.data()
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// Drop `n` bytes of consumed input.
    pub fn consume(&mut self, n: usize) {
        self.input.consume(n);
    }

    /// Read buffer reached the watermark.
    pub fn input_full(&self) -> bool {
        self.input.is_full()
    }

    /// Read until the socket would block, the peer closes, or the buffer
    /// reaches the watermark.
    pub fn fill(&mut self) -> io::Result<Fill> {
        let mut fill = Fill {
            read: 0,
            eof: false,
        };
        while !self.input.is_full() {
            match self.input.fill_from(&mut self.transport) {
                // An empty datagram, not end of stream
                Ok(0) if matches!(self.transport, Transport::Udp(_)) => continue,
                Ok(0) => {
                    fill.eof = true;
                    break;
                }
                Ok(n) => {
                    fill.read += n;
                    // One datagram per read; do not merge datagrams
                    if matches!(self.transport, Transport::Udp(_)) {
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(fill)
    }

    /// Bytes queued but not yet accepted by the transport.
    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Write half of the stream.
    pub fn writer(&mut self) -> StreamWriter<'_> {
        StreamWriter {
            transport: &mut self.transport,
            output: &mut self.output,
            watermark: self.watermark,
        }
    }

    /// Buffered input together with the write half, so input can be handed
    /// to code that answers on the same stream.
    pub fn split(&mut self) -> (&[u8], StreamWriter<'_>) {
        (
            self.input.data(),
            StreamWriter {
                transport: &mut self.transport,
                output: &mut self.output,
                watermark: self.watermark,
            },
        )
    }

    /// See [`StreamWriter::write`].
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer().write(data)
    }

    /// See [`StreamWriter::flush`].
    pub fn flush(&mut self) -> io::Result<bool> {
        self.writer().flush()
    }
}

/// Borrowed write half of a [`BufferedStream`].
pub struct StreamWriter<'a> {
    transport: &'a mut Transport,
    output: &'a mut BytesMut,
    watermark: usize,
}

impl StreamWriter<'_> {
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    /// Write `data`, queueing whatever the socket does not take now.
    ///
    /// Fails with `OutOfMemory` if the backlog would pass the watermark.
    pub fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        if self.output.is_empty() {
            loop {
                match self.transport.write(data) {
                    Ok(0) if !data.is_empty() => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"))
                    }
                    Ok(n) => {
                        data = &data[n..];
                        if data.is_empty() {
                            return Ok(());
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        if self.output.len() + data.len() > self.watermark {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "write backlog of {} bytes exceeds watermark {}",
                    self.output.len() + data.len(),
                    self.watermark
                ),
            ));
        }
        self.output.extend_from_slice(data);
        Ok(())
    }

    /// Push the backlog to the transport. Returns `true` once it is empty.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.output.is_empty() {
            match self.transport.write(&self.output[..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => self.output.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match self.transport.flush() {
            Ok(()) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}
