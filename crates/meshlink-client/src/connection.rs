//! One framed, possibly-TLS-wrapped connection to a single cluster member.
//!
//! Structurally this follows `kimberlite-server`'s `Connection`: a
//! `read_buf`/`write_buf` pair of `BytesMut`, non-blocking reads that loop
//! until `WouldBlock`, and a `try_decode_frame` that hands off complete
//! frames once enough bytes have accumulated. The client side additionally
//! writes the three-byte preamble before any framed traffic, exactly as the
//! source reactor's `AsyncoreConnection` does in its first queued write.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use meshlink_types::MemberId;
use mio::net::TcpStream;
use mio::Interest;
use tracing::{debug, trace};

use meshlink_wire::{Frame, PREAMBLE};

use crate::error::{ClientError, ClientResult};
use crate::tls::TlsSession;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Default socket send/receive buffer size, matching the source reactor's
/// `SNDBUF`/`RCVBUF` override (128000 bytes).
pub const DEFAULT_SOCKET_BUFFER: usize = 128_000;

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsSession>),
}

impl Transport {
    fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(s) => s,
            Transport::Tls(t) => t.socket_mut(),
        }
    }
}

/// A live connection to one cluster member (or, before authentication
/// completes, to a not-yet-identified candidate address).
pub struct Connection {
    pub id: u64,
    pub remote_address: SocketAddr,
    pub local_address: Option<SocketAddr>,
    pub member_id: Option<MemberId>,
    pub start_time: Instant,
    pub last_read_time: Instant,
    pub last_write_time: Instant,
    transport: Transport,
    read_buf: BytesMut,
    write_queue: Mutex<VecDeque<Bytes>>,
    alive: bool,
    preamble_sent: bool,
}

impl Connection {
    pub fn connect_plain(remote_address: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(remote_address)?;
        Ok(Self::from_transport(remote_address, Transport::Plain(stream)))
    }

    pub fn connect_tls(remote_address: SocketAddr, tls: TlsSession) -> io::Result<Self> {
        Ok(Self::from_transport(
            remote_address,
            Transport::Tls(Box::new(tls)),
        ))
    }

    fn from_transport(remote_address: SocketAddr, transport: Transport) -> Self {
        let now = Instant::now();
        let mut conn = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote_address,
            local_address: None,
            member_id: None,
            start_time: now,
            last_read_time: now,
            last_write_time: now,
            transport,
            read_buf: BytesMut::with_capacity(DEFAULT_SOCKET_BUFFER),
            write_queue: Mutex::new(VecDeque::new()),
            alive: true,
            preamble_sent: false,
        };
        conn.local_address = conn.transport.stream_mut().local_addr().ok();
        conn.queue_raw(Bytes::from_static(&PREAMBLE));
        conn
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mio_source(&mut self) -> &mut TcpStream {
        self.transport.stream_mut()
    }

    /// Directly enqueues raw bytes ahead of any framed message -- used only
    /// for the one-time preamble.
    fn queue_raw(&mut self, bytes: Bytes) {
        self.write_queue.lock().unwrap().push_back(bytes);
        self.preamble_sent = true;
    }

    pub fn queue_frame(&mut self, frame: &Frame) -> ClientResult<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf)?;
        self.write_queue.lock().unwrap().push_back(buf.freeze());
        Ok(())
    }

    pub fn interest(&self) -> Interest {
        if self.write_queue.lock().unwrap().is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Drains as much of the write queue as the socket will currently
    /// accept. Returns `Ok(true)` if the queue was fully drained.
    pub fn write(&mut self) -> ClientResult<bool> {
        loop {
            let front = {
                let mut queue = self.write_queue.lock().unwrap();
                match queue.pop_front() {
                    Some(b) => b,
                    None => return Ok(true),
                }
            };
            match self.write_bytes(&front) {
                Ok(written) if written == front.len() => {
                    self.last_write_time = Instant::now();
                }
                Ok(written) => {
                    let remainder = front.slice(written..);
                    self.write_queue.lock().unwrap().push_front(remainder);
                    return Ok(false);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.write_queue.lock().unwrap().push_front(front);
                    return Ok(false);
                }
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }

    fn write_bytes(&mut self, bytes: &Bytes) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(s) => s.write(bytes),
            Transport::Tls(t) => t.write(bytes),
        }
    }

    /// Reads as much as is currently available into `read_buf`. Returns
    /// `Ok(true)` if the connection is still alive, `Ok(false)` if the peer
    /// closed it.
    pub fn read(&mut self) -> ClientResult<bool> {
        let mut scratch = [0u8; 4096];
        loop {
            let n = match self.read_into(&mut scratch) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(e) => return Err(ClientError::Io(e)),
            };
            if n == 0 {
                self.alive = false;
                return Ok(false);
            }
            self.read_buf.extend_from_slice(&scratch[..n]);
            self.last_read_time = Instant::now();
        }
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(t) => t.read(buf),
        }
    }

    /// Pulls every complete frame currently buffered, in arrival order.
    pub fn drain_frames(&mut self) -> ClientResult<Vec<Frame>> {
        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(&mut self.read_buf)? {
            trace!(correlation_id = frame.correlation_id, "decoded inbound frame");
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn close(&mut self) {
        if self.alive {
            debug!(connection_id = self.id, "closing connection");
        }
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    #[test]
    fn new_connection_queues_the_preamble_first() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || listener.accept().unwrap().0);
        let std_stream = StdTcpStream::connect(addr).unwrap();
        let server_stream = accept_thread.join().unwrap();
        drop(server_stream);

        let stream = TcpStream::from_std(std_stream);
        let mut conn = Connection::from_transport(addr, Transport::Plain(stream));
        assert_eq!(conn.write_queue.lock().unwrap().len(), 1);
        assert_eq!(
            conn.write_queue.lock().unwrap().front().unwrap().as_ref(),
            &PREAMBLE
        );
        conn.close();
    }

    #[test]
    fn interest_is_read_only_once_write_queue_drains() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || listener.accept().unwrap());
        let std_stream = StdTcpStream::connect(addr).unwrap();
        let (_server_stream, _) = accept_thread.join().unwrap();

        let stream = TcpStream::from_std(std_stream);
        let mut conn = Connection::from_transport(addr, Transport::Plain(stream));
        assert!(conn.interest().is_writable());
        conn.write_queue.lock().unwrap().clear();
        assert!(!conn.interest().is_writable());
    }
}
