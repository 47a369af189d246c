//! Non-blocking byte-stream sockets.
//!
//! The frame helpers never block: every call either makes progress or
//! returns [`io::ErrorKind::WouldBlock`]. [`TcpSocket`] adapts a std TCP
//! stream to that contract; [`MemorySocket`] is an in-process stand-in with
//! knobs for chunked reads, a limited write window and injected failures.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;

/// A non-blocking, connected byte stream.
pub trait Socket: Send {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `buf`.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Write some prefix of the concatenation of `bufs`.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Toggle non-blocking mode.
    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()>;

    /// Toggle `TCP_NODELAY`.
    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()>;

    /// Shut down one or both halves of the stream.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Release the underlying descriptor. Later calls fail with `NotConnected`.
    fn close(&mut self) -> io::Result<()>;

    /// Printable peer address.
    fn peer_name(&self) -> String;
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// [`Socket`] over a std [`TcpStream`].
#[derive(Debug)]
pub struct TcpSocket {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpSocket {
    /// Wrap an accepted stream. The peer address is captured now so it stays
    /// printable after the stream is closed.
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| String::from("unknown"));
        Self {
            stream: Some(stream),
            peer,
        }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream()?.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream()?.write_vectored(bufs)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        self.stream()?.set_nonblocking(nonblocking)
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.stream()?.set_nodelay(nodelay)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.stream()?.shutdown(how)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(stream) => {
                // Shutdown tells the peer immediately even if a clone of the fd lingers.
                let _ = stream.shutdown(Shutdown::Both);
                Ok(())
            }
            None => Err(not_connected()),
        }
    }

    fn peer_name(&self) -> String {
        self.peer.clone()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    read_chunk: Option<usize>,
    write_budget: Option<usize>,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    remote_closed: bool,
    closed: bool,
    shutdown: Option<Shutdown>,
    nonblocking: bool,
    nodelay: bool,
}

impl MemoryState {
    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(not_connected())
        } else {
            Ok(())
        }
    }

    fn accept_write(&mut self, bytes: &[u8]) -> usize {
        let n = match self.write_budget {
            Some(budget) => bytes.len().min(budget),
            None => bytes.len(),
        };
        self.tx.extend_from_slice(&bytes[..n]);
        if let Some(budget) = self.write_budget.as_mut() {
            *budget -= n;
        }
        n
    }

    fn write_blocked(&self) -> bool {
        self.write_budget == Some(0)
    }
}

/// In-process [`Socket`] whose far end is driven through a [`MemoryPeer`].
#[derive(Debug)]
pub struct MemorySocket {
    state: Arc<Mutex<MemoryState>>,
    peer: String,
}

/// The test-side end of a [`MemorySocket`].
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySocket {
    /// Create a connected socket and the handle that controls its far end.
    pub fn new(peer: impl Into<String>) -> (Self, MemoryPeer) {
        let state = Arc::new(Mutex::new(MemoryState::default()));
        (
            Self {
                state: Arc::clone(&state),
                peer: peer.into(),
            },
            MemoryPeer { state },
        )
    }
}

impl Socket for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(kind) = state.read_error {
            return Err(kind.into());
        }
        if state.rx.is_empty() {
            if state.remote_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let limit = state.read_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(state.rx.len()).min(limit);
        for (dst, src) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writev(&[IoSlice::new(buf)])
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.check_open()?;
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if state.write_blocked() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut total = 0;
        for buf in bufs {
            let n = state.accept_write(buf);
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.nonblocking = nonblocking;
        Ok(())
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.nodelay = nodelay;
        Ok(())
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.shutdown = Some(how);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.closed = true;
        Ok(())
    }

    fn peer_name(&self) -> String {
        self.peer.clone()
    }
}

impl MemoryPeer {
    /// Queue bytes for the socket to read.
    pub fn send(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes);
    }

    /// Take everything the socket has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().tx)
    }

    /// Bytes queued for reading that the socket has not consumed yet.
    pub fn pending_rx(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Cap every read at `chunk` bytes.
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.state.lock().read_chunk = chunk;
    }

    /// Accept at most `budget` more written bytes before reporting `WouldBlock`.
    /// `None` removes the limit.
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.lock().write_budget = budget;
    }

    /// Make every read fail with `kind`.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.state.lock().read_error = Some(kind);
    }

    /// Make every write fail with `kind`.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.lock().write_error = Some(kind);
    }

    /// Signal end-of-stream once the queued bytes are consumed.
    pub fn close_remote(&self) {
        self.state.lock().remote_closed = true;
    }

    /// Whether the socket side called [`Socket::close`].
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// The last shutdown mode requested by the socket side.
    pub fn shutdown_mode(&self) -> Option<Shutdown> {
        self.state.lock().shutdown
    }

    /// Whether the socket side enabled non-blocking mode and `TCP_NODELAY`.
    pub fn is_configured(&self) -> bool {
        let state = self.state.lock();
        state.nonblocking && state.nodelay
    }
}
