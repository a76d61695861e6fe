//! The socket capability: abstract send/recv/select/close over
//! heterogeneous backends (live L2, live L3, offline pcap, in-memory, and
//! the control pipe used to unblock a blocked sniff loop).
//!
//! Raw socket construction, BPF filter application, and L2/L3 framing are
//! treated as an external capability rather than a concern of this engine:
//! it only needs the trait below. The concrete backends here exist so the
//! crate's own tests and CLI binaries have something real to drive.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};

/// A send/recv/close capability over some underlying transport.
///
/// Implementations that can't expose a pollable file descriptor (most
/// notably [`MemorySocket`] and the pnet-backed live sockets, which hide
/// their fd behind a cross-platform abstraction) implement [`is_ready`]
/// instead; see [`poll_select`].
///
/// [`is_ready`]: Socket::is_ready
pub trait Socket: Send {
    /// Send a single frame.
    fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Receive a single frame.
    ///
    /// `Ok(None)` means "no data available right now" (only meaningful for
    /// sockets polled directly rather than through [`poll_select`]).
    /// `Err(Error::Eof)` signals end of stream (caller should evict this
    /// socket). Any other `Err` is a transient failure.
    fn recv(&mut self) -> Result<Option<Vec<u8>>>;

    /// A pollable file descriptor, if this backend has one.
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    /// Cheap readiness check used when `raw_fd()` is `None`.
    fn is_ready(&mut self) -> Result<bool>;

    /// True if `send`/`recv` never block.
    fn nonblocking(&self) -> bool {
        false
    }

    /// Interface name this socket is bound to, if any.
    fn iface(&self) -> Option<&str> {
        None
    }

    /// Release any underlying resources. Called by the sniffer on every
    /// exit path once a socket is evicted.
    fn close(&mut self) {}

    /// True for the distinguished control pipe the sniffer installs to
    /// unblock a blocking wait on external stop. The main loop special-cases
    /// readiness on this socket: it short-circuits the ready batch rather
    /// than decoding it as a packet.
    fn is_control_pipe(&self) -> bool {
        false
    }
}

/// One entry in a sniffer's socket set: a socket paired with the label
/// attached to every packet it produces (`sniffed_on`).
pub struct SniffEntry {
    pub socket: Box<dyn Socket>,
    pub label: String,
}

impl SniffEntry {
    pub fn new(socket: Box<dyn Socket>, label: impl Into<String>) -> Self {
        Self {
            socket,
            label: label.into(),
        }
    }
}

/// Result of a [`poll_select`] call: indices into the entry slice that are
/// ready to read.
pub type ReadySet = Vec<usize>;

/// Multiplex reads across a heterogeneous set of sockets.
///
/// If every entry exposes a `raw_fd`, this uses `libc::poll`. Otherwise it
/// falls back to a short busy-poll loop over `is_ready()`, which is the
/// common case for the pnet-backed live sockets in this crate (their fd is
/// hidden behind a cross-platform abstraction). If the sockets in one set
/// don't share a single `select` implementation, this warns once and
/// proceeds using the first socket's.
pub fn poll_select(
    entries: &mut [SniffEntry],
    timeout: Option<Duration>,
    warned_once: &mut bool,
) -> Result<ReadySet> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let all_fd = entries.iter().all(|e| e.socket.raw_fd().is_some());
    let none_fd = entries.iter().all(|e| e.socket.raw_fd().is_none());

    if !all_fd && !none_fd && !*warned_once {
        warn!(
            "inconsistent socket types in sniff set: some expose a pollable \
             fd and some don't; falling back to busy-poll readiness checks \
             for all of them"
        );
        *warned_once = true;
    }

    if all_fd {
        poll_select_fd(entries, timeout)
    } else {
        poll_select_busy(entries, timeout)
    }
}

fn poll_select_fd(entries: &[SniffEntry], timeout: Option<Duration>) -> Result<ReadySet> {
    let mut pollfds: Vec<libc::pollfd> = entries
        .iter()
        .map(|e| libc::pollfd {
            fd: e.socket.raw_fd().expect("checked by caller"),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = match timeout {
        Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        None => -1,
    };

    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(Error::Io(err));
    }

    Ok(pollfds
        .iter()
        .enumerate()
        .filter(|(_, pfd)| pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .map(|(i, _)| i)
        .collect())
}

/// Busy-poll quantum for backends without a pollable fd. Short enough that
/// a `stop()` or deadline is noticed promptly, long enough to not spin a
/// full core while idle.
const BUSY_POLL_QUANTUM: Duration = Duration::from_millis(10);

fn poll_select_busy(entries: &mut [SniffEntry], timeout: Option<Duration>) -> Result<ReadySet> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut ready = Vec::new();
        for (i, entry) in entries.iter_mut().enumerate() {
            if entry.socket.is_ready()? {
                ready.push(i);
            }
        }
        if !ready.is_empty() {
            return Ok(ready);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
        }
        std::thread::sleep(BUSY_POLL_QUANTUM);
    }
}

// ===========================================================================
// Control pipe
// ===========================================================================

/// A select-readable object whose sole purpose is to unblock a blocked
/// sniff loop when external stop is requested.
///
/// Backed by a real `pipe(2)`: writing the sentinel byte makes the read end
/// pollable, which is what lets [`poll_select_fd`] wake up immediately
/// instead of waiting out the busy-poll quantum.
pub struct ControlPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ControlPipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// A cloneable handle that can wake this pipe's sniffer from another
    /// thread.
    pub fn waker(&self) -> ControlPipeWaker {
        ControlPipeWaker {
            write_fd: self.write_fd,
        }
    }
}

impl Socket for ControlPipe {
    fn send(&mut self, _frame: &[u8]) -> Result<()> {
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, 1) };
        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(None)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.read_fd)
    }

    fn is_ready(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn is_control_pipe(&self) -> bool {
        true
    }

    fn close(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// A handle used to wake a [`ControlPipe`] from another thread.
#[derive(Clone, Copy)]
pub struct ControlPipeWaker {
    write_fd: RawFd,
}

// SAFETY: writing a single byte to a pipe fd is async-signal-safe and the
// fd outlives the waker for the lifetime of one sniff invocation.
unsafe impl Send for ControlPipeWaker {}
unsafe impl Sync for ControlPipeWaker {}

impl ControlPipeWaker {
    /// Write a sentinel byte, unblocking any `poll()` waiting on the read end.
    pub fn wake(&self) {
        let byte = [0u8];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const _, 1);
        }
    }
}

// ===========================================================================
// In-memory socket (tests, and genuinely in-memory packet sources)
// ===========================================================================

/// A socket backed by an in-process queue: frames are injected with
/// [`MemorySocket::inject`] and consumed by `recv()`. Used as the "faithful
/// stub socket" for the coordinator's property tests and as a real backend
/// for fully in-memory pipelines (e.g. replaying an already-parsed capture).
pub struct MemorySocket {
    inbox: std::sync::mpsc::Receiver<Vec<u8>>,
    inbox_tx: std::sync::mpsc::Sender<Vec<u8>>,
    outbox: Vec<Vec<u8>>,
    /// A frame pulled out of `inbox` by `is_ready()` but not yet handed to
    /// the caller, mirroring how the live socket backends reconcile a
    /// consuming readiness check with a separate `recv()` call.
    pending: Option<Vec<u8>>,
    eof: bool,
}

impl MemorySocket {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        Self {
            inbox: rx,
            inbox_tx: tx,
            outbox: Vec::new(),
            pending: None,
            eof: false,
        }
    }

    /// A handle that can inject frames into this socket's recv queue from
    /// another thread (used by stub test harnesses to simulate replies).
    pub fn injector(&self) -> MemorySocketInjector {
        MemorySocketInjector {
            tx: self.inbox_tx.clone(),
        }
    }

    /// Mark the queue as exhausted: further `recv()` calls return `Eof`
    /// once buffered frames are drained.
    pub fn close_for_reading(&mut self) {
        self.eof = true;
    }

    /// Frames that were `send()`-ed through this socket, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.outbox
    }
}

impl Default for MemorySocket {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct MemorySocketInjector {
    tx: std::sync::mpsc::Sender<Vec<u8>>,
}

impl MemorySocketInjector {
    pub fn inject(&self, frame: Vec<u8>) {
        // The receiver only disappears when the socket is dropped; a failed
        // send past that point is inert for a test harness.
        let _ = self.tx.send(frame);
    }
}

impl Socket for MemorySocket {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.outbox.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        match self.inbox.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(std::sync::mpsc::TryRecvError::Empty) => {
                if self.eof {
                    Err(Error::Eof)
                } else {
                    Ok(None)
                }
            }
            Err(std::sync::mpsc::TryRecvError::Disconnected) => Err(Error::Eof),
        }
    }

    fn is_ready(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        match self.inbox.try_recv() {
            Ok(frame) => {
                self.pending = Some(frame);
                Ok(true)
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => Ok(self.eof),
            Err(std::sync::mpsc::TryRecvError::Disconnected) => Ok(true),
        }
    }

    fn nonblocking(&self) -> bool {
        true
    }
}

pub mod pcap_file;
pub mod live;

pub use live::{EthernetSocket, IpSocket};
pub use pcap_file::PcapFileSocket;

/// Interface names known to the local machine, for CLI validation and
/// error messages during interface selection.
pub fn list_interfaces() -> Vec<String> {
    pnet::datalink::interfaces()
        .into_iter()
        .map(|i| i.name)
        .collect()
}

/// Look up a network interface by name.
pub fn resolve_iface(name: &str) -> Result<pnet::datalink::NetworkInterface> {
    pnet::datalink::interfaces()
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| Error::InterfaceNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_socket_round_trips_injected_frames() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![1, 2, 3]);
        assert_eq!(sock.recv().unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(sock.recv().unwrap(), None);
    }

    #[test]
    fn memory_socket_eof_after_close_and_drain() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![9]);
        sock.close_for_reading();
        assert_eq!(sock.recv().unwrap(), Some(vec![9]));
        assert!(matches!(sock.recv(), Err(Error::Eof)));
    }

    #[test]
    fn memory_socket_is_ready_does_not_discard_the_frame() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![5, 6]);
        assert!(sock.is_ready().unwrap());
        assert_eq!(sock.recv().unwrap(), Some(vec![5, 6]));
    }

    #[test]
    fn memory_socket_records_sent_frames() {
        let mut sock = MemorySocket::new();
        sock.send(&[1, 2]).unwrap();
        sock.send(&[3]).unwrap();
        assert_eq!(sock.sent(), &[vec![1, 2], vec![3]]);
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn socket_impls_are_send() {
        assert_send::<MemorySocket>();
        assert_send::<ControlPipe>();
    }
}
