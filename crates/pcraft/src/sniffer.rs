//! The sniffer engine: pull frames off a set of sockets, decode them
//! through a session, and apply filter/stop/count/timeout policy.
//!
//! [`sniff`] runs to completion on the calling thread. [`AsyncSniffer`]
//! spawns the same loop on a background thread and can be asked to stop
//! early, either because the caller set a `stop_filter`/`count`/`timeout`
//! or because something external calls [`AsyncSniffer::stop`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::Session;
use crate::socket::{poll_select, ControlPipe, ControlPipeWaker, SniffEntry};

/// One decoded, matched packet plus which socket produced it.
#[derive(Debug, Clone)]
pub struct Sniffed<P> {
    pub packet: P,
    pub sniffed_on: String,
}

/// Policy and callbacks for one sniff invocation.
///
/// `filter` and `stop_filter` are distinct: a packet rejected by `filter`
/// is never stored, never passed to `prn`, and never counted toward
/// `count`; a packet rejected by `stop_filter` is stored and passed to
/// `prn` as normal, but doesn't trigger early stop (only a match does).
pub struct SnifferConfig<P> {
    pub session: Box<dyn Session<P>>,
    pub filter: Option<Box<dyn FnMut(&P) -> bool + Send>>,
    pub stop_filter: Option<Box<dyn FnMut(&P) -> bool + Send>>,
    pub prn: Option<Box<dyn FnMut(&Sniffed<P>) + Send>>,
    /// Stop once this many packets have passed `filter`. `None` = unbounded.
    pub count: Option<usize>,
    /// Stop after this much wall-clock time has elapsed since the loop
    /// started, regardless of how many packets arrived.
    pub timeout: Option<Duration>,
    /// Keep matched packets in memory and return them from `sniff`/`stop`.
    /// Disable for long-running captures where only `prn` side effects
    /// matter and unbounded memory growth would be a problem.
    pub store: bool,
    /// Called exactly once, after every socket is bound and before the
    /// loop's first `select`. The match coordinator relies on this to
    /// start its sender only once the receive window is open: it passes
    /// the sender's entry point here instead of spawning it ahead of the
    /// sniffer.
    pub started_callback: Option<Box<dyn FnOnce() + Send>>,
}

impl<P> SnifferConfig<P> {
    pub fn new(session: Box<dyn Session<P>>) -> Self {
        Self {
            session,
            filter: None,
            stop_filter: None,
            prn: None,
            count: None,
            timeout: None,
            store: true,
            started_callback: None,
        }
    }
}

/// Run the sniff loop to completion on the calling thread.
///
/// `stop_requested` lets a caller share one flag across threads (used by
/// [`AsyncSniffer`]); pass a fresh `Arc::new(AtomicBool::new(false))` for a
/// plain blocking call that only stops via `count`/`timeout`/`stop_filter`.
pub fn sniff<P>(
    mut sockets: Vec<SniffEntry>,
    mut config: SnifferConfig<P>,
    stop_requested: Arc<AtomicBool>,
) -> Result<Vec<P>> {
    let start = Instant::now();
    let mut results = Vec::new();
    let mut warned_once = false;
    let mut matched_count = 0usize;

    if let Some(started_callback) = config.started_callback.take() {
        started_callback();
    }

    loop {
        if stop_requested.load(Ordering::Acquire) {
            debug!("sniff loop: external stop requested");
            break;
        }
        if let Some(timeout) = config.timeout {
            if start.elapsed() >= timeout {
                debug!("sniff loop: timeout elapsed");
                break;
            }
        }
        if let Some(count) = config.count {
            if matched_count >= count {
                debug!("sniff loop: count quota reached");
                break;
            }
        }
        if sockets.is_empty() {
            debug!("sniff loop: no sockets left");
            break;
        }

        let per_iter_timeout = config
            .timeout
            .map(|t| t.saturating_sub(start.elapsed()))
            .unwrap_or(Duration::from_millis(200))
            .max(Duration::from_millis(1));

        let ready = match poll_select(&mut sockets, Some(per_iter_timeout), &mut warned_once) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "select over sniff socket set failed");
                continue;
            }
        };

        let mut evict = Vec::new();
        for &idx in &ready {
            if sockets[idx].socket.is_control_pipe() {
                let _ = sockets[idx].socket.recv();
                continue;
            }

            match sockets[idx].socket.recv() {
                Ok(Some(frame)) => {
                    let label = sockets[idx].label.clone();
                    for packet in config.session.decode(&frame) {
                        if let Some(filter) = config.filter.as_mut() {
                            if !filter(&packet) {
                                continue;
                            }
                        }

                        matched_count += 1;
                        let sniffed = Sniffed {
                            packet,
                            sniffed_on: label.clone(),
                        };
                        if let Some(prn) = config.prn.as_mut() {
                            prn(&sniffed);
                        }

                        let should_stop = config
                            .stop_filter
                            .as_mut()
                            .map(|f| f(&sniffed.packet))
                            .unwrap_or(false);

                        if config.store {
                            results.push(sniffed.packet);
                        }

                        if should_stop {
                            debug!("sniff loop: stop_filter matched");
                            return Ok(results);
                        }
                        if let Some(count) = config.count {
                            if matched_count >= count {
                                break;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_eof() => {
                    debug!(socket = %sockets[idx].label, "socket reached end of stream, evicting");
                    evict.push(idx);
                }
                Err(e) => {
                    warn!(socket = %sockets[idx].label, error = %e, "transient recv error");
                }
            }
        }

        for idx in evict.into_iter().rev() {
            sockets[idx].socket.close();
            sockets.remove(idx);
        }
    }

    for entry in sockets.iter_mut() {
        entry.socket.close();
    }

    Ok(results)
}

/// A sniffer running on a background thread, stoppable from any other
/// thread.
pub struct AsyncSniffer<P> {
    handle: Option<JoinHandle<Result<Vec<P>>>>,
    stop_requested: Arc<AtomicBool>,
    waker: Option<ControlPipeWaker>,
    running: Arc<Mutex<bool>>,
}

impl<P: Send + 'static> AsyncSniffer<P> {
    /// Start sniffing on a background thread. A [`crate::socket::ControlPipe`]
    /// is added to the socket set automatically so `stop()` can unblock a
    /// blocked `poll()` immediately rather than waiting out the next
    /// iteration's bounded wait.
    pub fn start(mut sockets: Vec<SniffEntry>, config: SnifferConfig<P>) -> Result<Self>
    where
        P: Send,
    {
        let control_pipe = ControlPipe::new()?;
        let waker = control_pipe.waker();
        sockets.push(SniffEntry::new(Box::new(control_pipe), "__control__"));

        let stop_requested = Arc::new(AtomicBool::new(false));
        let running = Arc::new(Mutex::new(true));

        let thread_stop = stop_requested.clone();
        let thread_running = running.clone();
        let handle = std::thread::Builder::new()
            .name("pcraft-sniffer".to_string())
            .spawn(move || {
                let result = sniff(sockets, config, thread_stop);
                *thread_running.lock().expect("running mutex poisoned") = false;
                result
            })
            .map_err(Error::Io)?;

        Ok(Self {
            handle: Some(handle),
            stop_requested,
            waker: Some(waker),
            running,
        })
    }

    /// True if the background thread is still collecting packets.
    pub fn is_running(&self) -> bool {
        *self.running.lock().expect("running mutex poisoned")
    }

    /// Ask the sniffer to stop, wake its blocked poll, and join the thread.
    pub fn stop(mut self) -> Result<Vec<P>> {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
        self.join()
    }

    /// Wait for the sniffer to finish on its own (count/timeout/stop_filter)
    /// without requesting early stop.
    pub fn join(mut self) -> Result<Vec<P>> {
        let handle = self.handle.take().expect("join called twice");
        match handle.join() {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(Error::SnifferPanicked(msg))
            }
        }
    }
}

impl<P> Drop for AsyncSniffer<P> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop_requested.store(true, Ordering::Release);
            if let Some(waker) = self.waker.take() {
                waker.wake();
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BytesPacket;
    use crate::session::DefaultSession;
    use crate::socket::MemorySocket;

    fn decode_bytes_packet(frame: &[u8]) -> Option<BytesPacket> {
        if frame.is_empty() {
            return None;
        }
        Some(BytesPacket::new(
            format!("pkt-{}", frame[0]),
            vec![frame[0]],
            0.0,
        ))
    }

    #[test]
    fn sniff_collects_until_eof() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![1]);
        injector.inject(vec![2]);
        sock.close_for_reading();

        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));
        let results = sniff(entries, config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn sniff_honors_count() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        for b in [1u8, 2, 3, 4] {
            injector.inject(vec![b]);
        }

        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let mut config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));
        config.count = Some(2);
        let results = sniff(entries, config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn sniff_filter_excludes_from_store_and_count() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![1]);
        injector.inject(vec![2]);
        sock.close_for_reading();

        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let mut config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));
        config.filter = Some(Box::new(|p: &BytesPacket| p.label == "pkt-2"));
        let results = sniff(entries, config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "pkt-2");
    }

    #[test]
    fn sniff_stop_filter_ends_early_and_keeps_match() {
        let mut sock = MemorySocket::new();
        let injector = sock.injector();
        injector.inject(vec![1]);
        injector.inject(vec![2]);
        injector.inject(vec![3]);

        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let mut config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));
        config.stop_filter = Some(Box::new(|p: &BytesPacket| p.label == "pkt-2"));
        let results = sniff(entries, config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].label, "pkt-2");
    }

    #[test]
    fn async_sniffer_stop_returns_collected_packets() {
        let sock = MemorySocket::new();
        let injector = sock.injector();
        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));

        let sniffer = AsyncSniffer::start(entries, config).unwrap();
        injector.inject(vec![7]);
        std::thread::sleep(Duration::from_millis(50));
        let results = sniffer.stop().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "pkt-7");
    }

    #[test]
    fn started_callback_runs_before_sockets_are_read() {
        let sock = MemorySocket::new();
        let injector = sock.injector();
        let entries = vec![SniffEntry::new(Box::new(sock), "mem0")];
        let mut config = SnifferConfig::new(Box::new(DefaultSession::new(decode_bytes_packet)));
        config.count = Some(1);
        config.timeout = Some(Duration::from_millis(100));
        config.started_callback = Some(Box::new(move || injector.inject(vec![9])));

        let results = sniff(entries, config, Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].label, "pkt-9");
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn async_sniffer_is_send() {
        assert_send::<AsyncSniffer<BytesPacket>>();
    }
}
