//! The match coordinator: send stimuli on one thread while sniffing for
//! replies on another, and pair them up by fingerprint. This is the core of
//! the `sr`/`sr1`/`srp`/`srp1` family.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::packet::{Packet, PacketSource, Stimulus};
use crate::session::Session;
use crate::socket::{poll_select, SniffEntry, Socket};

/// A post-match termination predicate: checked against every reply as it's
/// matched, independent of `multi`/timeout. Returning `true` ends the round
/// immediately, as if every stimulus had just been answered.
pub type StopFilter<P> = Box<dyn FnMut(&P) -> bool + Send>;

/// Policy for one `sndrcv` invocation.
#[derive(Debug, Clone)]
pub struct SndRcvOptions {
    /// How long to keep listening for replies after the last stimulus was
    /// sent, before giving up on whatever's still outstanding.
    pub timeout: Duration,
    /// Retry budget. `0` disables retrying
    /// entirely. A negative value `-k` puts the coordinator in **autostop**
    /// mode: `k` is the budget, and a round that makes partial progress
    /// (fewer stimuli unanswered than it started with, but not all of
    /// them) resets the budget back to `k` instead of consuming a unit. A
    /// positive value is a plain bounded retry count that decrements every
    /// round regardless of progress — the autostop reset only applies
    /// when the caller passed a negative `retry`.
    pub retry: i32,
    /// Allow more than one reply to match the same stimulus (srp-style
    /// "multi" sniffing) instead of retiring a stimulus on its first match.
    /// `multi` mode never retries: every stimulus is always
    /// eligible for another reply, so "no progress" isn't well-defined.
    pub multi: bool,
    /// Delay between consecutive stimulus sends within a round.
    pub inter: Option<Duration>,
    /// Checked between sends and on every receive-loop tick; set to
    /// request early stop (flood's external-cancellation path, or a
    /// caller-driven interrupt). Distinct from a round's own `timeout`.
    pub stop: Option<Arc<AtomicBool>>,
    /// If `opts.stop` triggers an early stop, propagate `Error::Interrupted`
    /// instead of returning whatever partial result had accumulated so far.
    pub chain_interrupt: bool,
    /// If a stimulus send fails, propagate the error instead of logging it
    /// and aborting the rest of that round's sends.
    pub chain_exceptions: bool,
}

impl Default for SndRcvOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            retry: 0,
            multi: false,
            inter: None,
            stop: None,
            chain_interrupt: false,
            chain_exceptions: false,
        }
    }
}

/// The outcome of a coordinated send/receive: every stimulus/reply pair
/// found, and every stimulus that never got an answer.
///
/// In `multi` mode, `unanswered` deliberately still includes stimuli that
/// *did* receive at least one answer: "remaining" means "still eligible to
/// match another reply", which in multi mode every stimulus always is,
/// matched or not (see DESIGN.md's Open Questions).
pub struct SndRcvResult<P> {
    pub answered: Vec<(P, P)>,
    pub unanswered: Vec<P>,
}

struct SndRcvState<P> {
    table: HashMap<Vec<u8>, Vec<Stimulus<P>>>,
    answered: Vec<(P, P)>,
}

impl<P: Packet> SndRcvState<P> {
    fn new() -> Self {
        Self {
            table: HashMap::new(),
            answered: Vec::new(),
        }
    }

    /// Insert a stimulus under its fingerprint. Must happen before the
    /// corresponding `send()` call returns.
    fn insert(&mut self, packet: P) {
        self.table.entry(packet.hashret()).or_default().push(Stimulus::new(packet));
    }

    /// Try to match `reply` against an outstanding stimulus. Returns true if
    /// it matched (whether or not that stimulus had already been answered
    /// before, in `multi` mode).
    fn try_match(&mut self, reply: &P, multi: bool) -> bool {
        let Some(bucket) = self.table.get_mut(&reply.hashret()) else {
            return false;
        };
        for stim in bucket.iter_mut() {
            if stim.answered && !multi {
                continue;
            }
            if reply.answers(&stim.packet) {
                stim.answered = true;
                self.answered.push((stim.packet.clone(), reply.clone()));
                return true;
            }
        }
        false
    }

    fn unanswered(&self) -> Vec<P> {
        self.table
            .values()
            .flatten()
            .filter(|s| !s.answered)
            .map(|s| s.packet.clone())
            .collect()
    }
}

/// The match coordinator: owns the outstanding table behind a single lock,
/// per the concurrency design's choice to guard table and answered-list
/// together rather than with separate atomics.
///
/// The receive loop in [`run_round`] re-checks `unanswered()` every
/// `poll_select` quantum (at most a few tens of milliseconds), so a plain
/// `Mutex` without a condvar is enough to break out promptly once every
/// stimulus is answered.
struct SndRcv<P> {
    state: Mutex<SndRcvState<P>>,
}

impl<P: Packet> SndRcv<P> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SndRcvState::new()),
        }
    }

    fn insert(&self, packet: P) {
        self.state.lock().expect("sndrcv mutex poisoned").insert(packet);
    }

    fn record_reply(&self, reply: &P, multi: bool) -> bool {
        let mut state = self.state.lock().expect("sndrcv mutex poisoned");
        state.try_match(reply, multi)
    }

    fn unanswered(&self) -> Vec<P> {
        self.state.lock().expect("sndrcv mutex poisoned").unanswered()
    }

    fn into_answered(self) -> Vec<(P, P)> {
        self.state.into_inner().expect("sndrcv mutex poisoned").answered
    }
}

/// Run one round: send every packet `source` yields on `send_socket` while
/// sniffing `recv_entries` for replies (decoded by `session`), stopping once
/// everything is answered, `stop_filter` accepts a reply, or `opts.timeout`
/// has elapsed since the last stimulus was sent (or, for an unbounded
/// `source` such as a flood, once `opts.stop` is set).
///
/// The sender inserts each stimulus into the outstanding table **before**
/// transmitting it, one
/// packet at a time, so `source` never needs to be fully materialized up
/// front — an infinite [`crate::flood::FloodGenerator`] works exactly like
/// a finite `Vec`-backed [`PacketSource`].
fn run_round<P: Packet>(
    send_socket: &mut dyn Socket,
    recv_entries: &mut [SniffEntry],
    source: PacketSource<P>,
    session: &mut dyn Session<P>,
    stop_filter: &mut Option<StopFilter<P>>,
    opts: &SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    let coordinator = SndRcv::new();
    let breakout = opts.stop.clone().unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    // Declared outside `thread::scope` (rather than as a local inside the
    // closure) so its final value is still readable once the scope ends.
    let stopped_by_filter = AtomicBool::new(false);

    let recv_result = thread::scope(|scope| -> Result<()> {
        let coordinator_ref = &coordinator;
        let breakout_ref = &breakout;
        let stopped_by_filter_ref = &stopped_by_filter;
        let inter = opts.inter;
        let chain_exceptions = opts.chain_exceptions;
        let sender = scope.spawn(move || -> Result<()> {
            let mut source = source;
            loop {
                if breakout_ref.load(Ordering::Acquire) || stopped_by_filter_ref.load(Ordering::Acquire) {
                    trace!("sndrcv sender: breakout observed, stopping early");
                    break;
                }
                let Some(packet) = source.next() else {
                    break;
                };
                // Insert before transmit.
                coordinator_ref.insert(packet.clone());
                let frame = packet.build();
                if let Err(e) = send_socket.send(&frame) {
                    if chain_exceptions {
                        return Err(e);
                    }
                    warn!(error = %e, "stimulus send failed, aborting this round's sends");
                    break;
                }
                if let Some(inter) = inter {
                    thread::sleep(inter);
                }
            }
            Ok(())
        });

        let mut warned_once = false;
        let mut deadline: Option<Instant> = None;

        'recv: loop {
            if sender.is_finished() && coordinator.unanswered().is_empty() && !opts.multi {
                break;
            }
            if breakout.load(Ordering::Acquire) && sender.is_finished() {
                break;
            }
            if stopped_by_filter.load(Ordering::Acquire) {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            let send_finished = sender.is_finished();
            if send_finished && deadline.is_none() {
                deadline = Some(Instant::now() + opts.timeout);
            }

            let wait = match deadline {
                Some(d) => d.saturating_duration_since(Instant::now()).min(Duration::from_millis(50)),
                None => Duration::from_millis(50),
            };
            let ready = poll_select(recv_entries, Some(wait), &mut warned_once)?;

            for &idx in &ready {
                if recv_entries[idx].socket.is_control_pipe() {
                    let _ = recv_entries[idx].socket.recv();
                    continue;
                }
                match recv_entries[idx].socket.recv() {
                    Ok(Some(frame)) => {
                        for reply in session.decode(&frame) {
                            if coordinator.record_reply(&reply, opts.multi) {
                                trace!(reply = %reply.summary(), "matched stimulus");
                            }
                            if let Some(filter) = stop_filter.as_mut() {
                                if filter(&reply) {
                                    debug!("sndrcv: stop_filter accepted a reply, ending round early");
                                    stopped_by_filter.store(true, Ordering::Release);
                                    break 'recv;
                                }
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) if e.is_eof() => {
                        debug!(socket = %recv_entries[idx].label, "reply socket reached EOF");
                    }
                    Err(e) => {
                        debug!(socket = %recv_entries[idx].label, error = %e, "transient recv error");
                    }
                }
            }
        }

        match sender.join() {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                debug!("sender thread panicked during sndrcv round");
            }
        }
        Ok(())
    });
    recv_result?;

    if opts.chain_interrupt && breakout.load(Ordering::Acquire) {
        return Err(Error::Interrupted);
    }

    let unanswered = coordinator.unanswered();
    let answered = coordinator.into_answered();
    Ok(SndRcvResult { answered, unanswered })
}

/// Send `source` and match replies, retrying stimuli that went unanswered.
///
/// See [`SndRcvOptions::retry`] for the autostop-vs-plain-retry distinction
/// (resolved in DESIGN.md as OQ-2). `multi` mode
/// never retries: every stimulus is always eligible for another reply, so
/// "remaining" is always the full stimulus set and retrying would spin
/// forever without making the notion of "progress" well-defined.
pub fn sndrcv<P: Packet>(
    send_socket: &mut dyn Socket,
    mut recv_entries: Vec<SniffEntry>,
    source: PacketSource<P>,
    mut session: Box<dyn Session<P>>,
    mut stop_filter: Option<StopFilter<P>>,
    opts: SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    let autostop = opts.retry < 0;
    let mut budget = opts.retry.unsigned_abs();

    // Sockets must be closed whether the rounds below succeed, return a
    // partial result, or error out (an interrupt/send failure propagated
    // via `?` must not leak the receive sockets).
    let outcome = (|| -> Result<SndRcvResult<P>> {
        let first_round = run_round(send_socket, &mut recv_entries, source, session.as_mut(), &mut stop_filter, &opts)?;
        let mut answered = first_round.answered;
        let mut remaining = first_round.unanswered;

        loop {
            if opts.multi || remaining.is_empty() || budget == 0 {
                return Ok(SndRcvResult {
                    answered,
                    unanswered: remaining,
                });
            }

            let before = remaining.len();
            let retry_source = PacketSource::from_vec(remaining);
            let round = run_round(send_socket, &mut recv_entries, retry_source, session.as_mut(), &mut stop_filter, &opts)?;
            answered.extend(round.answered);
            remaining = round.unanswered;

            let progressed = remaining.len() < before;
            if autostop && progressed {
                budget = opts.retry.unsigned_abs();
            } else {
                budget -= 1;
            }
        }
    })();

    for entry in recv_entries.iter_mut() {
        entry.socket.close();
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BytesPacket;
    use crate::session::DefaultSession;
    use crate::socket::{MemorySocket, SniffEntry};

    fn pkt(label: &str, fp: &str) -> BytesPacket {
        BytesPacket::new(label, fp.as_bytes().to_vec(), 0.0).with_payload(label.as_bytes().to_vec())
    }

    fn decode(frame: &[u8]) -> Option<BytesPacket> {
        let label = String::from_utf8_lossy(frame).to_string();
        // A reply shares its stimulus's fingerprint (hashret is commutative
        // across request/response direction); only the `answering` set
        // distinguishes "this is a reply" from "this is another stimulus".
        if let Some(stim_label) = label.strip_prefix("reply-to-") {
            let reply = BytesPacket::new(label.clone(), stim_label.as_bytes().to_vec(), 0.0)
                .answering(stim_label.to_string());
            Some(reply)
        } else {
            Some(BytesPacket::new(label.clone(), label.as_bytes().to_vec(), 0.0))
        }
    }

    #[test]
    fn matches_reply_to_stimulus() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let injector = recv_sock.injector();
        injector.inject(b"reply-to-a".to_vec());

        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert_eq!(result.answered.len(), 1);
        assert!(result.unanswered.is_empty());
    }

    #[test]
    fn unmatched_stimulus_is_reported() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert!(result.answered.is_empty());
        assert_eq!(result.unanswered.len(), 1);
    }

    #[test]
    fn single_answer_mode_dedups_extra_replies() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let injector = recv_sock.injector();
        injector.inject(b"reply-to-a".to_vec());
        injector.inject(b"reply-to-a".to_vec());

        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(150),
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert_eq!(result.answered.len(), 1);
    }

    #[test]
    fn multi_mode_collects_every_reply_and_reports_stimulus_as_remaining() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let injector = recv_sock.injector();
        injector.inject(b"reply-to-a".to_vec());
        injector.inject(b"reply-to-a".to_vec());

        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(150),
            multi: true,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert_eq!(result.answered.len(), 2);
        // OQ-1: multi mode reports every stimulus as "remaining", answered
        // or not, because it's always eligible for another match.
        assert_eq!(result.unanswered.len(), 1);
    }

    #[test]
    fn plain_retry_decrements_even_without_progress() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(20),
            retry: 2,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        // 1 initial round + 2 retries, no progress ever made, then give up.
        assert_eq!(result.unanswered.len(), 1);
        assert!(result.answered.is_empty());
    }

    #[test]
    fn autostop_resets_only_on_partial_progress() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let injector = recv_sock.injector();
        // Only "a" gets answered, on the very first round; "b" never does.
        injector.inject(b"reply-to-a".to_vec());

        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a"), pkt("b", "b")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(20),
            retry: -1,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert_eq!(result.answered.len(), 1);
        assert_eq!(result.unanswered.len(), 1);
        assert_eq!(result.unanswered[0].label, "b");
    }

    /// A socket whose `send` always fails, to exercise `chain_exceptions`.
    struct FailingSocket;

    impl Socket for FailingSocket {
        fn send(&mut self, _frame: &[u8]) -> Result<()> {
            Err(Error::Io(std::io::Error::other("simulated send failure")))
        }
        fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn is_ready(&mut self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn stop_filter_ends_the_round_once_a_reply_is_accepted() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let injector = recv_sock.injector();
        injector.inject(b"reply-to-a".to_vec());

        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let stop_filter: StopFilter<BytesPacket> = Box::new(|reply: &BytesPacket| reply.label == "reply-to-a");

        let start = Instant::now();
        let result = sndrcv(
            &mut send_sock,
            entries,
            source,
            Box::new(DefaultSession::new(decode)),
            Some(stop_filter),
            opts,
        )
        .unwrap();
        assert_eq!(result.answered.len(), 1);
        // Ends as soon as the filter accepts, well under the 500ms timeout.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn chain_interrupt_propagates_error_on_external_stop() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let stop = Arc::new(AtomicBool::new(true));
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(500),
            stop: Some(stop),
            chain_interrupt: true,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts);
        assert!(matches!(result, Err(Error::Interrupted)));
    }

    #[test]
    fn without_chain_interrupt_external_stop_returns_partial_result() {
        let mut send_sock = MemorySocket::new();
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let stop = Arc::new(AtomicBool::new(true));
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(500),
            stop: Some(stop),
            chain_interrupt: false,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert!(result.answered.is_empty());
    }

    #[test]
    fn chain_exceptions_propagates_send_failure() {
        let mut send_sock = FailingSocket;
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(50),
            chain_exceptions: true,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts);
        assert!(result.is_err());
    }

    #[test]
    fn without_chain_exceptions_send_failure_is_absorbed() {
        let mut send_sock = FailingSocket;
        let recv_sock = MemorySocket::new();
        let entries = vec![SniffEntry::new(Box::new(recv_sock), "mem0")];
        let source = PacketSource::from_vec(vec![pkt("a", "a")]);
        let opts = SndRcvOptions {
            timeout: Duration::from_millis(50),
            chain_exceptions: false,
            ..Default::default()
        };

        let result = sndrcv(&mut send_sock, entries, source, Box::new(DefaultSession::new(decode)), None, opts).unwrap();
        assert!(result.answered.is_empty());
        assert_eq!(result.unanswered.len(), 1);
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn sndrcv_state_is_send() {
        assert_send::<SndRcv<BytesPacket>>();
    }
}
