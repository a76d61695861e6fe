//! The loop controller: repeat a `sndrcv` round at a steady cadence,
//! accumulating results across iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A decode function shared across every iteration of a [`sr_loop`] run.
pub type SharedDecode<P> = Arc<dyn Fn(&[u8]) -> Option<P> + Send + Sync>;

use tracing::info;

use crate::error::Result;
use crate::packet::{Packet, PacketSource};
use crate::session::DefaultSession;
use crate::sndrcv::{sndrcv, SndRcvOptions, SndRcvResult};
use crate::socket::{Socket, SniffEntry};

/// Policy for a [`sr_loop`] run.
pub struct LoopOptions {
    /// Number of iterations to run. `None` loops until `interrupt` fires.
    pub count: Option<u32>,
    /// Delay between the end of one iteration's `sndrcv` and the start of
    /// the next.
    pub inter: Duration,
    /// Per-iteration `sndrcv` policy (timeout/retry/multi).
    pub sndrcv: SndRcvOptions,
    /// Checked between iterations; set to stop early.
    pub interrupt: Option<Arc<AtomicBool>>,
}

/// Default per-iteration `sndrcv` timeout when a caller picks `inter` but
/// leaves `sndrcv.timeout` at its default: `min(2 * inter, 5s)`, so a slow
/// loop cadence gets a proportionally longer listen window without ever
/// outrunning a sensible upper bound.
pub fn default_loop_timeout(inter: Duration) -> Duration {
    (inter * 2).min(Duration::from_secs(5))
}

impl Default for LoopOptions {
    fn default() -> Self {
        let inter = Duration::from_secs(1);
        Self {
            count: None,
            inter,
            sndrcv: SndRcvOptions {
                timeout: default_loop_timeout(inter),
                ..SndRcvOptions::default()
            },
            interrupt: None,
        }
    }
}

/// Accumulated results across every iteration of a [`sr_loop`] run.
pub struct LoopResult<P> {
    pub iterations: u32,
    pub answered: Vec<(P, P)>,
    pub unanswered: Vec<P>,
}

/// Repeatedly build a fresh stimulus set and socket pair, run `sndrcv`
/// against them, and accumulate the results, sleeping `opts.inter` between
/// rounds.
///
/// Sockets are rebuilt every iteration (via `mk_send_socket`/`mk_recv_entries`)
/// rather than reused, because [`sndrcv`] takes ownership of the receive
/// sockets and closes them once its retry budget is exhausted.
pub fn sr_loop<P, StimF, MkSend, MkRecv>(
    mut mk_send_socket: MkSend,
    mut mk_recv_entries: MkRecv,
    mut stimuli_factory: StimF,
    decode: SharedDecode<P>,
    opts: LoopOptions,
) -> Result<LoopResult<P>>
where
    P: Packet,
    StimF: FnMut() -> Vec<P>,
    MkSend: FnMut() -> Box<dyn Socket>,
    MkRecv: FnMut() -> Vec<SniffEntry>,
{
    let mut answered = Vec::new();
    let mut unanswered = Vec::new();
    let mut iterations = 0u32;

    loop {
        if let Some(count) = opts.count {
            if iterations >= count {
                break;
            }
        }
        if let Some(flag) = &opts.interrupt {
            if flag.load(Ordering::Acquire) {
                info!(iterations, "sr_loop: interrupt observed");
                break;
            }
        }

        let mut send_socket = mk_send_socket();
        let recv_entries = mk_recv_entries();
        let stimuli = stimuli_factory();
        let source = PacketSource::from_vec(stimuli);

        let SndRcvResult {
            answered: round_answered,
            unanswered: round_unanswered,
        } = sndrcv(
            send_socket.as_mut(),
            recv_entries,
            source,
            Box::new(DefaultSession::new(decode_for_round(&decode))),
            None,
            opts.sndrcv.clone(),
        )?;

        answered.extend(round_answered);
        unanswered.extend(round_unanswered);
        iterations += 1;

        info!(iterations, answered = answered.len(), "sr_loop: iteration complete");

        let should_continue = match opts.count {
            Some(count) => iterations < count,
            None => true,
        };
        if should_continue {
            let deadline = Instant::now() + opts.inter;
            while Instant::now() < deadline {
                if let Some(flag) = &opts.interrupt {
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(10).min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }

    Ok(LoopResult {
        iterations,
        answered,
        unanswered,
    })
}

/// `sndrcv` takes the decode closure as an owned `Box` per call. Callers of
/// `sr_loop` hand in one long-lived `Arc`-shared closure reused across every
/// iteration, so each round gets a thin forwarding `Box` instead of
/// requiring the closure itself to be `Clone`.
fn decode_for_round<P: Packet>(decode: &SharedDecode<P>) -> Box<dyn Fn(&[u8]) -> Option<P> + Send + Sync> {
    let decode = decode.clone();
    Box::new(move |frame| decode(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BytesPacket;
    use crate::socket::MemorySocket;
    use std::sync::Arc;

    fn pkt(label: &str) -> BytesPacket {
        BytesPacket::new(label, label.as_bytes().to_vec(), 0.0).with_payload(label.as_bytes().to_vec())
    }

    fn decode(frame: &[u8]) -> Option<BytesPacket> {
        let label = String::from_utf8_lossy(frame).to_string();
        if let Some(stim) = label.strip_prefix("reply-to-") {
            Some(BytesPacket::new(label.clone(), stim.as_bytes().to_vec(), 0.0).answering(stim.to_string()))
        } else {
            Some(BytesPacket::new(label.clone(), label.as_bytes().to_vec(), 0.0))
        }
    }

    #[test]
    fn runs_fixed_number_of_iterations() {
        let decode: SharedDecode<BytesPacket> = Arc::new(decode);
        let opts = LoopOptions {
            count: Some(3),
            inter: Duration::from_millis(1),
            sndrcv: SndRcvOptions {
                timeout: Duration::from_millis(20),
                ..Default::default()
            },
            interrupt: None,
        };

        let result = sr_loop(
            || Box::new(MemorySocket::new()) as Box<dyn Socket>,
            || vec![crate::socket::SniffEntry::new(Box::new(MemorySocket::new()), "mem0")],
            || vec![pkt("a")],
            decode,
            opts,
        )
        .unwrap();

        assert_eq!(result.iterations, 3);
        assert_eq!(result.unanswered.len(), 3);
    }
}
