//! The bridge forwarder: relay frames between two sockets, optionally
//! transforming them per direction, while still making every forwarded
//! frame available to a sniff-style callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::socket::{poll_select, SniffEntry, Socket};

/// Per-direction transform applied to a frame before it's forwarded.
/// `None` means "forward unchanged".
pub type Xfrm = Box<dyn FnMut(Vec<u8>) -> Option<Vec<u8>> + Send>;

/// Policy for one [`bridge_and_sniff`] run.
pub struct BridgeOptions {
    /// Applied to frames read from `if1` before they're written to `if2`.
    pub xfrm_1_to_2: Option<Xfrm>,
    /// Applied to frames read from `if2` before they're written to `if1`.
    pub xfrm_2_to_1: Option<Xfrm>,
    /// Called with every frame actually forwarded, labeled by source side.
    pub prn: Option<Box<dyn FnMut(&[u8], BridgeSide) + Send>>,
    pub interrupt: Option<Arc<AtomicBool>>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            xfrm_1_to_2: None,
            xfrm_2_to_1: None,
            prn: None,
            interrupt: None,
        }
    }
}

/// Which bridge leg a forwarded frame originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    First,
    Second,
}

/// Counts of frames forwarded and dropped (by a transform returning `None`)
/// in each direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub forwarded_1_to_2: u64,
    pub forwarded_2_to_1: u64,
    pub dropped_1_to_2: u64,
    pub dropped_2_to_1: u64,
}

/// Forward frames between `if1` and `if2` until `opts.interrupt` is set or
/// either socket reaches end of stream.
///
/// Both interfaces are read concurrently (here, multiplexed through the
/// same `poll_select` the sniffer uses) rather than each on its own
/// blocking thread, so a single stop flag cleanly tears down both
/// directions at once.
pub fn bridge_and_sniff(
    if1: Box<dyn Socket>,
    if2: Box<dyn Socket>,
    mut opts: BridgeOptions,
) -> Result<BridgeStats> {
    let mut entries = vec![SniffEntry::new(if1, "if1"), SniffEntry::new(if2, "if2")];
    let mut stats = BridgeStats::default();
    let mut warned_once = false;

    loop {
        if let Some(flag) = &opts.interrupt {
            if flag.load(Ordering::Acquire) {
                debug!("bridge_and_sniff: interrupt observed");
                break;
            }
        }
        if entries.len() < 2 {
            debug!("bridge_and_sniff: a leg reached end of stream, stopping");
            break;
        }

        let ready = poll_select(&mut entries, Some(std::time::Duration::from_millis(100)), &mut warned_once)?;

        let mut evict = Vec::new();
        for &idx in &ready {
            let other = 1 - idx;
            match entries[idx].socket.recv() {
                Ok(Some(frame)) => {
                    let (side, xfrm, forwarded_counter, dropped_counter): (_, &mut Option<Xfrm>, &mut u64, &mut u64) =
                        if idx == 0 {
                            (
                                BridgeSide::First,
                                &mut opts.xfrm_1_to_2,
                                &mut stats.forwarded_1_to_2,
                                &mut stats.dropped_1_to_2,
                            )
                        } else {
                            (
                                BridgeSide::Second,
                                &mut opts.xfrm_2_to_1,
                                &mut stats.forwarded_2_to_1,
                                &mut stats.dropped_2_to_1,
                            )
                        };

                    let transformed = match xfrm {
                        Some(f) => std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(frame))).unwrap_or_else(|payload| {
                            let msg = payload
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| payload.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "non-string panic payload".to_string());
                            warn!(side = ?side, panic = %msg, "bridge xfrm panicked, dropping frame");
                            None
                        }),
                        None => Some(frame),
                    };

                    match transformed {
                        Some(out_frame) => {
                            if let Some(prn) = opts.prn.as_mut() {
                                prn(&out_frame, side);
                            }
                            match entries[other].socket.send(&out_frame) {
                                Ok(()) => *forwarded_counter += 1,
                                Err(e) => {
                                    warn!(side = ?side, error = %e, "bridge forward send failed, dropping frame");
                                    *dropped_counter += 1;
                                }
                            }
                        }
                        None => {
                            *dropped_counter += 1;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) if e.is_eof() => {
                    debug!(socket = %entries[idx].label, "bridge leg reached EOF");
                    evict.push(idx);
                }
                Err(e) => {
                    warn!(socket = %entries[idx].label, error = %e, "transient recv error on bridge leg");
                }
            }
        }

        for idx in evict.into_iter().rev() {
            entries[idx].socket.close();
            entries.remove(idx);
        }
    }

    for entry in entries.iter_mut() {
        entry.socket.close();
    }

    Ok(stats)
}
