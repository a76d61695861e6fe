//! The flood controller: cycle a packet source indefinitely until told to
//! stop, tracking how many times it has wrapped around.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::packet::Packet;

/// Cycles a fixed set of packets forever, re-cloning them on every lap.
///
/// Unlike [`crate::packet::PacketSource`], which is a one-shot iterator, a
/// flood needs to replay the same packets indefinitely, so the source is
/// materialized once up front.
pub struct FloodGenerator<P> {
    packets: Vec<P>,
    cursor: usize,
    /// How many complete laps have been made. `iterlen` is only meaningful
    /// after the first lap: before that, a caller can't know the total
    /// length without waiting for wrap.
    laps: u64,
    /// Stop once this many laps have completed. `None` means unbounded
    /// (the common case: a flood stopped externally rather than by count).
    max_retries: Option<u64>,
    stop: Arc<AtomicBool>,
    /// Forwarded `sent_time`, set by the sender once it stops drawing from
    /// this generator.
    sent_time: Option<f64>,
}

impl<P: Packet> FloodGenerator<P> {
    /// `packets` must be non-empty; an empty flood would spin immediately
    /// without ever producing anything, which is almost certainly a caller
    /// bug rather than a case worth modeling as `None`.
    pub fn new(packets: Vec<P>, stop: Arc<AtomicBool>) -> Self {
        assert!(!packets.is_empty(), "flood source must have at least one packet");
        Self {
            packets,
            cursor: 0,
            laps: 0,
            max_retries: None,
            stop,
            sent_time: None,
        }
    }

    /// Stop this flood after `n` complete laps even without external stop.
    pub fn with_max_retries(mut self, n: u64) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Number of packets in one lap.
    pub fn lap_len(&self) -> usize {
        self.packets.len()
    }

    /// Length of a single cycle. A caller uses this to compute `notans` for
    /// a flood round.
    pub fn iterlen(&self) -> usize {
        self.packets.len()
    }

    /// Number of complete laps made so far.
    pub fn laps(&self) -> u64 {
        self.laps
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn sent_time(&self) -> Option<f64> {
        self.sent_time
    }

    pub fn set_sent_time(&mut self, t: f64) {
        self.sent_time = Some(t);
    }
}

impl<P: Packet> Iterator for FloodGenerator<P> {
    type Item = P;

    fn next(&mut self) -> Option<P> {
        if self.stop.load(Ordering::Acquire) {
            return None;
        }
        if let Some(max) = self.max_retries {
            if self.laps >= max {
                return None;
            }
        }
        let packet = self.packets[self.cursor].clone();
        self.cursor += 1;
        if self.cursor == self.packets.len() {
            self.cursor = 0;
            self.laps += 1;
        }
        Some(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::BytesPacket;

    fn pkt(label: &str) -> BytesPacket {
        BytesPacket::new(label, label.as_bytes().to_vec(), 0.0)
    }

    #[test]
    fn cycles_through_packets_indefinitely() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = FloodGenerator::new(vec![pkt("a"), pkt("b")], stop);
        let labels: Vec<String> = (0..5).map(|_| flood.next().unwrap().label).collect();
        assert_eq!(labels, vec!["a", "b", "a", "b", "a"]);
    }

    #[test]
    fn tracks_laps_after_first_full_cycle() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = FloodGenerator::new(vec![pkt("a"), pkt("b"), pkt("c")], stop);
        assert_eq!(flood.laps(), 0);
        for _ in 0..3 {
            flood.next();
        }
        assert_eq!(flood.laps(), 1);
        for _ in 0..3 {
            flood.next();
        }
        assert_eq!(flood.laps(), 2);
    }

    #[test]
    fn stops_when_requested() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = FloodGenerator::new(vec![pkt("a")], stop.clone());
        assert!(flood.next().is_some());
        flood.request_stop();
        assert!(flood.next().is_none());
    }

    #[test]
    fn max_retries_stops_without_external_signal() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = FloodGenerator::new(vec![pkt("a"), pkt("b")], stop).with_max_retries(2);
        let collected: Vec<_> = std::iter::from_fn(|| flood.next()).collect();
        assert_eq!(collected.len(), 4);
        assert_eq!(flood.laps(), 2);
    }

    #[test]
    fn stop_is_observable_from_another_handle() {
        let stop = Arc::new(AtomicBool::new(false));
        let mut flood = FloodGenerator::new(vec![pkt("a")], stop.clone());
        stop.store(true, Ordering::Release);
        assert!(flood.next().is_none());
    }
}
