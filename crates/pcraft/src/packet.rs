//! The packet capability: the minimal contract the coordination engine
//! needs from whatever packet-layer model a caller brings.
//!
//! `pcraft` never parses or dissects protocols itself (see crate-level
//! Non-goals); any type implementing [`Packet`] is accepted. [`BytesPacket`]
//! is a test double used throughout this crate's own test suite, and
//! [`crate::icmp::IcmpEchoPacket`] is a minimal real implementation used by
//! the `pcraft-send` CLI.

use std::fmt;

/// Routing hint returned by [`Packet::route`]: which interface and
/// source/destination a packet would take, used by interface selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteHint {
    /// Outgoing interface name, if known ahead of a routing lookup.
    pub iface: Option<String>,
    /// Source address as text (IPv4 or IPv6).
    pub src: Option<String>,
    /// Destination address as text (IPv4 or IPv6).
    pub dst: Option<String>,
}

/// A packet (stimulus or reply) that the coordination engine can send,
/// sniff, and match.
///
/// Implementors are typically cheap-to-clone value types; the engine clones
/// stimuli into the outstanding table before sending them — a stimulus is
/// recorded before the send call that emits it returns.
pub trait Packet: Clone + Send + 'static {
    /// A fingerprint shared by a stimulus and its reply, used as a
    /// first-pass index. Commutative across request/response direction.
    fn hashret(&self) -> Vec<u8>;

    /// Deep check: is `self` a reply to `stimulus`? Only called for
    /// packets that already share a `hashret()` bucket.
    fn answers(&self, stimulus: &Self) -> bool;

    /// Routing hint used by interface selection.
    fn route(&self) -> RouteHint {
        RouteHint::default()
    }

    /// Capture/creation timestamp, seconds since an arbitrary monotonic
    /// origin.
    fn time(&self) -> f64;

    /// Serialize to the wire bytes a [`crate::socket::Socket`] should send.
    fn build(&self) -> Vec<u8>;

    /// Diagnostic one-line description.
    fn summary(&self) -> String;
}

/// A stimulus that has been inserted into the outstanding table.
///
/// `answered` is a statically-typed flag carried by the table entry itself
/// rather than a sentinel attached to the packet.
#[derive(Debug, Clone)]
pub struct Stimulus<P> {
    pub packet: P,
    pub answered: bool,
}

impl<P> Stimulus<P> {
    pub fn new(packet: P) -> Self {
        Self {
            packet,
            answered: false,
        }
    }
}

/// A lazily-iterated, possibly-infinite source of packets to send.
///
/// A single packet, a concrete sequence, or a true generator are all
/// normalized to the same shape. `sent_time` lives on the source itself
/// (not on each packet) so it can be propagated from the last packet
/// actually transmitted.
pub struct PacketSource<P> {
    iter: Box<dyn Iterator<Item = P> + Send>,
    sent_time: Option<f64>,
}

impl<P: 'static> PacketSource<P> {
    /// Wrap a single packet as a one-element source.
    pub fn once(packet: P) -> Self {
        Self::from_iter(std::iter::once(packet))
    }

    /// Wrap a concrete, already-materialized sequence.
    pub fn from_vec(packets: Vec<P>) -> Self {
        Self::from_iter(packets.into_iter())
    }

    /// Wrap an arbitrary (possibly infinite) iterator.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: Iterator<Item = P> + Send + 'static,
    {
        Self {
            iter: Box::new(iter),
            sent_time: None,
        }
    }

    /// Materialize the whole source eagerly (the `prebuild` option).
    pub fn prebuild(self) -> Self {
        let sent_time = self.sent_time;
        let items: Vec<P> = self.iter.collect();
        Self {
            iter: Box::new(items.into_iter()),
            sent_time,
        }
    }

    pub fn sent_time(&self) -> Option<f64> {
        self.sent_time
    }

    pub fn set_sent_time(&mut self, t: f64) {
        self.sent_time = Some(t);
    }
}

impl<P> Iterator for PacketSource<P> {
    type Item = P;

    fn next(&mut self) -> Option<P> {
        self.iter.next()
    }
}

impl<P> fmt::Debug for PacketSource<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSource")
            .field("sent_time", &self.sent_time)
            .finish_non_exhaustive()
    }
}

/// A minimal [`Packet`] implementation used as a test double: an opaque
/// payload plus an explicit, caller-supplied fingerprint and a closure
/// deciding the `answers` relation. Paired with
/// [`crate::socket::MemorySocket`], it's enough to drive the match
/// coordinator's property tests end to end.
#[derive(Clone)]
pub struct BytesPacket {
    pub label: String,
    pub fingerprint: Vec<u8>,
    pub payload: Vec<u8>,
    pub time: f64,
    /// Fingerprints this packet answers, by label. A reply `answers` a
    /// stimulus if the stimulus's label is in this set.
    answers_labels: Vec<String>,
}

impl BytesPacket {
    pub fn new(label: impl Into<String>, fingerprint: impl Into<Vec<u8>>, time: f64) -> Self {
        Self {
            label: label.into(),
            fingerprint: fingerprint.into(),
            payload: Vec::new(),
            time,
            answers_labels: Vec::new(),
        }
    }

    /// Mark this packet as answering the stimulus with the given label.
    pub fn answering(mut self, stimulus_label: impl Into<String>) -> Self {
        self.answers_labels.push(stimulus_label.into());
        self
    }

    /// Set the bytes `build()` returns (by default empty).
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }
}

impl fmt::Debug for BytesPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesPacket")
            .field("label", &self.label)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

impl Packet for BytesPacket {
    fn hashret(&self) -> Vec<u8> {
        self.fingerprint.clone()
    }

    fn answers(&self, stimulus: &Self) -> bool {
        self.answers_labels.iter().any(|l| l == &stimulus.label)
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn build(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn summary(&self) -> String {
        format!("{} [{} bytes]", self.label, self.payload.len())
    }
}
