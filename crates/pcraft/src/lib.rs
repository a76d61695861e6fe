//! Send/receive coordination engine for raw-packet tools.
//!
//! `pcraft` is the concurrent producer/consumer pipeline at the heart of a
//! packet-crafting toolkit: it transmits caller-supplied packets through a
//! [`socket::Socket`], sniffs the wire (or an offline capture) for replies,
//! and matches each reply back to the stimulus that provoked it. Packet
//! parsing and dissection are explicitly out of scope (see [`packet`]):
//! this crate only needs a [`packet::Packet`] implementation, never
//! produces one of its own beyond the minimal [`icmp::IcmpEchoPacket`] demo
//! type.
//!
//! # Layering
//!
//! - [`socket`] — the send/recv/select capability over live L2/L3, offline
//!   pcap, and in-memory backends, plus the control pipe used to unblock a
//!   blocked sniff loop.
//! - [`session`] — turns raw frames into logical packets (pass-through by
//!   default; pluggable reassembly).
//! - [`sniffer`] — multiplexes reads across a socket set and applies
//!   accept/stop/count/timeout policy.
//! - [`send`] — paces and repeats transmission of a packet source.
//! - [`sndrcv`] — the match coordinator: runs send and sniff concurrently
//!   and pairs replies to stimuli. This module is the core of the crate.
//! - [`flood`] / [`loop_ctl`] / [`bridge`] — the flood, loop, and two-port
//!   bridge variants built on top of the above.
//! - [`replay`] — `sendpfast`-equivalent high-rate transmission via an
//!   external tool.
//!
//! The free functions at the crate root are the caller-facing entry points
//! (`send`/`sendp`, `sr`/`srp`/`sr1`/`srp1`, `srloop`/`srploop`,
//! `srflood`/`sr1flood`/`srpflood`/`srp1flood`, `sniff`, `bridge_and_sniff`,
//! `summarize`) — thin, mostly-generic wrappers over the modules above.

pub mod bridge;
pub mod config;
pub mod error;
pub mod filterlang;
pub mod flood;
pub mod icmp;
pub mod loop_ctl;
pub mod packet;
pub mod replay;
pub mod send;
pub mod sndrcv;
pub mod sniffer;
pub mod session;
pub mod socket;

pub use config::Config;
pub use error::{Error, Result};

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bridge::{bridge_and_sniff as bridge_and_sniff_impl, BridgeOptions, BridgeStats};
use flood::FloodGenerator;
use loop_ctl::{sr_loop, LoopOptions, LoopResult, SharedDecode};
use packet::{Packet, PacketSource};
use send::{send_packets, SendOptions, SendOutcome};
use session::DefaultSession;
use sndrcv::{sndrcv, SndRcvOptions, SndRcvResult};
use sniffer::{sniff as sniff_impl, AsyncSniffer, Sniffed, SnifferConfig};
use socket::{EthernetSocket, IpSocket, Socket, SniffEntry};

type Decode<P> = Box<dyn Fn(&[u8]) -> Option<P> + Send + Sync>;

/// L3 transmit only: push `source` through an already-open [`IpSocket`].
pub fn send<P: Packet>(socket: &mut IpSocket, source: PacketSource<P>, opts: SendOptions) -> Result<SendOutcome<P>> {
    send_packets(socket, source, opts)
}

/// L2 transmit only: push `source` through an already-open [`EthernetSocket`].
pub fn sendp<P: Packet>(socket: &mut EthernetSocket, source: PacketSource<P>, opts: SendOptions) -> Result<SendOutcome<P>> {
    send_packets(socket, source, opts)
}

/// L3 stimulus-response: send `source` and match replies read from `rx`.
///
/// `tx` and `rx` are deliberately separate handles: the coordinator uses
/// separate send and receive sockets whenever the underlying transport
/// doesn't allow concurrent send/recv on one handle. A caller that wants
/// to send and receive on the same interface opens two sockets bound to
/// it — exactly as [`IpSocket::open_v4`] or [`EthernetSocket::open`]
/// allow, since the kernel permits multiple raw sockets per interface.
pub fn sr<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    source: PacketSource<P>,
    decode: Decode<P>,
    opts: SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    sndrcv(tx, rx, source, Box::new(DefaultSession::new(decode)), None, opts)
}

/// L2 stimulus-response; see [`sr`].
pub fn srp<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    source: PacketSource<P>,
    decode: Decode<P>,
    opts: SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    sndrcv(tx, rx, source, Box::new(DefaultSession::new(decode)), None, opts)
}

/// Send a single stimulus and return only its first reply, if any.
pub fn sr1<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packet: P,
    decode: Decode<P>,
    opts: SndRcvOptions,
) -> Result<Option<P>> {
    let result = sndrcv(
        tx,
        rx,
        PacketSource::once(packet),
        Box::new(DefaultSession::new(decode)),
        None,
        opts,
    )?;
    Ok(result.answered.into_iter().next().map(|(_, reply)| reply))
}

/// L2 single-stimulus, first-reply-only send/receive; see [`sr1`].
pub fn srp1<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packet: P,
    decode: Decode<P>,
    opts: SndRcvOptions,
) -> Result<Option<P>> {
    sr1(tx, rx, packet, decode, opts)
}

/// Repeated `sr` at a steady cadence; see [`loop_ctl::sr_loop`].
pub fn srloop<P, StimF, MkSend, MkRecv>(
    mk_send_socket: MkSend,
    mk_recv_entries: MkRecv,
    stimuli_factory: StimF,
    decode: SharedDecode<P>,
    opts: LoopOptions,
) -> Result<LoopResult<P>>
where
    P: Packet,
    StimF: FnMut() -> Vec<P>,
    MkSend: FnMut() -> Box<dyn Socket>,
    MkRecv: FnMut() -> Vec<SniffEntry>,
{
    sr_loop(mk_send_socket, mk_recv_entries, stimuli_factory, decode, opts)
}

/// L2 variant of [`srloop`].
pub fn srploop<P, StimF, MkSend, MkRecv>(
    mk_send_socket: MkSend,
    mk_recv_entries: MkRecv,
    stimuli_factory: StimF,
    decode: SharedDecode<P>,
    opts: LoopOptions,
) -> Result<LoopResult<P>>
where
    P: Packet,
    StimF: FnMut() -> Vec<P>,
    MkSend: FnMut() -> Box<dyn Socket>,
    MkRecv: FnMut() -> Vec<SniffEntry>,
{
    sr_loop(mk_send_socket, mk_recv_entries, stimuli_factory, decode, opts)
}

/// Sustained transmission: cycle `packets` forever (until `stop` is set or
/// an externally-configured `opts.stop`/retry policy ends it) while
/// matching replies. Forces the match coordinator's threaded path by
/// construction — [`sndrcv::sndrcv`]'s sender always runs on its own
/// thread, so a flood's unbounded source is simply a source that never
/// finishes on its own.
pub fn srflood<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packets: Vec<P>,
    decode: Decode<P>,
    stop: Arc<AtomicBool>,
    mut opts: SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    let flood = FloodGenerator::new(packets, stop.clone());
    let source = PacketSource::from_iter(flood);
    opts.stop = Some(stop);
    opts.retry = 0;
    sndrcv(tx, rx, source, Box::new(DefaultSession::new(decode)), None, opts)
}

/// L2 variant of [`srflood`].
pub fn srpflood<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packets: Vec<P>,
    decode: Decode<P>,
    stop: Arc<AtomicBool>,
    opts: SndRcvOptions,
) -> Result<SndRcvResult<P>> {
    srflood(tx, rx, packets, decode, stop, opts)
}

/// Flood variant of [`sr1`]: returns only the first reply seen.
pub fn sr1flood<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packets: Vec<P>,
    decode: Decode<P>,
    stop: Arc<AtomicBool>,
    opts: SndRcvOptions,
) -> Result<Option<P>> {
    let result = srflood(tx, rx, packets, decode, stop, opts)?;
    Ok(result.answered.into_iter().next().map(|(_, reply)| reply))
}

/// L2 variant of [`sr1flood`].
pub fn srp1flood<P: Packet>(
    tx: &mut dyn Socket,
    rx: Vec<SniffEntry>,
    packets: Vec<P>,
    decode: Decode<P>,
    stop: Arc<AtomicBool>,
    opts: SndRcvOptions,
) -> Result<Option<P>> {
    sr1flood(tx, rx, packets, decode, stop, opts)
}

/// Synchronous capture: run the sniff loop to completion on the calling
/// thread. See [`AsyncSniffer`] for the non-blocking form.
pub fn sniff<P>(
    sockets: Vec<SniffEntry>,
    config: SnifferConfig<P>,
    stop_requested: Arc<AtomicBool>,
) -> Result<Vec<P>> {
    sniff_impl(sockets, config, stop_requested)
}

/// Two-port bridge: couple `if1` and `if2`, forwarding (optionally
/// transformed) frames between them while sniffing both.
pub fn bridge_and_sniff(if1: Box<dyn Socket>, if2: Box<dyn Socket>, opts: BridgeOptions) -> Result<BridgeStats> {
    bridge_and_sniff_impl(if1, if2, opts)
}

/// `tshark`-style capture: wrap [`sniff`] with a `prn` that prints
/// `"{count}\t{summary}"` for every accepted packet, composed ahead of any
/// `prn` the caller already set on `config`.
pub fn summarize<P: Packet>(
    sockets: Vec<SniffEntry>,
    mut config: SnifferConfig<P>,
    stop_requested: Arc<AtomicBool>,
) -> Result<Vec<P>> {
    let mut count = 0usize;
    let mut previous_prn = config.prn.take();
    config.prn = Some(Box::new(move |sniffed: &Sniffed<P>| {
        count += 1;
        println!("{count}\t{}", sniffed.packet.summary());
        if let Some(prn) = previous_prn.as_mut() {
            prn(sniffed);
        }
    }));
    sniff_impl(sockets, config, stop_requested)
}
