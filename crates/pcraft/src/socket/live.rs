//! Live socket backends, built on `pnet`'s cross-platform datalink and
//! transport-layer channels.
//!
//! Both backends hide their underlying file descriptor behind `pnet`'s
//! platform abstraction, so neither implements [`Socket::raw_fd`]; instead
//! each channel is opened with a short read timeout and [`Socket::is_ready`]
//! does a bounded-wait recv, which [`super::poll_select`]'s busy-poll path
//! drives directly. This mirrors the approach `deavid-zzping`'s transport
//! layer takes to reconcile a blocking third-party channel with a
//! multi-socket select loop.

use std::time::Duration;

use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender, NetworkInterface};
use pnet::transport::{self, TransportReceiver, TransportSender};

use crate::error::{Error, Result};
use crate::socket::{resolve_iface, Socket};

/// How long a single recv attempt blocks before `is_ready()` reports "not
/// yet" and the caller gets another crack at the deadline/stop flag.
const RECV_QUANTUM: Duration = Duration::from_millis(10);

fn find_interface(name: &str) -> Result<NetworkInterface> {
    resolve_iface(name)
}

/// A live layer-2 socket: sends and receives whole Ethernet frames on a
/// named interface.
pub struct EthernetSocket {
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
    iface: String,
    /// A frame pulled by `is_ready()` but not yet handed to the caller.
    pending: Option<Vec<u8>>,
}

impl EthernetSocket {
    pub fn open(iface_name: &str) -> Result<Self> {
        let iface = find_interface(iface_name)?;
        let config = datalink::Config {
            read_timeout: Some(RECV_QUANTUM),
            ..Default::default()
        };
        let channel = datalink::channel(&iface, config).map_err(Error::Io)?;
        let (tx, rx) = match channel {
            Channel::Ethernet(tx, rx) => (tx, rx),
            _ => {
                return Err(Error::Io(std::io::Error::other(
                    "unsupported datalink channel type",
                )));
            }
        };
        Ok(Self {
            tx,
            rx,
            iface: iface_name.to_string(),
            pending: None,
        })
    }

    fn recv_raw(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Socket for EthernetSocket {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        match self.tx.send_to(frame, None) {
            Some(Ok(())) => Ok(()),
            Some(Err(e)) => Err(Error::Io(e)),
            None => Err(Error::Io(std::io::Error::other(
                "datalink sender rejected frame (likely oversized for this interface)",
            ))),
        }
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.recv_raw()
    }

    fn is_ready(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        self.pending = self.recv_raw()?;
        Ok(self.pending.is_some())
    }

    fn iface(&self) -> Option<&str> {
        Some(&self.iface)
    }
}

/// A live layer-3 socket: sends and receives raw IP packets (no Ethernet
/// framing) for a single next-level protocol, e.g. ICMP.
pub struct IpSocket {
    tx: TransportSender,
    rx: TransportReceiver,
    protocol_name: &'static str,
    pending: Option<Vec<u8>>,
}

impl IpSocket {
    /// Open a raw IPv4 transport channel carrying the given next-level
    /// protocol (e.g. `IpNextHeaderProtocols::Icmp`).
    pub fn open_v4(protocol: pnet::packet::ip::IpNextHeaderProtocol) -> Result<Self> {
        let channel_type = transport::TransportChannelType::Layer3(protocol);
        let (tx, rx) = transport::transport_channel(4096, channel_type).map_err(Error::Io)?;
        Ok(Self {
            tx,
            rx,
            protocol_name: "ipv4",
            pending: None,
        })
    }

    fn recv_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut iter = transport::ipv4_packet_iter(&mut self.rx);
        match iter.next_with_timeout(RECV_QUANTUM) {
            Ok(Some((packet, _addr))) => Ok(Some(packet.packet().to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl Socket for IpSocket {
    fn send(&mut self, frame: &[u8]) -> Result<()> {
        use pnet::packet::ipv4::Ipv4Packet;
        let packet = Ipv4Packet::new(frame)
            .ok_or_else(|| Error::Io(std::io::Error::other("frame too short to be an IPv4 packet")))?;
        let dst = std::net::IpAddr::V4(packet.get_destination());
        self.tx.send_to(packet, dst).map_err(Error::Io)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        self.recv_raw()
    }

    fn is_ready(&mut self) -> Result<bool> {
        if self.pending.is_some() {
            return Ok(true);
        }
        self.pending = self.recv_raw()?;
        Ok(self.pending.is_some())
    }

    fn iface(&self) -> Option<&str> {
        Some(self.protocol_name)
    }
}
