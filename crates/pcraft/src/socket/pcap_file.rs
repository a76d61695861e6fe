//! Offline capture playback: read an already-captured pcap file as if it
//! were a live socket, so the sniffer engine doesn't need to distinguish
//! "live" from "offline" in its main loop.
//!
//! Only the classic pcap format is supported (not pcapng). The global and
//! per-record headers are parsed with `zerocopy` directly out of a
//! memory-mapped-free byte buffer; endianness is detected from the magic
//! number.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, RawFd};

use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{Error, Result};
use crate::socket::Socket;

const MAGIC_LE: u32 = 0xa1b2c3d4;
const MAGIC_SWAPPED: u32 = 0xd4c3b2a1;
const MAGIC_NS_LE: u32 = 0xa1b23c4d;
const MAGIC_NS_SWAPPED: u32 = 0x4d3cb2a1;

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PcapGlobalHeader {
    magic: u32,
    version_major: u16,
    version_minor: u16,
    thiszone: i32,
    sigfigs: u32,
    snaplen: u32,
    network: u32,
}

#[derive(FromBytes, Immutable, KnownLayout)]
#[repr(C)]
struct PcapRecordHeader {
    ts_sec: u32,
    ts_usec: u32,
    incl_len: u32,
    orig_len: u32,
}

/// A socket-shaped reader over a classic-format pcap file.
///
/// Frames are handed back in file order; `recv()` returns `Err(Error::Eof)`
/// once the file is exhausted, so the sniffer evicts it the same way it
/// would any other drained socket. There is no `send()` counterpart:
/// writing to an offline socket is a programming error.
pub struct PcapFileSocket {
    file: File,
    swap: bool,
    nanosecond_ts: bool,
    iface: Option<String>,
}

impl PcapFileSocket {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header_buf = [0u8; std::mem::size_of::<PcapGlobalHeader>()];
        file.read_exact(&mut header_buf)?;
        let header = PcapGlobalHeader::read_from_bytes(&header_buf)
            .map_err(|_| Error::Io(std::io::Error::other("truncated pcap global header")))?;

        let (swap, nanosecond_ts) = match header.magic {
            MAGIC_LE => (false, false),
            MAGIC_SWAPPED => (true, false),
            MAGIC_NS_LE => (false, true),
            MAGIC_NS_SWAPPED => (true, true),
            other => {
                return Err(Error::Io(std::io::Error::other(format!(
                    "not a pcap file (bad magic {other:#x})"
                ))));
            }
        };

        Ok(Self {
            file,
            swap,
            nanosecond_ts,
            iface: None,
        })
    }

    pub fn with_iface_label(mut self, label: impl Into<String>) -> Self {
        self.iface = Some(label.into());
        self
    }

    fn fix_u32(&self, v: u32) -> u32 {
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    /// Timestamp of the next record, as seconds since the Unix epoch, or
    /// `None` at end of file. Used by [`recv`](Socket::recv) callers that
    /// want to reconstruct `Packet::time()` from capture time rather than
    /// wall-clock read time.
    fn read_one(&mut self) -> Result<Option<(f64, Vec<u8>)>> {
        let mut rec_buf = [0u8; std::mem::size_of::<PcapRecordHeader>()];
        match self.file.read_exact(&mut rec_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        }
        let rec = PcapRecordHeader::read_from_bytes(&rec_buf)
            .map_err(|_| Error::Io(std::io::Error::other("truncated pcap record header")))?;

        let incl_len = self.fix_u32(rec.incl_len) as usize;
        let ts_sec = self.fix_u32(rec.ts_sec) as f64;
        let ts_frac = self.fix_u32(rec.ts_usec) as f64;
        let frac_scale = if self.nanosecond_ts { 1e9 } else { 1e6 };

        let mut data = vec![0u8; incl_len];
        self.file.read_exact(&mut data)?;

        Ok(Some((ts_sec + ts_frac / frac_scale, data)))
    }
}

impl Socket for PcapFileSocket {
    fn send(&mut self, _frame: &[u8]) -> Result<()> {
        Err(Error::Unsupported("send() on an offline pcap file socket".to_string()))
    }

    fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_one()? {
            Some((_ts, data)) => Ok(Some(data)),
            None => Err(Error::Eof),
        }
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    fn is_ready(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn iface(&self) -> Option<&str> {
        self.iface.as_deref()
    }
}
