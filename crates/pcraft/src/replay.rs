//! High-rate offline replay: hand a set of packets to an external replay
//! tool (`tcpreplay` by default) instead of sending them one at a time
//! through this process, and parse back its reported throughput.
//!
//! The packets are written to a temporary pcap file, the tool is shelled
//! out to, and its stdout/stderr is scraped for a handful of numbers
//! (packets sent, failed, bytes, rates). This crate has no equivalent
//! in-process high-rate raw-socket writer (see crate-level Non-goals), so
//! the external-tool path is the only one offered.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// What was actually written to the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActualStats {
    pub packets: Option<u64>,
    pub bytes: Option<u64>,
}

/// The throughput `tcpreplay` reports it achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RatedStats {
    pub pps: Option<f64>,
    pub bps: Option<f64>,
    pub mbps: Option<f64>,
}

/// Flow accounting, only present when `tcpreplay` was run with flow tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowStats {
    pub flows: Option<u64>,
    pub flow_packets: Option<u64>,
    pub non_flow: Option<u64>,
}

/// Parsed summary of a `tcpreplay` invocation (spec's `sendpfast` report).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplayResult {
    /// Number of packets handed to the replay tool, before it runs.
    pub attempted: Option<u64>,
    /// Number the tool reports it actually put on the wire.
    pub successful: Option<u64>,
    pub failed: Option<u64>,
    pub truncated: Option<u64>,
    pub retried_enobufs: Option<u64>,
    pub retried_eagain: Option<u64>,
    pub actual: ActualStats,
    pub rated: RatedStats,
    pub flows: FlowStats,
    /// The exact command line that was run, for diagnostics.
    pub command: Option<String>,
    /// Lines from the tool's output that looked like a warning but didn't
    /// match any of the recognized report fields.
    pub warnings: Vec<String>,
}

/// Options controlling a [`sendpfast`] invocation.
pub struct ReplayOptions {
    /// Path to the replay tool binary (default resolved from `Config`).
    pub tool_path: PathBuf,
    /// Extra raw CLI arguments appended after `-i <iface>`.
    pub extra_args: Vec<String>,
    /// Interface to transmit on.
    pub iface: String,
    /// Loop the capture this many times (`tcpreplay -l`).
    pub loop_count: Option<u32>,
    /// Target rate in Mbps (`tcpreplay --mbps`).
    pub mbps: Option<f64>,
    /// Target rate in packets/sec (`tcpreplay --pps`).
    pub pps: Option<f64>,
}

impl ReplayOptions {
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            tool_path: PathBuf::from("tcpreplay"),
            extra_args: Vec::new(),
            iface: iface.into(),
            loop_count: None,
            mbps: None,
            pps: None,
        }
    }
}

/// A pcap file that unlinks itself on drop, used to stage packets for the
/// external replay tool without leaving scratch files behind on error
/// paths.
struct TempPcap {
    path: PathBuf,
}

impl TempPcap {
    fn write(frames: &[Vec<u8>]) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("pcraft-replay-{}.pcap", std::process::id()));
        let mut file = std::fs::File::create(&path)?;

        file.write_all(&0xa1b2c3d4u32.to_le_bytes())?;
        file.write_all(&2u16.to_le_bytes())?;
        file.write_all(&4u16.to_le_bytes())?;
        file.write_all(&0i32.to_le_bytes())?;
        file.write_all(&0u32.to_le_bytes())?;
        file.write_all(&65535u32.to_le_bytes())?;
        file.write_all(&1u32.to_le_bytes())?; // LINKTYPE_ETHERNET

        for frame in frames {
            file.write_all(&0u32.to_le_bytes())?;
            file.write_all(&0u32.to_le_bytes())?;
            file.write_all(&(frame.len() as u32).to_le_bytes())?;
            file.write_all(&(frame.len() as u32).to_le_bytes())?;
            file.write_all(frame)?;
        }

        Ok(Self { path })
    }
}

impl Drop for TempPcap {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Write `frames` to a temporary pcap file and hand it to the external
/// replay tool, returning its parsed throughput report.
pub fn sendpfast(frames: &[Vec<u8>], opts: &ReplayOptions) -> Result<ReplayResult> {
    let pcap = TempPcap::write(frames)?;
    let mut result = run_replay_tool(&pcap.path, opts)?;
    result.attempted = Some(frames.len() as u64);
    Ok(result)
}

fn run_replay_tool(pcap_path: &Path, opts: &ReplayOptions) -> Result<ReplayResult> {
    let mut cmd = Command::new(&opts.tool_path);
    cmd.arg("-i").arg(&opts.iface);
    if let Some(loop_count) = opts.loop_count {
        cmd.arg("-l").arg(loop_count.to_string());
    }
    if let Some(mbps) = opts.mbps {
        cmd.arg("--mbps").arg(mbps.to_string());
    }
    if let Some(pps) = opts.pps {
        cmd.arg("--pps").arg(pps.to_string());
    }
    cmd.args(&opts.extra_args);
    cmd.arg(pcap_path);

    let command_line = format!("{:?}", cmd);

    let output = cmd.output().map_err(Error::Io)?;
    if !output.status.success() {
        return Err(Error::ReplayToolFailed(format!(
            "exit status {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let mut result = parse_tcpreplay_output(&combined)?;
    result.command = Some(command_line);
    result.successful = result.actual.packets;
    Ok(result)
}

/// Scrape a handful of numbers out of `tcpreplay`'s human-readable report.
///
/// `tcpreplay`'s output isn't machine-friendly JSON, so this matches known
/// phrasings line by line rather than attempting a full grammar; unmatched
/// lines are ignored, and a report with no recognizable lines at all is
/// treated as a parse failure (the tool presumably changed its format).
fn parse_tcpreplay_output(text: &str) -> Result<ReplayResult> {
    let mut result = ReplayResult::default();
    let mut matched_any = false;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Actual:") {
            matched_any |= parse_actual_line(rest, &mut result);
        } else if let Some(rest) = line.strip_prefix("Rated:") {
            matched_any |= parse_rated_line(rest, &mut result);
        } else if let Some(rest) = line.strip_prefix("Flows:") {
            matched_any |= parse_flows_line(rest, &mut result);
        } else if let Some(rest) = line.strip_prefix("Failed packets:") {
            if let Some(n) = first_integer(rest) {
                result.failed = Some(n);
                matched_any = true;
            }
        } else if let Some(rest) = line.strip_prefix("Truncated packets:") {
            if let Some(n) = first_integer(rest) {
                result.truncated = Some(n);
                matched_any = true;
            }
        } else if let Some(rest) = line.strip_prefix("Retried packets (ENOBUFS):") {
            if let Some(n) = first_integer(rest) {
                result.retried_enobufs = Some(n);
                matched_any = true;
            }
        } else if let Some(rest) = line.strip_prefix("Retried packets (EAGAIN):") {
            if let Some(n) = first_integer(rest) {
                result.retried_eagain = Some(n);
                matched_any = true;
            }
        } else if line.to_ascii_lowercase().starts_with("warning:") {
            result.warnings.push(line.to_string());
            matched_any = true;
        }
    }

    if matched_any {
        Ok(result)
    } else {
        Err(Error::ReplayParseFailed(text.to_string()))
    }
}

fn parse_actual_line(rest: &str, result: &mut ReplayResult) -> bool {
    // "Actual: 100 packets (6400 bytes) sent in 1.00 seconds"
    let mut matched = false;
    if let Some(n) = first_integer(rest) {
        result.actual.packets = Some(n);
        matched = true;
    }
    if let Some(idx) = rest.find('(') {
        if let Some(n) = first_integer(&rest[idx + 1..]) {
            result.actual.bytes = Some(n);
            matched = true;
        }
    }
    matched
}

fn parse_rated_line(rest: &str, result: &mut ReplayResult) -> bool {
    // "Rated: 51200.0 Bps, 0.41 Mbps, 100.00 pps"
    let mut matched = false;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some(v) = first_float(part) {
            if part.ends_with("Bps") {
                result.rated.bps = Some(v);
                matched = true;
            } else if part.ends_with("Mbps") {
                result.rated.mbps = Some(v);
                matched = true;
            } else if part.ends_with("pps") {
                result.rated.pps = Some(v);
                matched = true;
            }
        }
    }
    matched
}

fn parse_flows_line(rest: &str, result: &mut ReplayResult) -> bool {
    // "Flows: 12 flows, 8.00 fps, 100 flow packets, 0 non-flow"
    let mut matched = false;
    let mut parts = rest.split(',');
    if let Some(p) = parts.next() {
        if let Some(n) = first_integer(p) {
            result.flows.flows = Some(n);
            matched = true;
        }
    }
    for part in parts {
        let part = part.trim();
        if part.contains("flow packets") {
            if let Some(n) = first_integer(part) {
                result.flows.flow_packets = Some(n);
                matched = true;
            }
        } else if part.contains("non-flow") {
            if let Some(n) = first_integer(part) {
                result.flows.non_flow = Some(n);
                matched = true;
            }
        }
    }
    matched
}

fn first_integer(s: &str) -> Option<u64> {
    let digits: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn first_float(s: &str) -> Option<f64> {
    let token: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    token.parse().ok()
}
