//! Process-lifetime configuration, passed explicitly instead of through a
//! global mutable object (see spec Design Notes on the `conf` singleton).

use std::path::PathBuf;

/// How diagnostic output should be colorized, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorTheme {
    /// No ANSI escapes.
    #[default]
    Plain,
    /// ANSI color codes for interactive terminals.
    Ansi,
}

/// Settings that would otherwise live in a process-wide global.
///
/// Every entry point that needs one of these takes a `&Config` explicitly
/// rather than reading from a singleton, so tests can run concurrently with
/// different settings and nothing here needs `unsafe` or `OnceLock`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Verbosity level: 0 is silent, 1 prints progress dots, 2+ prints
    /// per-packet detail.
    pub verb: u8,
    /// Keep a record of every sent/received/matched packet for debugging.
    /// Expensive; off by default.
    pub debug_match: bool,
    /// Re-raise transient socket recv errors instead of logging and
    /// evicting the socket.
    pub debug_dissector: bool,
    /// How to colorize `srloop`/`tshark`-style textual output.
    pub color_theme: ColorTheme,
    /// Path to the external high-rate replay tool used by `sendpfast`.
    pub replay_tool_path: PathBuf,
    /// Path to an external capture-filter tool for applying a BPF-like
    /// filter to offline files. Unused unless a caller explicitly opts in;
    /// the default is to filter offline captures in-process instead.
    pub capture_filter_tool_path: PathBuf,
    /// Interface to use when the caller doesn't specify one.
    pub default_iface: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            verb: 1,
            debug_match: false,
            debug_dissector: false,
            color_theme: ColorTheme::default(),
            replay_tool_path: PathBuf::from("tcpreplay"),
            capture_filter_tool_path: PathBuf::from("tcpdump"),
            default_iface: None,
        }
    }
}
