//! Error types for the send/receive coordination engine.

use std::io;

/// Result type used throughout `pcraft`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while sending, sniffing, or matching packets.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// End of stream: the socket (or offline capture) has no more data.
    ///
    /// Distinguished from a transient I/O error because the sniffer evicts
    /// the socket silently instead of logging a warning.
    #[error("end of stream")]
    Eof,

    /// External stop was requested and `chain_interrupt` was set.
    #[error("interrupted")]
    Interrupted,

    /// An operation isn't supported by the socket it was issued against
    /// (e.g. `send()` on an offline/read-only transport), or
    /// `Sniffer::stop()` was called but the sniffer has no way to unblock
    /// its current wait. The payload names the specific operation/socket.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The sniffer was asked to stop while it was not running.
    #[error("not running")]
    NotRunning,

    /// The sniffer thread panicked; the panic payload (if a string) is
    /// preserved for diagnostics.
    #[error("sniffer thread panicked: {0}")]
    SnifferPanicked(String),

    /// The external high-rate replay tool exited with a failure status.
    #[error("replay tool failed: {0}")]
    ReplayToolFailed(String),

    /// The replay tool's stdout/stderr could not be parsed into a result map.
    #[error("failed to parse replay tool output: {0}")]
    ReplayParseFailed(String),

    /// A requested network interface does not exist.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// A capture-filter expression failed to parse.
    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    /// A sniff set mixed sockets that expose a pollable fd with sockets
    /// that don't. `poll_select` falls back to busy-polling and logs a
    /// `tracing::warn!` rather than raising this; the variant exists so
    /// the condition is a first-class, testable value instead of only a
    /// log line.
    #[error("inconsistent socket types in sniff set: {0}")]
    InconsistentSelect(String),
}

impl Error {
    /// True if this error represents end-of-stream (vs. a transient failure).
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_carries_its_payload_in_display() {
        let e = Error::Unsupported("send() on an offline socket".to_string());
        assert_eq!(e.to_string(), "unsupported: send() on an offline socket");
    }

    #[test]
    fn inconsistent_select_carries_its_payload_in_display() {
        let e = Error::InconsistentSelect("mixed pollable and non-pollable sockets".to_string());
        assert_eq!(
            e.to_string(),
            "inconsistent socket types in sniff set: mixed pollable and non-pollable sockets"
        );
    }

    #[test]
    fn is_eof_only_true_for_eof() {
        assert!(Error::Eof.is_eof());
        assert!(!Error::Interrupted.is_eof());
    }
}
