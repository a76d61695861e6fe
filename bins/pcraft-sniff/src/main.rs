//! pcraft-sniff - capture ICMP echo traffic from a live interface or replay
//! it from an offline pcap file, printing a one-line summary per packet.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use pcraft::filterlang::{self, FilterFields};
use pcraft::icmp::IcmpEchoPacket;
use pcraft::packet::Packet;
use pcraft::session::DefaultSession;
use pcraft::socket::{EthernetSocket, PcapFileSocket, SniffEntry};
use pcraft::sniffer::SnifferConfig;

#[derive(Parser)]
#[command(name = "pcraft-sniff", version, about = "Sniff ICMP echo traffic")]
struct Cli {
    /// Live interface to capture from.
    #[arg(short = 'i', long, conflicts_with = "read_file")]
    iface: Option<String>,

    /// Read packets from an offline pcap file instead of a live interface.
    #[arg(short = 'r', long = "read-file")]
    read_file: Option<String>,

    /// Stop after this many matching packets.
    #[arg(short = 'c', long)]
    count: Option<usize>,

    /// Stop after this many seconds, regardless of count.
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Capture-filter expression, e.g. "host 10.0.0.1".
    #[arg(short = 'f', long)]
    filter: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("pcraft-sniff: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> pcraft::Result<()> {
    if cli.iface.is_none() && cli.read_file.is_none() {
        eprintln!("pcraft-sniff: exactly one of --iface or --read-file is required");
        std::process::exit(2);
    }

    let compiled_filter = match cli.filter.as_deref().map(filterlang::compile) {
        Some(Ok(compiled)) => Some(compiled),
        Some(Err(e)) => {
            eprintln!("pcraft-sniff: invalid filter: {e}");
            std::process::exit(2);
        }
        None => None,
    };

    let socket: Box<dyn pcraft::socket::Socket> = match (&cli.iface, &cli.read_file) {
        (Some(iface), None) => Box::new(EthernetSocket::open(iface)?),
        (None, Some(path)) => Box::new(PcapFileSocket::open(path)?.with_iface_label(path.clone())),
        _ => unreachable!("validated above"),
    };

    let label = cli.iface.clone().or_else(|| cli.read_file.clone()).unwrap_or_default();
    let entries = vec![SniffEntry::new(socket, label)];

    let mut config: SnifferConfig<IcmpEchoPacket> =
        SnifferConfig::new(Box::new(DefaultSession::new(|frame: &[u8]| IcmpEchoPacket::parse(frame, 0.0))));
    config.count = cli.count;
    config.timeout = cli.timeout.map(Duration::from_secs);
    if let Some(compiled) = compiled_filter {
        config.filter = Some(Box::new(move |pkt: &IcmpEchoPacket| {
            let hint = pkt.route();
            let fields = FilterFields {
                protocol: Some("icmp".to_string()),
                src: hint.src.and_then(|s| s.parse().ok()),
                dst: hint.dst.and_then(|s| s.parse().ok()),
            };
            compiled.matches(&fields)
        }));
    }

    let results = pcraft::summarize(entries, config, Arc::new(AtomicBool::new(false)))?;
    eprintln!("pcraft-sniff: captured {} packet(s)", results.len());
    Ok(())
}
