//! pcraft-bridge - relay frames between two interfaces, optionally dropping
//! frames that match a filter expression, for as long as `--duration` runs
//! (or until the process is killed).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet as PnetPacket;

use pcraft::bridge::{BridgeOptions, BridgeSide};
use pcraft::filterlang::{self, CompiledFilter, FilterFields};
use pcraft::socket::EthernetSocket;

#[derive(Parser)]
#[command(name = "pcraft-bridge", version, about = "Bridge two interfaces")]
struct Cli {
    /// First interface.
    #[arg(long)]
    if1: String,

    /// Second interface.
    #[arg(long)]
    if2: String,

    /// Drop forwarded frames (either direction) matching this filter
    /// expression instead of letting them through, e.g. "proto tcp".
    #[arg(long)]
    drop: Option<String>,

    /// Stop after this many seconds. Runs until killed if unset.
    #[arg(long)]
    duration: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("pcraft-bridge: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> pcraft::Result<()> {
    let drop_filter = match cli.drop.as_deref().map(filterlang::compile) {
        Some(Ok(compiled)) => Some(compiled),
        Some(Err(e)) => {
            eprintln!("pcraft-bridge: invalid filter: {e}");
            std::process::exit(2);
        }
        None => None,
    };

    let if1 = EthernetSocket::open(&cli.if1)?;
    let if2 = EthernetSocket::open(&cli.if2)?;

    let interrupt = Arc::new(AtomicBool::new(false));
    if let Some(secs) = cli.duration {
        let interrupt = interrupt.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            interrupt.store(true, Ordering::Release);
        });
    }

    let mut opts = BridgeOptions {
        prn: Some(Box::new(|frame: &[u8], side: BridgeSide| {
            tracing::debug!(?side, len = frame.len(), "forwarded frame");
        })),
        interrupt: Some(interrupt),
        ..Default::default()
    };

    if let Some(filter) = drop_filter {
        let filter_1 = filter.clone();
        let filter_2 = filter.clone();
        opts.xfrm_1_to_2 = Some(Box::new(move |frame| drop_if_matches(frame, &filter_1)));
        opts.xfrm_2_to_1 = Some(Box::new(move |frame| drop_if_matches(frame, &filter_2)));
    }

    let stats = pcraft::bridge_and_sniff(Box::new(if1), Box::new(if2), opts)?;
    println!(
        "pcraft-bridge: forwarded {}/{} dropped {}/{} (1->2 / 2->1)",
        stats.forwarded_1_to_2, stats.forwarded_2_to_1, stats.dropped_1_to_2, stats.dropped_2_to_1
    );
    Ok(())
}

/// Extract best-effort filter fields from an Ethernet frame carrying IPv4,
/// and drop the frame (return `None`) if it matches `filter`. Frames that
/// aren't IPv4 never match and are always forwarded.
fn drop_if_matches(frame: Vec<u8>, filter: &CompiledFilter) -> Option<Vec<u8>> {
    let fields = ethernet_filter_fields(&frame);
    if filter.matches(&fields) {
        None
    } else {
        Some(frame)
    }
}

fn ethernet_filter_fields(frame: &[u8]) -> FilterFields {
    let Some(eth) = EthernetPacket::new(frame) else {
        return FilterFields::default();
    };
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return FilterFields::default();
    }
    let Some(ipv4) = Ipv4Packet::new(eth.payload()) else {
        return FilterFields::default();
    };
    let protocol = match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => Some("tcp".to_string()),
        IpNextHeaderProtocols::Udp => Some("udp".to_string()),
        IpNextHeaderProtocols::Icmp => Some("icmp".to_string()),
        _ => None,
    };
    FilterFields {
        protocol,
        src: Some(std::net::IpAddr::V4(ipv4.get_source())),
        dst: Some(std::net::IpAddr::V4(ipv4.get_destination())),
    }
}
