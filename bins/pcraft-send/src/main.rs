//! pcraft-send - send a burst of ICMP echo requests and match replies via
//! the coordination engine, printing round-trip accounting.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;
use pnet::packet::ip::IpNextHeaderProtocols;

use pcraft::icmp::IcmpEchoPacket;
use pcraft::packet::{Packet, PacketSource};
use pcraft::sndrcv::SndRcvOptions;
use pcraft::socket::{IpSocket, SniffEntry};

#[derive(Parser)]
#[command(name = "pcraft-send", version, about = "Send ICMP echo requests and match replies")]
struct Cli {
    /// Source address to stamp on outgoing packets.
    #[arg(long)]
    src: Ipv4Addr,

    /// Destination to ping.
    #[arg(long)]
    dst: Ipv4Addr,

    /// Number of echo requests to send.
    #[arg(short = 'c', long, default_value_t = 4)]
    count: u16,

    /// Milliseconds between consecutive sends.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Milliseconds to keep listening after the last request was sent.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Retry budget; negative values enable autostop. See the library's
    /// `SndRcvOptions::retry` for the exact semantics.
    #[arg(long, default_value_t = 0)]
    retry: i32,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("pcraft-send: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> pcraft::Result<()> {
    let mut tx = IpSocket::open_v4(IpNextHeaderProtocols::Icmp)?;
    let rx = IpSocket::open_v4(IpNextHeaderProtocols::Icmp)?;
    let entries = vec![SniffEntry::new(Box::new(rx), "icmp-rx")];

    let requests: Vec<IcmpEchoPacket> = (0..cli.count)
        .map(|seq| IcmpEchoPacket::echo_request(cli.src, cli.dst, std::process::id() as u16, seq, 0.0))
        .collect();

    let opts = SndRcvOptions {
        timeout: Duration::from_millis(cli.timeout_ms),
        retry: cli.retry,
        multi: false,
        inter: cli.interval_ms.map(Duration::from_millis),
        stop: None,
        chain_interrupt: false,
        chain_exceptions: false,
    };

    let result = pcraft::sr(
        &mut tx,
        entries,
        PacketSource::from_vec(requests),
        Box::new(|frame: &[u8]| IcmpEchoPacket::parse(frame, 0.0)),
        opts,
    )?;

    for (_, reply) in &result.answered {
        println!("{}", reply.summary());
    }
    println!(
        "pcraft-send: {} answered, {} unanswered",
        result.answered.len(),
        result.unanswered.len()
    );

    Ok(())
}
