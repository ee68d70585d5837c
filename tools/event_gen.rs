//! Synthetic connection-event generator for appwall
//!
//! Emits JSON-lines `ConnectionEvent`s suitable for `appwall simulate`.
//!
//! # Usage
//!
//! ```bash
//! # 500 mixed events on stdout, piped straight into the simulator
//! cargo run --features event_gen --bin event_gen -- --count 500 | appwall simulate
//!
//! # Reproducible port scan against one host, written to a file
//! cargo run --features event_gen --bin event_gen -- --scenario scan --seed 7 -o /tmp/scan.jsonl
//!
//! # Print a distribution report on stderr
//! cargo run --features event_gen --bin event_gen -- --scenario burst --report
//! ```

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::process::ExitCode;

use appwall::core::firewall::{ConnectionEvent, Direction, Protocol};
use clap::{Parser, ValueEnum};
use rand::prelude::*;
use rand::rngs::StdRng;

/// appwall connection-event generator
#[derive(Parser)]
#[command(name = "event_gen")]
#[command(about = "Generate JSON-lines connection events for appwall simulate")]
struct Args {
    /// Number of events to generate (overridden by --scenario)
    #[arg(short, long, default_value = "100")]
    count: usize,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Traffic shape
    #[arg(long, value_enum, default_value = "mixed")]
    scenario: Scenario,

    /// Print protocol/direction/application counts to stderr
    #[arg(long)]
    report: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Desktop-like mix of browsers, updaters and a few inbound services
    Mixed,
    /// One application probing ports 1-1024 on a single host
    Scan,
    /// 2000 events from a handful of chatty applications
    Burst,
}

impl Scenario {
    const fn count(self, requested: usize) -> usize {
        match self {
            Scenario::Mixed => requested,
            Scenario::Scan => 1024,
            Scenario::Burst => 2000,
        }
    }
}

const APPLICATIONS: [&str; 8] = [
    "/usr/lib/firefox/firefox",
    "/usr/bin/curl",
    "/usr/bin/telnet",
    "/usr/bin/ssh",
    "/usr/sbin/sshd",
    "/usr/bin/syncthing",
    "/opt/updater/bin/updater",
    r"C:\Program Files\Mozilla Firefox\firefox.exe",
];

const OUTBOUND_PORTS: [u16; 9] = [80, 443, 53, 22, 23, 123, 8080, 8443, 22000];
const LISTEN_PORTS: [u16; 4] = [22, 8384, 22000, 631];

#[derive(Default)]
struct Report {
    protocols: BTreeMap<&'static str, usize>,
    directions: BTreeMap<&'static str, usize>,
    applications: BTreeMap<String, usize>,
}

impl Report {
    fn record(&mut self, event: &ConnectionEvent) {
        *self.protocols.entry(event.protocol.as_str()).or_insert(0) += 1;
        *self.directions.entry(event.direction.as_str()).or_insert(0) += 1;
        *self.applications.entry(event.app_path.clone()).or_insert(0) += 1;
    }

    fn print(&self) {
        eprintln!("\nProtocols:");
        for (name, n) in &self.protocols {
            eprintln!("  {name:<10} {n}");
        }
        eprintln!("Directions:");
        for (name, n) in &self.directions {
            eprintln!("  {name:<10} {n}");
        }
        eprintln!("Applications:");
        for (name, n) in &self.applications {
            eprintln!("  {name:<48} {n}");
        }
    }
}

fn remote_addr(rng: &mut StdRng) -> IpAddr {
    if rng.random_bool(0.15) {
        IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, rng.random()))
    } else {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, rng.random_range(1..=254)))
    }
}

fn local_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
}

fn ephemeral_port(rng: &mut StdRng) -> u16 {
    rng.random_range(32_768..=60_999)
}

fn mixed_event(rng: &mut StdRng) -> ConnectionEvent {
    let pid = rng.random_range(300..40_000);
    if rng.random_bool(0.2) {
        // Remote peer reaching a local listener: src_port is the local port
        let app = *["/usr/sbin/sshd", "/usr/bin/syncthing"]
            .choose(rng)
            .unwrap_or(&"/usr/sbin/sshd");
        let port = *LISTEN_PORTS.choose(rng).unwrap_or(&22);
        return ConnectionEvent::new(app, Protocol::Tcp, Direction::Inbound)
            .with_pid(pid)
            .with_source(local_addr(), port)
            .with_destination(remote_addr(rng), ephemeral_port(rng));
    }

    let app = *APPLICATIONS.choose(rng).unwrap_or(&"/usr/bin/curl");
    let port = *OUTBOUND_PORTS.choose(rng).unwrap_or(&443);
    let protocol = match port {
        53 | 123 => Protocol::Udp,
        _ if rng.random_bool(0.05) => Protocol::Icmp,
        _ => Protocol::Tcp,
    };
    ConnectionEvent::new(app, protocol, Direction::Outbound)
        .with_pid(pid)
        .with_source(local_addr(), ephemeral_port(rng))
        .with_destination(remote_addr(rng), port)
}

fn scan_event(rng: &mut StdRng, index: usize, target: IpAddr) -> ConnectionEvent {
    let port = u16::try_from(index % 1024 + 1).unwrap_or(1);
    ConnectionEvent::new("/usr/bin/nmap", Protocol::Tcp, Direction::Outbound)
        .with_pid(4242)
        .with_source(local_addr(), ephemeral_port(rng))
        .with_destination(target, port)
}

fn burst_event(rng: &mut StdRng) -> ConnectionEvent {
    let app = *APPLICATIONS[..3].choose(rng).unwrap_or(&"/usr/bin/curl");
    ConnectionEvent::new(app, Protocol::Tcp, Direction::Outbound)
        .with_pid(1000)
        .with_source(local_addr(), ephemeral_port(rng))
        .with_destination(remote_addr(rng), 443)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    eprintln!("Using seed: {seed}");
    let mut rng = StdRng::seed_from_u64(seed);

    let count = args.scenario.count(args.count);
    let scan_target = remote_addr(&mut rng);

    let sink: Box<dyn Write> = match &args.output {
        Some(path) => match std::fs::File::create(path) {
            Ok(file) => Box::new(file),
            Err(e) => {
                eprintln!("Error: cannot create {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => Box::new(std::io::stdout().lock()),
    };
    let mut out = BufWriter::new(sink);

    let mut report = Report::default();
    for i in 0..count {
        let event = match args.scenario {
            Scenario::Mixed => mixed_event(&mut rng),
            Scenario::Scan => scan_event(&mut rng, i, scan_target),
            Scenario::Burst => burst_event(&mut rng),
        };
        report.record(&event);

        let written = serde_json::to_string(&event)
            .map_err(std::io::Error::other)
            .and_then(|line| writeln!(out, "{line}"));
        if let Err(e) = written {
            eprintln!("Error: write failed: {e}");
            return ExitCode::FAILURE;
        }
    }
    if let Err(e) = out.flush() {
        eprintln!("Error: write failed: {e}");
        return ExitCode::FAILURE;
    }

    if let Some(path) = &args.output {
        eprintln!("Wrote {count} events to {}", path.display());
    }
    if args.report {
        report.print();
    }
    ExitCode::SUCCESS
}
