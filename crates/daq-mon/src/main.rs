//! daq-mon - live monitor for the readout daemon.
//!
//! Receives the stats records published by daqd over UDP and renders a
//! console dashboard (or plain line-per-record output).

use std::io::{Write, stdout};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

use clap::Parser;
use crossterm::{
    cursor,
    terminal::{Clear, ClearType},
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use daq_core::stats::StatsRecord;
use daq_core::util::format_bytes;

/// Readout statistics monitor.
#[derive(Parser)]
#[command(name = "daq-mon", about = "Readout statistics monitor", version)]
struct Args {
    /// Address to listen on for stats datagrams.
    #[arg(short, long, default_value = "0.0.0.0:6008")]
    listen: String,

    /// Plain output: one line per received record, no screen control.
    #[arg(short, long)]
    plain: bool,

    /// Seconds without a record before the source is reported stale.
    #[arg(long, default_value = "5.0")]
    stale_after: f64,
}

struct Dashboard {
    previous: Option<StatsRecord>,
    last_seen: Option<Instant>,
    records_received: u64,
}

impl Dashboard {
    fn new() -> Self {
        Self { previous: None, last_seen: None, records_received: 0 }
    }

    /// Rate between the two latest records, bytes/second.
    fn rate(&self, current: &StatsRecord) -> f64 {
        let Some(prev) = &self.previous else { return current.readout_rate };
        let dt = current.timestamp_us.saturating_sub(prev.timestamp_us) as f64 / 1e6;
        if dt <= 0.0 {
            return current.readout_rate;
        }
        current.bytes_readout.saturating_sub(prev.bytes_readout) as f64 / dt
    }

    fn plain_line(&self, record: &StatsRecord) -> String {
        format!(
            "{} state={} stf={} readout={} recorded={} tx={} rate={}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.state_string(),
            record.subtimeframes,
            format_bytes(record.bytes_readout as f64, "B"),
            format_bytes(record.bytes_recorded as f64, "B"),
            format_bytes(record.bytes_tx as f64, "B"),
            format_bytes(self.rate(record), "B/s"),
        )
    }

    fn render(&self, record: &StatsRecord, stale: bool) -> String {
        let mut out = String::new();
        out.push_str("daq-mon - readout statistics\n");
        out.push_str(&format!("updated    : {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S")));
        if stale {
            out.push_str("   [STALE - no recent data]");
        }
        out.push('\n');
        out.push_str(&format!("state      : {}\n", record.state_string()));
        out.push_str(&format!("uptime     : {:.1}s\n", record.timestamp_us as f64 / 1e6));
        out.push_str(&format!("records rx : {}\n", self.records_received));
        out.push('\n');
        out.push_str(&format!("subtimeframes : {}\n", record.subtimeframes));
        out.push_str(&format!(
            "readout       : {}  ({})\n",
            format_bytes(record.bytes_readout as f64, "B"),
            format_bytes(self.rate(record), "B/s"),
        ));
        out.push_str(&format!("recorded      : {}\n", format_bytes(record.bytes_recorded as f64, "B")));
        out.push_str(&format!("transport     : {}\n", format_bytes(record.bytes_tx as f64, "B")));
        out.push_str(&format!("tx pending    : {} pages\n", record.tx_pages_pending));
        if record.tx_pages_released > 0 {
            out.push_str(&format!(
                "tx latency    : {:.1} us/page\n",
                record.tx_latency_us as f64 / record.tx_pages_released as f64
            ));
        }
        match record.first_orbit {
            u64::MAX => out.push_str("first orbit   : undefined\n"),
            orbit => out.push_str(&format!("first orbit   : 0x{:X}\n", orbit)),
        }
        out
    }
}

fn main() -> std::io::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("daq_mon={}", Level::INFO).parse().expect("static directive parses")),
        )
        .with_target(false)
        .init();

    let socket = UdpSocket::bind(&args.listen)?;
    socket.set_read_timeout(Some(Duration::from_millis(500)))?;
    eprintln!("daq-mon: listening on {}", args.listen);

    let mut dashboard = Dashboard::new();
    let mut latest: Option<StatsRecord> = None;
    let mut buf = [0u8; 512];

    loop {
        match socket.recv(&mut buf) {
            Ok(n) => match StatsRecord::decode(&buf[..n]) {
                Ok(record) => {
                    dashboard.records_received += 1;
                    if args.plain {
                        println!("{}", dashboard.plain_line(&record));
                    }
                    dashboard.previous = latest;
                    dashboard.last_seen = Some(Instant::now());
                    latest = Some(record);
                }
                Err(e) => eprintln!("daq-mon: bad record: {}", e),
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }

        if !args.plain {
            if let Some(record) = &latest {
                let stale = dashboard
                    .last_seen
                    .map(|t| t.elapsed().as_secs_f64() > args.stale_after)
                    .unwrap_or(true);
                let mut out = stdout();
                crossterm::execute!(out, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
                write!(out, "{}", dashboard.render(record, stale))?;
                out.flush()?;
            }
        }
    }
}
