//! daqd - readout pipeline daemon.
//!
//! Assembles the pipeline from a configuration file (memory banks,
//! equipments, aggregator, consumers), runs it until interrupted and
//! drains everything in order on shutdown.

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use daq_core::aggregator::{Aggregator, AggregatorConfig};
use daq_core::config::ConfigMap;
use daq_core::consumer::{BlockFilter, ConsumerSlot, Fanout, create_consumer};
use daq_core::equipment::{Equipment, create_equipment};
use daq_core::memory::MemoryBank;
use daq_core::pipeline::PipelineContext;
use daq_core::stats::StatsPublisher;

/// Readout pipeline daemon.
#[derive(Parser)]
#[command(name = "daqd", about = "Detector readout pipeline daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "daqd.cfg")]
    config: PathBuf,

    /// Run duration in seconds; unlimited when not set.
    #[arg(short, long)]
    duration: Option<f64>,

    /// Run number stamped into every data block.
    #[arg(long, default_value = "0")]
    run_number: u32,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("daqd={}", level).parse().expect("static directive parses"))
        .add_directive(format!("daq_core={}", level).parse().expect("static directive parses"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Creates the memory banks listed in `bank-*` sections; with none
/// configured, one malloc bank sized by `readout.defaultBankSize`.
fn create_banks(cfg: &ConfigMap, ctx: &PipelineContext) -> Result<(), Box<dyn std::error::Error>> {
    let sections = cfg.sections_with_prefix("bank-");
    if sections.is_empty() {
        let size = cfg.get_bytes_or("readout", "defaultBankSize", 128 * 1024 * 1024)? as usize;
        info!("no bank configured, creating default malloc bank of {} bytes", size);
        ctx.banks
            .add_bank(Arc::new(MemoryBank::new_malloc(size, "default")?), "default");
        return Ok(());
    }
    for section in sections {
        let name = section.strip_prefix("bank-").unwrap_or(&section).to_string();
        let size = cfg.get_bytes_or(&section, "size", 0)? as usize;
        if size == 0 {
            return Err(format!("bank {}: missing or zero size", section).into());
        }
        let kind = cfg.get_str_or(&section, "type", "malloc");
        let bank = match kind.as_str() {
            "malloc" => MemoryBank::new_malloc(size, &name)?,
            "hugepage" => {
                let mount = cfg.get_str_or(&section, "hugePagePath", "/var/lib/hugetlbfs/global/pagesize-2MB");
                MemoryBank::new_hugepage(size, Path::new(&mount), &name)?
            }
            other => return Err(format!("bank {}: unknown type '{}'", section, other).into()),
        };
        ctx.banks.add_bank(Arc::new(bank), &name);
    }
    Ok(())
}

/// Maps each consumer's `forwardTo` section name to a slot index.
fn resolve_forwards(names: &[String], targets: &[Option<String>]) -> Result<Vec<Option<usize>>, String> {
    targets
        .iter()
        .enumerate()
        .map(|(i, target)| match target {
            None => Ok(None),
            Some(name) => match names.iter().position(|n| n == name) {
                Some(ix) if ix != i => Ok(Some(ix)),
                Some(_) => Err(format!("consumer {} forwards to itself", name)),
                None => Err(format!("forward target '{}' is not a configured consumer", name)),
            },
        })
        .collect()
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("daqd {} starting", env!("CARGO_PKG_VERSION"));
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|e| format!("cannot read {}: {}", args.config.display(), e))?;
    let cfg = ConfigMap::parse(&config_text)?;
    info!("configuration loaded from {}", args.config.display());

    let ctx = PipelineContext::new();
    ctx.set_run_number(args.run_number);
    ctx.stats.set_state("starting");

    create_banks(&cfg, &ctx)?;

    // equipments
    let mut equipments: Vec<Equipment> = Vec::new();
    for section in cfg.sections_with_prefix("equipment-") {
        if !cfg.get_bool_or(&section, "enabled", true)? {
            continue;
        }
        equipments.push(create_equipment(&cfg, &section, &ctx)?);
    }
    if equipments.is_empty() {
        return Err("no equipment configured".into());
    }
    info!("{} equipment(s) configured", equipments.len());

    // aggregator
    let mut aggregator = Aggregator::new(AggregatorConfig::from_config(&cfg)?, &ctx);
    for equipment in &equipments {
        aggregator.add_input(equipment.output());
    }
    let aggregator_output = aggregator.output();

    // consumers
    let mut names = Vec::new();
    let mut forwards = Vec::new();
    let mut slots = Vec::new();
    for section in cfg.sections_with_prefix("consumer-") {
        if !cfg.get_bool_or(&section, "enabled", true)? {
            continue;
        }
        let consumer = create_consumer(&cfg, &section, &ctx)?;
        let filter = BlockFilter::from_config(&cfg, &section)?;
        let stop_on_error = cfg.get_bool_or(&section, "stopOnError", false)?;
        names.push(section.clone());
        forwards.push(cfg.get_str(&section, "forwardTo").map(str::to_string));
        slots.push(ConsumerSlot::new(consumer).with_filter(filter).with_stop_on_error(stop_on_error));
    }
    let resolved = resolve_forwards(&names, &forwards)?;
    for (slot, target) in slots.iter_mut().zip(&resolved) {
        slot.forward_to = *target;
    }
    for target in resolved.into_iter().flatten() {
        slots[target].forward_only = true;
    }
    info!("{} consumer(s) configured", slots.len());
    let mut fanout = Fanout::new(aggregator_output.clone(), slots, &ctx);

    // stats publication
    let mut publisher = match cfg.get_str("readout", "statsPublishAddress") {
        Some(target) => {
            let period = cfg.get_f64_or("readout", "statsPublishInterval", 1.0)?;
            Some(StatsPublisher::start(
                ctx.stats.clone(),
                ctx.metrics.clone(),
                target,
                Duration::from_secs_f64(period.max(0.05)),
            )?)
        }
        None => None,
    };

    // graceful shutdown on ctrl-c
    let running = Arc::new(AtomicBool::new(true));
    {
        let r = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received shutdown signal");
            r.store(false, Ordering::SeqCst);
        }) {
            warn!("failed to set ctrl-c handler: {}", e);
        }
    }

    // start order: sinks first, then the aggregator, then the producers
    fanout.start()?;
    aggregator.start();
    for equipment in &mut equipments {
        equipment.start()?;
    }
    for equipment in &equipments {
        equipment.set_data_on();
    }
    ctx.stats.set_state("running");
    info!("running");

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if let Some(limit) = args.duration {
            if started.elapsed().as_secs_f64() >= limit {
                info!("configured duration elapsed");
                break;
            }
        }
        if ctx.is_stop_requested() {
            warn!("run stop requested by a pipeline component");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    // shutdown: stop producing, drain each stage in order, then sinks
    ctx.stats.set_state("stopping");
    info!("stopping data taking");
    for equipment in &equipments {
        equipment.set_data_off();
    }
    for equipment in &mut equipments {
        equipment.stop();
    }

    let flush_timeout = cfg.get_f64_or("readout", "flushTimeout", 2.0)?;
    aggregator.flush_and_wait(Duration::from_secs_f64(flush_timeout));
    let drain_deadline = Instant::now() + Duration::from_secs_f64(flush_timeout);
    while !aggregator_output.is_empty() && Instant::now() < drain_deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    fanout.stop();
    aggregator.stop();
    if let Some(p) = publisher.as_mut() {
        p.stop();
    }

    ctx.stats.set_state("idle");
    ctx.stats.print();
    info!("shutdown complete after {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("daqd: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_resolution() {
        let names = vec!["consumer-zstd".to_string(), "consumer-rec".to_string()];
        let targets = vec![Some("consumer-rec".to_string()), None];
        let resolved = resolve_forwards(&names, &targets).unwrap();
        assert_eq!(resolved, vec![Some(1), None]);
    }

    #[test]
    fn forward_to_unknown_consumer_fails() {
        let names = vec!["consumer-a".to_string()];
        let targets = vec![Some("consumer-missing".to_string())];
        assert!(resolve_forwards(&names, &targets).is_err());
    }

    #[test]
    fn forward_to_self_fails() {
        let names = vec!["consumer-a".to_string()];
        let targets = vec![Some("consumer-a".to_string())];
        assert!(resolve_forwards(&names, &targets).is_err());
    }

    #[test]
    fn default_bank_is_created_without_bank_sections() {
        let cfg = ConfigMap::parse("[readout]\ndefaultBankSize=1M\n").unwrap();
        let ctx = PipelineContext::new();
        create_banks(&cfg, &ctx).unwrap();
        assert_eq!(ctx.banks.bank_names(), vec!["default"]);
    }

    #[test]
    fn bank_sections_require_a_size() {
        let cfg = ConfigMap::parse("[bank-a1]\ntype=malloc\n").unwrap();
        let ctx = PipelineContext::new();
        assert!(create_banks(&cfg, &ctx).is_err());
    }
}
