use anyhow::{anyhow, bail, Context};
use clap::{value_parser, Arg, ArgMatches, Command};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use netsniff::{
    network::{
        export::{default_export_name, export_to_file},
        AnalyticsEngine, CaptureOrchestrator, CaptureSession, ExportFormat, SessionState,
    },
    utils::is_elevated,
    CaptureConfig, Config,
};

const MAX_LINES_PER_TICK: usize = 20;
const TOP_TALKERS: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("netsniff")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Packet capture with automatic strategy fallback and traffic analytics")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true)
        )
        .subcommand(
            Command::new("interfaces")
                .about("List capture interfaces")
        )
        .subcommand(
            Command::new("capture")
                .about("Capture packets and print a traffic summary")
                .arg(
                    Arg::new("interface")
                        .short('i')
                        .long("interface")
                        .value_name("INTERFACE")
                        .help("Interface name, or 'any' for automatic selection")
                )
                .arg(
                    Arg::new("filter")
                        .short('f')
                        .long("filter")
                        .value_name("BPF")
                        .help("Capture filter expression, e.g. 'tcp and port 443'")
                )
                .arg(
                    Arg::new("count")
                        .short('c')
                        .long("count")
                        .value_name("PACKETS")
                        .help("Stop after this many packets (0 = unbounded)")
                        .value_parser(value_parser!(usize))
                )
                .arg(
                    Arg::new("timeout")
                        .short('t')
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Capture duration in seconds")
                        .value_parser(value_parser!(u64))
                )
                .arg(
                    Arg::new("export")
                        .long("export")
                        .value_name("FORMAT")
                        .help("Export captured packets as json or csv")
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .value_name("PATH")
                        .help("Export file path")
                        .requires("export")
                )
        )
        .get_matches();

    let config = load_config(matches.get_one::<String>("config"))?;
    init_logging(&config);

    match matches.subcommand() {
        Some(("interfaces", _)) => run_interfaces(&config),
        Some(("capture", sub_matches)) => run_capture(&config, sub_matches).await,
        _ => {
            eprintln!("No subcommand provided. Use --help for usage information.");
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path).with_context(|| format!("Cannot load config {}", path))?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.logging.level.as_str()))
        .format_timestamp_millis()
        .init();
}

fn run_interfaces(config: &Config) -> anyhow::Result<()> {
    let orchestrator = CaptureOrchestrator::new(config);
    let interfaces = orchestrator.interfaces();

    println!("\n=== CAPTURE INTERFACES ===");
    for iface in &interfaces {
        let addresses: Vec<&str> = iface.addresses.iter().map(|a| a.address.as_str()).collect();
        println!(
            "{:<24} {:<9} {:<5} {}",
            iface.name,
            format!("{:?}", iface.kind).to_lowercase(),
            if iface.is_up { "up" } else { "down" },
            if addresses.is_empty() { "-".to_string() } else { addresses.join(", ") }
        );
    }
    println!("\nStrategies: {}", orchestrator.strategy_names().join(" -> "));
    Ok(())
}

fn capture_request(config: &Config, matches: &ArgMatches) -> CaptureConfig {
    let mut request = CaptureConfig::from_defaults(&config.capture);
    if let Some(interface) = matches.get_one::<String>("interface") {
        request = request.with_interface(interface);
    }
    if let Some(filter) = matches.get_one::<String>("filter") {
        request = request.with_filter(filter);
    }
    if let Some(count) = matches.get_one::<usize>("count") {
        request = request.with_packet_count(*count);
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        request = request.with_timeout_secs(*timeout);
    }
    request
}

async fn run_capture(config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    let export = matches
        .get_one::<String>("export")
        .map(|f| f.parse::<ExportFormat>())
        .transpose()?;
    let output = matches.get_one::<String>("output").map(PathBuf::from);
    let request = capture_request(config, matches);

    if !is_elevated() {
        warn!("Not running as root/Administrator: live capture will likely be refused and fall back to demo data");
    }

    let orchestrator = CaptureOrchestrator::new(config);
    let session = orchestrator.start(request)?;
    info!("Capture session {} started. Press Ctrl-C to stop.", session.id());

    follow(&session).await?;

    let report = session.report();
    print_summary(&session);

    if report.state == SessionState::Failed {
        bail!(report.error.unwrap_or_else(|| "capture failed".to_string()));
    }

    if let Some(format) = export {
        let path = output.unwrap_or_else(|| PathBuf::from(default_export_name(format)));
        export_records(&report.packets, format, &path)?;
    }
    Ok(())
}

/// Prints new packets every second until the session ends or Ctrl-C.
async fn follow(session: &Arc<CaptureSession>) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut printed = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping capture");
                let stopping = Arc::clone(session);
                tokio::task::spawn_blocking(move || stopping.stop())
                    .await
                    .map_err(|e| anyhow!("stop task failed: {}", e))?;
                return Ok(());
            }
            _ = interval.tick() => {
                let stats = session.statistics();
                let fresh = (stats.total_packets - printed) as usize;
                if fresh > 0 {
                    let shown = fresh.min(MAX_LINES_PER_TICK);
                    for record in session.records(Some(shown)) {
                        println!("{}", AnalyticsEngine::format_record(&record));
                    }
                    if fresh > shown {
                        println!("... {} more", fresh - shown);
                    }
                    printed = stats.total_packets;
                }
                if session.is_finished() {
                    return Ok(());
                }
            }
        }
    }
}

fn print_summary(session: &CaptureSession) {
    let status = session.status();
    let records = session.records(None);

    println!("\n=== CAPTURE SUMMARY ===");
    println!("Session ID: {}", status.id);
    println!("State: {:?}", status.state);
    if let Some(ref strategy) = status.strategy {
        println!("Strategy: {}{}", strategy, if status.demo_mode { " (demo data)" } else { "" });
    }
    if let Some(ref error) = status.error {
        println!("Error: {}", error);
    }
    println!("Duration: {:.2}s", status.duration);
    println!("Packets: {} ({} buffered)", status.stats.total_packets, status.buffered);
    println!("Bytes: {}", status.stats.total_bytes);
    println!("Rate: {:.2} packets/s", status.stats.packets_per_second);

    println!("\n--- Protocol Distribution ---");
    for (protocol, count) in &status.stats.protocols {
        println!("{}: {}", protocol, count);
    }

    println!("\n--- Top Talkers ---");
    for talker in AnalyticsEngine::top_talkers(&records, TOP_TALKERS) {
        println!("{:<40} {:>10} bytes {:>6} packets", talker.address, talker.bytes, talker.packets);
    }

    println!("\n--- Application Traffic ---");
    println!("HTTP/HTTPS: {}", AnalyticsEngine::filter_http(&records).len());
    println!("DNS: {}", AnalyticsEngine::filter_dns(&records).len());

    let flows = AnalyticsEngine::conversations(&records);
    if !flows.is_empty() {
        println!("\n--- Busiest Conversations ---");
        for flow in flows.iter().take(TOP_TALKERS) {
            println!(
                "{} ({} packets, {} bytes, avg {:.1})",
                flow.flow_id, flow.packet_count, flow.byte_count, flow.avg_packet_size
            );
        }
    }
}

fn export_records(records: &[netsniff::network::PacketRecord], format: ExportFormat, path: &Path) -> anyhow::Result<()> {
    export_to_file(records, format, path).with_context(|| format!("Cannot export to {}", path.display()))?;
    println!("\nExported {} packets to {}", records.len(), path.display());
    Ok(())
}
