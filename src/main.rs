use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use strata::discovery::corroborate::Corroboration;
use strata::discovery::MatchPolicy;
use strata::network::TransportSelection;
use strata::output::{OutputConfig, OutputFormat, OutputManager};
use strata::scanner::ProbeEvent;
use strata::utils::scan_options::{PortSet, ScanOrder};
use strata::utils::target_parser::resolve_targets;
use strata::utils::Logger;
use strata::{ScanConfig, ScanEngine, ScanError};

/// Descriptors kept free for stdio, the resolver and discovery sessions
const RESERVED_DESCRIPTORS: u64 = 64;

const POLICIES: [&str; 2] = ["first-match", "all-matching"];

fn build_cli() -> Command {
    Command::new("strata")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Layered service discovery: find open ports, then identify session, presentation and application protocols")
        .arg(
            Arg::new("target")
                .value_name("TARGET")
                .help("IPv4 address, start-end range, CIDR block or hostname")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("ports")
                .value_name("PORTS")
                .help("Ports to scan (e.g. 22 80,443 8000-8100). Default: 1-65535")
                .num_args(0..)
                .index(2),
        )
        .arg(
            Arg::new("tcp")
                .long("tcp")
                .help("Scan TCP only")
                .action(ArgAction::SetTrue)
                .conflicts_with("udp"),
        )
        .arg(
            Arg::new("udp")
                .long("udp")
                .help("Scan UDP only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .value_name("MS")
                .help("Per-attempt connect timeout in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("io-timeout")
                .long("io-timeout")
                .value_name("MS")
                .help("Read, write and handshake timeout during discovery, in milliseconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("concurrency")
                .short('c')
                .long("concurrency")
                .value_name("K")
                .help("Maximum probes in flight at once")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("no-discovery")
                .long("no-discovery")
                .help("Only report open ports")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan-order")
                .long("scan-order")
                .value_name("ORDER")
                .help("Probe order")
                .value_parser(["serial", "random"]),
        )
        .arg(
            Arg::new("session-policy")
                .long("session-policy")
                .value_name("POLICY")
                .help("Matching policy for session plugins")
                .value_parser(POLICIES),
        )
        .arg(
            Arg::new("presentation-policy")
                .long("presentation-policy")
                .value_name("POLICY")
                .help("Matching policy for presentation plugins")
                .value_parser(POLICIES),
        )
        .arg(
            Arg::new("app-policy")
                .long("app-policy")
                .value_name("POLICY")
                .help("Matching policy for application plugins")
                .value_parser(POLICIES),
        )
        .arg(
            Arg::new("corroborate")
                .long("corroborate")
                .value_name("MODE")
                .help("How suspected exposures are confirmed")
                .value_parser(["http", "command", "none"]),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FORMAT")
                .help("Report format")
                .value_parser(["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .value_name("FILE")
                .help("Write the report to FILE instead of stdout"),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .help("Disable coloured text output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-progress")
                .long("no-progress")
                .help("Hide the probe progress bar")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Load settings from a TOML file (default: ~/.strata.toml)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Debug logging")
                .action(ArgAction::SetTrue),
        )
}

fn parse_choice<T: std::str::FromStr<Err = String>>(
    matches: &ArgMatches,
    id: &str,
) -> Result<Option<T>, ScanError> {
    matches
        .get_one::<String>(id)
        .map(|value| value.parse::<T>().map_err(ScanError::Usage))
        .transpose()
}

/// Layer command-line flags over the loaded configuration
fn apply_flags(mut config: ScanConfig, matches: &ArgMatches) -> Result<ScanConfig, ScanError> {
    if let Some(target) = matches.get_one::<String>("target") {
        config.target = target.clone();
    }

    let ports: Vec<&String> = matches
        .get_many::<String>("ports")
        .map(|values| values.collect())
        .unwrap_or_default();
    if !ports.is_empty() {
        config.ports = PortSet::parse(&ports)?;
    }

    if matches.get_flag("tcp") {
        config.transport = TransportSelection::Tcp;
    } else if matches.get_flag("udp") {
        config.transport = TransportSelection::Udp;
    }

    if let Some(&timeout) = matches.get_one::<u64>("timeout") {
        config.timeout_ms = timeout;
        if matches.get_one::<u64>("io-timeout").is_none() && config.io_timeout_ms < timeout {
            config.io_timeout_ms = timeout;
        }
    }
    if let Some(&io_timeout) = matches.get_one::<u64>("io-timeout") {
        config.io_timeout_ms = io_timeout;
    }
    if let Some(&concurrency) = matches.get_one::<usize>("concurrency") {
        config.concurrency = concurrency;
    }
    if matches.get_flag("no-discovery") {
        config.discovery = false;
    }
    if let Some(order) = parse_choice::<ScanOrder>(matches, "scan-order")? {
        config.scan_order = order;
    }
    if let Some(policy) = parse_choice::<MatchPolicy>(matches, "session-policy")? {
        config.policies.session = policy;
    }
    if let Some(policy) = parse_choice::<MatchPolicy>(matches, "presentation-policy")? {
        config.policies.presentation = policy;
    }
    if let Some(policy) = parse_choice::<MatchPolicy>(matches, "app-policy")? {
        config.policies.application = policy;
    }
    if let Some(mode) = parse_choice::<Corroboration>(matches, "corroborate")? {
        config.corroboration = mode;
    }

    Ok(config)
}

// Raise the descriptor soft limit to fit K sockets, or clamp K to what fits
#[cfg(unix)]
fn fit_descriptor_limit(concurrency: usize) -> usize {
    use rlimit::Resource;

    let wanted = concurrency as u64 + RESERVED_DESCRIPTORS;
    let (soft, hard) = match Resource::NOFILE.get() {
        Ok(limits) => limits,
        Err(e) => {
            log::warn!("Could not read file descriptor limit: {}", e);
            return concurrency;
        }
    };
    if soft >= wanted {
        return concurrency;
    }

    let raised = wanted.min(hard);
    let available = match Resource::NOFILE.set(raised, hard) {
        Ok(()) => {
            log::info!("Raised file descriptor limit from {} to {}", soft, raised);
            raised
        }
        Err(e) => {
            log::warn!("Could not raise file descriptor limit: {}", e);
            soft
        }
    };

    let usable = available.saturating_sub(RESERVED_DESCRIPTORS).max(1) as usize;
    if usable < concurrency {
        eprintln!(
            "{} {} {}",
            "[!] Descriptor limit too low, clamping concurrency to".bright_yellow(),
            usable.to_string().bright_cyan().bold(),
            format!("(requested {})", concurrency).bright_yellow()
        );
        usable
    } else {
        concurrency
    }
}

#[cfg(not(unix))]
fn fit_descriptor_limit(concurrency: usize) -> usize {
    concurrency
}

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} probes ({eta})",
        )
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar
}

async fn run(matches: ArgMatches) -> anyhow::Result<()> {
    let config_path = matches.get_one::<PathBuf>("config");
    let mut config = apply_flags(ScanConfig::load(config_path.map(PathBuf::as_path))?, &matches)?;
    config.concurrency = fit_descriptor_limit(config.concurrency);

    let format: OutputFormat = parse_choice(&matches, "output")?.unwrap_or_default();
    let output = OutputManager::new(OutputConfig {
        format,
        file: matches.get_one::<String>("output-file").cloned(),
        colored: !matches.get_flag("no-color"),
    });

    let targets = resolve_targets(&config.target).await?;
    let mut engine = ScanEngine::new(config)?;
    log::info!(
        "Scanning {} target(s), {} probe attempts",
        targets.len(),
        engine.total_attempts(&targets)
    );

    let bar = if format == OutputFormat::Text && !matches.get_flag("no-progress") {
        let bar = progress_bar(engine.total_attempts(&targets));
        let hook = bar.clone();
        engine = engine.with_progress(Arc::new(move |_: ProbeEvent| hook.inc(1)));
        Some(bar)
    } else {
        None
    };

    let reports = engine.scan(targets).await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    output
        .write_results(&reports)
        .context("Failed to write scan report")?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();

    let level = if matches.get_flag("verbose") {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    Logger::init(level);

    if let Err(e) = run(matches).await {
        let usage = e
            .downcast_ref::<ScanError>()
            .map(ScanError::is_usage)
            .unwrap_or(false);
        eprintln!("{} {:#}", "[!]".bright_red().bold(), e);
        process::exit(if usage { 2 } else { 1 });
    }
}
