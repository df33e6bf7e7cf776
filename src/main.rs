use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rust_tlsaudit::{
    config::{Isolation, ScanConfig},
    connectivity::dns,
    output,
    scanner::{CommandId, PluginRegistry, ScanCommand},
    scheduler::{worker::serve_worker_process, ConcurrentScanner, ScanJob},
    ClientAuthenticationCredentials, ConnectivityProber, ServerConnectivityInfo, SocketHandshaker,
    TlsHandshaker,
};

/// Audits the TLS configuration of one or more servers
#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = None,
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Targets as host[:port] (port defaults to 443)
    #[arg(required = true)]
    targets: Vec<String>,

    /// Server name to send instead of the target hostname
    #[arg(long)]
    sni: Option<String>,

    /// Client certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Scan commands to run, comma separated (default: all)
    #[arg(long, value_delimiter = ',')]
    commands: Vec<CommandId>,

    /// Path requested by the HTTP header scan
    #[arg(long, default_value = "/")]
    http_path: String,

    /// Number of concurrent workers
    #[arg(long)]
    workers: Option<usize>,

    /// Per-job timeout in seconds (0 disables it)
    #[arg(long)]
    timeout: Option<u64>,

    /// How each job is isolated
    #[arg(long, value_enum)]
    isolation: Option<Isolation>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print one JSON document instead of text
    #[arg(long)]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one encoded job from stdin (used by process isolation)
    #[command(hide = true)]
    Worker,

    /// Write the default configuration to a file
    WriteConfig { path: PathBuf },
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set subscriber")
}

fn parse_target(target: &str) -> Result<(String, u16)> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if target.parse::<IpAddr>().is_ok() {
        return Ok((target.to_string(), 443));
    }
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in target {target}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((target.to_string(), 443)),
    }
}

fn build_config(cli: &Cli) -> Result<ScanConfig> {
    let mut config = match &cli.config {
        Some(path) => ScanConfig::from_file(path)?,
        None => ScanConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(timeout) = cli.timeout {
        config.job_timeout_secs = timeout;
    }
    if let Some(isolation) = cli.isolation {
        config.isolation = isolation;
    }
    Ok(config)
}

fn scan_commands(cli: &Cli) -> Vec<ScanCommand> {
    let ids = if cli.commands.is_empty() {
        CommandId::ALL.to_vec()
    } else {
        cli.commands.clone()
    };
    ids.into_iter()
        .map(|id| match id {
            CommandId::HttpHeaders => ScanCommand::HttpHeaders {
                path: cli.http_path.clone(),
            },
            other => ScanCommand::from_id(other),
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let handshaker: Arc<dyn TlsHandshaker> = Arc::new(SocketHandshaker::new());
    let registry = Arc::new(PluginRegistry::with_default_plugins());

    match &cli.command {
        Some(Commands::Worker) => {
            serve_worker_process(&registry, handshaker.as_ref()).await?;
            return Ok(());
        }
        Some(Commands::WriteConfig { path }) => {
            ScanConfig::create_example(path)?;
            println!("wrote {}", path.display());
            return Ok(());
        }
        None => {}
    }

    let config = build_config(&cli)?;
    let credentials = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some(ClientAuthenticationCredentials::new(cert, key)),
        _ => None,
    };

    let start = Local::now();
    if !cli.json {
        output::print_start_banner(start);
    }

    let prober = ConnectivityProber::new(handshaker.clone()).with_timeout(config.network_timeout());
    let mut probes = JoinSet::new();
    for (order, target) in cli.targets.iter().enumerate() {
        let (host, port) = parse_target(target)?;
        let prober = prober.clone();
        let sni = cli.sni.clone();
        let credentials = credentials.clone();
        let target = target.clone();
        probes.spawn(async move {
            let result = prober.probe_host(&host, port, sni, credentials.as_ref()).await;
            (order, target, result)
        });
    }

    let mut probed = Vec::new();
    let mut servers: Vec<ServerConnectivityInfo> = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = probes.join_next().await {
        let (order, target, result) = joined.context("connectivity probe panicked")?;
        match result {
            Ok(info) => probed.push((order, info)),
            Err(e) => {
                warn!("{}: {}", target, e);
                failures.push((target, e.to_string()));
            }
        }
    }
    probed.sort_by_key(|(order, _)| *order);
    servers.extend(probed.into_iter().map(|(_, info)| info));

    if !cli.json {
        for (target, error) in &failures {
            output::print_connectivity_failure(target, error);
        }
    }

    let scanner = ConcurrentScanner::new(registry, handshaker, config.scanner_options()?);
    let commands = scan_commands(&cli);
    let jobs: Vec<ScanJob> = servers
        .iter()
        .flat_map(|info| {
            let info = Arc::new(info.clone());
            commands
                .iter()
                .map(move |command| ScanJob::new(info.clone(), command.clone()))
        })
        .collect();
    info!("submitting {} jobs for {} server(s)", jobs.len(), servers.len());

    let mut outcomes = scanner.submit(jobs)?;
    let mut collected = Vec::with_capacity(outcomes.remaining());
    let mut interrupted = false;
    loop {
        tokio::select! {
            item = outcomes.next() => match item {
                Some(item) => collected.push(item),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!("interrupted, cancelling outstanding jobs");
                interrupted = true;
                scanner.drain(std::time::Duration::ZERO).await;
            }
        }
    }
    scanner.drain(config.drain_grace()).await;

    collected.sort_by_key(|(job, _)| job.id);

    if cli.json {
        let report = output::json_report(&servers, &failures, &collected);
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for info in &servers {
        let rdns = dns::reverse_lookup(info.location.ip_address).await;
        output::print_server_header(info, rdns.as_deref());
        for (job, outcome) in collected
            .iter()
            .filter(|(job, _)| job.server_info.location == info.location)
        {
            output::print_outcome(job, outcome);
        }
    }
    output::print_end_banner(start, servers.len());

    Ok(())
}
