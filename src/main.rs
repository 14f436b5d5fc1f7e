use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use proxy_warden::{
    database::ProxyStore,
    job::{FileJobLock, JobInput, JobOptions, JobStatus, Scheduler, Trigger},
    logging, CacheSet, Engine, EngineConfig, ProxyParser, TieBreak,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Proxy validation and classification engine
#[derive(Parser)]
#[command(name = "proxy-warden")]
#[command(about = "Validate, classify and consolidate scraped proxies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Proxy store database URL
    #[arg(short, long, default_value = "sqlite:proxies.db")]
    database: String,

    /// Exclusion cache database URL
    #[arg(long, default_value = "sqlite:exclusion-cache.db")]
    cache: String,

    /// Directory holding job lock files
    #[arg(long)]
    lock_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a checker job
    Check {
        /// File with free-form proxy text
        #[arg(short, long, conflicts_with = "proxy")]
        input: Option<PathBuf>,
        /// Single proxy, ip:port or user:pass@ip:port
        #[arg(short, long)]
        proxy: Option<String>,
        /// Checker kind (full, https, sweep)
        #[arg(short, long, default_value = "full")]
        kind: String,
        /// User or session owning the job lock
        #[arg(long, default_value = "cli")]
        session: String,
        /// What launched the job (web, scheduled)
        #[arg(long, default_value = "scheduled")]
        trigger: String,
        /// Ignore the execution budget
        #[arg(long)]
        admin: bool,
        /// Execution budget in seconds
        #[arg(long)]
        budget: Option<u64>,
        /// Candidates checked concurrently per chunk
        #[arg(long)]
        chunk: Option<usize>,
        /// Stored rows sampled when no input is given
        #[arg(long, default_value = "100")]
        limit: i64,
        /// Require both title match and a changed egress IP
        #[arg(long)]
        accurate: bool,
        /// Progress log file
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Print the candidates found in a file
    Extract {
        /// Input file
        input: PathBuf,
    },
    /// Collapse same-host duplicates across the store and its mirrors
    Consolidate {
        /// Additional store kept in sync (can specify multiple)
        #[arg(short, long)]
        mirror: Vec<String>,
        /// Liveness timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Measure latency through one proxy
    Latency {
        address: String,
        #[arg(short = 'n', long, default_value = "5")]
        iterations: usize,
    },
    /// Classify the anonymity of one proxy
    Anonymity {
        address: String,
        /// Tie-break across protocols (best, worst)
        #[arg(long, default_value = "best")]
        policy: String,
    },
    /// Drop expired exclusion cache entries now
    PurgeCache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = EngineConfig::new();
    if let Some(dir) = &cli.lock_dir {
        config = config.with_lock_dir(dir.clone());
    }

    match cli.command {
        Commands::Check {
            input,
            proxy,
            kind,
            session,
            trigger,
            admin,
            budget,
            chunk,
            limit,
            accurate,
            log,
        } => {
            config = config.with_accurate(accurate);
            if let Some(secs) = budget {
                config = config.with_execution_budget(Duration::from_secs(secs));
            }
            if let Some(size) = chunk {
                config = config.with_chunk_size(size);
            }

            let job_input = match (input, proxy) {
                (Some(path), _) => JobInput::Text(std::fs::read_to_string(&path)?),
                (None, Some(address)) => JobInput::Single(address),
                (None, None) => JobInput::Store { limit },
            };
            let options = JobOptions {
                kind: kind.parse()?,
                session,
                trigger: parse_trigger(&trigger)?,
                admin,
                log_path: log,
            };

            let lock = Arc::new(FileJobLock::new(&config.lock_dir));
            let engine = Engine::open(config, &cli.database, &cli.cache).await?;
            let scheduler = Scheduler::new(Arc::new(engine), lock);

            let job = match scheduler.accept(options) {
                Ok(job) => job,
                Err(e) => {
                    println!("{}", serde_json::to_string(&JobStatus::rejected(&e))?);
                    return Ok(());
                }
            };
            println!("{}", serde_json::to_string(&job.status())?);

            // dropping the job on Ctrl-C releases its lock
            tokio::select! {
                summary = job.run(job_input) => {
                    let summary = summary?;
                    eprintln!(
                        "Results: {} active, {} dead, {} skipped, {} left over",
                        summary.active, summary.dead, summary.skipped, summary.remaining
                    );
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted, releasing job lock");
                }
            }
        }
        Commands::Extract { input } => {
            let candidates = ProxyParser::extract_file(&input)?;
            eprintln!("Extracted {} candidates from {:?}", candidates.len(), input);
            for candidate in &candidates {
                println!("{}", candidate);
            }
        }
        Commands::Consolidate { mirror, timeout } => {
            let engine = Engine::open(config, &cli.database, &cli.cache).await?;
            let mut mirrors = Vec::new();
            for url in &mirror {
                mirrors.push(ProxyStore::open(url).await?);
            }
            let stores: Vec<&ProxyStore> =
                std::iter::once(engine.store()).chain(mirrors.iter()).collect();

            let summary = engine
                .consolidator()
                .clone()
                .with_timeout(Duration::from_secs(timeout))
                .run(&stores)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Latency {
            address,
            iterations,
        } => {
            let candidate = ProxyParser::parse_single(&address)
                .ok_or_else(|| anyhow!("Invalid proxy address: {}", address))?;
            let engine = Engine::open(config, &cli.database, &cli.cache).await?;
            let report = engine
                .profiler()
                .clone()
                .with_iterations(iterations)
                .measure(&candidate)
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Anonymity { address, policy } => {
            let candidate = ProxyParser::parse_single(&address)
                .ok_or_else(|| anyhow!("Invalid proxy address: {}", address))?;
            let tie_break: TieBreak = policy.parse()?;
            let engine = Engine::open(config, &cli.database, &cli.cache).await?;
            let device_ip = engine.device_ip().await;
            let report = engine
                .classifier()
                .clone()
                .with_tie_break(tie_break)
                .classify(&candidate, device_ip)
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::PurgeCache => {
            let engine = Engine::open(config, &cli.database, &cli.cache).await?;
            let removed = engine.cache().purge_expired().await?;
            println!(
                "Purged {} expired entries ({} used, {} dead remain)",
                removed,
                engine.cache().len(CacheSet::Used).await?,
                engine.cache().len(CacheSet::Dead).await?
            );
        }
    }

    Ok(())
}

fn parse_trigger(s: &str) -> Result<Trigger> {
    match s.to_lowercase().as_str() {
        "web" => Ok(Trigger::Web),
        "scheduled" | "cli" | "cron" => Ok(Trigger::Scheduled),
        _ => Err(anyhow!("Invalid trigger: {}. Use: web, scheduled", s)),
    }
}
