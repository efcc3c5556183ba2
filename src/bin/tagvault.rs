use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tagvault::catalog::{CsvCatalogBuilder, TagCatalog};
use tagvault::config::CollectorConfig;
use tagvault::core::{clock, format_day, parse_day};
use tagvault::orchestrator::{Archiver, Orchestrator};
use tagvault::staging::{SqliteStaging, StagingStore};
use tagvault::store::{CoarseCache, DayStore, QueryEngine, ResampleMethod};
use time::Date;

/// Width of the range queried when neither --from nor --to is given.
const AUTO_RANGE: Duration = Duration::from_secs(8 * 3600);

#[derive(Parser)]
#[command(name = "tagvault")]
#[command(about = "Poll field devices and archive their tags into day files")]
struct Cli {
    /// Collector configuration (JSON)
    #[arg(long, global = true, default_value = "tagvault.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every polling job and the archiver until Ctrl-C or SIGTERM
    Run,
    /// Move staged samples into the day store
    Archive {
        /// Run a single pass and exit instead of archiving on the interval
        #[arg(long)]
        once: bool,
    },
    /// Print a resampled range as CSV
    Query {
        /// Comma-separated tag names
        #[arg(long, value_delimiter = ',', required = true)]
        tags: Vec<String>,

        /// Range start (RFC 3339, "YYYY-MM-DD HH:MM:SS" or "YYYY-MM-DD", local).
        /// Without --from and --to, the last 8 hours of archived data.
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Range end, same formats as --from
        #[arg(long, requires = "from")]
        to: Option<String>,

        /// raw, nearest, ffill, mean, min, max, median, interpolate, rolling_mean[:secs]
        #[arg(long, default_value = "mean")]
        method: String,

        /// Bucket width in seconds (default: range / 500, at least 1s)
        #[arg(long)]
        bucket: Option<u64>,
    },
    /// Update the one-minute coarse cache of every tag
    Coarse,
    /// Build the tag catalog from the configured sheet
    Catalog {
        /// Rebuild even if the artifact exists
        #[arg(long)]
        rebuild: bool,
    },
    /// List parked days with their tag count and size
    Days {
        /// Skip days holding this many bytes or fewer
        #[arg(long, default_value_t = 0)]
        min_bytes: u64,
    },
    /// Delete the day files of some tags, and their coarse cache
    RemoveTags {
        /// Comma-separated tag names
        #[arg(long, value_delimiter = ',', required = true)]
        tags: Vec<String>,

        /// First day to clean (YYYY-MM-DD); every day when omitted
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Last day to clean, inclusive
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Rewrite day files to the catalog datatype and the store timezone
    Repair {
        /// Comma-separated tag names; every catalog tag when omitted
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// First day to repair (YYYY-MM-DD); every day when omitted
        #[arg(long, requires = "to")]
        from: Option<String>,

        /// Last day to repair, inclusive
        #[arg(long, requires = "from")]
        to: Option<String>,
    },
    /// Delete staged samples without archiving them
    Flush {
        /// Only delete samples older than this timestamp
        #[arg(long)]
        before: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = CollectorConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Run => run(&config),
        Commands::Archive { once } => archive(&config, once),
        Commands::Query {
            tags,
            from,
            to,
            method,
            bucket,
        } => {
            let range = from.zip(to);
            query(&config, &tags, range, &method, bucket)
        }
        Commands::Coarse => coarse(&config),
        Commands::Catalog { rebuild } => {
            let catalog = load_catalog(&config, rebuild)?;
            println!(
                "{} tag(s) on {} device(s) -> {}",
                catalog.len(),
                catalog.devices().len(),
                config.catalog_path.display()
            );
            Ok(())
        }
        Commands::Days { min_bytes } => days(&config, min_bytes),
        Commands::RemoveTags { tags, from, to } => {
            let range = day_range(from.zip(to))?;
            remove_tags(&config, &tags, range)
        }
        Commands::Repair { tags, from, to } => {
            let range = day_range(from.zip(to))?;
            repair(&config, &tags, range)
        }
        Commands::Flush { before } => flush(&config, before.as_deref()),
    }
}

fn load_catalog(config: &CollectorConfig, rebuild: bool) -> Result<TagCatalog> {
    match &config.catalog_csv {
        Some(csv) => {
            let builder = CsvCatalogBuilder::new(csv);
            TagCatalog::load_or_build(&config.catalog_path, &builder, rebuild)
                .with_context(|| format!("Failed to build catalog from {}", csv.display()))
        }
        None if rebuild => bail!("--rebuild needs catalog_csv in the config"),
        None => TagCatalog::load(&config.catalog_path)
            .with_context(|| format!("Failed to load catalog {}", config.catalog_path.display())),
    }
}

fn open_staging(path: &Path) -> Result<Arc<dyn StagingStore>> {
    let staging = SqliteStaging::open(path)
        .with_context(|| format!("Failed to open staging database {}", path.display()))?;
    Ok(Arc::new(staging))
}

fn run(config: &CollectorConfig) -> Result<()> {
    let catalog = Arc::new(load_catalog(config, false)?);
    let staging = open_staging(&config.staging_path)?;
    let store = DayStore::new(&config.store_root, config.timezone);

    let orchestrator = Orchestrator::new(
        Arc::clone(&catalog),
        config.supervisors(),
        Arc::clone(&staging),
        config.timezone,
    );
    orchestrator
        .start_all()
        .context("Failed to start polling jobs")?;
    let archiver = Arc::new(Archiver::new(catalog, staging, store));
    orchestrator
        .start_archiver(archiver, config.archive_interval())
        .context("Failed to start archiver")?;
    log::info!(
        "running {} job(s); Ctrl-C or SIGTERM to stop",
        orchestrator.running_jobs().len()
    );

    wait_for_shutdown()?;
    orchestrator.stop_all();
    Ok(())
}

/// Block until Ctrl-C or, on unix, SIGTERM.
fn wait_for_shutdown() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the signal runtime")?;
    runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate =
                signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
            tokio::select! {
                res = ctrl_c => {
                    res.context("Failed to listen for Ctrl-C")?;
                    log::info!("received Ctrl-C, stopping");
                }
                _ = terminate.recv() => log::info!("received SIGTERM, stopping"),
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.context("Failed to listen for Ctrl-C")?;
            log::info!("received Ctrl-C, stopping");
        }

        Ok::<(), anyhow::Error>(())
    })
}

fn archive(config: &CollectorConfig, once: bool) -> Result<()> {
    let catalog = Arc::new(load_catalog(config, false)?);
    let staging = open_staging(&config.staging_path)?;
    let store = DayStore::new(&config.store_root, config.timezone);
    let archiver = Archiver::new(catalog, staging, store);

    if once {
        let report = archiver.run_once(clock::now_ns());
        println!(
            "moved {} row(s) of {} tag(s), {} rejected",
            report.rows_moved, report.tags_archived, report.rows_rejected
        );
        if !report.failed_tags.is_empty() {
            bail!("archive failed for {}", report.failed_tags.join(", "));
        }
        return Ok(());
    }

    let interval = config.archive_interval();
    let mut task = Arc::new(archiver)
        .start(interval)
        .context("Failed to start archiver")?;
    log::info!("archiving every {interval:?}; Ctrl-C or SIGTERM to stop");
    wait_for_shutdown()?;
    task.stop();
    Ok(())
}

fn query(
    config: &CollectorConfig,
    tags: &[String],
    range: Option<(String, String)>,
    method: &str,
    bucket: Option<u64>,
) -> Result<()> {
    let catalog = Arc::new(load_catalog(config, false)?);
    let tz = config.timezone;
    let store = DayStore::new(&config.store_root, tz);
    let (t0, t1) = match range {
        Some((from, to)) => (
            tz.parse_timestamp(&from)
                .with_context(|| format!("Invalid --from {from}"))?,
            tz.parse_timestamp(&to)
                .with_context(|| format!("Invalid --to {to}"))?,
        ),
        None => store
            .auto_time_range(AUTO_RANGE)
            .context("Failed to scan the day store")?
            .context("Nothing archived yet; pass --from and --to")?,
    };
    let method: ResampleMethod = method.parse().context("Invalid --method")?;

    let mut engine = QueryEngine::new(store, catalog)
        .with_coarse(CoarseCache::new(&config.coarse_root))
        .with_staging_window(config.staging_window());
    if config.staging_path.exists() {
        engine = engine.with_staging(open_staging(&config.staging_path)?);
    }
    if let Some(workers) = config.query_workers {
        engine = engine.with_workers(workers);
    }

    let frame = engine
        .load(tags, t0, t1, method, bucket.map(Duration::from_secs))
        .context("Query failed")?;
    frame
        .write_csv(io::stdout().lock(), tz)
        .context("Failed to write CSV")?;
    Ok(())
}

fn coarse(config: &CollectorConfig) -> Result<()> {
    let catalog = load_catalog(config, false)?;
    let store = DayStore::new(&config.store_root, config.timezone);
    let cache = CoarseCache::new(&config.coarse_root);
    let report = cache.update_all(&store, &catalog, clock::now_ns());
    println!(
        "{} tag(s) updated, {} minute(s) written",
        report.tags_updated, report.buckets_written
    );
    if !report.failed_tags.is_empty() {
        bail!("coarse update failed for {}", report.failed_tags.join(", "));
    }
    Ok(())
}

fn day_range(range: Option<(String, String)>) -> Result<Option<(Date, Date)>> {
    let Some((from, to)) = range else {
        return Ok(None);
    };
    let first = parse_day(&from).with_context(|| format!("Invalid --from {from}"))?;
    let last = parse_day(&to).with_context(|| format!("Invalid --to {to}"))?;
    if last < first {
        bail!("--to {to} is before --from {from}");
    }
    Ok(Some((first, last)))
}

fn days(config: &CollectorConfig, min_bytes: u64) -> Result<()> {
    let store = DayStore::new(&config.store_root, config.timezone);
    let days = store
        .parked_days(min_bytes)
        .context("Failed to list parked days")?;
    for summary in &days {
        println!(
            "{}\t{} tag(s)\t{} bytes",
            format_day(summary.day),
            summary.tags,
            summary.bytes
        );
    }
    Ok(())
}

fn remove_tags(
    config: &CollectorConfig,
    tags: &[String],
    range: Option<(Date, Date)>,
) -> Result<()> {
    let store = DayStore::new(&config.store_root, config.timezone);
    let removed = store
        .remove_tags(tags, range)
        .context("Failed to remove day files")?;
    // the cache would keep serving removed data
    let cache = CoarseCache::new(&config.coarse_root);
    for tag in tags {
        cache
            .remove_tag(tag)
            .with_context(|| format!("Failed to drop the coarse cache of {tag}"))?;
    }
    println!("removed {removed} day file(s)");
    Ok(())
}

fn repair(config: &CollectorConfig, tags: &[String], range: Option<(Date, Date)>) -> Result<()> {
    let catalog = load_catalog(config, false)?;
    let selected = if tags.is_empty() {
        catalog.tags().to_vec()
    } else {
        tags.iter()
            .map(|name| catalog.require(name).cloned())
            .collect::<tagvault::Result<Vec<_>>>()
            .context("Unknown tag")?
    };
    let store = DayStore::new(&config.store_root, config.timezone);
    let report = store.repair(&selected, range).context("Repair failed")?;
    println!(
        "{} of {} file(s) rewritten, {} point(s) dropped, {} moved",
        report.files_rewritten, report.files_checked, report.points_dropped, report.points_moved
    );
    if !report.failed.is_empty() {
        bail!("repair failed for {}", report.failed.join(", "));
    }
    Ok(())
}

fn flush(config: &CollectorConfig, before: Option<&str>) -> Result<()> {
    let before = before
        .map(|value| {
            config
                .timezone
                .parse_timestamp(value)
                .with_context(|| format!("Invalid --before {value}"))
        })
        .transpose()?;
    let staging = open_staging(&config.staging_path)?;
    let deleted = staging.flush(before).context("Failed to flush staging")?;
    println!("deleted {deleted} staged row(s)");
    Ok(())
}
