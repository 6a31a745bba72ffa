use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};
use lexrep_core::{Period, Statistics};
use lexrep_storage::{
    Catalog, DocumentCriteria, DEFAULT_PREVIEW_CHARS, DEFAULT_PREVIEW_FRAGMENTS,
};
use lexrep_sync::{
    select_enricher, DownloadJob, JobMonitor, RangeReport, StopSignal, SyncConfig, SyncPipeline,
    FULL_RANGE,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lexrep-cli")]
#[command(about = "Local replica of the zakonyprolidi.cz legal document collections")]
struct Cli {
    /// SQLite store path (overrides LEXREP_DB_PATH)
    #[arg(long, global = true)]
    db: Option<std::path::PathBuf>,
    /// API access token (overrides LEXREP_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest periods from the API and/or merge page markup from the website.
    Sync(SyncArgs),
    /// Ingest only the periods the store does not cover yet.
    Resume {
        #[arg(long, default_value = "cs")]
        collection: String,
        #[arg(long, default_value_t = FULL_RANGE.0)]
        from: Period,
        #[arg(long, default_value_t = FULL_RANGE.1)]
        to: Period,
    },
    /// Fetch the structured content (and optionally the versions) of one document.
    Document {
        code: String,
        #[arg(long, default_value = "cs")]
        collection: String,
        #[arg(long)]
        versions: bool,
    },
    /// Upsert the documents published in a date range.
    Published {
        #[arg(long, default_value = "cs")]
        collection: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Render and tag a selection of stored documents.
    Download(DownloadArgs),
    /// Read-only queries against the store.
    Query(QueryArgs),
    /// Run the JSON web front end.
    Serve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncMode {
    Api,
    Scrape,
    Both,
    Stats,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_enum, default_value_t = SyncMode::Api)]
    mode: SyncMode,
    #[arg(long, default_value = "cs")]
    collection: String,
    #[arg(long, conflicts_with_all = ["start_year", "end_year"])]
    year: Option<Period>,
    #[arg(long)]
    start_year: Option<Period>,
    #[arg(long)]
    end_year: Option<Period>,
    /// Only what the `test` token can reach: metadata, 1964, 2012 and sample documents.
    #[arg(long)]
    test_only: bool,
}

impl SyncArgs {
    fn check(&self) -> Result<()> {
        if self.test_only && !matches!(self.mode, SyncMode::Api | SyncMode::Both) {
            bail!("--test-only only applies to --mode api or both");
        }
        Ok(())
    }

    fn range(&self) -> Result<(Period, Period)> {
        let (start, end) = match self.year {
            Some(year) => (year, year),
            None => (
                self.start_year.unwrap_or(FULL_RANGE.0),
                self.end_year.unwrap_or(FULL_RANGE.1),
            ),
        };
        if start > end {
            bail!("start year {start} is after end year {end}");
        }
        Ok((start, end))
    }
}

#[derive(Debug, Args)]
struct DownloadArgs {
    #[arg(long)]
    year: Option<Period>,
    #[arg(long)]
    doc_type: Option<String>,
    #[arg(long)]
    date_from: Option<NaiveDate>,
    #[arg(long)]
    date_to: Option<NaiveDate>,
    #[arg(long)]
    days_old: Option<i64>,
    #[arg(long, default_value_t = 100)]
    max_docs: u32,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    year: Option<Period>,
    #[arg(long, requires = "year")]
    doc_type: Option<String>,
    #[arg(long)]
    detail: Option<String>,
    #[arg(long)]
    stats: bool,
}

impl QueryArgs {
    fn check(&self) -> Result<()> {
        let selected = [
            self.search.is_some(),
            self.year.is_some(),
            self.detail.is_some(),
            self.stats,
        ]
        .into_iter()
        .filter(|s| *s)
        .count();
        if selected != 1 {
            bail!("choose exactly one of --search, --year, --detail or --stats");
        }
        Ok(())
    }
}

fn init_tracing(config: &SyncConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// First Ctrl-C asks the running loop to stop after its current unit.
fn stop_on_ctrl_c(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current unit");
            stop.stop();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(api_key) = cli.api_key {
        config.api_key = api_key;
    }
    init_tracing(&config);

    match cli.command.unwrap_or(Commands::Query(QueryArgs {
        search: None,
        year: None,
        doc_type: None,
        detail: None,
        stats: true,
    })) {
        Commands::Sync(args) => run_sync(&config, args).await?,
        Commands::Resume {
            collection,
            from,
            to,
        } => {
            let pipeline = pipeline(&config).await?;
            let result = async {
                pipeline.sync_metadata().await?;
                let report = pipeline.resume_range(&collection, from, to).await?;
                print_range(&report);
                print_statistics(&pipeline.store().statistics().await?);
                Ok::<_, anyhow::Error>(())
            }
            .await;
            pipeline.store().close().await;
            result?;
        }
        Commands::Document {
            code,
            collection,
            versions,
        } => {
            let pipeline = pipeline(&config).await?;
            let result = async {
                let stored = pipeline
                    .download_document_content(&collection, &code)
                    .await?;
                println!("content {code}: {}", if stored { "stored" } else { "no matching row" });
                if versions {
                    let appended = pipeline.sync_document_versions(&collection, &code).await?;
                    println!("versions {code}: {appended} new");
                }
                print_statistics(&pipeline.store().statistics().await?);
                Ok::<_, anyhow::Error>(())
            }
            .await;
            pipeline.store().close().await;
            result?;
        }
        Commands::Published {
            collection,
            from,
            to,
        } => {
            let pipeline = pipeline(&config).await?;
            let result = async {
                let count = pipeline.sync_published(&collection, from, to).await?;
                println!("published {from}..{to}: {count} documents");
                print_statistics(&pipeline.store().statistics().await?);
                Ok::<_, anyhow::Error>(())
            }
            .await;
            pipeline.store().close().await;
            result?;
        }
        Commands::Download(args) => run_download(&config, args).await?,
        Commands::Query(args) => run_query(&config, args).await?,
        Commands::Serve => lexrep_web::serve(&config).await?,
    }

    Ok(())
}

async fn pipeline(config: &SyncConfig) -> Result<SyncPipeline> {
    let stop = StopSignal::new();
    stop_on_ctrl_c(stop.clone());
    Ok(SyncPipeline::from_config(config)
        .await?
        .with_stop_signal(stop))
}

async fn run_sync(config: &SyncConfig, args: SyncArgs) -> Result<()> {
    args.check()?;
    let (start, end) = args.range()?;
    info!(
        db = %config.db_path.display(),
        collection = %args.collection,
        mode = ?args.mode,
        start,
        end,
        "sync starting"
    );
    let pipeline = pipeline(config).await?;
    let result = sync_with(&pipeline, &args, start, end).await;
    // also reached after Ctrl-C: the loops return early with partial reports
    pipeline.store().close().await;
    result
}

async fn sync_with(
    pipeline: &SyncPipeline,
    args: &SyncArgs,
    start: Period,
    end: Period,
) -> Result<()> {
    if args.test_only {
        let report = pipeline.sync_test_data(&args.collection).await?;
        println!(
            "test data: {} collections, {} doc types, {} periods, {} contents, {} failures",
            report.metadata.collections,
            report.metadata.doc_types,
            report.periods.len(),
            report.contents_stored,
            report.failures.len()
        );
        print_statistics(&pipeline.store().statistics().await?);
        return Ok(());
    }

    if matches!(args.mode, SyncMode::Api | SyncMode::Both) {
        pipeline.sync_metadata().await?;
        let report = pipeline
            .sync_period_range(&args.collection, start, end)
            .await?;
        print_range(&report);
    }
    if matches!(args.mode, SyncMode::Scrape | SyncMode::Both) {
        let report = pipeline.scrape_range(&args.collection, start, end).await?;
        println!(
            "scrape: {} links, {} merged, {} without a stored row, {} failures{}",
            report.discovered,
            report.merged,
            report.skipped_unknown.len(),
            report.failures.len(),
            if report.interrupted { " (interrupted)" } else { "" }
        );
    }

    print_statistics(&pipeline.store().statistics().await?);
    Ok(())
}

async fn run_download(config: &SyncConfig, args: DownloadArgs) -> Result<()> {
    let criteria = DocumentCriteria {
        date_from: args.date_from,
        date_to: args.date_to,
        days_old: args.days_old,
        doc_type: args.doc_type,
        period: args.year,
        max_docs: args.max_docs,
    };
    DownloadJob::validate(&criteria)?;

    let pipeline = SyncPipeline::from_config(config).await?;
    let job = DownloadJob::new(
        pipeline.store().clone(),
        pipeline.pages(),
        Arc::from(select_enricher(config.enricher, config)),
        Arc::new(config.tag_indexer()?),
        config.page_pacing,
    )
    .with_attachment_dir(&config.attachment_dir);
    let monitor = JobMonitor::new();
    let run_id = monitor
        .try_begin()
        .await
        .context("download job slot already taken")?;

    let stopper = monitor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping download job");
            stopper.request_stop().await;
        }
    });

    let result = async {
        let state = job.run(run_id, &criteria, &monitor).await?;
        println!(
            "download: {}/{} completed, {} errors",
            state.completed,
            state.total,
            state.errors.len()
        );
        for error in &state.errors {
            println!("  {error}");
        }
        print_statistics(&pipeline.store().statistics().await?);
        Ok::<_, anyhow::Error>(())
    }
    .await;
    pipeline.store().close().await;
    result
}

async fn run_query(config: &SyncConfig, args: QueryArgs) -> Result<()> {
    args.check()?;
    let catalog = Catalog::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    if let Some(keyword) = &args.search {
        let hits = catalog.search_by_title(keyword, 20).await?;
        println!("{} documents matching {keyword:?}", hits.len());
        for hit in &hits {
            println!(
                "  {:<12} {}",
                hit.code,
                hit.title.as_deref().unwrap_or("(untitled)")
            );
        }
    } else if let Some(year) = args.year {
        let docs = catalog.list_by_period(year, args.doc_type.as_deref()).await?;
        println!("{} documents in {year}", docs.len());
        for doc in &docs {
            println!(
                "  {:<12} {:<4} {}",
                doc.code,
                doc.doc_type.as_deref().unwrap_or("-"),
                doc.title.as_deref().unwrap_or("(untitled)")
            );
        }
    } else if let Some(code) = &args.detail {
        match catalog
            .document_detail(code, DEFAULT_PREVIEW_FRAGMENTS, DEFAULT_PREVIEW_CHARS)
            .await?
        {
            Some(detail) => println!("{}", serde_json::to_string_pretty(&detail)?),
            None => println!("document {code} not found"),
        }
    }

    print_statistics(&catalog.statistics().await?);
    catalog.close().await;
    Ok(())
}

fn print_range(report: &RangeReport) {
    println!(
        "periods: {} requested, {} ingested, {} gaps, {} failed ({:?}); {} documents in {:.1}s{}",
        report.requested.len(),
        report.ingested.len(),
        report.gaps.len(),
        report.failures.len(),
        report.failed_periods(),
        report.documents,
        report.elapsed.as_secs_f64(),
        if report.interrupted { " (interrupted)" } else { "" }
    );
}

fn print_statistics(stats: &Statistics) {
    println!("store statistics");
    println!("  collections:   {}", stats.total_collections);
    println!("  doc types:     {}", stats.total_doc_types);
    println!("  batches:       {}", stats.total_batches);
    println!("  documents:     {}", stats.total_documents);
    println!("  full content:  {}", stats.with_full_content);
    println!("  tagged:        {}", stats.tagged_documents);
    if let (Some(first), Some(last)) = (stats.first_period, stats.last_period) {
        println!("  periods:       {first}-{last}");
    }
    for (collection, count) in &stats.by_collection {
        println!("  collection {collection:<4} {count}");
    }
    for (doc_type, count) in &stats.by_type {
        println!("  type {doc_type:<9} {count}");
    }
    let busiest = busiest_periods(stats, TOP_PERIODS);
    if !busiest.is_empty() {
        println!("  busiest periods:");
        for (period, count) in busiest {
            println!("    {period}: {count}");
        }
    }
}

const TOP_PERIODS: usize = 10;

/// Periods with the most documents, largest first; ties go to the later period.
fn busiest_periods(stats: &Statistics, limit: usize) -> Vec<(Period, u64)> {
    let mut periods: Vec<(Period, u64)> = stats.by_period.iter().map(|(p, n)| (*p, *n)).collect();
    periods.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.cmp(&a.0)));
    periods.truncate(limit);
    periods
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_range_defaults_to_full_range() {
        let cli = Cli::try_parse_from(["lexrep-cli", "sync"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.mode, SyncMode::Api);
        assert_eq!(args.range().unwrap(), FULL_RANGE);
    }

    #[test]
    fn single_year_and_inverted_ranges() {
        let cli = Cli::try_parse_from(["lexrep-cli", "sync", "--mode", "both", "--year", "1964"])
            .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.range().unwrap(), (1964, 1964));

        let cli = Cli::try_parse_from([
            "lexrep-cli",
            "sync",
            "--start-year",
            "2012",
            "--end-year",
            "2000",
        ])
        .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert!(args.range().is_err());

        assert!(Cli::try_parse_from(["lexrep-cli", "sync", "--year", "1964", "--start-year", "1960"])
            .is_err());
    }

    #[test]
    fn test_only_is_limited_to_api_modes() {
        let sync = |argv: &[&str]| match Cli::try_parse_from(argv).map(|cli| cli.command) {
            Ok(Some(Commands::Sync(args))) => args,
            _ => panic!("expected sync"),
        };
        assert!(sync(&["lexrep-cli", "sync", "--test-only"]).check().is_ok());
        assert!(sync(&["lexrep-cli", "sync", "--mode", "both", "--test-only"])
            .check()
            .is_ok());
        assert!(sync(&["lexrep-cli", "sync", "--mode", "scrape", "--test-only"])
            .check()
            .is_err());
        assert!(sync(&["lexrep-cli", "sync", "--mode", "stats", "--test-only"])
            .check()
            .is_err());
        assert!(sync(&["lexrep-cli", "sync", "--mode", "scrape"]).check().is_ok());
    }

    #[tokio::test]
    async fn sync_closes_the_store_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            db_path: dir.path().join("replica.db"),
            ..SyncConfig::default()
        };
        let cli = Cli::try_parse_from(["lexrep-cli", "sync", "--mode", "stats"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };

        run_sync(&config, args).await.unwrap();
        assert!(dir.path().join("replica.db").exists());
        // sqlite removes the WAL once the last connection has closed
        assert!(!dir.path().join("replica.db-wal").exists());
    }

    #[test]
    fn busiest_periods_are_ranked_by_document_count() {
        let stats = Statistics {
            by_period: [(1964, 3), (2011, 40), (2012, 40), (2013, 7)].into_iter().collect(),
            ..Default::default()
        };
        assert_eq!(
            busiest_periods(&stats, 3),
            vec![(2012, 40), (2011, 40), (2013, 7)]
        );
        assert!(busiest_periods(&Statistics::default(), 3).is_empty());
    }

    #[test]
    fn query_needs_exactly_one_selector() {
        let query = |argv: &[&str]| match Cli::try_parse_from(argv).map(|cli| cli.command) {
            Ok(Some(Commands::Query(args))) => Some(args),
            _ => None,
        };
        assert!(query(&["lexrep-cli", "query"]).unwrap().check().is_err());
        assert!(query(&["lexrep-cli", "query", "--stats", "--search", "daň"])
            .unwrap()
            .check()
            .is_err());
        assert!(query(&["lexrep-cli", "query", "--doc-type", "4"]).is_none());
        let args = query(&["lexrep-cli", "--db", "x.db", "query", "--year", "2012", "--doc-type", "4"])
            .unwrap();
        assert!(args.check().is_ok());
    }
}
