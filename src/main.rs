use agri_price_engine::background_jobs::jobs::{AggregateRecomputeJob, EntityMatchingJob};
use agri_price_engine::background_jobs::{HookEvent, JobContext, JobScheduler};
use agri_price_engine::catalog_store::{EntityKind, PeriodType, SqliteCatalogStore};
use agri_price_engine::cli_style::{get_styles, TableBuilder};
use agri_price_engine::comparison::ComparisonRequest;
use agri_price_engine::config::{AppConfig, CliConfig, FileConfig};
use agri_price_engine::conversion::RateTableExport;
use agri_price_engine::sources::SourceRecord;
use agri_price_engine::{metrics, PriceEngine};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(styles = get_styles(), version = env!("APP_VERSION"))]
struct CliArgs {
    /// Path to a TOML config file. Its values override the flags below.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the price database (prices.db).
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Minimum similarity for the matcher to link an entity on its own.
    #[clap(long)]
    pub auto_link_threshold: Option<f64>,

    /// Attempts per product before an aggregate recompute gives up.
    #[clap(long)]
    pub max_attempts: Option<u32>,

    /// Print the Prometheus metrics collected by the command before exiting.
    #[clap(long)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the background jobs until interrupted.
    Run {
        /// Observation files ingested once the scheduler is up.
        #[clap(long, value_parser = parse_path)]
        import: Vec<PathBuf>,
    },

    /// Ingest a JSON array of source records.
    Import {
        #[clap(value_parser = parse_path)]
        file: PathBuf,

        /// Skip the aggregate recompute of the touched products.
        #[clap(long)]
        no_recompute: bool,
    },

    /// Regenerate aggregates for one product, or for all linked products.
    Recompute {
        #[clap(long)]
        product: Option<i64>,
    },

    /// Run the matcher over one entity kind, or over all of them.
    Match {
        #[clap(long, value_enum)]
        kind: Option<KindArg>,
    },

    /// Show the stored aggregates of a product.
    Aggregates { product_id: i64 },

    /// Compare products over one period type in a common currency and unit.
    Compare {
        #[clap(required = true)]
        product_ids: Vec<i64>,

        #[clap(long, value_enum, default_value = "monthly")]
        period: PeriodArg,

        #[clap(long)]
        year: Option<i32>,

        #[clap(long)]
        market_type: Option<String>,

        #[clap(long, default_value = "USD")]
        currency: String,

        #[clap(long, default_value = "kg")]
        unit: String,
    },

    /// Convert a price between currencies and units.
    Convert {
        value: f64,
        from_currency: String,
        to_currency: String,
        from_unit: String,
        to_unit: String,
    },

    /// Inspect or edit the rate tables.
    Rates {
        #[command(subcommand)]
        command: RatesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum RatesCommand {
    /// Print the rate tables as JSON.
    Export,

    /// Upsert every rate of a JSON export.
    Import {
        #[clap(value_parser = parse_path)]
        file: PathBuf,
    },

    /// Set a currency rate against the base currency.
    SetCurrency { code: String, rate_to_base: f64 },

    /// Set a unit rate against its base unit.
    SetUnit {
        code: String,
        conversion_rate: f64,
        base_unit: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Product,
    Variety,
    Country,
    Market,
    PriceStage,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Product => EntityKind::Product,
            KindArg::Variety => EntityKind::Variety,
            KindArg::Country => EntityKind::Country,
            KindArg::Market => EntityKind::Market,
            KindArg::PriceStage => EntityKind::PriceStage,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PeriodArg {
    Weekly,
    Monthly,
    Annual,
}

impl From<PeriodArg> for PeriodType {
    fn from(period: PeriodArg) -> Self {
        match period {
            PeriodArg::Weekly => PeriodType::Weekly,
            PeriodArg::Monthly => PeriodType::Monthly,
            PeriodArg::Annual => PeriodType::Annual,
        }
    }
}

fn read_records(path: &Path) -> Result<Vec<SourceRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read observations file: {:?}", path))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse observations file: {:?}", path))
}

fn import_file(engine: &PriceEngine, path: &Path, recompute: bool) -> Result<()> {
    let records = read_records(path)?;
    info!("Ingesting {} record(s) from {:?}", records.len(), path);
    let summary = engine.ingest_records(&records)?;
    info!(
        "Stored {} observation(s), skipped {}",
        summary.observations, summary.skipped
    );
    if recompute {
        let recomputed = engine.recompute_for_source_products(&summary.source_products)?;
        info!(
            "Recomputed {} aggregate(s) for {} product(s)",
            recomputed.total, recomputed.products_processed
        );
        if !recomputed.failed.is_empty() {
            warn!("Recompute gave up on products {:?}", recomputed.failed);
        }
    }
    Ok(())
}

async fn run_jobs(engine: Arc<PriceEngine>, config: &AppConfig, imports: Vec<PathBuf>) -> Result<()> {
    let shutdown_token = CancellationToken::new();
    let (hook_sender, hook_receiver) = mpsc::channel(16);
    let context = JobContext::new(shutdown_token.clone(), engine.clone());
    let mut scheduler = JobScheduler::new(hook_receiver, shutdown_token.clone(), context);

    let jobs = &config.background_jobs;
    scheduler
        .register_job(Arc::new(EntityMatchingJob::new(
            jobs.matching_interval_hours,
            jobs.matching_kinds.clone(),
        )))
        .await;
    scheduler
        .register_job(Arc::new(AggregateRecomputeJob::new(
            jobs.aggregation_interval_hours,
            jobs.recompute_on_startup,
        )))
        .await;

    let scheduler_handle = tokio::spawn(async move { scheduler.run().await });

    if !imports.is_empty() {
        let mut ingested = false;
        for path in &imports {
            // The recompute job picks the new observations up through the hook
            match import_file(&engine, path, false) {
                Ok(()) => ingested = true,
                Err(e) => error!("Import of {:?} failed: {:#}", path, e),
            }
        }
        if ingested && hook_sender.send(HookEvent::OnObservationsIngested).await.is_err() {
            warn!("Scheduler stopped before the ingest hook could be delivered");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down...");
    shutdown_token.cancel();
    scheduler_handle.await.context("Scheduler task panicked")?;
    Ok(())
}

fn print_aggregates(engine: &PriceEngine, product_id: i64) -> Result<()> {
    let aggregates = engine.aggregates_for_product(product_id)?;
    let mut table = TableBuilder::new(&[
        "Market type", "Period", "Year", "Avg", "Min", "Max", "N", "Currency/Unit",
    ]);
    for record in aggregates {
        let period = match record.period {
            Some(period) => format!("{} {}", record.period_type.to_db_str(), period),
            None => record.period_type.to_db_str().to_string(),
        };
        table.add_row(vec![
            record.market_type_code,
            period,
            record.year.to_string(),
            format!("{:.3}", record.avg_price),
            format!("{:.3}", record.min_price),
            format!("{:.3}", record.max_price),
            record.sample_count.to_string(),
            format!("{}/{}", record.currency, record.unit),
        ]);
    }
    if table.is_empty() {
        println!("No aggregates for product {}", product_id);
    } else {
        table.print();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        auto_link_threshold: cli_args.auto_link_threshold,
        max_attempts: cli_args.max_attempts,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    metrics::init_metrics();

    let db_path = config.catalog_db_path();
    info!("Opening SQLite price database at {:?}...", db_path);
    let store = Arc::new(SqliteCatalogStore::new(&db_path)?);
    let engine = Arc::new(PriceEngine::new(store, &config.engine_settings()));

    match cli_args.command {
        Command::Run { import } => run_jobs(engine, &config, import).await?,
        Command::Import { file, no_recompute } => import_file(&engine, &file, !no_recompute)?,
        Command::Recompute { product: Some(product_id) } => {
            let written = engine.recompute_aggregates_for_product(product_id)?;
            info!("Wrote {} aggregate(s) for product {}", written, product_id);
        }
        Command::Recompute { product: None } => {
            let summary = engine.recompute_all_aggregates()?;
            info!(
                "Wrote {} aggregate(s) for {} product(s)",
                summary.total, summary.products_processed
            );
            if !summary.failed.is_empty() {
                bail!("Recompute gave up on products {:?}", summary.failed);
            }
        }
        Command::Match { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind.into()],
                None => config.background_jobs.matching_kinds.clone(),
            };
            for kind in kinds {
                let summary = engine.run_matching(kind)?;
                info!(
                    "{}: {} linked, {} left for review",
                    kind, summary.matched, summary.unmatched
                );
            }
        }
        Command::Aggregates { product_id } => print_aggregates(&engine, product_id)?,
        Command::Compare {
            product_ids,
            period,
            year,
            market_type,
            currency,
            unit,
        } => {
            let comparison = engine.compare(&ComparisonRequest {
                product_ids,
                period_type: period.into(),
                year,
                market_type_code: market_type,
                currency,
                unit,
            })?;
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        }
        Command::Convert {
            value,
            from_currency,
            to_currency,
            from_unit,
            to_unit,
        } => {
            let conversion =
                engine.convert(value, &from_currency, &to_currency, &from_unit, &to_unit)?;
            match &conversion.warning {
                None => println!("{} {}/{}", conversion.value, to_currency, to_unit),
                Some(warning) => {
                    warn!("{}", warning);
                    println!("{} {}/{} (unconverted)", conversion.value, from_currency, from_unit);
                }
            }
        }
        Command::Rates { command } => match command {
            RatesCommand::Export => {
                println!("{}", serde_json::to_string_pretty(&engine.rate_table_export()?)?);
            }
            RatesCommand::Import { file } => {
                let contents = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read rates file: {:?}", file))?;
                let export: RateTableExport = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse rates file: {:?}", file))?;
                for (code, rate) in &export.currencies {
                    engine.upsert_currency_rate(code, rate.rate_to_base)?;
                }
                for (code, rate) in &export.units {
                    engine.upsert_unit_rate(code, rate.conversion_rate, &rate.base_unit)?;
                }
                info!(
                    "Imported {} currency and {} unit rate(s)",
                    export.currencies.len(),
                    export.units.len()
                );
            }
            RatesCommand::SetCurrency { code, rate_to_base } => {
                engine.upsert_currency_rate(&code, rate_to_base)?;
            }
            RatesCommand::SetUnit {
                code,
                conversion_rate,
                base_unit,
            } => {
                engine.upsert_unit_rate(&code, conversion_rate, &base_unit)?;
            }
        },
    }

    if cli_args.print_metrics {
        print!("{}", metrics::gather_text());
    }
    Ok(())
}
