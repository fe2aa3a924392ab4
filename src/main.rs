mod cli;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking;
use tracing_subscriber::{prelude::*, EnvFilter};

use cli::{BacktestArgs, Cli, Commands, CommonArgs, ScanArgs};
use patternscope::{
    backtest::{record_results, simulate_history, BacktestResult},
    config::AppConfig,
    freshness::{CandleCache, FixedCalendar},
    orchestrator::DetectionOrchestrator,
    performance::{analyze, PerformanceReport},
    scanner::{ScanControl, Scanner},
    source::{CandleSource, CsvDirSource, FetchRequest},
    store::JsonlStore,
};

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Reports go to stdout, so logs use stderr
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {parent:?}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {path:?}"))?;
        let (writer, guard) = non_blocking(file);
        // Keep the writer alive for the whole process
        let _guard = Box::leak(Box::new(guard));
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .try_init()
            .map_err(|err| anyhow!("failed to initialize tracing: {err}"))
    }
}

fn load_config(common: &CommonArgs) -> Result<AppConfig> {
    match &common.config {
        Some(path) => AppConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(AppConfig::default()),
    }
}

fn open_store(common: &CommonArgs) -> Result<Option<JsonlStore>> {
    common
        .store_dir
        .as_ref()
        .map(|dir| {
            JsonlStore::open(dir).with_context(|| format!("failed to open store {}", dir.display()))
        })
        .transpose()
}

fn write_report<T: Serialize>(report: &T, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to encode report")?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}").context("failed to write report")
        },
    }
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if !args.timeframes.is_empty() {
        config.scan.timeframes = args.timeframes.clone();
    }

    let engine = Arc::new(config.build_engine().context("invalid detector configuration")?);
    let source = Arc::new(CsvDirSource::new(&args.common.data_dir));
    let cache = CandleCache::new(
        source,
        Arc::new(FixedCalendar(args.market.into())),
        config.freshness_policy(),
    )
    .with_fetch_timeout(config.scan.fetch_timeout());
    let orchestrator = DetectionOrchestrator::new(engine, config.orchestrator.clone());
    let mut scanner = Scanner::new(Arc::new(cache), Arc::new(orchestrator), config.scan.clone());
    if let Some(store) = open_store(&args.common)? {
        scanner = scanner.with_store(Arc::new(store));
    }

    let report = scanner.scan(&args.common.symbols, &ScanControl::new()).await;
    for failure in &report.failures {
        warn!(symbol = %failure.symbol, error = %failure.error, "symbol not fully scanned");
    }
    if report.scanned.is_empty() {
        bail!("no symbol could be scanned ({} failures)", report.failures.len());
    }
    info!(signals = report.signals.len(), symbols = report.scanned.len(), "scan finished");
    write_report(&report, args.common.output.as_ref())
}

#[derive(Serialize)]
struct BacktestReport {
    signals: usize,
    unresolved: usize,
    performance: PerformanceReport,
    results: Vec<BacktestResult>,
}

async fn run_backtest(args: BacktestArgs) -> Result<()> {
    let mut config = load_config(&args.common)?;
    if let Some(days) = args.max_holding_days {
        config.backtest.max_holding_days = days;
    }
    let engine = config.build_engine().context("invalid detector configuration")?;
    let source = CsvDirSource::new(&args.common.data_dir);

    let mut results = Vec::new();
    for symbol in &args.common.symbols {
        let request = FetchRequest::latest(symbol.as_str(), args.timeframe, args.limit);
        let fetched = source
            .fetch_candles(&request)
            .await
            .with_context(|| format!("failed to load {symbol} {}", args.timeframe))?;

        let history = engine.scan_history(&fetched.series);
        let replayed = simulate_history(&fetched.series, &history, &config.backtest);
        info!(%symbol, signals = history.len(), "replayed history");
        results.extend(replayed);
    }

    if let Some(store) = open_store(&args.common)? {
        record_results(&store, &results)
            .await
            .with_context(|| format!("failed to save results to {}", store.dir().display()))?;
    }

    let performance = analyze(&results).context("nothing to aggregate")?;
    let unresolved = results.iter().filter(|r| !r.is_resolved()).count();
    info!(
        trades = performance.overall.total_trades,
        win_rate = performance.overall.win_rate,
        "backtest finished"
    );
    write_report(
        &BacktestReport {
            signals: results.len(),
            unresolved,
            performance,
            results,
        },
        args.common.output.as_ref(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.command.common().log_file.as_deref())?;

    match cli.command {
        Commands::Scan(args) => run_scan(args).await,
        Commands::Backtest(args) => run_backtest(args).await,
    }
}
