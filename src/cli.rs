use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use patternscope::{freshness::MarketStatus, Timeframe};

#[derive(Parser, Debug)]
#[command(
    name = "patternscope",
    about = "Chart pattern detection, scoring and backtesting over CSV candles"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect patterns on the latest candles and print scored signals
    Scan(ScanArgs),
    /// Walk history, replay every signal and print performance statistics
    Backtest(BacktestArgs),
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Commands::Scan(args) => &args.common,
            Commands::Backtest(args) => &args.common,
        }
    }
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Directory holding `{SYMBOL}_{timeframe}.csv` files
    #[arg(long = "data-dir", value_hint = clap::ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Symbols to process, comma separated
    #[arg(long, value_delimiter = ',', required = true)]
    pub symbols: Vec<String>,

    /// JSON configuration file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    /// Append signals and backtest results as JSON lines under this directory
    #[arg(long = "store-dir", value_hint = clap::ValueHint::DirPath)]
    pub store_dir: Option<PathBuf>,

    /// Also append logs to this file
    #[arg(long = "log-file", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Timeframes to scan, overriding the configuration
    #[arg(long, value_delimiter = ',', value_parser = parse_timeframe)]
    pub timeframes: Vec<Timeframe>,

    /// Market session used for cache freshness
    #[arg(long, default_value = "closed")]
    pub market: MarketValue,
}

#[derive(Args, Debug)]
pub struct BacktestArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    #[arg(long, default_value = "1d", value_parser = parse_timeframe)]
    pub timeframe: Timeframe,

    /// Holding window, overriding the configuration
    #[arg(long = "max-holding-days")]
    pub max_holding_days: Option<u32>,

    /// Candles read per symbol
    #[arg(long, default_value_t = 5_000)]
    pub limit: usize,
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, String> {
    raw.parse().map_err(|e: patternscope::PatternError| e.to_string())
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MarketValue {
    Open,
    PreMarket,
    AfterHours,
    Closed,
}

impl From<MarketValue> for MarketStatus {
    fn from(value: MarketValue) -> Self {
        match value {
            MarketValue::Open => MarketStatus::Open,
            MarketValue::PreMarket => MarketStatus::PreMarket,
            MarketValue::AfterHours => MarketStatus::AfterHours,
            MarketValue::Closed => MarketStatus::Closed,
        }
    }
}
