//! Command-line interface for the portfolio engine.

use sena::analytics::ReportFormatter;
use sena::cache::{CacheManager, CacheStore};
use sena::config::EngineConfig;
use sena::engine::{FxShock, PortfolioEngine, PortfolioReport, RunOptions, TargetStrategy};
use sena::error::{PortfolioError, Result};
use sena::gateway::{CsvGateway, MarketDataGateway, TimeoutGateway};
use sena::optimizer::SharpeSolverKind;
use sena::portfolio::Portfolio;
use sena::rebalance::RiskProfile;
use sena::store::{default_database_path, ensure_parent_dir, PortfolioManager, SqliteStore};

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Sena - staleness-aware portfolio valuation and optimization.
#[derive(Parser)]
#[command(name = "sena")]
#[command(version)]
#[command(about = "Value, optimize and stress-test USD/JPY portfolios")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory of per-symbol price CSV files
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// SQLite database for the cache and stored portfolios
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where a command reads holdings from.
#[derive(Args, Clone)]
pub struct PortfolioSource {
    /// Holdings CSV with ticker and shares columns
    #[arg(short, long, conflicts_with = "name")]
    pub file: Option<PathBuf>,

    /// Name of a stored portfolio
    #[arg(short, long)]
    pub name: Option<String>,

    /// Ignore cache TTLs and refetch every field
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Value holdings in USD and JPY
    Value {
        #[command(flatten)]
        source: PortfolioSource,

        /// Record the valuation in the portfolio's history
        #[arg(long)]
        save: bool,
    },

    /// Efficient frontier, max-Sharpe and min-volatility portfolios
    Optimize {
        #[command(flatten)]
        source: PortfolioSource,

        /// Number of frontier points
        #[arg(short, long)]
        points: Option<usize>,

        /// Max-Sharpe solver backend
        #[arg(long, value_enum)]
        solver: Option<SolverArg>,

        /// Print the sampled frontier
        #[arg(long)]
        frontier: bool,
    },

    /// Trade list toward a target allocation
    Rebalance {
        #[command(flatten)]
        source: PortfolioSource,

        /// Target allocation
        #[arg(short, long, value_enum, default_value = "max-sharpe")]
        target: TargetArg,

        /// Skip trades smaller than this amount, in the portfolio's base currency
        #[arg(long)]
        min_trade: Option<f64>,

        /// Risk profile for inverse-volatility targets
        #[arg(long, value_enum)]
        profile: Option<ProfileArg>,
    },

    /// Beta-based market crash scenarios
    Crash {
        #[command(flatten)]
        source: PortfolioSource,

        /// Market shocks in percent, e.g. -10 -20
        #[arg(short, long, num_args = 1.., allow_negative_numbers = true)]
        shocks: Vec<f64>,

        /// Equity shock (percent) for the JPY stress test
        #[arg(long, allow_negative_numbers = true, requires = "fx_shock")]
        equity_shock: Option<f64>,

        /// USD/JPY shock (percent) for the JPY stress test
        #[arg(long, allow_negative_numbers = true)]
        fx_shock: Option<f64>,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "sena.toml")]
        output: PathBuf,
    },

    /// Inspect or invalidate cached market data
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage stored portfolios
    Portfolio {
        #[command(subcommand)]
        action: PortfolioAction,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// List cached fields with age and freshness
    Show {
        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,
    },
    /// Drop every cached field of a symbol
    Invalidate { symbol: String },
    /// Purge long-expired prices
    Clear,
}

#[derive(Subcommand)]
pub enum PortfolioAction {
    /// Import holdings from CSV
    Import {
        file: PathBuf,
        /// Portfolio name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List stored portfolios
    List,
    /// Delete a stored portfolio
    Delete { name: String },
    /// Show recorded valuations
    History {
        name: String,
        #[arg(short, long, default_value = "30")]
        days: i64,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum SolverArg {
    ProjectedGradient,
    ConvexTransform,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    MaxSharpe,
    MinVolatility,
    SharpeScore,
    InverseVolatility,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ProfileArg {
    Conservative,
    Balanced,
    Aggressive,
}

impl From<SolverArg> for SharpeSolverKind {
    fn from(arg: SolverArg) -> Self {
        match arg {
            SolverArg::ProjectedGradient => SharpeSolverKind::ProjectedGradient,
            SolverArg::ConvexTransform => SharpeSolverKind::ConvexTransform,
        }
    }
}

impl From<TargetArg> for TargetStrategy {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::MaxSharpe => TargetStrategy::MaxSharpe,
            TargetArg::MinVolatility => TargetStrategy::MinVolatility,
            TargetArg::SharpeScore => TargetStrategy::SharpeScore,
            TargetArg::InverseVolatility => TargetStrategy::InverseVolatility,
        }
    }
}

impl From<ProfileArg> for RiskProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Conservative => RiskProfile::Conservative,
            ProfileArg::Balanced => RiskProfile::Balanced,
            ProfileArg::Aggressive => RiskProfile::Aggressive,
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }

    fn load_config(&self) -> Result<EngineConfig> {
        match &self.config {
            Some(path) => EngineConfig::load(path),
            None => Ok(EngineConfig::default()),
        }
    }

    fn database_path(&self, config: &EngineConfig) -> Result<String> {
        let path = self
            .db
            .as_ref()
            .map(|p| p.display().to_string())
            .or_else(|| config.storage.database_path.clone())
            .unwrap_or_else(default_database_path);
        ensure_parent_dir(&path)?;
        Ok(path)
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Value { source, save } => run_value(&cli, source, *save),

        Commands::Optimize {
            source,
            points,
            solver,
            frontier,
        } => run_optimize(&cli, source, *points, *solver, *frontier),

        Commands::Rebalance {
            source,
            target,
            min_trade,
            profile,
        } => run_rebalance(&cli, source, *target, *min_trade, *profile),

        Commands::Crash {
            source,
            shocks,
            equity_shock,
            fx_shock,
        } => run_crash(&cli, source, shocks, *equity_shock, *fx_shock),

        Commands::Init { output } => init_config(output),

        Commands::Cache { action } => run_cache(&cli, action),

        Commands::Portfolio { action } => run_portfolio(&cli, action),
    }
}

struct Session {
    engine: PortfolioEngine,
    db_path: String,
}

fn open_session(cli: &Cli, mut config: EngineConfig) -> Result<Session> {
    config.validate()?;
    let db_path = cli.database_path(&config)?;
    let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open(&db_path)?);
    let gateway: Arc<dyn MarketDataGateway> = Arc::new(TimeoutGateway::new(
        CsvGateway::new(&cli.data_dir),
        config.cache.gateway_timeout(),
    ));
    info!("Reading market data from {}", cli.data_dir.display());
    let cache = Arc::new(CacheManager::new(gateway, store, &config));
    config.storage.database_path = Some(db_path.clone());
    Ok(Session {
        engine: PortfolioEngine::new(cache, config),
        db_path,
    })
}

fn load_portfolio(source: &PortfolioSource, db_path: &str) -> Result<Portfolio> {
    if let Some(file) = &source.file {
        return Portfolio::load_csv(file);
    }
    let name = source.name.as_deref().ok_or_else(|| {
        PortfolioError::InvalidInput("Pass --file <csv> or --name <portfolio>".to_string())
    })?;
    PortfolioManager::open(db_path)?
        .get_by_name(name)?
        .ok_or_else(|| PortfolioError::InvalidInput(format!("No stored portfolio named '{}'", name)))
}

fn execute(
    cli: &Cli,
    config: EngineConfig,
    source: &PortfolioSource,
    options: RunOptions,
) -> Result<(Session, Portfolio, PortfolioReport)> {
    let session = open_session(cli, config)?;
    let portfolio = load_portfolio(source, &session.db_path)?;
    let options = RunOptions {
        force_refresh: source.refresh,
        show_progress: cli.output == OutputFormat::Text,
        ..options
    };
    let report = session.engine.run(&portfolio, &options)?;
    Ok((session, portfolio, report))
}

fn run_value(cli: &Cli, source: &PortfolioSource, save: bool) -> Result<()> {
    let (session, portfolio, report) =
        execute(cli, cli.load_config()?, source, RunOptions::default())?;

    if save {
        match (portfolio.id, report.to_history_snapshot()) {
            (Some(id), Some(snapshot)) => {
                PortfolioManager::open(&session.db_path)?.add_history_snapshot(id, &snapshot)?;
                info!("Recorded valuation for '{}'", portfolio.name);
            }
            (None, _) => {
                return Err(PortfolioError::InvalidInput(
                    "--save needs a stored portfolio (--name)".to_string(),
                ))
            }
            (_, None) => {}
        }
    }

    match cli.output {
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&report)),
        OutputFormat::Text => {
            if let Some(valuation) = &report.valuation {
                println!("{}", ReportFormatter::valuation_table(valuation));
                println!(
                    "Total: ${:.2} / ¥{:.0} (USD/JPY {:.2})",
                    valuation.total_usd, valuation.total_jpy, valuation.usd_jpy
                );
                for (sector, value) in valuation.by_sector() {
                    println!("  {:<24} {:>6.1}%", sector, value / valuation.total_usd * 100.0);
                }
            }
            print_notes(&report);
        }
    }
    Ok(())
}

fn run_optimize(
    cli: &Cli,
    source: &PortfolioSource,
    points: Option<usize>,
    solver: Option<SolverArg>,
    show_frontier: bool,
) -> Result<()> {
    let mut config = cli.load_config()?;
    if let Some(solver) = solver {
        config.optimizer.sharpe_solver = solver.into();
    }
    let options = RunOptions {
        frontier_points: points,
        ..Default::default()
    };
    let (session, _, report) = execute(cli, config, source, options)?;

    match cli.output {
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&report)),
        OutputFormat::Text => {
            if let Some(result) = &report.optimization {
                println!("{}", ReportFormatter::suggestions_table(&report.suggestions));
                ReportFormatter::print_diagnostics(result);
                if show_frontier {
                    println!("{}", ReportFormatter::frontier_table(&result.frontier));
                    let cloud = session.engine.optimizer().random_portfolios(
                        &result.problem,
                        session.engine.config().optimizer.random_portfolios,
                        42,
                    );
                    let best = cloud
                        .iter()
                        .filter_map(|p| p.sharpe)
                        .fold(f64::NEG_INFINITY, f64::max);
                    println!(
                        "{} random portfolios, best Sharpe {:.3}",
                        cloud.len(),
                        best
                    );
                }
                println!("Input fingerprint: {}", result.fingerprint);
            }
            print_notes(&report);
        }
    }
    Ok(())
}

fn run_rebalance(
    cli: &Cli,
    source: &PortfolioSource,
    target: TargetArg,
    min_trade: Option<f64>,
    profile: Option<ProfileArg>,
) -> Result<()> {
    let mut config = cli.load_config()?;
    if let Some(profile) = profile {
        config.rebalance.risk_profile = profile.into();
    }
    let options = RunOptions {
        target: target.into(),
        min_trade_value: min_trade,
        ..Default::default()
    };
    let (_, _, report) = execute(cli, config, source, options)?;

    match cli.output {
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&report)),
        OutputFormat::Text => {
            if let Some(target) = &report.target {
                println!("{}", ReportFormatter::weights_table(report.current.as_ref(), target));
                println!("{}", ReportFormatter::trades_table(&report.trades));
            }
            print_notes(&report);
        }
    }
    Ok(())
}

fn run_crash(
    cli: &Cli,
    source: &PortfolioSource,
    shocks: &[f64],
    equity_shock: Option<f64>,
    fx_shock: Option<f64>,
) -> Result<()> {
    let fx_stress = fx_shock.map(|fx| FxShock {
        equity_pct: equity_shock.unwrap_or(0.0),
        fx_pct: fx,
    });
    let options = RunOptions {
        shocks_pct: (!shocks.is_empty()).then(|| shocks.to_vec()),
        fx_stress,
        ..Default::default()
    };
    let (_, _, report) = execute(cli, cli.load_config()?, source, options)?;

    match cli.output {
        OutputFormat::Json => println!("{}", ReportFormatter::to_json(&report)),
        OutputFormat::Text => {
            println!("{}", ReportFormatter::scenarios_table(&report.scenarios));
            if let Some(worst) = report.scenarios.last() {
                for mitigation in &worst.mitigations {
                    println!("  - {}", mitigation);
                }
                if !worst.assumed_betas.is_empty() {
                    println!("Beta assumed for: {}", worst.assumed_betas.join(", "));
                }
            }
            if let Some(stress) = &report.fx_stress {
                ReportFormatter::print_fx_stress(stress);
            }
            print_notes(&report);
        }
    }
    Ok(())
}

fn print_notes(report: &PortfolioReport) {
    if !report.stale_fields.is_empty() {
        println!("Stale inputs: {}", report.stale_fields.join(", "));
    }
    for (symbol, reason) in &report.excluded {
        println!("Excluded {}: {}", symbol, reason);
    }
    for failure in &report.failures {
        println!("{} stage failed: {}", failure.stage, failure.error);
    }
}

fn init_config(output: &PathBuf) -> Result<()> {
    fs::write(output, EngineConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file, then run for example:");
    println!("  sena -c {} value --file portfolio.csv", output.display());
    Ok(())
}

fn run_cache(cli: &Cli, action: &CacheAction) -> Result<()> {
    let session = open_session(cli, cli.load_config()?)?;
    let cache = session.engine.cache();
    match action {
        CacheAction::Show { symbol } => {
            let mut entries = cache.entries()?;
            if let Some(symbol) = symbol {
                entries.retain(|e| &e.symbol == symbol);
            }
            match cli.output {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string())
                ),
                OutputFormat::Text => println!(
                    "{}",
                    ReportFormatter::cache_table(&entries, cache.field_cache().settings())
                ),
            }
        }
        CacheAction::Invalidate { symbol } => {
            let removed = cache.invalidate(symbol)?;
            println!("Removed {} cached fields for {}", removed, symbol);
        }
        CacheAction::Clear => {
            let removed = cache.clear_expired()?;
            println!("Purged {} expired price fields", removed);
        }
    }
    Ok(())
}

fn run_portfolio(cli: &Cli, action: &PortfolioAction) -> Result<()> {
    let config = cli.load_config()?;
    let manager = PortfolioManager::open(cli.database_path(&config)?)?;
    match action {
        PortfolioAction::Import { file, name } => {
            let portfolio = manager.import_csv(file, name.as_deref())?;
            println!(
                "Imported '{}' with {} holdings ({})",
                portfolio.name,
                portfolio.len(),
                portfolio.base_currency
            );
        }
        PortfolioAction::List => {
            for p in manager.list()? {
                println!(
                    "{:>4}  {:<24} {:>3} holdings  {}",
                    p.id.unwrap_or_default(),
                    p.name,
                    p.len(),
                    p.base_currency
                );
            }
        }
        PortfolioAction::Delete { name } => {
            let portfolio = manager
                .get_by_name(name)?
                .ok_or_else(|| PortfolioError::InvalidInput(format!("No portfolio '{}'", name)))?;
            if let Some(id) = portfolio.id {
                manager.delete(id)?;
            }
            println!("Deleted '{}'", name);
        }
        PortfolioAction::History { name, days } => {
            let portfolio = manager
                .get_by_name(name)?
                .ok_or_else(|| PortfolioError::InvalidInput(format!("No portfolio '{}'", name)))?;
            let id = portfolio.id.unwrap_or_default();
            for row in manager.history(id, *days)? {
                println!(
                    "{}  ${:>14.2}  ¥{:>16.0}  {:.2}",
                    row.snapshot_date.format("%Y-%m-%d %H:%M"),
                    row.total_value_usd,
                    row.total_value_jpy,
                    row.usd_jpy_rate
                );
            }
        }
    }
    Ok(())
}
