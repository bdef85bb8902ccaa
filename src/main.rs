use anyhow::{anyhow, Context, Result};
use backtest_runner::{
    api,
    config::ServiceConfig,
    context::AppContext,
    repository::{InMemoryMarketData, MarketDataFile},
    sandbox::{Sandbox, SandboxConfig},
};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "backtest-runner")]
#[command(about = "Runs user-authored backtesting strategies in a sandbox")]
struct Cli {
    /// Keep strategies and executions in process memory instead of PostgreSQL
    #[arg(long, global = true)]
    in_memory: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the worker pool
    Serve {
        /// Market data files to preload (in-memory mode only)
        #[arg(long = "market-data", value_name = "PATH")]
        market_data: Vec<PathBuf>,
    },
    /// Run the worker pool without the HTTP API
    Work,
    /// Mark executions whose worker disappeared as interrupted, then exit
    Recover,
    /// Compile a strategy program and list the entry points it defines
    CheckProgram {
        /// Path to the program source
        path: PathBuf,
    },
    /// Apply the database schema
    Migrate,
    /// Store klines and symbol metadata from exported market data files
    ImportMarketData {
        #[arg(required = true, value_name = "PATH")]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { in_memory, command } = Cli::parse();
    let config = ServiceConfig::from_env()?;

    match command {
        Commands::CheckProgram { path } => check_program(&config, &path),
        Commands::Serve { market_data } => {
            let context = build_context(config, in_memory, &market_data).await?;
            serve(context).await
        }
        Commands::Work => {
            let context = build_context(config, in_memory, &[]).await?;
            work(context).await
        }
        Commands::Recover => {
            let context = build_context(config, in_memory, &[]).await?;
            let interrupted = context.scheduler()?.recover_now().await?;
            info!("Recovery sweep interrupted {} execution(s)", interrupted.len());
            Ok(())
        }
        Commands::Migrate => {
            let context = AppContext::initialize(config, false).await?;
            context.database()?.apply_schema().await?;
            info!("Database schema applied");
            Ok(())
        }
        Commands::ImportMarketData { files } => {
            let context = AppContext::initialize(config, false).await?;
            let database = context.database()?;
            for path in files {
                let file = MarketDataFile::read(&path)?;
                let model = file.symbol_model()?;
                database
                    .upsert_symbol(&file.exchange, &model.symbol, &file.symbol)
                    .await?;
                let stored = database
                    .insert_klines(&file.exchange, &model.symbol, file.timeframe, &file.klines)
                    .await?;
                info!(
                    "Imported {} klines of {} {} from {}",
                    stored,
                    model.symbol,
                    file.timeframe.as_str(),
                    path.display()
                );
            }
            Ok(())
        }
    }
}

async fn build_context(
    config: ServiceConfig,
    in_memory: bool,
    market_data_files: &[PathBuf],
) -> Result<AppContext> {
    if !in_memory {
        if !market_data_files.is_empty() {
            warn!("--market-data is ignored without --in-memory; use import-market-data");
        }
        return AppContext::initialize(config, false).await;
    }

    let market_data = Arc::new(InMemoryMarketData::new());
    for path in market_data_files {
        market_data.import(MarketDataFile::read(path)?)?;
        info!("Loaded market data from {}", path.display());
    }
    Ok(AppContext::in_memory(config, market_data))
}

async fn serve(context: AppContext) -> Result<()> {
    let scheduler = context.scheduler()?;
    scheduler.start();
    let bind_addr = context.config().bind_addr.clone();
    let state = context.api_state(scheduler.clone());

    let outcome = tokio::select! {
        served = api::serve(&bind_addr, state) => served,
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c"),
    };
    scheduler.shutdown().await;
    outcome
}

async fn work(context: AppContext) -> Result<()> {
    let scheduler = context.scheduler()?;
    scheduler.start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    scheduler.shutdown().await;
    Ok(())
}

fn check_program(config: &ServiceConfig, path: &Path) -> Result<()> {
    let program = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read program {}", path.display()))?;
    let prelude = match &config.scheduler.prelude_path {
        Some(prelude_path) => Some(
            std::fs::read_to_string(prelude_path)
                .with_context(|| format!("failed to read prelude {}", prelude_path.display()))?,
        ),
        None => None,
    };
    let sandbox = Sandbox::start(SandboxConfig {
        limits: config.scheduler.sandbox.clone(),
        deadline: config.scheduler.job_timeout,
        prelude,
    })?;
    let entry_points = sandbox.check(&program).map_err(|message| anyhow!(message))?;
    if entry_points.is_empty() {
        info!("{} compiles; no entry points, runs as a script", path.display());
    } else {
        info!("{} compiles; defines {}", path.display(), entry_points.join(", "));
    }
    Ok(())
}
