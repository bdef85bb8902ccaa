//! Runs against a real PostgreSQL when `TEST_DATABASE_URL` is set; the
//! tables it touches are truncated first.

mod common;

use anyhow::Result;
use backtest_runner::database::Database;
use backtest_runner::models::{
    ExecutionError, ExecutionStatus, ProgressUpdate, StrategyId, TerminalUpdate, Timeframe,
};
use backtest_runner::repository::{MarketDataSource, StrategyRepository};
use backtest_runner::store::ExecutionStore;
use chrono::Utc;
use common::{ensure_test_env, hourly_klines, strategy_payload, EXCHANGE, SYMBOL};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::NoTls;

static DATABASE_TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

async fn acquire_lock() -> MutexGuard<'static, ()> {
    DATABASE_TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .await
}

async fn test_database() -> Result<Option<Database>> {
    ensure_test_env();
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping PostgreSQL store test");
        return Ok(None);
    };
    let database = Database::new(&url).await?;
    database.apply_schema().await?;

    let (client, connection) = tokio_postgres::connect(&url, NoTls).await?;
    tokio::spawn(connection);
    client
        .batch_execute("TRUNCATE bt_executions, bt_strategies, klines, symbols")
        .await?;
    Ok(Some(database))
}

fn progress(percentage: u8, log_offset: usize, lines: &[&str]) -> ProgressUpdate {
    ProgressUpdate {
        percentage,
        log_offset,
        lines: lines.iter().map(|line| line.to_string()).collect(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execution_lifecycle_round_trips_through_postgres() -> Result<()> {
    let _guard = acquire_lock().await;
    let Some(database) = test_database().await? else {
        return Ok(());
    };

    let strategy = database.add(strategy_payload("fn on_bar(bar) { }")).await?;
    assert!(database.exists_by_id(&strategy.id).await?);
    let loaded = StrategyRepository::get_by_id(&database, &strategy.id)
        .await?
        .expect("strategy stored");
    assert_eq!(loaded.initial_capital, strategy.initial_capital);
    assert_eq!(loaded.timeframe, Timeframe::OneHour);

    let first = database.create(&strategy.id).await?;
    let second = database.create(&strategy.id).await?;
    assert_eq!(first.status, ExecutionStatus::Pending);

    let claimed = database
        .claim_next_pending(Duration::from_secs(10))
        .await?
        .expect("pending execution");
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, ExecutionStatus::Running);
    assert!(claimed.deadline_at > claimed.started_at);

    assert!(database.update_progress(&first.id, &progress(40, 0, &["a", "b"])).await?);
    assert!(database.update_progress(&first.id, &progress(20, 1, &["b", "c"])).await?);
    let record = ExecutionStore::get_by_id(&database, &first.id)
        .await?
        .expect("execution stored");
    assert_eq!(record.percentage, 40);
    assert_eq!(record.logs, vec!["a", "b", "c"]);

    let failure = TerminalUpdate::Failed(ExecutionError::new("ProgramError", "boom"));
    assert!(database.set_terminal(&first.id, &failure).await?);
    assert!(!database.set_terminal(&first.id, &failure).await?);
    assert!(!database.update_progress(&first.id, &progress(90, 3, &["d"])).await?);

    assert_eq!(
        database.request_cancellation(&second.id).await?,
        Some(ExecutionStatus::Canceled)
    );
    assert!(database
        .claim_next_pending(Duration::from_secs(10))
        .await?
        .is_none());

    let last = database
        .get_last_for_strategy(&strategy.id)
        .await?
        .expect("executions exist");
    assert_eq!(last.id, second.id);

    let counts = database.count_by_status().await?;
    assert_eq!(counts.get("failed"), Some(&1));
    assert_eq!(counts.get("canceled"), Some(&1));
    assert!(database
        .get_last_for_strategy(&StrategyId::generate())
        .await?
        .is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_running_rows_are_interrupted() -> Result<()> {
    let _guard = acquire_lock().await;
    let Some(database) = test_database().await? else {
        return Ok(());
    };

    let strategy = database.add(strategy_payload("loop { }")).await?;
    let execution = database.create(&strategy.id).await?;
    database
        .claim_next_pending(Duration::from_millis(10))
        .await?
        .expect("pending execution");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(database.interrupt_expired(Utc::now()).await?, vec![execution.id.clone()]);
    let record = ExecutionStore::get_by_id(&database, &execution.id)
        .await?
        .expect("execution stored");
    assert_eq!(record.status, ExecutionStatus::Interrupted);
    assert!(database.interrupt_expired(Utc::now()).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn market_data_is_windowed_and_symbols_carry_filters() -> Result<()> {
    let _guard = acquire_lock().await;
    let Some(database) = test_database().await? else {
        return Ok(());
    };

    let mut klines = hourly_klines(30);
    klines.reverse();
    database
        .insert_klines(EXCHANGE, SYMBOL, Timeframe::OneHour, &klines)
        .await?;
    database
        .upsert_symbol(
            EXCHANGE,
            SYMBOL,
            &json!({
                "symbol": SYMBOL,
                "baseAsset": "BTC",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000", "tickSize": "0.01"}
                ]
            }),
        )
        .await?;

    let strategy = strategy_payload("fn on_bar(bar) { }")
        .into_strategy(StrategyId::generate(), Utc::now());
    let window = database.klines(&strategy).await?;
    assert_eq!(window.len(), 24);
    assert!(window.windows(2).all(|pair| pair[0].open_time < pair[1].open_time));

    let model = database.symbol(EXCHANGE, SYMBOL).await?;
    assert_eq!(model.base_asset, "BTC");
    assert!(model.filters.price.is_some());

    let unknown = database.symbol(EXCHANGE, "DOGEUSDT").await?;
    assert!(unknown.filters.price.is_none());
    Ok(())
}
