#![allow(dead_code)]

use anyhow::{anyhow, Result};
use backtest_runner::config::SchedulerConfig;
use backtest_runner::models::{
    BtExecution, ExecutionId, Kline, NewBtStrategy, StrategyId, Timeframe,
};
use backtest_runner::repository::{InMemoryMarketData, InMemoryStrategyRepository, StrategyRepository};
use backtest_runner::scheduler::JobScheduler;
use backtest_runner::store::{ExecutionStore, InMemoryExecutionStore};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub const EXCHANGE: &str = "binance";
pub const SYMBOL: &str = "BTCUSDT";
pub const KLINE_COUNT: i64 = 24;

pub fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn series_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn hourly_klines(count: i64) -> Vec<Kline> {
    (0..count)
        .map(|hour| {
            let open_time = series_start() + ChronoDuration::hours(hour);
            let close = 100.0 + hour as f64;
            Kline {
                open_time,
                close_time: open_time + ChronoDuration::hours(1) - ChronoDuration::milliseconds(1),
                open: close - 0.5,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 10.0,
            }
        })
        .collect()
}

pub fn strategy_payload(body: &str) -> NewBtStrategy {
    NewBtStrategy {
        name: "test strategy".to_string(),
        exchange: EXCHANGE.to_string(),
        symbol: SYMBOL.to_string(),
        timeframe: Timeframe::OneHour,
        initial_capital: dec!(1000),
        maker_fee_rate: dec!(0.001),
        taker_fee_rate: dec!(0.001),
        body: body.to_string(),
        start_time: series_start(),
        end_time: series_start() + ChronoDuration::hours(KLINE_COUNT),
    }
}

pub fn scheduler_config(concurrency: usize, timeout: Duration) -> SchedulerConfig {
    SchedulerConfig {
        job_concurrency: concurrency,
        job_timeout: timeout,
        poll_interval: Duration::from_millis(20),
        recovery_interval: Duration::from_secs(3600),
        recovery_grace: Duration::ZERO,
        ..SchedulerConfig::default()
    }
}

pub fn market_data() -> Arc<InMemoryMarketData> {
    let data = Arc::new(InMemoryMarketData::new());
    data.insert_klines(EXCHANGE, SYMBOL, Timeframe::OneHour, hourly_klines(KLINE_COUNT));
    data
}

pub struct Harness {
    pub executions: Arc<InMemoryExecutionStore>,
    pub strategies: Arc<InMemoryStrategyRepository>,
    pub market_data: Arc<InMemoryMarketData>,
    pub scheduler: JobScheduler,
}

impl Harness {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        ensure_test_env();
        let executions = Arc::new(InMemoryExecutionStore::new());
        let strategies = Arc::new(InMemoryStrategyRepository::new());
        let market_data = market_data();
        let scheduler = JobScheduler::new(
            executions.clone(),
            strategies.clone(),
            market_data.clone(),
            config,
        )?;
        Ok(Self {
            executions,
            strategies,
            market_data,
            scheduler,
        })
    }

    pub async fn add_strategy(&self, body: &str) -> Result<StrategyId> {
        Ok(self.strategies.add(strategy_payload(body)).await?.id)
    }

    pub async fn record(&self, id: &ExecutionId) -> Result<BtExecution> {
        self.executions
            .get_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("execution {} missing", id))
    }

    /// Polls the store until `done` holds for the record or `within` elapses.
    pub async fn wait_for(
        &self,
        id: &ExecutionId,
        within: Duration,
        done: impl Fn(&BtExecution) -> bool,
    ) -> Result<BtExecution> {
        let started = Instant::now();
        loop {
            let record = self.record(id).await?;
            if done(&record) {
                return Ok(record);
            }
            if started.elapsed() > within {
                return Err(anyhow!(
                    "execution {} still {} after {:?}",
                    id,
                    record.status,
                    within
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_terminal(&self, id: &ExecutionId, within: Duration) -> Result<BtExecution> {
        self.wait_for(id, within, |record| record.status.is_terminal())
            .await
    }
}
