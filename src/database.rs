use crate::errors::StoreError;
use crate::filters::{ExchangeFilter, SymbolFilters, SymbolModel};
use crate::models::*;
use crate::repository::{MarketDataSource, StrategyRepository};
use crate::store::{canceled_before_start, interrupted_error, ExecutionStore};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_postgres::{Client, NoTls, Row};

const SCHEMA_SQL: &str = include_str!("../migrations/001_init.sql");

const EXECUTION_COLUMNS: &str = "id, bt_strategy_id, status, percentage, logs, result, error,
     cancel_requested, created_at, started_at, deadline_at, finished_at";

const STRATEGY_COLUMNS: &str = "id, name, exchange, symbol, timeframe, initial_capital,
     maker_fee_rate, taker_fee_rate, body, start_time, end_time, created_at";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn apply_schema(&self) -> Result<()> {
        self.client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("failed to apply database schema")
    }

    pub async fn insert_klines(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        klines: &[Kline],
    ) -> Result<u64> {
        let exchange = exchange.to_lowercase();
        let symbol = symbol.to_uppercase();
        let mut inserted = 0;
        for kline in klines {
            inserted += self
                .client
                .execute(
                    "INSERT INTO klines
                        (exchange, symbol, timeframe, open_time, close_time, open, high, low, close, volume)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                     ON CONFLICT (exchange, symbol, timeframe, open_time) DO UPDATE SET
                        close_time = EXCLUDED.close_time,
                        open = EXCLUDED.open,
                        high = EXCLUDED.high,
                        low = EXCLUDED.low,
                        close = EXCLUDED.close,
                        volume = EXCLUDED.volume",
                    &[
                        &exchange,
                        &symbol,
                        &timeframe.as_str(),
                        &kline.open_time,
                        &kline.close_time,
                        &kline.open,
                        &kline.high,
                        &kline.low,
                        &kline.close,
                        &kline.volume,
                    ],
                )
                .await
                .with_context(|| format!("failed to store kline {} for {}", kline.open_time, symbol))?;
        }
        Ok(inserted)
    }

    pub async fn upsert_symbol(&self, exchange: &str, symbol: &str, metadata: &Value) -> Result<()> {
        let filters = metadata.get("filters").cloned().unwrap_or_else(|| Value::Array(Vec::new()));
        let base_asset = metadata
            .get("baseAsset")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let quote_asset = metadata
            .get("quoteAsset")
            .and_then(Value::as_str)
            .unwrap_or_default();
        self.client
            .execute(
                "INSERT INTO symbols (exchange, symbol, base_asset, quote_asset, filters)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (exchange, symbol) DO UPDATE SET
                    base_asset = EXCLUDED.base_asset,
                    quote_asset = EXCLUDED.quote_asset,
                    filters = EXCLUDED.filters",
                &[
                    &exchange.to_lowercase(),
                    &symbol.to_uppercase(),
                    &base_asset,
                    &quote_asset,
                    &filters,
                ],
            )
            .await
            .with_context(|| format!("failed to store symbol {}", symbol))?;
        Ok(())
    }
}

fn row_to_execution(row: &Row) -> Result<BtExecution, StoreError> {
    let id: String = row.get(0);
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let status: String = row.get(2);
    let status = status
        .parse::<ExecutionStatus>()
        .map_err(|err| corrupt(err.to_string()))?;
    let percentage: i16 = row.get(3);
    let percentage =
        u8::try_from(percentage.clamp(0, 100)).map_err(|err| corrupt(err.to_string()))?;
    let result = row
        .get::<_, Option<Value>>(5)
        .map(serde_json::from_value::<ExecutionResult>)
        .transpose()
        .map_err(|err| corrupt(format!("result: {}", err)))?;
    let error = row
        .get::<_, Option<Value>>(6)
        .map(serde_json::from_value::<ExecutionError>)
        .transpose()
        .map_err(|err| corrupt(format!("error: {}", err)))?;

    Ok(BtExecution {
        id: ExecutionId::parse(&id).map_err(|err| corrupt(err.to_string()))?,
        bt_strategy_id: StrategyId::parse(row.get::<_, &str>(1))
            .map_err(|err| corrupt(err.to_string()))?,
        status,
        percentage,
        logs: row.get(4),
        result,
        error,
        cancel_requested: row.get(7),
        created_at: row.get(8),
        started_at: row.get(9),
        deadline_at: row.get(10),
        finished_at: row.get(11),
    })
}

fn row_to_strategy(row: &Row) -> Result<BtStrategy, StoreError> {
    let id: String = row.get(0);
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };
    Ok(BtStrategy {
        id: StrategyId::parse(&id).map_err(|err| corrupt(err.to_string()))?,
        name: row.get(1),
        exchange: row.get(2),
        symbol: row.get(3),
        timeframe: Timeframe::parse(row.get::<_, &str>(4)).map_err(|err| corrupt(err.to_string()))?,
        initial_capital: row.get(5),
        maker_fee_rate: row.get(6),
        taker_fee_rate: row.get(7),
        body: row.get(8),
        start_time: row.get(9),
        end_time: row.get(10),
        created_at: row.get(11),
    })
}

fn error_json(error: &ExecutionError) -> Result<Value, StoreError> {
    serde_json::to_value(error).map_err(StoreError::unavailable)
}

#[async_trait]
impl ExecutionStore for Database {
    async fn create(&self, strategy_id: &StrategyId) -> Result<BtExecution, StoreError> {
        let record = BtExecution::pending(ExecutionId::generate(), strategy_id.clone(), Utc::now());
        self.client
            .execute(
                "INSERT INTO bt_executions (id, bt_strategy_id, status, created_at)
                 VALUES ($1, $2, $3, $4)",
                &[
                    &record.id.as_str(),
                    &strategy_id.as_str(),
                    &record.status.as_str(),
                    &record.created_at,
                ],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(record)
    }

    async fn claim_next_pending(
        &self,
        timeout: Duration,
    ) -> Result<Option<BtExecution>, StoreError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|err| StoreError::unavailable(format!("invalid job timeout: {}", err)))?;
        let now = Utc::now();
        let deadline = now + timeout;
        let row = self
            .client
            .query_opt(
                &format!(
                    "UPDATE bt_executions
                     SET status = 'running', started_at = $1, deadline_at = $2
                     WHERE id = (
                        SELECT id FROM bt_executions
                        WHERE status = 'pending'
                        ORDER BY created_at, id
                        LIMIT 1
                        FOR UPDATE SKIP LOCKED
                     )
                     RETURNING {}",
                    EXECUTION_COLUMNS
                ),
                &[&now, &deadline],
            )
            .await
            .map_err(StoreError::unavailable)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn update_progress(
        &self,
        id: &ExecutionId,
        update: &ProgressUpdate,
    ) -> Result<bool, StoreError> {
        let percentage = i16::from(update.percentage.min(100));
        let log_offset = i32::try_from(update.log_offset).map_err(StoreError::unavailable)?;
        let updated = self
            .client
            .execute(
                "UPDATE bt_executions
                 SET percentage = GREATEST(percentage, $2),
                     logs = logs || ($3::text[])[(cardinality(logs) - $4 + 1):]
                 WHERE id = $1 AND status = 'running'",
                &[&id.as_str(), &percentage, &update.lines, &log_offset],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(updated == 1)
    }

    async fn set_terminal(
        &self,
        id: &ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        let status = update.status();
        let error = update.error().map(error_json).transpose()?;
        let (result, logs) = match update {
            TerminalUpdate::Finished(result) => (
                Some(serde_json::to_value(result).map_err(StoreError::unavailable)?),
                Some(result.logs.clone()),
            ),
            _ => (None, None),
        };
        let updated = self
            .client
            .execute(
                "UPDATE bt_executions
                 SET status = $2,
                     error = $3,
                     result = $4,
                     logs = COALESCE($5, logs),
                     percentage = CASE WHEN $2 = 'finished' THEN 100 ELSE percentage END,
                     finished_at = $6
                 WHERE id = $1 AND status = 'running'",
                &[
                    &id.as_str(),
                    &status.as_str(),
                    &error,
                    &result,
                    &logs,
                    &Utc::now(),
                ],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(updated == 1)
    }

    async fn get_by_id(&self, id: &ExecutionId) -> Result<Option<BtExecution>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {} FROM bt_executions WHERE id = $1", EXECUTION_COLUMNS),
                &[&id.as_str()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn get_last_for_strategy(
        &self,
        strategy_id: &StrategyId,
    ) -> Result<Option<BtExecution>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT {} FROM bt_executions
                     WHERE bt_strategy_id = $1
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                    EXECUTION_COLUMNS
                ),
                &[&strategy_id.as_str()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn request_cancellation(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StoreError> {
        let error = error_json(&canceled_before_start())?;
        let row = self
            .client
            .query_opt(
                "UPDATE bt_executions
                 SET status = CASE WHEN status = 'pending' THEN 'canceled' ELSE status END,
                     error = CASE WHEN status = 'pending' THEN $2 ELSE error END,
                     finished_at = CASE WHEN status = 'pending' THEN $3 ELSE finished_at END,
                     cancel_requested = cancel_requested OR status IN ('pending', 'running')
                 WHERE id = $1
                 RETURNING status",
                &[&id.as_str(), &error, &Utc::now()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        row.map(|row| {
            row.get::<_, &str>(0)
                .parse::<ExecutionStatus>()
                .map_err(|err| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: err.to_string(),
                })
        })
        .transpose()
    }

    async fn is_cancellation_requested(&self, id: &ExecutionId) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT cancel_requested FROM bt_executions WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(row.map(|row| row.get::<_, bool>(0)).unwrap_or(false))
    }

    async fn interrupt_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        let error = error_json(&interrupted_error())?;
        let rows = self
            .client
            .query(
                "UPDATE bt_executions
                 SET status = 'interrupted', error = $2, finished_at = $3
                 WHERE status = 'running' AND deadline_at < $1
                 RETURNING id",
                &[&cutoff, &error, &Utc::now()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        rows.iter()
            .map(|row| {
                let id: &str = row.get(0);
                ExecutionId::parse(id).map_err(|err| StoreError::Corrupt {
                    id: id.to_string(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT status, COUNT(*) FROM bt_executions GROUP BY status",
                &[],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(rows
            .iter()
            .map(|row| {
                let count: i64 = row.get(1);
                (row.get::<_, String>(0), count.max(0) as usize)
            })
            .collect())
    }
}

#[async_trait]
impl StrategyRepository for Database {
    async fn exists_by_id(&self, id: &StrategyId) -> Result<bool, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM bt_strategies WHERE id = $1)",
                &[&id.as_str()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(row.get(0))
    }

    async fn get_by_id(&self, id: &StrategyId) -> Result<Option<BtStrategy>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {} FROM bt_strategies WHERE id = $1", STRATEGY_COLUMNS),
                &[&id.as_str()],
            )
            .await
            .map_err(StoreError::unavailable)?;
        row.as_ref().map(row_to_strategy).transpose()
    }

    async fn add(&self, strategy: NewBtStrategy) -> Result<BtStrategy, StoreError> {
        let strategy = strategy.into_strategy(StrategyId::generate(), Utc::now());
        self.client
            .execute(
                "INSERT INTO bt_strategies
                    (id, name, exchange, symbol, timeframe, initial_capital,
                     maker_fee_rate, taker_fee_rate, body, start_time, end_time, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                &[
                    &strategy.id.as_str(),
                    &strategy.name,
                    &strategy.exchange,
                    &strategy.symbol,
                    &strategy.timeframe.as_str(),
                    &strategy.initial_capital,
                    &strategy.maker_fee_rate,
                    &strategy.taker_fee_rate,
                    &strategy.body,
                    &strategy.start_time,
                    &strategy.end_time,
                    &strategy.created_at,
                ],
            )
            .await
            .map_err(StoreError::unavailable)?;
        Ok(strategy)
    }
}

#[async_trait]
impl MarketDataSource for Database {
    async fn klines(&self, strategy: &BtStrategy) -> Result<Vec<Kline>> {
        let rows = self
            .client
            .query(
                "SELECT open_time, close_time, open, high, low, close, volume
                 FROM klines
                 WHERE exchange = $1 AND symbol = $2 AND timeframe = $3
                   AND open_time >= $4 AND open_time < $5
                 ORDER BY open_time",
                &[
                    &strategy.exchange.to_lowercase(),
                    &strategy.symbol.to_uppercase(),
                    &strategy.timeframe.as_str(),
                    &strategy.start_time,
                    &strategy.end_time,
                ],
            )
            .await
            .with_context(|| {
                format!(
                    "failed to load {} {} klines for strategy {}",
                    strategy.symbol,
                    strategy.timeframe.as_str(),
                    strategy.id
                )
            })?;

        let mut klines = Vec::with_capacity(rows.len());
        for row in rows {
            klines.push(Kline {
                open_time: row.get(0),
                close_time: row.get(1),
                open: row.get(2),
                high: row.get(3),
                low: row.get(4),
                close: row.get(5),
                volume: row.get(6),
            });
        }
        Ok(klines)
    }

    async fn symbol(&self, exchange: &str, symbol: &str) -> Result<SymbolModel> {
        let symbol = symbol.to_uppercase();
        let row = self
            .client
            .query_opt(
                "SELECT base_asset, quote_asset, filters FROM symbols
                 WHERE exchange = $1 AND symbol = $2",
                &[&exchange.to_lowercase(), &symbol],
            )
            .await
            .with_context(|| format!("failed to load symbol metadata for {}", symbol))?;

        let Some(row) = row else {
            warn!(
                "No symbol metadata for {} on {}; trading without filters",
                symbol, exchange
            );
            return Ok(SymbolModel::unrestricted(symbol));
        };

        let raw_filters: Value = row.get(2);
        let filters: Vec<ExchangeFilter> = serde_json::from_value(raw_filters)
            .with_context(|| format!("malformed filters for symbol {}", symbol))?;
        let filters = SymbolFilters::from_exchange_filters(filters)
            .map_err(|err| anyhow!("invalid filters for symbol {}: {}", symbol, err))?;

        Ok(SymbolModel {
            symbol,
            base_asset: row.get(0),
            quote_asset: row.get(1),
            filters,
        })
    }
}
