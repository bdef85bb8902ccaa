use crate::errors::StoreError;
use crate::filters::SymbolModel;
use crate::models::{BtStrategy, Kline, NewBtStrategy, StrategyId, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    async fn exists_by_id(&self, id: &StrategyId) -> Result<bool, StoreError>;
    async fn get_by_id(&self, id: &StrategyId) -> Result<Option<BtStrategy>, StoreError>;
    /// Persists a validated payload under a fresh id.
    async fn add(&self, strategy: NewBtStrategy) -> Result<BtStrategy, StoreError>;
}

/// Historical data a backtest replays. `klines` returns the strategy's
/// window ordered by open time; calling it twice yields the same series.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    async fn klines(&self, strategy: &BtStrategy) -> Result<Vec<Kline>>;
    async fn symbol(&self, exchange: &str, symbol: &str) -> Result<SymbolModel>;
}

#[derive(Default)]
pub struct InMemoryStrategyRepository {
    strategies: DashMap<StrategyId, BtStrategy>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn exists_by_id(&self, id: &StrategyId) -> Result<bool, StoreError> {
        Ok(self.strategies.contains_key(id))
    }

    async fn get_by_id(&self, id: &StrategyId) -> Result<Option<BtStrategy>, StoreError> {
        Ok(self.strategies.get(id).map(|entry| entry.value().clone()))
    }

    async fn add(&self, strategy: NewBtStrategy) -> Result<BtStrategy, StoreError> {
        let strategy = strategy.into_strategy(StrategyId::generate(), Utc::now());
        self.strategies
            .insert(strategy.id.clone(), strategy.clone());
        Ok(strategy)
    }
}

fn market_key(exchange: &str, symbol: &str) -> String {
    format!("{}:{}", exchange.to_lowercase(), symbol.to_uppercase())
}

/// Klines and symbol metadata held in memory, keyed by exchange, symbol
/// and timeframe.
#[derive(Default)]
pub struct InMemoryMarketData {
    klines: DashMap<(String, Timeframe), Vec<Kline>>,
    symbols: DashMap<String, SymbolModel>,
}

impl InMemoryMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_klines(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: Timeframe,
        mut klines: Vec<Kline>,
    ) {
        klines.sort_by_key(|kline| kline.open_time);
        self.klines
            .insert((market_key(exchange, symbol), timeframe), klines);
    }

    pub fn insert_symbol(&self, exchange: &str, model: SymbolModel) {
        self.symbols
            .insert(market_key(exchange, &model.symbol), model);
    }

    pub fn import(&self, file: MarketDataFile) -> Result<()> {
        let model = file.symbol_model()?;
        self.insert_klines(&file.exchange, &model.symbol, file.timeframe, file.klines);
        self.insert_symbol(&file.exchange, model);
        Ok(())
    }
}

/// One market's klines plus its exchange symbol metadata, as exported from
/// an exchange info endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataFile {
    pub exchange: String,
    pub timeframe: Timeframe,
    /// Raw exchange metadata: `symbol`, `baseAsset`, `quoteAsset`, `filters`.
    pub symbol: Value,
    pub klines: Vec<Kline>,
}

impl MarketDataFile {
    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read market data {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid market data file {}", path.display()))
    }

    pub fn symbol_model(&self) -> Result<SymbolModel> {
        let mut model: SymbolModel = serde_json::from_value(self.symbol.clone())
            .context("invalid symbol metadata")?;
        model.symbol = model.symbol.to_uppercase();
        Ok(model)
    }
}

#[async_trait]
impl MarketDataSource for InMemoryMarketData {
    async fn klines(&self, strategy: &BtStrategy) -> Result<Vec<Kline>> {
        let key = (
            market_key(&strategy.exchange, &strategy.symbol),
            strategy.timeframe,
        );
        Ok(self
            .klines
            .get(&key)
            .map(|series| {
                series
                    .iter()
                    .filter(|kline| {
                        kline.open_time >= strategy.start_time
                            && kline.open_time < strategy.end_time
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn symbol(&self, exchange: &str, symbol: &str) -> Result<SymbolModel> {
        Ok(self
            .symbols
            .get(&market_key(exchange, symbol))
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| SymbolModel::unrestricted(symbol.to_uppercase())))
    }
}
