use crate::api::ApiState;
use crate::config::ServiceConfig;
use crate::database::Database;
use crate::repository::{
    InMemoryMarketData, InMemoryStrategyRepository, MarketDataSource, StrategyRepository,
};
use crate::scheduler::JobScheduler;
use crate::store::{ExecutionStore, InMemoryExecutionStore};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::Arc;

/// Collaborators shared by the API, the worker pool and CLI commands.
#[derive(Clone)]
pub struct AppContext {
    config: ServiceConfig,
    database: Option<Arc<Database>>,
    executions: Arc<dyn ExecutionStore>,
    strategies: Arc<dyn StrategyRepository>,
    market_data: Arc<dyn MarketDataSource>,
}

impl AppContext {
    /// Connects to PostgreSQL, or falls back to process-local storage when
    /// `in_memory` is set.
    pub async fn initialize(config: ServiceConfig, in_memory: bool) -> Result<Self> {
        if in_memory {
            if config.database_url.is_some() {
                warn!("--in-memory given; ignoring DATABASE_URL");
            }
            info!("Using in-memory storage; executions are lost on exit");
            return Ok(Self::in_memory(config, Arc::new(InMemoryMarketData::new())));
        }

        let Some(database_url) = config.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set unless --in-memory is used."
            ));
        };
        let database = Arc::new(Database::new(database_url).await?);
        Ok(Self {
            executions: database.clone(),
            strategies: database.clone(),
            market_data: database.clone(),
            database: Some(database),
            config,
        })
    }

    pub fn in_memory(config: ServiceConfig, market_data: Arc<InMemoryMarketData>) -> Self {
        Self {
            config,
            database: None,
            executions: Arc::new(InMemoryExecutionStore::new()),
            strategies: Arc::new(InMemoryStrategyRepository::new()),
            market_data,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn database(&self) -> Result<Arc<Database>> {
        self.database
            .clone()
            .ok_or_else(|| anyhow!("DATABASE_URL must be set to use database-backed commands."))
    }

    pub fn executions(&self) -> Arc<dyn ExecutionStore> {
        self.executions.clone()
    }

    pub fn strategies(&self) -> Arc<dyn StrategyRepository> {
        self.strategies.clone()
    }

    pub fn scheduler(&self) -> Result<JobScheduler> {
        JobScheduler::new(
            self.executions.clone(),
            self.strategies.clone(),
            self.market_data.clone(),
            self.config.scheduler.clone(),
        )
    }

    pub fn api_state(&self, scheduler: JobScheduler) -> ApiState {
        ApiState {
            scheduler,
            strategies: self.strategies.clone(),
            executions: self.executions.clone(),
        }
    }
}
