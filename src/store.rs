//! Durable execution records.
//!
//! The store is the only place where workers coordinate: `claim_next_pending`
//! hands each pending record to exactly one caller, and every status change
//! out of a terminal state is refused.

use crate::errors::StoreError;
use crate::models::{
    BtExecution, ExecutionError, ExecutionId, ExecutionStatus, ProgressUpdate, StrategyId,
    TerminalUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Inserts a new `pending` record with a fresh id.
    async fn create(&self, strategy_id: &StrategyId) -> Result<BtExecution, StoreError>;

    /// Moves the oldest pending record to `running` and stamps its deadline.
    async fn claim_next_pending(&self, timeout: Duration)
        -> Result<Option<BtExecution>, StoreError>;

    /// Applies a progress increment to a running record; `false` when the
    /// record is no longer running.
    async fn update_progress(
        &self,
        id: &ExecutionId,
        update: &ProgressUpdate,
    ) -> Result<bool, StoreError>;

    /// Writes the terminal state of a running record exactly once.
    async fn set_terminal(
        &self,
        id: &ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError>;

    async fn get_by_id(&self, id: &ExecutionId) -> Result<Option<BtExecution>, StoreError>;

    async fn get_last_for_strategy(
        &self,
        strategy_id: &StrategyId,
    ) -> Result<Option<BtExecution>, StoreError>;

    /// Pending records are canceled on the spot; running ones get their
    /// flag raised. Returns the status after the request, `None` if unknown.
    async fn request_cancellation(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StoreError>;

    async fn is_cancellation_requested(&self, id: &ExecutionId) -> Result<bool, StoreError>;

    /// Marks every running record whose deadline is before `cutoff` as
    /// `interrupted`.
    async fn interrupt_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StoreError>;

    async fn count_by_status(&self) -> Result<BTreeMap<String, usize>, StoreError>;
}

pub fn canceled_before_start() -> ExecutionError {
    ExecutionError::new("CanceledError", "execution was canceled before it started")
}

pub fn interrupted_error() -> ExecutionError {
    ExecutionError::new(
        "InterruptedError",
        "execution was still running past its deadline when the service recovered",
    )
}

/// Appends the part of `update.lines` not already present in `logs`.
pub(crate) fn merge_progress(
    percentage: &mut u8,
    logs: &mut Vec<String>,
    update: &ProgressUpdate,
) {
    *percentage = (*percentage).max(update.percentage.min(100));
    let already_present = logs.len().saturating_sub(update.log_offset);
    logs.extend(update.lines.iter().skip(already_present).cloned());
}

#[derive(Default)]
struct InMemoryTable {
    last_created_at: Option<DateTime<Utc>>,
    executions: HashMap<ExecutionId, BtExecution>,
}

impl InMemoryTable {
    /// Creation stamps are strictly increasing so `(created_at, id)` keeps
    /// insertion order even when the clock does not advance between calls.
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created_at {
            Some(last) if now <= last => last + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }
}

/// Process-local store for tests and `--in-memory` runs; one mutex around
/// the whole table makes every operation atomic.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    table: Mutex<InMemoryTable>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(&self, f: impl FnOnce(&mut InMemoryTable) -> T) -> Result<T, StoreError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| StoreError::unavailable("execution table lock poisoned"))?;
        Ok(f(&mut table))
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, strategy_id: &StrategyId) -> Result<BtExecution, StoreError> {
        self.with_table(|table| {
            let created_at = table.next_created_at();
            let record =
                BtExecution::pending(ExecutionId::generate(), strategy_id.clone(), created_at);
            table.executions.insert(record.id.clone(), record.clone());
            record
        })
    }

    async fn claim_next_pending(
        &self,
        timeout: Duration,
    ) -> Result<Option<BtExecution>, StoreError> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|err| StoreError::unavailable(format!("invalid job timeout: {}", err)))?;
        self.with_table(|table| {
            let next = table
                .executions
                .values_mut()
                .filter(|record| record.status == ExecutionStatus::Pending)
                .min_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))?;
            let now = Utc::now();
            next.status = ExecutionStatus::Running;
            next.started_at = Some(now);
            next.deadline_at = Some(now + timeout);
            Some(next.clone())
        })
    }

    async fn update_progress(
        &self,
        id: &ExecutionId,
        update: &ProgressUpdate,
    ) -> Result<bool, StoreError> {
        self.with_table(|table| match table.executions.get_mut(id) {
            Some(record) if record.status == ExecutionStatus::Running => {
                merge_progress(&mut record.percentage, &mut record.logs, update);
                true
            }
            _ => false,
        })
    }

    async fn set_terminal(
        &self,
        id: &ExecutionId,
        update: &TerminalUpdate,
    ) -> Result<bool, StoreError> {
        self.with_table(|table| {
            let Some(record) = table.executions.get_mut(id) else {
                return false;
            };
            if record.status != ExecutionStatus::Running {
                return false;
            }
            record.status = update.status();
            record.finished_at = Some(Utc::now());
            record.error = update.error().cloned();
            if let TerminalUpdate::Finished(result) = update {
                record.percentage = 100;
                record.logs = result.logs.clone();
                record.result = Some(result.clone());
            }
            true
        })
    }

    async fn get_by_id(&self, id: &ExecutionId) -> Result<Option<BtExecution>, StoreError> {
        self.with_table(|table| table.executions.get(id).cloned())
    }

    async fn get_last_for_strategy(
        &self,
        strategy_id: &StrategyId,
    ) -> Result<Option<BtExecution>, StoreError> {
        self.with_table(|table| {
            table
                .executions
                .values()
                .filter(|record| &record.bt_strategy_id == strategy_id)
                .max_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)))
                .cloned()
        })
    }

    async fn request_cancellation(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<ExecutionStatus>, StoreError> {
        self.with_table(|table| {
            let record = table.executions.get_mut(id)?;
            match record.status {
                ExecutionStatus::Pending => {
                    record.status = ExecutionStatus::Canceled;
                    record.cancel_requested = true;
                    record.error = Some(canceled_before_start());
                    record.finished_at = Some(Utc::now());
                }
                ExecutionStatus::Running => record.cancel_requested = true,
                _ => {}
            }
            Some(record.status)
        })
    }

    async fn is_cancellation_requested(&self, id: &ExecutionId) -> Result<bool, StoreError> {
        self.with_table(|table| {
            table
                .executions
                .get(id)
                .map(|record| record.cancel_requested)
                .unwrap_or(false)
        })
    }

    async fn interrupt_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ExecutionId>, StoreError> {
        self.with_table(|table| {
            let now = Utc::now();
            let mut interrupted = Vec::new();
            for record in table.executions.values_mut() {
                let expired = record
                    .deadline_at
                    .map(|deadline| deadline < cutoff)
                    .unwrap_or(false);
                if record.status == ExecutionStatus::Running && expired {
                    record.status = ExecutionStatus::Interrupted;
                    record.error = Some(interrupted_error());
                    record.finished_at = Some(now);
                    interrupted.push(record.id.clone());
                }
            }
            interrupted
        })
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, usize>, StoreError> {
        self.with_table(|table| {
            let mut counts = BTreeMap::new();
            for record in table.executions.values() {
                *counts
                    .entry(record.status.as_str().to_string())
                    .or_insert(0) += 1;
            }
            counts
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionResult;
    use rust_decimal::Decimal;
    use serde_json::Value;

    fn strategy_id() -> StrategyId {
        StrategyId::parse("strategy-1").unwrap()
    }

    fn progress(percentage: u8, log_offset: usize, lines: &[&str]) -> ProgressUpdate {
        ProgressUpdate {
            percentage,
            log_offset,
            lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }

    fn finished(logs: Vec<String>) -> TerminalUpdate {
        TerminalUpdate::Finished(ExecutionResult {
            logs,
            return_value: Value::Null,
            opening_trades: Vec::new(),
            closed_trades: Vec::new(),
            win_count: 0,
            loss_count: 0,
            even_count: 0,
            total_net_return: Decimal::ZERO,
            final_balance: Decimal::ZERO,
            processed_klines: 0,
        })
    }

    #[tokio::test]
    async fn claims_oldest_pending_first_and_only_once() {
        let store = InMemoryExecutionStore::new();
        let first = store.create(&strategy_id()).await.unwrap();
        let second = store.create(&strategy_id()).await.unwrap();

        let claimed = store
            .claim_next_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, ExecutionStatus::Running);
        assert!(claimed.deadline_at.unwrap() > claimed.started_at.unwrap());

        let claimed = store
            .claim_next_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store
            .claim_next_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_idempotent() {
        let store = InMemoryExecutionStore::new();
        let record = store.create(&strategy_id()).await.unwrap();
        assert!(!store
            .update_progress(&record.id, &progress(10, 0, &["a"]))
            .await
            .unwrap());
        store.claim_next_pending(Duration::from_secs(5)).await.unwrap();

        let update = progress(40, 0, &["a", "b"]);
        assert!(store.update_progress(&record.id, &update).await.unwrap());
        assert!(store.update_progress(&record.id, &update).await.unwrap());
        store
            .update_progress(&record.id, &progress(20, 1, &["b", "c"]))
            .await
            .unwrap();
        store
            .update_progress(&record.id, &progress(250, 3, &[]))
            .await
            .unwrap();

        let stored = store.get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.logs, vec!["a", "b", "c"]);
        assert_eq!(stored.percentage, 100);
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let store = InMemoryExecutionStore::new();
        let record = store.create(&strategy_id()).await.unwrap();
        assert!(!store
            .set_terminal(&record.id, &finished(Vec::new()))
            .await
            .unwrap());

        store.claim_next_pending(Duration::from_secs(5)).await.unwrap();
        let timeout = TerminalUpdate::Timeout(ExecutionError::new("TimeoutError", "too slow"));
        assert!(store.set_terminal(&record.id, &timeout).await.unwrap());
        assert!(!store
            .set_terminal(&record.id, &finished(vec!["late".to_string()]))
            .await
            .unwrap());

        let stored = store.get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Timeout);
        assert!(stored.result.is_none());
        assert_eq!(stored.error.unwrap().name, "TimeoutError");
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn finished_record_carries_result_and_full_log() {
        let store = InMemoryExecutionStore::new();
        let record = store.create(&strategy_id()).await.unwrap();
        store.claim_next_pending(Duration::from_secs(5)).await.unwrap();
        store
            .update_progress(&record.id, &progress(50, 0, &["one"]))
            .await
            .unwrap();
        store
            .set_terminal(
                &record.id,
                &finished(vec!["one".to_string(), "two".to_string()]),
            )
            .await
            .unwrap();

        let stored = store.get_by_id(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Finished);
        assert_eq!(stored.percentage, 100);
        assert_eq!(stored.logs.len(), 2);
        assert!(stored.result.is_some());
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn cancellation_depends_on_status() {
        let store = InMemoryExecutionStore::new();
        let running = store.create(&strategy_id()).await.unwrap();
        let pending = store.create(&strategy_id()).await.unwrap();
        store.claim_next_pending(Duration::from_secs(5)).await.unwrap();

        assert_eq!(
            store.request_cancellation(&pending.id).await.unwrap(),
            Some(ExecutionStatus::Canceled)
        );
        assert_eq!(
            store.request_cancellation(&running.id).await.unwrap(),
            Some(ExecutionStatus::Running)
        );
        assert!(store.is_cancellation_requested(&running.id).await.unwrap());
        assert_eq!(
            store
                .request_cancellation(&ExecutionId::generate())
                .await
                .unwrap(),
            None
        );

        // canceled records are never claimed
        assert!(store
            .claim_next_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn expired_running_records_are_interrupted() {
        let store = InMemoryExecutionStore::new();
        let stale = store.create(&strategy_id()).await.unwrap();
        let waiting = store.create(&strategy_id()).await.unwrap();
        store.claim_next_pending(Duration::from_millis(1)).await.unwrap();

        let interrupted = store
            .interrupt_expired(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(interrupted, vec![stale.id.clone()]);

        let stale = store.get_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, ExecutionStatus::Interrupted);
        let waiting = store.get_by_id(&waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, ExecutionStatus::Pending);

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts.get("interrupted"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
    }

    #[tokio::test]
    async fn equal_creation_times_fall_back_to_id_order() {
        let store = InMemoryExecutionStore::new();
        let created_at = Utc::now();
        store
            .with_table(|table| {
                for id in ["exec-b", "exec-a"] {
                    let record = BtExecution::pending(
                        ExecutionId::parse(id).unwrap(),
                        strategy_id(),
                        created_at,
                    );
                    table.executions.insert(record.id.clone(), record);
                }
            })
            .unwrap();

        let last = store
            .get_last_for_strategy(&strategy_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id.as_str(), "exec-b");

        let claimed = store
            .claim_next_pending(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id.as_str(), "exec-a");
    }

    #[tokio::test]
    async fn creation_times_strictly_increase() {
        let store = InMemoryExecutionStore::new();
        let mut previous = store.create(&strategy_id()).await.unwrap().created_at;
        for _ in 0..50 {
            let next = store.create(&strategy_id()).await.unwrap().created_at;
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn last_execution_is_the_newest() {
        let store = InMemoryExecutionStore::new();
        store.create(&strategy_id()).await.unwrap();
        let newest = store.create(&strategy_id()).await.unwrap();
        store
            .create(&StrategyId::parse("other").unwrap())
            .await
            .unwrap();

        let last = store
            .get_last_for_strategy(&strategy_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.id, newest.id);
    }
}
