use crate::models::{ExecutionId, StrategyId};
use std::time::Duration;
use thiserror::Error;

/// A request or payload that is malformed before it reaches any collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("strategy {0} does not exist")]
    StrategyNotFound(StrategyId),
    #[error("failed to schedule execution")]
    Store(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum SandboxCreationError {
    #[error("sandbox limit {name} must be greater than zero")]
    InvalidLimit { name: &'static str },
    #[error("program is {size} bytes, above the {limit} byte ceiling")]
    ProgramTooLarge { size: usize, limit: usize },
    #[error("prelude program does not compile: {0}")]
    Prelude(String),
}

#[derive(Debug, Clone, Error)]
#[error("execution exceeded its {} ms deadline", .limit.as_millis())]
pub struct SandboxTimeoutError {
    pub limit: Duration,
}

/// Collaborator lookups that found nothing; mapped to 404 by the API layer.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("strategy {0} not found")]
    Strategy(StrategyId),
    #[error("execution {0} not found")]
    Execution(ExecutionId),
    #[error("strategy {0} has no executions")]
    NoExecutions(StrategyId),
}

/// Walks the `source()` chain of an error, outermost cause first.
pub fn causes_list(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut causes = Vec::new();
    let mut current = err.source();
    while let Some(cause) = current {
        causes.push(cause.to_string());
        current = cause.source();
    }
    causes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causes_list_follows_source_chain() {
        let err = ScheduleError::Store(StoreError::Unavailable("connection reset".to_string()));
        assert_eq!(
            causes_list(&err),
            vec!["store unavailable: connection reset".to_string()]
        );
    }

    #[test]
    fn timeout_error_reports_limit_in_millis() {
        let err = SandboxTimeoutError {
            limit: Duration::from_millis(10_000),
        };
        assert_eq!(err.to_string(), "execution exceeded its 10000 ms deadline");
    }
}
