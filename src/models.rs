use crate::errors::ValidationError;
use crate::ledger::{ClosedTrade, OpeningTrade};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const MAX_ID_LENGTH: usize = 64;

fn validate_identifier(field: &str, raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if trimmed.len() > MAX_ID_LENGTH {
        return Err(ValidationError::new(
            field,
            format!("must be at most {} characters", MAX_ID_LENGTH),
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::new(
            field,
            "may only contain ASCII letters, digits, '-' and '_'",
        ));
    }
    Ok(trimmed.to_string())
}

macro_rules! identifier {
    ($name:ident, $field:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn parse(raw: &str) -> Result<Self, ValidationError> {
                validate_identifier($field, raw).map(Self)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

identifier!(StrategyId, "strategyId");
identifier!(ExecutionId, "executionId");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

impl Timeframe {
    pub const ALL: [Timeframe; 15] = [
        Timeframe::OneMinute,
        Timeframe::ThreeMinutes,
        Timeframe::FiveMinutes,
        Timeframe::FifteenMinutes,
        Timeframe::ThirtyMinutes,
        Timeframe::OneHour,
        Timeframe::TwoHours,
        Timeframe::FourHours,
        Timeframe::SixHours,
        Timeframe::EightHours,
        Timeframe::TwelveHours,
        Timeframe::OneDay,
        Timeframe::ThreeDays,
        Timeframe::OneWeek,
        Timeframe::OneMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::ThreeMinutes => "3m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::TwoHours => "2h",
            Timeframe::FourHours => "4h",
            Timeframe::SixHours => "6h",
            Timeframe::EightHours => "8h",
            Timeframe::TwelveHours => "12h",
            Timeframe::OneDay => "1d",
            Timeframe::ThreeDays => "3d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1M",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|timeframe| timeframe.as_str() == trimmed)
            .ok_or_else(|| {
                ValidationError::new("timeframe", format!("unknown timeframe '{}'", trimmed))
            })
    }
}

/// Creation payload for a backtesting strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBtStrategy {
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub initial_capital: Decimal,
    #[serde(default)]
    pub maker_fee_rate: Decimal,
    #[serde(default)]
    pub taker_fee_rate: Decimal,
    pub body: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl NewBtStrategy {
    pub fn validate(&self, max_program_bytes: usize) -> Result<(), ValidationError> {
        for (field, value) in [
            ("name", &self.name),
            ("exchange", &self.exchange),
            ("symbol", &self.symbol),
            ("body", &self.body),
        ] {
            if value.trim().is_empty() {
                return Err(ValidationError::new(field, "must not be empty"));
            }
        }
        if self.body.len() > max_program_bytes {
            return Err(ValidationError::new(
                "body",
                format!("must be at most {} bytes", max_program_bytes),
            ));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(ValidationError::new(
                "initialCapital",
                "must be greater than zero",
            ));
        }
        for (field, rate) in [
            ("makerFeeRate", self.maker_fee_rate),
            ("takerFeeRate", self.taker_fee_rate),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(ValidationError::new(field, "must be within [0, 1)"));
            }
        }
        if self.start_time >= self.end_time {
            return Err(ValidationError::new(
                "startTime",
                "must be earlier than endTime",
            ));
        }
        Ok(())
    }

    pub fn into_strategy(self, id: StrategyId, created_at: DateTime<Utc>) -> BtStrategy {
        BtStrategy {
            id,
            name: self.name.trim().to_string(),
            exchange: self.exchange.trim().to_string(),
            symbol: self.symbol.trim().to_ascii_uppercase(),
            timeframe: self.timeframe,
            initial_capital: self.initial_capital,
            maker_fee_rate: self.maker_fee_rate,
            taker_fee_rate: self.taker_fee_rate,
            body: self.body,
            start_time: self.start_time,
            end_time: self.end_time,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtStrategy {
    pub id: StrategyId,
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub initial_capital: Decimal,
    pub maker_fee_rate: Decimal,
    pub taker_fee_rate: Decimal,
    pub body: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Timeout,
    Failed,
    Canceled,
    Interrupted,
    Finished,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
            ExecutionStatus::Interrupted => "interrupted",
            ExecutionStatus::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "failed" => Ok(ExecutionStatus::Failed),
            "canceled" => Ok(ExecutionStatus::Canceled),
            "interrupted" => Ok(ExecutionStatus::Interrupted),
            "finished" => Ok(ExecutionStatus::Finished),
            other => Err(ValidationError::new(
                "status",
                format!("unknown execution status '{}'", other),
            )),
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
}

impl ExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub logs: Vec<String>,
    pub return_value: Value,
    pub opening_trades: Vec<OpeningTrade>,
    pub closed_trades: Vec<ClosedTrade>,
    pub win_count: usize,
    pub loss_count: usize,
    pub even_count: usize,
    pub total_net_return: Decimal,
    pub final_balance: Decimal,
    pub processed_klines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtExecution {
    pub id: ExecutionId,
    pub bt_strategy_id: StrategyId,
    pub status: ExecutionStatus,
    pub percentage: u8,
    pub logs: Vec<String>,
    pub result: Option<ExecutionResult>,
    pub error: Option<ExecutionError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BtExecution {
    pub fn pending(id: ExecutionId, bt_strategy_id: StrategyId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            bt_strategy_id,
            status: ExecutionStatus::Pending,
            percentage: 0,
            logs: Vec::new(),
            result: None,
            error: None,
            cancel_requested: false,
            created_at,
            started_at: None,
            deadline_at: None,
            finished_at: None,
        }
    }
}

/// One increment reported by a running execution.
///
/// `log_offset` is the index the first line of `lines` occupies in the full
/// log, so that re-delivering an update never duplicates lines.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub percentage: u8,
    pub log_offset: usize,
    pub lines: Vec<String>,
}

/// Final write for an execution.
#[derive(Debug, Clone)]
pub enum TerminalUpdate {
    Finished(ExecutionResult),
    Failed(ExecutionError),
    Timeout(ExecutionError),
    Canceled(ExecutionError),
    Interrupted(ExecutionError),
}

impl TerminalUpdate {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            TerminalUpdate::Finished(_) => ExecutionStatus::Finished,
            TerminalUpdate::Failed(_) => ExecutionStatus::Failed,
            TerminalUpdate::Timeout(_) => ExecutionStatus::Timeout,
            TerminalUpdate::Canceled(_) => ExecutionStatus::Canceled,
            TerminalUpdate::Interrupted(_) => ExecutionStatus::Interrupted,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            TerminalUpdate::Finished(_) => None,
            TerminalUpdate::Failed(error)
            | TerminalUpdate::Timeout(error)
            | TerminalUpdate::Canceled(error)
            | TerminalUpdate::Interrupted(error) => Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_strategy() -> NewBtStrategy {
        NewBtStrategy {
            name: "sma cross".to_string(),
            exchange: "binance".to_string(),
            symbol: "btcusdt".to_string(),
            timeframe: Timeframe::OneHour,
            initial_capital: dec!(1000),
            maker_fee_rate: dec!(0.001),
            taker_fee_rate: dec!(0.001),
            body: "fn on_bar(bar) { () }".to_string(),
            start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_time: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn execution_id_rejects_empty_and_whitespace() {
        assert!(ExecutionId::parse("").is_err());
        assert!(ExecutionId::parse("   ").is_err());
        let err = ExecutionId::parse("").unwrap_err();
        assert_eq!(err.field, "executionId");
    }

    #[test]
    fn execution_id_rejects_path_characters() {
        assert!(ExecutionId::parse("../etc").is_err());
        assert!(ExecutionId::parse("a b").is_err());
        assert_eq!(
            ExecutionId::parse(" abc-123_x ").unwrap().as_str(),
            "abc-123_x"
        );
    }

    #[test]
    fn generated_ids_are_distinct() {
        let first = ExecutionId::generate();
        let second = ExecutionId::generate();
        assert_ne!(first, second);
        assert!(ExecutionId::parse(first.as_str()).is_ok());
    }

    #[test]
    fn status_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        for status in [
            ExecutionStatus::Timeout,
            ExecutionStatus::Failed,
            ExecutionStatus::Canceled,
            ExecutionStatus::Interrupted,
            ExecutionStatus::Finished,
        ] {
            assert!(status.is_terminal(), "{} should be terminal", status);
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
    }

    #[test]
    fn timeframe_parses_exchange_labels() {
        assert_eq!(Timeframe::parse("1M").unwrap(), Timeframe::OneMonth);
        assert_eq!(Timeframe::parse("1m").unwrap(), Timeframe::OneMinute);
        assert!(Timeframe::parse("7m").is_err());
        let json = serde_json::to_string(&Timeframe::FourHours).unwrap();
        assert_eq!(json, "\"4h\"");
    }

    #[test]
    fn new_strategy_validation() {
        assert!(sample_strategy().validate(1024).is_ok());

        let mut blank_body = sample_strategy();
        blank_body.body = "  ".to_string();
        assert_eq!(blank_body.validate(1024).unwrap_err().field, "body");

        let mut reversed = sample_strategy();
        std::mem::swap(&mut reversed.start_time, &mut reversed.end_time);
        assert_eq!(reversed.validate(1024).unwrap_err().field, "startTime");

        let mut expensive = sample_strategy();
        expensive.taker_fee_rate = dec!(1);
        assert_eq!(expensive.validate(1024).unwrap_err().field, "takerFeeRate");

        assert_eq!(sample_strategy().validate(4).unwrap_err().field, "body");
    }

    #[test]
    fn into_strategy_normalizes_symbol() {
        let id = StrategyId::generate();
        let strategy = sample_strategy().into_strategy(id.clone(), Utc::now());
        assert_eq!(strategy.id, id);
        assert_eq!(strategy.symbol, "BTCUSDT");
    }
}
