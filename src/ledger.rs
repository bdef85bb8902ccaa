//! Per-execution accumulator of opening and closed trades.
//!
//! Trades are values: closing a trade removes it from the opening list and
//! appends a new [`ClosedTrade`]; nothing already recorded is edited. The
//! win/loss/even views are derived on demand from the closed list.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("trade {0} is already open")]
    DuplicateTrade(String),
    #[error("no opening trade with id {0}")]
    UnknownTrade(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpeningTrade {
    pub id: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_fee: Decimal,
}

impl OpeningTrade {
    /// Builds the closed counterpart of this trade; `self` is left untouched.
    pub fn close(&self, exit_time: DateTime<Utc>, exit_price: Decimal, exit_fee: Decimal) -> ClosedTrade {
        let gross = (exit_price - self.entry_price) * self.quantity;
        ClosedTrade {
            id: self.id.clone(),
            entry_time: self.entry_time,
            entry_price: self.entry_price,
            quantity: self.quantity,
            entry_fee: self.entry_fee,
            exit_time,
            exit_price,
            exit_fee,
            net_return: gross - self.entry_fee - exit_fee,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedTrade {
    pub id: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub entry_fee: Decimal,
    pub exit_time: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_fee: Decimal,
    pub net_return: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeOutcome {
    Win,
    Loss,
    Even,
}

impl ClosedTrade {
    pub fn outcome(&self) -> TradeOutcome {
        match self.net_return.cmp(&Decimal::ZERO) {
            Ordering::Greater => TradeOutcome::Win,
            Ordering::Less => TradeOutcome::Loss,
            Ordering::Equal => TradeOutcome::Even,
        }
    }
}

/// Borrowed split of the closed trades by outcome.
#[derive(Debug, Default)]
pub struct TradePartition<'a> {
    pub win: Vec<&'a ClosedTrade>,
    pub loss: Vec<&'a ClosedTrade>,
    pub even: Vec<&'a ClosedTrade>,
}

#[derive(Debug, Clone, Default)]
pub struct TradeLedger {
    opening: Vec<OpeningTrade>,
    closed: Vec<ClosedTrade>,
    next_sequence: u64,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_closed(closed: Vec<ClosedTrade>) -> Self {
        Self {
            opening: Vec::new(),
            next_sequence: closed.len() as u64,
            closed,
        }
    }

    pub fn opening_trades(&self) -> &[OpeningTrade] {
        &self.opening
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn next_trade_id(&mut self) -> String {
        self.next_sequence += 1;
        format!("trade-{}", self.next_sequence)
    }

    pub fn open(&mut self, trade: OpeningTrade) -> Result<(), LedgerError> {
        if self.opening.iter().any(|existing| existing.id == trade.id) {
            return Err(LedgerError::DuplicateTrade(trade.id));
        }
        self.opening.push(trade);
        Ok(())
    }

    pub fn close(
        &mut self,
        trade_id: &str,
        exit_time: DateTime<Utc>,
        exit_price: Decimal,
        exit_fee: Decimal,
    ) -> Result<&ClosedTrade, LedgerError> {
        let index = self
            .opening
            .iter()
            .position(|trade| trade.id == trade_id)
            .ok_or_else(|| LedgerError::UnknownTrade(trade_id.to_string()))?;
        let opening = self.opening.remove(index);
        self.closed.push(opening.close(exit_time, exit_price, exit_fee));
        Ok(&self.closed[self.closed.len() - 1])
    }

    pub fn partition(&self) -> TradePartition<'_> {
        let mut partition = TradePartition::default();
        for trade in &self.closed {
            match trade.outcome() {
                TradeOutcome::Win => partition.win.push(trade),
                TradeOutcome::Loss => partition.loss.push(trade),
                TradeOutcome::Even => partition.even.push(trade),
            }
        }
        partition
    }

    pub fn win_trades(&self) -> Vec<&ClosedTrade> {
        self.partition().win
    }

    pub fn loss_trades(&self) -> Vec<&ClosedTrade> {
        self.partition().loss
    }

    pub fn even_trades(&self) -> Vec<&ClosedTrade> {
        self.partition().even
    }

    pub fn total_net_return(&self) -> Decimal {
        self.closed.iter().map(|trade| trade.net_return).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::hours(hours)
    }

    fn opening(ledger: &mut TradeLedger, price: Decimal, quantity: Decimal) -> String {
        let id = ledger.next_trade_id();
        ledger
            .open(OpeningTrade {
                id: id.clone(),
                entry_time: at(0),
                entry_price: price,
                quantity,
                entry_fee: Decimal::ZERO,
            })
            .unwrap();
        id
    }

    #[test]
    fn closing_moves_trade_and_computes_net_return() {
        let mut ledger = TradeLedger::new();
        let id = opening(&mut ledger, dec!(100), dec!(2));
        let closed = ledger.close(&id, at(5), dec!(110), dec!(0.5)).unwrap().clone();

        assert!(ledger.opening_trades().is_empty());
        assert_eq!(ledger.closed_trades().len(), 1);
        assert_eq!(closed.net_return, dec!(19.5));
        assert_eq!(closed.entry_price, dec!(100));
        assert_eq!(closed.exit_time, at(5));
    }

    #[test]
    fn even_trade_is_only_in_even_partition() {
        let mut ledger = TradeLedger::new();
        let id = opening(&mut ledger, dec!(50), dec!(1));
        ledger.close(&id, at(1), dec!(50), Decimal::ZERO).unwrap();

        assert_eq!(ledger.even_trades().len(), 1);
        assert!(ledger.win_trades().is_empty());
        assert!(ledger.loss_trades().is_empty());
    }

    #[test]
    fn partitions_cover_all_closed_trades() {
        let mut ledger = TradeLedger::new();
        for exit in [dec!(9), dec!(10), dec!(11), dec!(12), dec!(8)] {
            let id = opening(&mut ledger, dec!(10), dec!(1));
            ledger.close(&id, at(2), exit, Decimal::ZERO).unwrap();
        }
        let partition = ledger.partition();
        assert_eq!(partition.win.len(), 2);
        assert_eq!(partition.loss.len(), 2);
        assert_eq!(partition.even.len(), 1);
        assert_eq!(
            partition.win.len() + partition.loss.len() + partition.even.len(),
            ledger.closed_trades().len()
        );
        assert_eq!(ledger.total_net_return(), dec!(0));
    }

    #[test]
    fn unknown_and_duplicate_trades_are_rejected() {
        let mut ledger = TradeLedger::new();
        let id = opening(&mut ledger, dec!(10), dec!(1));
        let duplicate = ledger.opening_trades()[0].clone();
        assert_eq!(
            ledger.open(duplicate).unwrap_err(),
            LedgerError::DuplicateTrade(id.clone())
        );
        ledger.close(&id, at(1), dec!(11), Decimal::ZERO).unwrap();
        assert_eq!(
            ledger.close(&id, at(2), dec!(11), Decimal::ZERO).unwrap_err(),
            LedgerError::UnknownTrade(id)
        );
    }

    #[test]
    fn trade_ids_are_sequential() {
        let mut ledger = TradeLedger::new();
        assert_eq!(ledger.next_trade_id(), "trade-1");
        assert_eq!(ledger.next_trade_id(), "trade-2");
    }
}
