//! Host side of a backtest: the klines being replayed, the trade ledger,
//! the quote balance and the order simulator the program's intents go
//! through.

use crate::filters::{round_scale, OrderKind, OrderRequest, SymbolFilters, SymbolModel};
use crate::ledger::{OpeningTrade, TradeLedger};
use crate::models::{BtStrategy, ExecutionResult, Kline};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;

/// What a strategy asked for on one bar.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    Enter {
        kind: OrderKind,
        quantity: Decimal,
        price: Option<Decimal>,
    },
    /// `None` closes every opening trade.
    Exit { trade_id: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled { message: String },
    Skipped {
        reason: &'static str,
        details: Option<String>,
    },
}

impl OrderOutcome {
    fn skipped(reason: &'static str, details: impl Into<String>) -> Self {
        OrderOutcome::Skipped {
            reason,
            details: Some(details.into()),
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self, OrderOutcome::Filled { .. })
    }

    pub fn log_line(&self) -> String {
        match self {
            OrderOutcome::Filled { message } => message.clone(),
            OrderOutcome::Skipped {
                reason,
                details: Some(details),
            } => format!("Order skipped ({}): {}", reason, details),
            OrderOutcome::Skipped {
                reason,
                details: None,
            } => format!("Order skipped ({})", reason),
        }
    }
}

/// Quote-asset balance of a single backtest.
#[derive(Debug, Clone, PartialEq)]
pub struct Portfolio {
    initial: Decimal,
    balance: Decimal,
}

impl Portfolio {
    pub fn new(initial: Decimal) -> Self {
        Self {
            initial,
            balance: initial,
        }
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn initial(&self) -> Decimal {
        self.initial
    }

    fn debit(&mut self, amount: Decimal) -> bool {
        if amount > self.balance {
            return false;
        }
        self.balance -= amount;
        true
    }

    fn credit(&mut self, amount: Decimal) {
        self.balance += amount;
    }
}

/// Fills intents against a bar under the symbol's filters and fee schedule.
#[derive(Debug, Clone)]
pub struct OrderSimulator {
    filters: SymbolFilters,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
}

impl OrderSimulator {
    pub fn new(filters: SymbolFilters, maker_fee_rate: Decimal, taker_fee_rate: Decimal) -> Self {
        Self {
            filters,
            maker_fee_rate,
            taker_fee_rate,
        }
    }

    fn fee_rate(&self, kind: OrderKind) -> Decimal {
        match kind {
            OrderKind::Market => self.taker_fee_rate,
            OrderKind::Limit => self.maker_fee_rate,
        }
    }

    fn enter(
        &self,
        bar: &Kline,
        kind: OrderKind,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        ledger: &mut TradeLedger,
        portfolio: &mut Portfolio,
    ) -> OrderOutcome {
        if quantity <= Decimal::ZERO {
            return OrderOutcome::skipped("invalid_quantity", format!("quantity {}", quantity));
        }
        let price = match (kind, limit_price) {
            (OrderKind::Market, _) => match Decimal::from_f64(bar.close) {
                Some(close) if close > Decimal::ZERO => close,
                _ => {
                    return OrderOutcome::Skipped {
                        reason: "price_unavailable",
                        details: None,
                    }
                }
            },
            (OrderKind::Limit, None) => {
                return OrderOutcome::skipped("missing_price", "limit orders need a price")
            }
            (OrderKind::Limit, Some(price)) => price,
        };
        if quantity.checked_mul(price).is_none() {
            return OrderOutcome::skipped(
                "invalid_quantity",
                format!("{} @ {} is out of range", quantity, price),
            );
        }

        let order = match self.filters.validate(&OrderRequest {
            kind,
            quantity,
            price,
        }) {
            Ok(order) => order,
            Err(err) => return OrderOutcome::skipped("filter_violation", err.to_string()),
        };
        if kind == OrderKind::Limit && !limit_reached(bar, order.price) {
            return OrderOutcome::skipped(
                "limit_not_reached",
                format!("{} outside [{}, {}]", order.price, bar.low, bar.high),
            );
        }

        let Some((fee, required)) = order
            .notional
            .checked_mul(self.fee_rate(kind))
            .map(round_scale)
            .and_then(|fee| Some((fee, order.notional.checked_add(fee)?)))
        else {
            return OrderOutcome::skipped(
                "invalid_quantity",
                format!("notional {} is out of range", order.notional),
            );
        };
        if !portfolio.debit(required) {
            return OrderOutcome::skipped(
                "insufficient_balance",
                format!("need {}, have {}", required, portfolio.balance()),
            );
        }

        let id = ledger.next_trade_id();
        if let Err(err) = ledger.open(OpeningTrade {
            id: id.clone(),
            entry_time: bar.close_time,
            entry_price: order.price,
            quantity: order.quantity,
            entry_fee: fee,
        }) {
            portfolio.credit(required);
            return OrderOutcome::skipped("ledger_rejected", err.to_string());
        }

        OrderOutcome::Filled {
            message: format!(
                "Opened {} {} @ {} (fee {})",
                id, order.quantity, order.price, fee
            ),
        }
    }

    fn exit(
        &self,
        bar: &Kline,
        trade_id: &str,
        ledger: &mut TradeLedger,
        portfolio: &mut Portfolio,
    ) -> OrderOutcome {
        let Some(quantity) = ledger
            .opening_trades()
            .iter()
            .find(|trade| trade.id == trade_id)
            .map(|trade| trade.quantity)
        else {
            return OrderOutcome::skipped("unknown_trade", trade_id.to_string());
        };
        let Some(price) = Decimal::from_f64(bar.close).map(round_scale) else {
            return OrderOutcome::Skipped {
                reason: "price_unavailable",
                details: None,
            };
        };

        let Some((notional, fee)) = price
            .checked_mul(quantity)
            .map(round_scale)
            .and_then(|notional| {
                let fee = round_scale(notional.checked_mul(self.taker_fee_rate)?);
                portfolio.balance().checked_add(notional - fee)?;
                Some((notional, fee))
            })
        else {
            return OrderOutcome::skipped(
                "invalid_quantity",
                format!("{} @ {} is out of range", quantity, price),
            );
        };
        match ledger.close(trade_id, bar.close_time, price, fee) {
            Ok(closed) => {
                let message = format!(
                    "Closed {} @ {} (fee {}, net {})",
                    closed.id, closed.exit_price, closed.exit_fee, closed.net_return
                );
                portfolio.credit(notional - fee);
                OrderOutcome::Filled { message }
            }
            Err(err) => OrderOutcome::skipped("ledger_rejected", err.to_string()),
        }
    }
}

fn limit_reached(bar: &Kline, price: Decimal) -> bool {
    match (Decimal::from_f64(bar.low), Decimal::from_f64(bar.high)) {
        (Some(low), Some(high)) => low <= price && price <= high,
        _ => false,
    }
}

/// Everything one execution mutates while its program runs.
#[derive(Debug, Clone)]
pub struct BacktestSession {
    klines: Vec<Kline>,
    start_time: DateTime<Utc>,
    simulator: OrderSimulator,
    ledger: TradeLedger,
    portfolio: Portfolio,
    processed: usize,
}

impl BacktestSession {
    pub fn new(strategy: &BtStrategy, symbol: SymbolModel, klines: Vec<Kline>) -> Self {
        Self {
            klines,
            start_time: strategy.start_time,
            simulator: OrderSimulator::new(
                symbol.filters,
                strategy.maker_fee_rate,
                strategy.taker_fee_rate,
            ),
            ledger: TradeLedger::new(),
            portfolio: Portfolio::new(strategy.initial_capital),
            processed: 0,
        }
    }

    pub fn kline_count(&self) -> usize {
        self.klines.len()
    }

    pub fn kline(&self, index: usize) -> Option<&Kline> {
        self.klines.get(index)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    pub fn balance(&self) -> Decimal {
        self.portfolio.balance()
    }

    pub fn processed_klines(&self) -> usize {
        self.processed
    }

    pub fn mark_processed(&mut self, index: usize) {
        self.processed = self.processed.max(index + 1);
    }

    /// Applies the intents in order against bar `index`; one outcome per
    /// intent, in the same order.
    pub fn apply_intents(&mut self, index: usize, intents: Vec<OrderIntent>) -> Vec<OrderOutcome> {
        let Some(bar) = self.klines.get(index).cloned() else {
            return Vec::new();
        };
        let mut outcomes = Vec::with_capacity(intents.len());
        for intent in intents {
            match intent {
                OrderIntent::Enter {
                    kind,
                    quantity,
                    price,
                } => outcomes.push(self.simulator.enter(
                    &bar,
                    kind,
                    quantity,
                    price,
                    &mut self.ledger,
                    &mut self.portfolio,
                )),
                OrderIntent::Exit { trade_id: Some(id) } => outcomes.push(self.simulator.exit(
                    &bar,
                    &id,
                    &mut self.ledger,
                    &mut self.portfolio,
                )),
                OrderIntent::Exit { trade_id: None } => {
                    let ids: Vec<String> = self
                        .ledger
                        .opening_trades()
                        .iter()
                        .map(|trade| trade.id.clone())
                        .collect();
                    for id in ids {
                        outcomes.push(self.simulator.exit(
                            &bar,
                            &id,
                            &mut self.ledger,
                            &mut self.portfolio,
                        ));
                    }
                }
            }
        }
        outcomes
    }

    pub fn into_result(self, logs: Vec<String>, return_value: Value) -> ExecutionResult {
        let partition = self.ledger.partition();
        let (win_count, loss_count, even_count) = (
            partition.win.len(),
            partition.loss.len(),
            partition.even.len(),
        );
        ExecutionResult {
            logs,
            return_value,
            win_count,
            loss_count,
            even_count,
            total_net_return: self.ledger.total_net_return(),
            final_balance: self.portfolio.balance(),
            processed_klines: self.processed,
            opening_trades: self.ledger.opening_trades().to_vec(),
            closed_trades: self.ledger.closed_trades().to_vec(),
        }
    }
}
