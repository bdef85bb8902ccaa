//! The two modules a strategy program can see: `system` (the simulated
//! clock) and `trades` (read-only ledger snapshots).
//!
//! Both modules read from a shared snapshot that only the host refreshes.
//! Every call hands the program a fresh copy, so a program editing what it
//! received never reaches host state.

use crate::ledger::{ClosedTrade, OpeningTrade, TradeLedger};
use crate::models::Kline;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rhai::{Array, Dynamic, EvalAltResult, Map, Module, FLOAT, INT};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::{Arc, RwLock};

pub const SYSTEM_MODULE: &str = "system";
pub const TRADES_MODULE: &str = "trades";

#[derive(Debug, Clone, Default)]
struct CapabilitySnapshot {
    now: DateTime<Utc>,
    balance: FLOAT,
    opening: Array,
    closed: Array,
    win: Array,
    loss: Array,
    even: Array,
}

#[derive(Clone, Default)]
pub struct Capabilities {
    state: Arc<RwLock<CapabilitySnapshot>>,
}

type NativeResult<T> = Result<T, Box<EvalAltResult>>;

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the simulated clock and republishes the ledger views.
    pub fn refresh(&self, now: DateTime<Utc>, ledger: &TradeLedger, balance: Decimal) {
        let partition = ledger.partition();
        let snapshot = CapabilitySnapshot {
            now,
            balance: decimal_to_float(balance),
            opening: ledger.opening_trades().iter().map(opening_to_dynamic).collect(),
            closed: ledger.closed_trades().iter().map(closed_to_dynamic).collect(),
            win: partition.win.into_iter().map(closed_to_dynamic).collect(),
            loss: partition.loss.into_iter().map(closed_to_dynamic).collect(),
            even: partition.even.into_iter().map(closed_to_dynamic).collect(),
        };
        if let Ok(mut state) = self.state.write() {
            *state = snapshot;
        }
    }

    pub fn now(&self) -> Option<DateTime<Utc>> {
        self.state.read().ok().map(|state| state.now)
    }

    pub fn system_module(&self) -> Module {
        let mut module = Module::new();

        let state = self.state.clone();
        module.set_native_fn("timestamp", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.timestamp_millis())
        });
        let state = self.state.clone();
        module.set_native_fn("iso", move || -> NativeResult<String> {
            read(&state, |snapshot| snapshot.now.to_rfc3339())
        });
        let state = self.state.clone();
        module.set_native_fn("year", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.year() as INT)
        });
        let state = self.state.clone();
        module.set_native_fn("month", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.month() as INT)
        });
        let state = self.state.clone();
        module.set_native_fn("day", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.day() as INT)
        });
        let state = self.state.clone();
        module.set_native_fn("hour", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.hour() as INT)
        });
        let state = self.state.clone();
        module.set_native_fn("minute", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.minute() as INT)
        });
        let state = self.state.clone();
        module.set_native_fn("second", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.second() as INT)
        });
        // ISO weekday: Monday = 1 ... Sunday = 7
        let state = self.state.clone();
        module.set_native_fn("weekday", move || -> NativeResult<INT> {
            read(&state, |snapshot| snapshot.now.weekday().number_from_monday() as INT)
        });

        module
    }

    pub fn trades_module(&self) -> Module {
        let mut module = Module::new();

        let state = self.state.clone();
        module.set_native_fn("opening", move || -> NativeResult<Array> {
            read(&state, |snapshot| snapshot.opening.clone())
        });
        let state = self.state.clone();
        module.set_native_fn("closed", move || -> NativeResult<Array> {
            read(&state, |snapshot| snapshot.closed.clone())
        });
        let state = self.state.clone();
        module.set_native_fn("win", move || -> NativeResult<Array> {
            read(&state, |snapshot| snapshot.win.clone())
        });
        let state = self.state.clone();
        module.set_native_fn("loss", move || -> NativeResult<Array> {
            read(&state, |snapshot| snapshot.loss.clone())
        });
        let state = self.state.clone();
        module.set_native_fn("even", move || -> NativeResult<Array> {
            read(&state, |snapshot| snapshot.even.clone())
        });
        let state = self.state.clone();
        module.set_native_fn("balance", move || -> NativeResult<FLOAT> {
            read(&state, |snapshot| snapshot.balance)
        });

        module
    }
}

fn read<T>(
    state: &Arc<RwLock<CapabilitySnapshot>>,
    f: impl FnOnce(&CapabilitySnapshot) -> T,
) -> NativeResult<T> {
    state
        .read()
        .map(|snapshot| f(&snapshot))
        .map_err(|_| "capability state unavailable".into())
}

fn decimal_to_float(value: Decimal) -> FLOAT {
    value.to_f64().unwrap_or(0.0)
}

fn opening_fields(map: &mut Map, trade: &OpeningTrade) {
    map.insert("id".into(), Dynamic::from(trade.id.clone()));
    map.insert(
        "entryTime".into(),
        Dynamic::from(trade.entry_time.timestamp_millis()),
    );
    map.insert(
        "entryPrice".into(),
        Dynamic::from(decimal_to_float(trade.entry_price)),
    );
    map.insert(
        "quantity".into(),
        Dynamic::from(decimal_to_float(trade.quantity)),
    );
    map.insert(
        "entryFee".into(),
        Dynamic::from(decimal_to_float(trade.entry_fee)),
    );
}

fn opening_to_dynamic(trade: &OpeningTrade) -> Dynamic {
    let mut map = Map::new();
    opening_fields(&mut map, trade);
    Dynamic::from_map(map)
}

fn closed_to_dynamic(trade: &ClosedTrade) -> Dynamic {
    let mut map = Map::new();
    opening_fields(
        &mut map,
        &OpeningTrade {
            id: trade.id.clone(),
            entry_time: trade.entry_time,
            entry_price: trade.entry_price,
            quantity: trade.quantity,
            entry_fee: trade.entry_fee,
        },
    );
    map.insert(
        "exitTime".into(),
        Dynamic::from(trade.exit_time.timestamp_millis()),
    );
    map.insert(
        "exitPrice".into(),
        Dynamic::from(decimal_to_float(trade.exit_price)),
    );
    map.insert(
        "exitFee".into(),
        Dynamic::from(decimal_to_float(trade.exit_fee)),
    );
    map.insert(
        "netReturn".into(),
        Dynamic::from(decimal_to_float(trade.net_return)),
    );
    Dynamic::from_map(map)
}

pub fn kline_to_dynamic(kline: &Kline) -> Dynamic {
    let mut map = Map::new();
    map.insert(
        "openTime".into(),
        Dynamic::from(kline.open_time.timestamp_millis()),
    );
    map.insert(
        "closeTime".into(),
        Dynamic::from(kline.close_time.timestamp_millis()),
    );
    map.insert("open".into(), Dynamic::from(kline.open));
    map.insert("high".into(), Dynamic::from(kline.high));
    map.insert("low".into(), Dynamic::from(kline.low));
    map.insert("close".into(), Dynamic::from(kline.close));
    map.insert("volume".into(), Dynamic::from(kline.volume));
    Dynamic::from_map(map)
}
