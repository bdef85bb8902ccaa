//! Isolated interpreter for untrusted strategy programs.
//!
//! A [`Sandbox`] owns one Rhai engine with no file access, no `eval`, no
//! clock or randomness of its own, and hard ceilings on what a program may
//! allocate. The only host state a program can reach is the `system` and
//! `trades` modules from [`crate::capabilities`]; console output goes to
//! the sandbox's own bounded log.
//!
//! A program may define any of:
//!
//! ```text
//! fn init() { #{ seen: 0 } }               // becomes `this` for on_bar/on_finish
//! fn on_bar(bar) { this.seen += 1; ... }    // returns (), an intent map or an array of them
//! fn on_finish() { this.seen }              // becomes the execution's return value
//! ```

use crate::backtester::{BacktestSession, OrderIntent};
use crate::capabilities::{kline_to_dynamic, Capabilities, SYSTEM_MODULE, TRADES_MODULE};
use crate::config::SandboxLimits;
use crate::errors::SandboxCreationError;
use crate::filters::OrderKind;
use log::debug;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, CorePackage, LogicPackage,
    MoreStringPackage, Package,
};
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const RUNNING: u8 = 0;
const STOPPED: u8 = 1;
const TIMED_OUT: u8 = 2;

/// Checking the clock on every operation is wasteful; every 256th is plenty.
const DEADLINE_CHECK_MASK: u64 = 0xFF;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub limits: SandboxLimits,
    pub deadline: Duration,
    /// Helper source compiled once and merged in front of every program.
    pub prelude: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Value),
    Threw(String),
    TimedOut,
    /// Stopped from outside for a reason other than the deadline.
    Stopped,
}

#[derive(Debug, Clone)]
pub enum SandboxEvent {
    Log { offset: usize, line: String },
    Progress(u8),
}

/// Cloneable remote control for a sandbox running on another thread.
#[derive(Debug, Clone, Default)]
pub struct SandboxHandle {
    state: Arc<AtomicU8>,
}

impl SandboxHandle {
    /// Returns `true` only for the call that actually stopped the sandbox.
    pub fn stop(&self) -> bool {
        self.transition(STOPPED)
    }

    pub fn stop_for_timeout(&self) -> bool {
        self.transition(TIMED_OUT)
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn timed_out(&self) -> bool {
        self.state.load(Ordering::Acquire) == TIMED_OUT
    }

    fn transition(&self, target: u8) -> bool {
        self.state
            .compare_exchange(RUNNING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn outcome(&self) -> Option<ExecutionOutcome> {
        match self.state.load(Ordering::Acquire) {
            STOPPED => Some(ExecutionOutcome::Stopped),
            TIMED_OUT => Some(ExecutionOutcome::TimedOut),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct LogSink {
    lines: Arc<Mutex<Vec<String>>>,
    max_lines: usize,
    events: UnboundedSender<SandboxEvent>,
}

impl LogSink {
    fn push(&self, line: String) {
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() > self.max_lines {
            return;
        }
        let line = if lines.len() == self.max_lines {
            format!(
                "Log limit of {} lines reached; further output dropped",
                self.max_lines
            )
        } else {
            line
        };
        let offset = lines.len();
        lines.push(line.clone());
        // The receiver may be gone after the worker gave up on the job.
        let _ = self.events.send(SandboxEvent::Log { offset, line });
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

pub struct Sandbox {
    engine: Engine,
    capabilities: Capabilities,
    logs: LogSink,
    handle: SandboxHandle,
    deadline: Duration,
    deadline_at: Arc<OnceLock<Instant>>,
    max_program_bytes: usize,
    prelude: Option<AST>,
    events: Option<UnboundedReceiver<SandboxEvent>>,
}

impl Sandbox {
    pub fn start(config: SandboxConfig) -> Result<Self, SandboxCreationError> {
        validate_limits(&config)?;
        let limits = &config.limits;

        let mut engine = Engine::new_raw();
        CorePackage::new().register_into_engine(&mut engine);
        LogicPackage::new().register_into_engine(&mut engine);
        BasicMathPackage::new().register_into_engine(&mut engine);
        BasicArrayPackage::new().register_into_engine(&mut engine);
        BasicMapPackage::new().register_into_engine(&mut engine);
        MoreStringPackage::new().register_into_engine(&mut engine);

        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");
        // blocks the thread where the progress hook cannot reach it
        engine.disable_symbol("sleep");
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(limits.max_string_size);
        engine.set_max_array_size(limits.max_array_size);
        engine.set_max_map_size(limits.max_map_size);
        engine.set_max_call_levels(limits.max_call_levels);
        engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);

        let (events_tx, events_rx) = unbounded_channel();
        let logs = LogSink {
            lines: Arc::new(Mutex::new(Vec::new())),
            max_lines: limits.max_log_lines,
            events: events_tx,
        };
        let sink = logs.clone();
        engine.on_print(move |text| sink.push(text.to_string()));
        let sink = logs.clone();
        engine.on_debug(move |text, _source, position| {
            if position.is_none() {
                sink.push(text.to_string());
            } else {
                sink.push(format!("{} @ {}", text, position));
            }
        });

        let handle = SandboxHandle::default();
        let deadline_at: Arc<OnceLock<Instant>> = Arc::new(OnceLock::new());
        {
            let handle = handle.clone();
            let deadline_at = deadline_at.clone();
            engine.on_progress(move |operations| {
                if operations & DEADLINE_CHECK_MASK == 0 {
                    if let Some(deadline) = deadline_at.get() {
                        if Instant::now() >= *deadline {
                            handle.stop_for_timeout();
                        }
                    }
                }
                if handle.is_stopped() {
                    Some(Dynamic::UNIT)
                } else {
                    None
                }
            });
        }

        let capabilities = Capabilities::new();
        engine.register_static_module(SYSTEM_MODULE, capabilities.system_module().into());
        engine.register_static_module(TRADES_MODULE, capabilities.trades_module().into());

        let prelude = match &config.prelude {
            Some(source) => Some(
                engine
                    .compile(source)
                    .map_err(|err| SandboxCreationError::Prelude(err.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            engine,
            capabilities,
            logs,
            handle,
            deadline: config.deadline,
            deadline_at,
            max_program_bytes: limits.max_program_bytes,
            prelude,
            events: Some(events_rx),
        })
    }

    pub fn handle(&self) -> SandboxHandle {
        self.handle.clone()
    }

    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Log and progress events in emission order; available once.
    pub fn take_events(&mut self) -> Option<UnboundedReceiver<SandboxEvent>> {
        self.events.take()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    /// Compiles `program` without running it and lists the entry points it
    /// defines.
    pub fn check(&self, program: &str) -> Result<Vec<String>, String> {
        let ast = self.compile(program)?;
        Ok(ast
            .iter_functions()
            .filter(|function| {
                matches!(
                    (function.name, function.params.len()),
                    ("init", 0) | ("on_bar", 1) | ("on_finish", 0)
                )
            })
            .map(|function| function.name.to_string())
            .collect())
    }

    fn compile(&self, program: &str) -> Result<AST, String> {
        if program.len() > self.max_program_bytes {
            return Err(SandboxCreationError::ProgramTooLarge {
                size: program.len(),
                limit: self.max_program_bytes,
            }
            .to_string());
        }
        let ast = self
            .engine
            .compile(program)
            .map_err(|err| format!("Compile error: {}", err))?;
        Ok(match &self.prelude {
            Some(prelude) => prelude.merge(&ast),
            None => ast,
        })
    }

    /// Runs `program` over every kline of `session`. Blocks the calling
    /// thread; the deadline starts with the first call.
    pub fn execute(&self, program: &str, session: &mut BacktestSession) -> ExecutionOutcome {
        if let Some(outcome) = self.handle.outcome() {
            return outcome;
        }
        let _ = self.deadline_at.set(Instant::now() + self.deadline);

        let ast = match self.compile(program) {
            Ok(ast) => ast,
            Err(message) => return ExecutionOutcome::Threw(message),
        };
        let has_init = defines(&ast, "init", 0);
        let has_on_bar = defines(&ast, "on_bar", 1);
        let has_on_finish = defines(&ast, "on_finish", 0);

        let mut scope = Scope::new();
        self.capabilities
            .refresh(session.start_time(), session.ledger(), session.balance());
        if let Err(err) = self.engine.run_ast_with_scope(&mut scope, &ast) {
            return self.failure(err);
        }

        let mut state = if has_init {
            match self.engine.call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false),
                &mut scope,
                &ast,
                "init",
                (),
            ) {
                Ok(state) => state,
                Err(err) => return self.failure(err),
            }
        } else {
            Dynamic::from_map(Map::new())
        };

        let total = session.kline_count();
        let mut reported = 0u8;
        for index in 0..total {
            if let Some(outcome) = self.interrupted() {
                return outcome;
            }
            let Some(bar) = session.kline(index).cloned() else {
                break;
            };
            self.capabilities
                .refresh(bar.close_time, session.ledger(), session.balance());

            if has_on_bar {
                let returned = match self.engine.call_fn_with_options::<Dynamic>(
                    CallFnOptions::new()
                        .eval_ast(false)
                        .bind_this_ptr(&mut state),
                    &mut scope,
                    &ast,
                    "on_bar",
                    (kline_to_dynamic(&bar),),
                ) {
                    Ok(returned) => returned,
                    Err(err) => return self.failure(err),
                };
                let intents = match parse_intents(returned) {
                    Ok(intents) => intents,
                    Err(message) => return ExecutionOutcome::Threw(message),
                };
                if !intents.is_empty() {
                    for outcome in session.apply_intents(index, intents) {
                        self.logs.push(outcome.log_line());
                    }
                }
            }
            session.mark_processed(index);

            let percentage = ((index + 1) * 100 / total) as u8;
            if percentage > reported {
                reported = percentage;
                let _ = self.logs.events.send(SandboxEvent::Progress(percentage));
            }
        }

        let finish_time = session
            .kline(total.saturating_sub(1))
            .map(|bar| bar.close_time)
            .unwrap_or_else(|| session.start_time());
        self.capabilities
            .refresh(finish_time, session.ledger(), session.balance());

        let returned = if has_on_finish {
            match self.engine.call_fn_with_options::<Dynamic>(
                CallFnOptions::new()
                    .eval_ast(false)
                    .bind_this_ptr(&mut state),
                &mut scope,
                &ast,
                "on_finish",
                (),
            ) {
                Ok(returned) => returned,
                Err(err) => return self.failure(err),
            }
        } else {
            Dynamic::UNIT
        };
        if reported < 100 {
            let _ = self.logs.events.send(SandboxEvent::Progress(100));
        }

        debug!("Program finished after {} klines", session.processed_klines());
        ExecutionOutcome::Completed(dynamic_to_json(&returned))
    }

    /// Stop requests and deadline checks between bars, for programs that
    /// never enter the interpreter while iterating.
    fn interrupted(&self) -> Option<ExecutionOutcome> {
        if let Some(deadline) = self.deadline_at.get() {
            if Instant::now() >= *deadline {
                self.handle.stop_for_timeout();
            }
        }
        self.handle.outcome()
    }

    fn failure(&self, err: Box<EvalAltResult>) -> ExecutionOutcome {
        self.handle
            .outcome()
            .unwrap_or_else(|| ExecutionOutcome::Threw(err.to_string()))
    }
}

fn validate_limits(config: &SandboxConfig) -> Result<(), SandboxCreationError> {
    let limits = &config.limits;
    let checks: [(&'static str, usize); 7] = [
        ("max_string_size", limits.max_string_size),
        ("max_array_size", limits.max_array_size),
        ("max_map_size", limits.max_map_size),
        ("max_call_levels", limits.max_call_levels),
        ("max_expr_depth", limits.max_expr_depth),
        ("max_log_lines", limits.max_log_lines),
        ("max_program_bytes", limits.max_program_bytes),
    ];
    if let Some(&(name, _)) = checks.iter().find(|(_, value)| *value == 0) {
        return Err(SandboxCreationError::InvalidLimit { name });
    }
    if config.deadline.is_zero() {
        return Err(SandboxCreationError::InvalidLimit { name: "deadline" });
    }
    Ok(())
}

fn defines(ast: &AST, name: &str, arity: usize) -> bool {
    ast.iter_functions()
        .any(|function| function.name == name && function.params.len() == arity)
}

fn dynamic_to_json(value: &Dynamic) -> Value {
    rhai::serde::from_dynamic::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn parse_intents(value: Dynamic) -> Result<Vec<OrderIntent>, String> {
    if value.is_unit() {
        return Ok(Vec::new());
    }
    if value.is_array() {
        let items = value.cast::<Array>();
        return items.into_iter().map(parse_intent).collect();
    }
    if value.is_map() {
        return Ok(vec![parse_intent(value)?]);
    }
    Err(format!(
        "on_bar must return (), an order map or an array of order maps, not {}",
        value.type_name()
    ))
}

fn parse_intent(value: Dynamic) -> Result<OrderIntent, String> {
    let type_name = value.type_name();
    let map = value
        .try_cast::<Map>()
        .ok_or_else(|| format!("order intent must be a map, not {}", type_name))?;
    let action = string_field(&map, "action")?
        .ok_or_else(|| "order intent needs an action".to_string())?;

    match action.as_str() {
        "enter" => {
            let quantity = decimal_field(&map, "quantity")?
                .ok_or_else(|| "enter intent needs a quantity".to_string())?;
            let kind = match string_field(&map, "type")?.as_deref() {
                None | Some("market") => OrderKind::Market,
                Some("limit") => OrderKind::Limit,
                Some(other) => return Err(format!("unknown order type {:?}", other)),
            };
            Ok(OrderIntent::Enter {
                kind,
                quantity,
                price: decimal_field(&map, "price")?,
            })
        }
        "exit" => {
            let trade_id = match string_field(&map, "trade_id")? {
                Some(id) => Some(id),
                None => string_field(&map, "tradeId")?,
            };
            Ok(OrderIntent::Exit { trade_id })
        }
        other => Err(format!("unknown order action {:?}", other)),
    }
}

fn string_field(map: &Map, key: &str) -> Result<Option<String>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(value) if value.is_unit() => Ok(None),
        Some(value) => value
            .clone()
            .into_string()
            .map(Some)
            .map_err(|actual| format!("{} must be a string, not {}", key, actual)),
    }
}

fn decimal_field(map: &Map, key: &str) -> Result<Option<Decimal>, String> {
    let Some(value) = map.get(key).filter(|value| !value.is_unit()) else {
        return Ok(None);
    };
    if let Ok(int) = value.as_int() {
        return Ok(Some(Decimal::from(int)));
    }
    let float = value
        .as_float()
        .map_err(|actual| format!("{} must be a number, not {}", key, actual))?;
    Decimal::from_f64(float)
        .map(Some)
        .ok_or_else(|| format!("{} is not a finite number", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtester::test_support::session;

    fn config(deadline_ms: u64) -> SandboxConfig {
        SandboxConfig {
            limits: SandboxLimits::default(),
            deadline: Duration::from_millis(deadline_ms),
            prelude: None,
        }
    }

    fn run(program: &str, closes: &[f64]) -> (ExecutionOutcome, Sandbox, BacktestSession) {
        let sandbox = Sandbox::start(config(5_000)).unwrap();
        let mut session = session(closes);
        let outcome = sandbox.execute(program, &mut session);
        (outcome, sandbox, session)
    }

    #[test]
    fn infinite_loop_times_out() {
        let sandbox = Sandbox::start(config(200)).unwrap();
        let mut session = session(&[1.0]);
        let started = Instant::now();
        let outcome = sandbox.execute("fn on_bar(bar) { loop { } }", &mut session);
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(sandbox.handle().is_stopped());
        assert!(!sandbox.stop());
    }

    #[test]
    fn stop_is_idempotent_and_prevents_execution() {
        let sandbox = Sandbox::start(config(1_000)).unwrap();
        let handle = sandbox.handle();
        assert!(handle.stop());
        assert!(!handle.stop());
        assert!(!sandbox.stop());

        let mut session = session(&[1.0, 2.0]);
        let outcome = sandbox.execute("fn on_bar(bar) { print(\"ran\"); }", &mut session);
        assert_eq!(outcome, ExecutionOutcome::Stopped);
        assert!(sandbox.logs().is_empty());
    }

    #[test]
    fn stop_from_another_thread_aborts_running_program() {
        let sandbox = Sandbox::start(config(10_000)).unwrap();
        let handle = sandbox.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.stop()
        });
        let mut session = session(&[1.0]);
        let outcome = sandbox.execute("loop { }", &mut session);
        assert!(stopper.join().unwrap());
        assert_eq!(outcome, ExecutionOutcome::Stopped);
    }

    #[test]
    fn console_output_is_captured_in_order() {
        let (outcome, sandbox, _) = run(
            r#"
                print("starting");
                fn on_bar(bar) { print(`close ${bar.close}`); }
                fn on_finish() { debug("done"); }
            "#,
            &[1.5, 2.5],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::Null));
        let logs = sandbox.logs();
        assert_eq!(logs[0], "starting");
        assert_eq!(logs[1], "close 1.5");
        assert_eq!(logs[2], "close 2.5");
        assert!(logs[3].contains("done"));
    }

    #[test]
    fn log_lines_are_bounded() {
        let sandbox = Sandbox::start(SandboxConfig {
            limits: SandboxLimits {
                max_log_lines: 3,
                ..SandboxLimits::default()
            },
            ..config(5_000)
        })
        .unwrap();
        let mut session = session(&[]);
        sandbox.execute("for i in 0..100 { print(i); }", &mut session);
        let logs = sandbox.logs();
        assert_eq!(logs.len(), 4);
        assert!(logs[3].contains("Log limit"));
    }

    #[test]
    fn thrown_errors_become_threw() {
        let (outcome, _, _) = run(r#"fn on_bar(bar) { throw "boom"; }"#, &[1.0]);
        match outcome {
            ExecutionOutcome::Threw(message) => assert!(message.contains("boom"), "{}", message),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn import_and_eval_are_unavailable() {
        let (outcome, _, _) = run(r#"import "os" as os;"#, &[]);
        assert!(matches!(outcome, ExecutionOutcome::Threw(_)), "{:?}", outcome);

        let (outcome, _, _) = run(r#"eval("40 + 2")"#, &[]);
        assert!(matches!(outcome, ExecutionOutcome::Threw(_)), "{:?}", outcome);
    }

    #[test]
    fn sleep_is_rejected_instead_of_blocking_past_the_deadline() {
        let sandbox = Sandbox::start(config(200)).unwrap();
        let mut session = session(&[1.0]);
        let started = Instant::now();
        let outcome = sandbox.execute("sleep(30); 1", &mut session);
        assert!(
            matches!(outcome, ExecutionOutcome::Threw(_) | ExecutionOutcome::TimedOut),
            "{:?}",
            outcome
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sandbox.check("fn on_bar(bar) { sleep(1); }").is_err());
    }

    #[test]
    fn state_from_init_is_bound_to_this() {
        let (outcome, _, session) = run(
            r#"
                fn init() { #{ bars: 0 } }
                fn on_bar(bar) { this.bars += 1; }
                fn on_finish() { this.bars }
            "#,
            &[1.0, 2.0, 3.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::from(3)));
        assert_eq!(session.processed_klines(), 3);
    }

    #[test]
    fn system_clock_follows_bar_close_time() {
        let (outcome, _, session) = run(
            r#"
                fn init() { #{ matched: true } }
                fn on_bar(bar) {
                    if system::timestamp() != bar.closeTime { this.matched = false; }
                }
                fn on_finish() { this.matched }
            "#,
            &[1.0, 2.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::Bool(true)));
        assert_eq!(session.processed_klines(), 2);
    }

    #[test]
    fn intents_drive_the_ledger() {
        let (outcome, _, session) = run(
            r#"
                fn on_bar(bar) {
                    if trades::opening().is_empty() && trades::closed().is_empty() {
                        #{ action: "enter", quantity: 1 }
                    } else if !trades::opening().is_empty() {
                        #{ action: "exit" }
                    }
                }
                fn on_finish() { trades::win().len() }
            "#,
            &[100.0, 120.0, 130.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::from(1)));
        assert_eq!(session.ledger().closed_trades().len(), 1);
        assert!(session.ledger().opening_trades().is_empty());
    }

    #[test]
    fn trade_views_are_copies() {
        let (outcome, _, session) = run(
            r#"
                fn on_bar(bar) {
                    if trades::opening().is_empty() {
                        return #{ action: "enter", quantity: 1 };
                    }
                    let view = trades::opening();
                    view[0].quantity = 1000;
                    view.clear();
                }
                fn on_finish() { trades::opening().len() }
            "#,
            &[10.0, 11.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::from(1)));
        assert_eq!(
            session.ledger().opening_trades()[0].quantity,
            Decimal::from(1)
        );
    }

    #[test]
    fn malformed_intent_is_reported() {
        let (outcome, _, _) = run(r#"fn on_bar(bar) { #{ action: "short" } }"#, &[1.0]);
        match outcome {
            ExecutionOutcome::Threw(message) => assert!(message.contains("short")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn rejected_orders_are_logged_not_fatal() {
        let (outcome, sandbox, _) = run(
            r#"fn on_bar(bar) { #{ action: "enter", quantity: 1000000 } }"#,
            &[10.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::Null));
        assert!(sandbox
            .logs()
            .iter()
            .any(|line| line.contains("insufficient_balance")));
    }

    #[test]
    fn out_of_range_quantity_is_logged_and_execution_finishes() {
        let (outcome, sandbox, session) = run(
            r#"fn on_bar(bar) { #{ action: "enter", quantity: 1.0e28 } }"#,
            &[100.0, 101.0],
        );
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::Null));
        assert_eq!(session.processed_klines(), 2);
        assert!(session.ledger().opening_trades().is_empty());
        assert!(sandbox
            .logs()
            .iter()
            .any(|line| line.contains("invalid_quantity")));
    }

    #[test]
    fn progress_reaches_one_hundred() {
        let mut sandbox = Sandbox::start(config(5_000)).unwrap();
        let mut events = sandbox.take_events().unwrap();
        let mut session = session(&[1.0, 2.0, 3.0, 4.0]);
        sandbox.execute("fn on_bar(bar) { }", &mut session);

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SandboxEvent::Progress(percentage) = event {
                progress.push(percentage);
            }
        }
        assert_eq!(progress, vec![25, 50, 75, 100]);
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let err = Sandbox::start(SandboxConfig {
            limits: SandboxLimits {
                max_call_levels: 0,
                ..SandboxLimits::default()
            },
            ..config(1_000)
        })
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SandboxCreationError::InvalidLimit {
                name: "max_call_levels"
            }
        ));
    }

    #[test]
    fn prelude_functions_are_visible() {
        let sandbox = Sandbox::start(SandboxConfig {
            prelude: Some("fn double(x) { x * 2 }".to_string()),
            ..config(5_000)
        })
        .unwrap();
        let mut session = session(&[]);
        let outcome = sandbox.execute("fn on_finish() { double(21) }", &mut session);
        assert_eq!(outcome, ExecutionOutcome::Completed(Value::from(42)));
    }

    #[test]
    fn operation_ceiling_is_enforced() {
        let sandbox = Sandbox::start(SandboxConfig {
            limits: SandboxLimits {
                max_operations: 1_000,
                ..SandboxLimits::default()
            },
            ..config(5_000)
        })
        .unwrap();
        let mut session = session(&[]);
        let outcome = sandbox.execute("let x = 0; loop { x += 1; }", &mut session);
        assert!(matches!(outcome, ExecutionOutcome::Threw(_)), "{:?}", outcome);
    }

    #[test]
    fn check_lists_entry_points() {
        let sandbox = Sandbox::start(config(1_000)).unwrap();
        let mut found = sandbox
            .check("fn on_bar(bar) { } fn helper() { } fn init() { #{} }")
            .unwrap();
        found.sort();
        assert_eq!(found, vec!["init".to_string(), "on_bar".to_string()]);
        assert!(sandbox.check("fn broken( {").is_err());
    }
}
