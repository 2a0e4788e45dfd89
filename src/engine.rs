// =============================================================================
// Tick Processor: one instrument's state and the per-tick pipeline
// =============================================================================
//
// Per tick:
//
//   sweep    exchange flat?  -> drop tracked positions
//            timed out?      -> reduce-only market close (restored on failure);
//                               the bracket's resting legs are left in place
//   decide   bars -> indicators -> evaluator -> admission -> sizer -> planner
//            -> execution -> ledger
//
// Push (kline stream) and poll (REST) both feed this single owner through the
// driver loop, so the bar window and the ledger need no locking.  A closed bar
// is decided at most once even when both paths deliver it.
//
// Admission is check-then-act against the exchange count; two ticks racing
// can overshoot `max_open_trades` by one.  Accepted.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::execution::{ExecutionEngine, ExecutionResult};
use crate::gateway::{ExchangeGateway, GatewayError};
use crate::indicators::{enrich, IndicatorSettings};
use crate::market_data::{Bar, BarWindow, PushOutcome};
use crate::planner::{plan_bracket, BracketParams, OrderLeg};
use crate::position_engine::PositionLedger;
use crate::runtime_config::BotConfig;
use crate::sizing::PositionSizer;
use crate::strategy::{evaluate, Evaluation, RuleGroup, SignalParams};
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What the decision half of a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Entry and every protective leg accepted.
    Traded {
        direction: Direction,
        rule: RuleGroup,
        position_id: Uuid,
    },
    /// Entry accepted, some protective legs missing.
    PartialBracket {
        direction: Direction,
        position_id: Uuid,
        unprotected: Vec<OrderLeg>,
    },
    NoSignal,
    InsufficientData(String),
    /// The newest closed bar was already decided.
    NoNewBar,
    AtCapacity { open: usize, max: usize },
    SizingDegenerate(String),
    PlanRejected(String),
    /// Retryable gateway failure; the driver backs off.
    TransientFailure(String),
    /// Non-retryable gateway failure; logged, next tick proceeds normally.
    Failed(String),
}

impl TickOutcome {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }

    fn from_gateway(err: &GatewayError) -> Self {
        if err.is_retryable() {
            Self::TransientFailure(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl std::fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Traded { direction, rule, .. } => write!(f, "Traded({direction} via {rule})"),
            Self::PartialBracket {
                direction,
                unprotected,
                ..
            } => write!(f, "PartialBracket({direction}, unprotected {unprotected:?})"),
            Self::NoSignal => write!(f, "NoSignal"),
            Self::InsufficientData(reason) => write!(f, "InsufficientData({reason})"),
            Self::NoNewBar => write!(f, "NoNewBar"),
            Self::AtCapacity { open, max } => write!(f, "AtCapacity({open}/{max})"),
            Self::SizingDegenerate(reason) => write!(f, "SizingDegenerate({reason})"),
            Self::PlanRejected(reason) => write!(f, "PlanRejected({reason})"),
            Self::TransientFailure(reason) => write!(f, "TransientFailure({reason})"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// What the sweep half of a tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Timed-out positions closed.
    pub closed: usize,
    /// Timed-out positions whose close failed; they stay tracked.
    pub close_failures: usize,
    /// Positions forgotten because the exchange reported the instrument flat.
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub sweep: SweepReport,
}

// ---------------------------------------------------------------------------
// Tick processor
// ---------------------------------------------------------------------------

pub struct TickProcessor {
    symbol: String,
    interval: String,
    max_open_trades: usize,
    timeout_secs: i64,
    signals: SignalParams,
    indicators: IndicatorSettings,
    sizer: PositionSizer,
    bracket: BracketParams,
    window: BarWindow,
    ledger: PositionLedger,
    gateway: Arc<dyn ExchangeGateway>,
    execution: ExecutionEngine,
    /// Open time of the last bar the evaluator ran on.
    last_decided: Option<i64>,
}

impl TickProcessor {
    /// Build a processor from a validated configuration.
    pub fn new(config: &BotConfig, gateway: Arc<dyn ExchangeGateway>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            symbol: config.symbol.clone(),
            interval: config.interval.clone(),
            max_open_trades: config.max_open_trades,
            timeout_secs: config.timeout_secs()?,
            signals: config.signal_params(),
            indicators: config.indicators.clone(),
            sizer: config.sizer(),
            bracket: config.bracket_params(),
            window: BarWindow::new(config.retention_bars),
            ledger: PositionLedger::new(),
            execution: ExecutionEngine::new(gateway.clone()),
            gateway,
            last_decided: None,
        })
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    #[cfg(test)]
    pub fn window(&self) -> &BarWindow {
        &self.window
    }

    /// Tick driven by a pushed closed candle.
    pub async fn on_closed_bar(&mut self, bar: Bar, now_secs: i64) -> TickReport {
        if self.window.push(bar) == PushOutcome::Stale {
            debug!(open_time = bar.open_time, "stale bar ignored");
        }
        self.run_tick(now_secs).await
    }

    /// Tick driven by the poll timer: refresh the window over REST first.
    pub async fn poll(&mut self, now_secs: i64) -> TickReport {
        let limit = u32::try_from(self.window.capacity()).unwrap_or(u32::MAX);
        match self
            .gateway
            .fetch_recent_bars(&self.symbol, &self.interval, limit)
            .await
        {
            Ok(bars) => {
                let appended = self.window.extend(bars);
                debug!(appended, retained = self.window.len(), "bars polled");
                self.run_tick(now_secs).await
            }
            Err(e) => {
                warn!(error = %e, "bar poll failed");
                let sweep = self.sweep(now_secs).await;
                TickReport {
                    outcome: TickOutcome::from_gateway(&e),
                    sweep,
                }
            }
        }
    }

    async fn run_tick(&mut self, now_secs: i64) -> TickReport {
        let sweep = self.sweep(now_secs).await;
        let outcome = self.decide(now_secs).await;
        TickReport { outcome, sweep }
    }

    // -------------------------------------------------------------------------
    // Sweep
    // -------------------------------------------------------------------------

    async fn sweep(&mut self, now_secs: i64) -> SweepReport {
        let mut report = SweepReport::default();
        if self.ledger.is_empty() {
            return report;
        }

        match self.gateway.open_position_count(&self.symbol).await {
            Ok(0) => {
                report.dropped = self.ledger.clear();
                return report;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "position count unavailable; sweeping on local state"),
        }

        for position in self.ledger.take_expired(now_secs, self.timeout_secs) {
            match self.execution.close_position(&self.symbol, &position).await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    warn!(id = %position.id, error = %e, "timeout close failed; will retry next tick");
                    self.ledger.restore(position);
                    report.close_failures += 1;
                }
            }
        }
        report
    }

    // -------------------------------------------------------------------------
    // Decision
    // -------------------------------------------------------------------------

    async fn decide(&mut self, now_secs: i64) -> TickOutcome {
        let Some(latest) = self.window.last().copied() else {
            return TickOutcome::InsufficientData("no bars yet".into());
        };
        if self.last_decided == Some(latest.open_time) {
            return TickOutcome::NoNewBar;
        }
        self.last_decided = Some(latest.open_time);

        let history = enrich(&self.window.to_vec(), &self.indicators);
        let evaluation = evaluate(&history, &self.signals, &self.indicators);
        debug!(open_time = latest.open_time, decision = %evaluation.decision(), "bar evaluated");
        let (direction, rule) = match evaluation {
            Evaluation::Signal { direction, rule } => (direction, rule),
            Evaluation::NoSignal => return TickOutcome::NoSignal,
            Evaluation::InsufficientData { reason } => {
                debug!(%reason, "not enough data to decide");
                return TickOutcome::InsufficientData(reason);
            }
        };

        info!(%direction, %rule, close = latest.close, "signal");

        let open = match self.gateway.open_position_count(&self.symbol).await {
            Ok(open) => open,
            Err(e) => {
                // Nothing was submitted; let a retry decide this bar again.
                self.last_decided = None;
                return TickOutcome::from_gateway(&e);
            }
        };
        if open >= self.max_open_trades {
            info!(open, max = self.max_open_trades, "at capacity; signal skipped");
            return TickOutcome::AtCapacity {
                open,
                max: self.max_open_trades,
            };
        }

        let quantity = match self.sizer.quantity(latest.close) {
            Ok(q) => q,
            Err(e) => {
                warn!(error = %e, "sizing degenerate; no order");
                return TickOutcome::SizingDegenerate(e.to_string());
            }
        };

        let plan = match plan_bracket(
            &self.symbol,
            direction,
            latest.close,
            quantity,
            &self.bracket,
            Uuid::new_v4(),
        ) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "bracket plan rejected");
                return TickOutcome::PlanRejected(e.to_string());
            }
        };

        let result = match self.execution.execute_bracket(&plan, latest.close, now_secs).await {
            Ok(result) => result,
            Err(e) => return TickOutcome::from_gateway(&e),
        };

        let position_id = result.position().id;
        self.ledger.open(result.position().clone());
        info!(%result, "bracket submitted");

        match result {
            ExecutionResult::Protected(_) => TickOutcome::Traded {
                direction,
                rule,
                position_id,
            },
            ExecutionResult::PartialBracket { unprotected, .. } => TickOutcome::PartialBracket {
                direction,
                position_id,
                unprotected,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::sizing::SizingStrategy;
    use crate::strategy::{MeanReversionRule, StrategyProfile};
    use rust_decimal_macros::dec;

    const T0: i64 = 1_700_000_000;

    fn trend(n: usize, step: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let close = 1000.0 + step * i as f64;
                Bar::new(i as i64 * 300_000, close - step / 2.0, close + 1.0, close - 1.0, close, 100.0)
            })
            .collect()
    }

    /// Mean reversion with the RSI gate wide open: LONG whenever close is
    /// above the 20-bar SMA, SHORT whenever below.
    fn trend_follower() -> BotConfig {
        let mut signals = StrategyProfile::Classic.params();
        signals.breakout.enabled = false;
        signals.mean_reversion = MeanReversionRule {
            enabled: true,
            rsi_oversold: 101.0,
            rsi_overbought: -1.0,
        };
        let mut config = BotConfig {
            retention_bars: 60,
            signals: Some(signals),
            ..BotConfig::default()
        };
        config.indicators.sma_trend = 20;
        config
    }

    fn processor(config: &BotConfig, bars: Vec<Bar>) -> (Arc<MockGateway>, TickProcessor) {
        let mock = Arc::new(MockGateway::with_bars(bars));
        let tp = TickProcessor::new(config, mock.clone()).unwrap();
        (mock, tp)
    }

    #[tokio::test]
    async fn uptrend_opens_a_bracketed_long() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        let report = tp.poll(T0).await;

        assert!(
            matches!(report.outcome, TickOutcome::Traded { direction: Direction::Long, rule: RuleGroup::MeanReversion, .. }),
            "{}",
            report.outcome
        );
        assert_eq!(
            mock.submitted_legs(),
            vec![OrderLeg::Entry, OrderLeg::StopLoss, OrderLeg::TrailingStop, OrderLeg::TakeProfit]
        );
        assert_eq!(tp.ledger().len(), 1);
        assert_eq!(tp.ledger().positions()[0].entry_timestamp, T0);
        assert_eq!(tp.ledger().positions()[0].entry_price, 1078.0);
    }

    #[tokio::test]
    async fn downtrend_opens_a_short() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, -2.0));
        let report = tp.poll(T0).await;
        assert!(matches!(report.outcome, TickOutcome::Traded { direction: Direction::Short, .. }));
        assert_eq!(mock.submitted.lock()[0].side, crate::types::OrderSide::Sell);
    }

    #[tokio::test]
    async fn flat_market_has_no_signal() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 0.0));
        assert_eq!(tp.poll(T0).await.outcome, TickOutcome::NoSignal);
        assert!(mock.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn at_capacity_submits_nothing() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        *mock.open_count.lock() = 10;
        let report = tp.poll(T0).await;
        assert_eq!(report.outcome, TickOutcome::AtCapacity { open: 10, max: 10 });
        assert!(mock.submitted.lock().is_empty());
        assert!(tp.ledger().is_empty());
    }

    #[tokio::test]
    async fn one_below_capacity_still_trades() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        *mock.open_count.lock() = 9;
        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::Traded { .. }));
    }

    #[tokio::test]
    async fn short_history_is_insufficient() {
        let (mock, mut tp) = processor(&trend_follower(), trend(10, 2.0));
        let report = tp.poll(T0).await;
        assert!(matches!(report.outcome, TickOutcome::InsufficientData(_)));
        assert!(mock.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn same_bar_from_push_after_poll_is_decided_once() {
        let bars = trend(40, 2.0);
        let last = *bars.last().unwrap();
        let (mock, mut tp) = processor(&trend_follower(), bars);

        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::Traded { .. }));
        assert_eq!(tp.on_closed_bar(last, T0 + 1).await.outcome, TickOutcome::NoNewBar);
        assert_eq!(mock.submitted.lock().len(), 4);
    }

    #[tokio::test]
    async fn pushed_bar_triggers_a_new_decision() {
        let bars = trend(41, 2.0);
        let (mock, mut tp) = processor(&trend_follower(), bars[..40].to_vec());
        *mock.open_count.lock() = 10;
        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::AtCapacity { .. }));

        *mock.open_count.lock() = 0;
        let report = tp.on_closed_bar(bars[40], T0 + 300).await;
        assert!(matches!(report.outcome, TickOutcome::Traded { .. }));
        assert_eq!(tp.window().len(), 41);
    }

    #[tokio::test]
    async fn poll_failure_is_transient() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        *mock.fail_bars.lock() = true;
        let report = tp.poll(T0).await;
        assert!(report.outcome.is_transient());
    }

    #[tokio::test]
    async fn count_failure_lets_the_same_bar_retry() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        *mock.fail_count.lock() = true;
        assert!(tp.poll(T0).await.outcome.is_transient());
        assert!(mock.submitted.lock().is_empty());

        *mock.fail_count.lock() = false;
        assert!(matches!(tp.poll(T0 + 5).await.outcome, TickOutcome::Traded { .. }));
    }

    #[tokio::test]
    async fn dust_size_is_degenerate() {
        let config = BotConfig {
            sizing: SizingStrategy::FlatCapital {
                capital_per_trade: dec!(0.001),
            },
            leverage: 1,
            ..trend_follower()
        };
        let (mock, mut tp) = processor(&config, trend(40, 2.0));
        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::SizingDegenerate(_)));
        assert!(mock.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn partial_bracket_is_still_tracked() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        mock.fail_leg(OrderLeg::StopLoss, 2);
        let report = tp.poll(T0).await;
        match report.outcome {
            TickOutcome::PartialBracket { unprotected, .. } => assert_eq!(unprotected, vec![OrderLeg::StopLoss]),
            other => panic!("expected partial bracket, got {other}"),
        }
        assert_eq!(tp.ledger().len(), 1);
    }

    #[tokio::test]
    async fn rejected_entry_is_not_tracked() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        mock.fail_leg(OrderLeg::Entry, 1);
        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::Failed(_)));
        assert!(tp.ledger().is_empty());
    }

    #[tokio::test]
    async fn timeout_closes_exactly_at_boundary() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        assert!(matches!(tp.poll(T0).await.outcome, TickOutcome::Traded { .. }));
        *mock.open_count.lock() = 1;

        let early = tp.poll(T0 + 4499).await;
        assert_eq!(early.sweep, SweepReport::default());
        assert_eq!(early.outcome, TickOutcome::NoNewBar);
        assert_eq!(tp.ledger().len(), 1);

        let due = tp.poll(T0 + 4500).await;
        assert_eq!(due.sweep.closed, 1);
        assert!(tp.ledger().is_empty());

        let sent = mock.submitted.lock();
        let close = sent.last().unwrap();
        assert_eq!(close.leg, OrderLeg::TimeoutClose);
        assert_eq!(close.side, crate::types::OrderSide::Sell);
        assert!(close.reduce_only);
    }

    #[tokio::test]
    async fn failed_close_is_retried_next_tick() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        tp.poll(T0).await;
        *mock.open_count.lock() = 1;
        mock.fail_leg(OrderLeg::TimeoutClose, 1);

        let first = tp.poll(T0 + 4500).await;
        assert_eq!(first.sweep.close_failures, 1);
        assert_eq!(tp.ledger().len(), 1);

        let second = tp.poll(T0 + 4800).await;
        assert_eq!(second.sweep.closed, 1);
        assert!(tp.ledger().is_empty());
    }

    #[tokio::test]
    async fn flat_exchange_drops_tracked_positions() {
        let (mock, mut tp) = processor(&trend_follower(), trend(40, 2.0));
        tp.poll(T0).await;
        assert_eq!(tp.ledger().len(), 1);

        // Protective leg filled on the exchange; count back to zero.
        *mock.open_count.lock() = 0;
        let report = tp.poll(T0 + 600).await;
        assert_eq!(report.sweep.dropped, 1);
        assert!(tp.ledger().is_empty());
        assert!(mock.submitted_legs().iter().all(|l| *l != OrderLeg::TimeoutClose));
    }

    #[tokio::test]
    async fn zero_timeout_never_closes() {
        let config = BotConfig {
            timeout_bars: 0,
            ..trend_follower()
        };
        let (mock, mut tp) = processor(&config, trend(40, 2.0));
        tp.poll(T0).await;
        *mock.open_count.lock() = 1;
        let report = tp.poll(T0 + 1_000_000).await;
        assert_eq!(report.sweep.closed, 0);
        assert_eq!(tp.ledger().len(), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = BotConfig {
            max_open_trades: 0,
            ..BotConfig::default()
        };
        assert!(TickProcessor::new(&config, Arc::new(MockGateway::default())).is_err());
    }
}
