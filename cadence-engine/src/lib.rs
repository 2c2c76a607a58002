//! The recurring-order execution engine.
//!
//! One [`OrderEngine`] value owns the per-run pipeline: read the declared
//! orders, filter to the due set, and walk each due row strictly in
//! ascending row order through resolve → price → quantity → place → log.
//! Row-scoped failures never abort the batch; engine-level failures abort it
//! and still produce a terminal notification.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence_broker::{BrokerClient, BrokerError};
use cadence_core::{
    AggregateResult, ExecutionResult, Frequency, Outcome, OrderTicket, RecurringOrder, SheetRow,
};
use cadence_notify::Notifier;
use cadence_sheets::{OrderSheet, SheetError};

pub mod due;
pub mod scheduler;

pub use scheduler::{Scheduler, SchedulerStatus};

/// Errors surfaced by `execute_due`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A run is already in flight; the caller gets no side effects.
    #[error("an execution run is already in flight")]
    Busy,
    #[error(transparent)]
    Sheet(#[from] SheetError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// What caused a run. Scheduled runs apply the calendar; manual runs bypass
/// it and may restrict to one frequency class.
#[derive(Clone, Copy, Debug)]
pub enum Trigger {
    Scheduled,
    Manual { frequency: Option<Frequency> },
}

/// Rolling counters for the status surfaces. In-memory only; the durable
/// trail lives in the worksheet and the webhook sink.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_summary: Option<String>,
    pub last_error: Option<String>,
}

pub struct OrderEngine {
    broker: Arc<BrokerClient>,
    sheet: Arc<OrderSheet>,
    notifier: Arc<Notifier>,
    timezone: Tz,
    inter_order_pause: Duration,
    cancel: CancellationToken,
    in_flight: Mutex<()>,
    stats: StdMutex<EngineStats>,
}

impl OrderEngine {
    pub fn new(
        broker: Arc<BrokerClient>,
        sheet: Arc<OrderSheet>,
        notifier: Arc<Notifier>,
        timezone: Tz,
        inter_order_pause: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            sheet,
            notifier,
            timezone,
            inter_order_pause,
            cancel,
            in_flight: Mutex::new(()),
            stats: StdMutex::new(EngineStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.stats.lock().expect("stats lock").clone()
    }

    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Symbols due today, for the status endpoint's preview. Read-only.
    pub async fn due_preview(&self) -> Result<Vec<String>, EngineError> {
        let today = Utc::now().with_timezone(&self.timezone).date_naive();
        let rows = self.sheet.list_orders().await?;
        Ok(rows
            .iter()
            .filter_map(|row| match row {
                SheetRow::Order(order) if due::is_due(order.frequency, today) => {
                    Some(format!("{} ({})", order.symbol, order.frequency))
                }
                _ => None,
            })
            .collect())
    }

    /// Execute every order due at `now` once. Non-reentrant: a second
    /// caller gets [`EngineError::Busy`] with no side effects while a run
    /// is in flight.
    pub async fn execute_due(
        &self,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> Result<AggregateResult, EngineError> {
        let _guard = self.in_flight.try_lock().map_err(|_| EngineError::Busy)?;
        let started_at = now;
        let today = started_at.with_timezone(&self.timezone).date_naive();
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.executions += 1;
            stats.last_run_at = Some(started_at);
        }
        info!(?trigger, "starting recurring order run");

        let rows = match self.sheet.list_orders().await {
            Ok(rows) => rows,
            Err(err) => {
                self.record_error(&err.to_string());
                self.notifier
                    .send_terminal_failure("Failed to read the order sheet", &err.to_string())
                    .await;
                return Err(err.into());
            }
        };
        let active_count = rows.len();

        let due: Vec<&SheetRow> = rows
            .iter()
            .filter(|row| match row {
                SheetRow::Order(order) => match trigger {
                    Trigger::Scheduled => due::is_due(order.frequency, today),
                    Trigger::Manual { frequency: None } => true,
                    Trigger::Manual {
                        frequency: Some(filter),
                    } => order.frequency == filter,
                },
                // Malformed active rows are surfaced on every run so the
                // operator sees them; they are row-scoped, never fatal.
                SheetRow::Invalid { .. } => true,
            })
            .collect();

        if due.is_empty() {
            info!(active = active_count, "no orders due today");
            let upcoming = upcoming_preview(&rows, today);
            self.notifier.send_no_orders(active_count, &upcoming).await;
            self.finish_stats(&AggregateResult::default());
            return Ok(AggregateResult {
                started_at: Some(started_at),
                finished_at: Some(Utc::now()),
                results: Vec::new(),
            });
        }

        let account = match self.broker.account_id().await {
            Ok(account) => account,
            Err(err) => {
                self.record_error(&err.to_string());
                self.notifier
                    .send_terminal_failure("Failed to resolve brokerage account", &err.to_string())
                    .await;
                return Err(err.into());
            }
        };

        let mut results = Vec::with_capacity(due.len());
        let mut first = true;
        for row in due {
            if !first && !self.cancel.is_cancelled() {
                // Brief pause between submissions; cut short on shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(self.inter_order_pause) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
            first = false;

            let result = if self.cancel.is_cancelled() {
                skipped_result(row, "shutdown", started_at)
            } else {
                match row {
                    SheetRow::Order(order) => self.execute_row(&account, order, started_at).await,
                    SheetRow::Invalid {
                        row_index,
                        symbol,
                        reason,
                    } => ExecutionResult {
                        row_index: *row_index,
                        symbol: symbol.clone(),
                        requested_qty: 0,
                        fill_price: None,
                        order_id: None,
                        outcome: Outcome::Rejected,
                        message: format!("invalid row: {reason}"),
                        timestamp: started_at,
                    },
                }
            };

            // Log appends for this order land strictly before the next
            // order starts. The write is at-least-once; the embedded
            // timestamp keeps duplicates identifiable.
            if let SheetRow::Order(order) = row {
                let line = self.log_line(&result, order.frequency);
                if let Err(err) = self.sheet.append_log(result.row_index, &line).await {
                    warn!(row = result.row_index, error = %err, "failed to append sheet log");
                }
            }
            info!(
                symbol = %result.symbol,
                outcome = ?result.outcome,
                "order processed"
            );
            results.push(result);
        }

        let aggregate = AggregateResult {
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            results,
        };
        self.finish_stats(&aggregate);
        self.notifier.send_run_report(&aggregate).await;
        info!(
            total = aggregate.total(),
            successes = aggregate.successes(),
            failures = aggregate.failures(),
            "recurring order run finished"
        );
        Ok(aggregate)
    }

    /// The per-order pipeline. Every failure is caught and folded into the
    /// result; only the caller decides batch-level fate.
    async fn execute_row(
        &self,
        account: &str,
        order: &RecurringOrder,
        now: DateTime<Utc>,
    ) -> ExecutionResult {
        let mut result = ExecutionResult {
            row_index: order.row_index,
            symbol: order.symbol.clone(),
            requested_qty: 0,
            fill_price: None,
            order_id: None,
            outcome: Outcome::Error,
            message: String::new(),
            timestamp: now,
        };

        // Resolve.
        let conid = match self.broker.resolve_symbol(&order.symbol).await {
            Ok(Some(conid)) => conid,
            Ok(None) => {
                result.outcome = Outcome::Rejected;
                result.message = "unresolved symbol".into();
                return result;
            }
            Err(err) => {
                result.message = format!("symbol lookup failed: {err}");
                return result;
            }
        };

        // Price.
        let snapshot = match self.broker.market_snapshot(conid).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                result.message = format!("market data failed: {err}");
                return result;
            }
        };
        let fill_price = match snapshot.reference_price().or(order.price_hint) {
            Some(price) => price,
            None => {
                result.outcome = Outcome::Rejected;
                result.message = "no price".into();
                return result;
            }
        };
        result.fill_price = Some(fill_price);

        // Quantity: an explicit share count strictly overrides the notional.
        let quantity = match order.qty_to_buy {
            Some(qty) => qty,
            None => {
                let amount = order.amount_usd.unwrap_or(Decimal::ZERO);
                (amount / fill_price).floor().to_u32().unwrap_or(0)
            }
        };
        if quantity < 1 {
            result.outcome = Outcome::Rejected;
            result.message = "sub-share notional".into();
            return result;
        }
        result.requested_qty = quantity;

        // Place.
        let local_now = now.with_timezone(&self.timezone);
        let ticket = OrderTicket::market_buy(conid, quantity).with_client_order_id(format!(
            "recurring-{}-{}",
            order.symbol,
            local_now.format("%Y%m%d%H%M%S")
        ));
        match self.broker.place_order(account, &ticket).await {
            Ok(order_id) => {
                result.order_id = Some(order_id);
                result.outcome = Outcome::Placed;
                result.message = format!("{quantity} share(s) @ ${fill_price:.2}");
            }
            Err(err) => {
                result.outcome = Outcome::Error;
                result.message = err.to_string();
            }
        }
        result
    }

    /// One line per attempt, appended to the row's log cell.
    fn log_line(&self, result: &ExecutionResult, frequency: Frequency) -> String {
        let stamp = result
            .timestamp
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z");
        match result.outcome {
            Outcome::Placed => format!(
                "{} {stamp}: {} {} @ ${:.2} | id={} | {frequency}",
                result.outcome.icon(),
                result.symbol,
                result.requested_qty,
                result.fill_price.unwrap_or_default(),
                result.order_id.as_deref().unwrap_or("-"),
            ),
            Outcome::Skipped => format!(
                "{} {stamp}: {} skipped - {} | {frequency}",
                result.outcome.icon(),
                result.symbol,
                result.message,
            ),
            Outcome::Rejected | Outcome::Error => format!(
                "{} {stamp}: {} FAILED - {} | {frequency}",
                result.outcome.icon(),
                result.symbol,
                result.message,
            ),
        }
    }

    fn record_error(&self, message: &str) {
        let mut stats = self.stats.lock().expect("stats lock");
        stats.failures += 1;
        stats.last_error = Some(message.to_string());
    }

    fn finish_stats(&self, aggregate: &AggregateResult) {
        let mut stats = self.stats.lock().expect("stats lock");
        stats.successes += aggregate.successes() as u64;
        stats.failures += aggregate.failures() as u64;
        stats.last_summary = Some(format!(
            "total={} success={} failed={} notional=${:.2}",
            aggregate.total(),
            aggregate.successes(),
            aggregate.failures(),
            aggregate.total_notional(),
        ));
    }
}

fn skipped_result(row: &SheetRow, reason: &str, now: DateTime<Utc>) -> ExecutionResult {
    let (row_index, symbol) = match row {
        SheetRow::Order(order) => (order.row_index, order.symbol.clone()),
        SheetRow::Invalid {
            row_index, symbol, ..
        } => (*row_index, symbol.clone()),
    };
    ExecutionResult {
        row_index,
        symbol,
        requested_qty: 0,
        fill_price: None,
        order_id: None,
        outcome: Outcome::Skipped,
        message: reason.to_string(),
        timestamp: now,
    }
}

/// Describe when the not-due orders will next fire.
fn upcoming_preview(rows: &[SheetRow], today: chrono::NaiveDate) -> Vec<String> {
    rows.iter()
        .filter_map(|row| match row {
            SheetRow::Order(order) if !due::is_due(order.frequency, today) => {
                let sizing = match (order.qty_to_buy, order.amount_usd) {
                    (Some(qty), _) => format!("{qty} share(s)"),
                    (None, Some(amount)) => format!("${amount:.2}"),
                    (None, None) => "?".to_string(),
                };
                Some(format!(
                    "**{}** ({sizing}) - {}",
                    order.symbol,
                    due::next_due_hint(order.frequency, today)
                ))
            }
            _ => None,
        })
        .collect()
}
