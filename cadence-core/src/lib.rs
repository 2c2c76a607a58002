//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Alias for price precision.
pub type Price = Decimal;
/// Broker-assigned numeric identifier for a tradeable instrument.
pub type Conid = i64;
/// Unique identifier assigned to orders by the broker.
pub type OrderId = String;
/// 1-based worksheet row position, used solely to address writes.
pub type RowIndex = usize;

/// Activation flag carried by every worksheet row.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum RowStatus {
    Active,
    Inactive,
}

impl RowStatus {
    /// Parse the worksheet cell, comparing case-insensitively.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("active") {
            Self::Active
        } else {
            Self::Inactive
        }
    }

    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// How often a recurring order fires.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "Daily",
            Self::Weekly => "Weekly",
            Self::Monthly => "Monthly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(format!("unrecognized frequency '{other}'")),
        }
    }
}

/// A declarative recurring order, one worksheet row.
///
/// The engine never caches these across runs; the worksheet is the source of
/// truth and `row_index` addresses the write-back.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RecurringOrder {
    pub row_index: RowIndex,
    pub status: RowStatus,
    pub symbol: String,
    pub price_hint: Option<Price>,
    pub amount_usd: Option<Price>,
    pub qty_to_buy: Option<u32>,
    pub frequency: Frequency,
    pub log: String,
}

impl RecurringOrder {
    /// A row is well-formed when it names a symbol and carries either a
    /// share quantity or a positive notional.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("missing symbol".into());
        }
        match (self.qty_to_buy, self.amount_usd) {
            (Some(qty), _) if qty >= 1 => Ok(()),
            (Some(qty), _) => Err(format!("quantity must be at least 1, got {qty}")),
            (None, Some(amount)) if amount > Decimal::ZERO => Ok(()),
            (None, Some(amount)) => Err(format!("amount must be positive, got {amount}")),
            (None, None) => Err("neither quantity nor amount set".into()),
        }
    }
}

/// One worksheet row as returned by the sheet adapter. Inactive rows are
/// dropped before this point; active rows that fail to parse surface as
/// `Invalid` so the batch can record a row-scoped error without aborting.
#[derive(Clone, Debug)]
pub enum SheetRow {
    Order(RecurringOrder),
    Invalid {
        row_index: RowIndex,
        symbol: String,
        reason: String,
    },
}

impl SheetRow {
    #[must_use]
    pub fn row_index(&self) -> RowIndex {
        match self {
            Self::Order(order) => order.row_index,
            Self::Invalid { row_index, .. } => *row_index,
        }
    }
}

/// The side of an order.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// Order execution style. The recurring path only ever submits market
/// orders; limit support exists for the convenience proxies.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MKT",
            Self::Limit => "LMT",
        }
    }
}

/// Time-in-force constraints supported by the broker.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TimeInForce {
    Day,
    GoodTilCanceled,
}

impl TimeInForce {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "DAY",
            Self::GoodTilCanceled => "GTC",
        }
    }
}

/// Everything the broker needs to submit one order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderTicket {
    pub conid: Conid,
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub tif: TimeInForce,
    pub client_order_id: Option<String>,
}

impl OrderTicket {
    /// A plain market day-order, the shape every recurring buy takes.
    #[must_use]
    pub fn market_buy(conid: Conid, quantity: u32) -> Self {
        Self {
            conid,
            side: Side::Buy,
            quantity,
            order_type: OrderType::Market,
            price: None,
            tif: TimeInForce::Day,
            client_order_id: None,
        }
    }

    #[must_use]
    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Last/bid/ask snapshot for a single instrument.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct MarketSnapshot {
    pub conid: Conid,
    pub last: Option<Price>,
    pub bid: Option<Price>,
    pub ask: Option<Price>,
}

impl MarketSnapshot {
    #[must_use]
    pub fn mid(&self) -> Option<Price> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// The price used for notional reporting: last, falling back to mid.
    #[must_use]
    pub fn reference_price(&self) -> Option<Price> {
        self.last.or_else(|| self.mid())
    }
}

/// A position held at the broker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub conid: Conid,
    pub symbol: String,
    pub quantity: Decimal,
    pub market_price: Option<Price>,
    pub market_value: Option<Price>,
}

/// Terminal classification of one order attempt.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Outcome {
    /// Order accepted by the broker; `order_id` is set.
    Placed,
    /// The pipeline refused the row before submission.
    Rejected,
    /// The row never got its turn (shutdown, busy engine).
    Skipped,
    /// The broker or transport failed mid-submission.
    Error,
}

impl Outcome {
    #[must_use]
    pub fn icon(self) -> &'static str {
        match self {
            Self::Placed => "\u{2705}",
            Self::Rejected | Self::Error => "\u{274c}",
            Self::Skipped => "\u{23ed}",
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Placed)
    }
}

/// Result of one order attempt within a batch.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExecutionResult {
    pub row_index: RowIndex,
    pub symbol: String,
    pub requested_qty: u32,
    pub fill_price: Option<Price>,
    pub order_id: Option<OrderId>,
    pub outcome: Outcome,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// Notional value of a placed order, `fill_price * requested_qty`.
    #[must_use]
    pub fn notional(&self) -> Option<Price> {
        if !self.outcome.is_success() {
            return None;
        }
        self.fill_price
            .map(|price| price * Decimal::from(self.requested_qty))
    }
}

/// Aggregate of one `execute_due` run.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct AggregateResult {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Vec<ExecutionResult>,
}

impl AggregateResult {
    #[must_use]
    pub fn total(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn successes(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_success())
            .count()
    }

    #[must_use]
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Rejected | Outcome::Error))
            .count()
    }

    /// Sum of `fill_price * qty` over successfully placed orders.
    #[must_use]
    pub fn total_notional(&self) -> Price {
        self.results.iter().filter_map(ExecutionResult::notional).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(qty: Option<u32>, amount: Option<Price>) -> RecurringOrder {
        RecurringOrder {
            row_index: 2,
            status: RowStatus::Active,
            symbol: "AAPL".into(),
            price_hint: None,
            amount_usd: amount,
            qty_to_buy: qty,
            frequency: Frequency::Daily,
            log: String::new(),
        }
    }

    #[test]
    fn frequency_parses_case_insensitively() {
        assert_eq!("Daily".parse::<Frequency>().unwrap(), Frequency::Daily);
        assert_eq!(" WEEKLY ".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert_eq!("monthly".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert!("fortnightly".parse::<Frequency>().is_err());
    }

    #[test]
    fn status_parse_ignores_case_and_whitespace() {
        assert!(RowStatus::parse(" Active ").is_active());
        assert!(!RowStatus::parse("inactive").is_active());
        assert!(!RowStatus::parse("").is_active());
    }

    #[test]
    fn validation_requires_qty_or_amount() {
        assert!(order(Some(2), None).validate().is_ok());
        assert!(order(None, Some(Decimal::new(500, 0))).validate().is_ok());
        assert!(order(None, None).validate().is_err());
        assert!(order(Some(0), None).validate().is_err());
        assert!(order(None, Some(Decimal::ZERO)).validate().is_err());
    }

    #[test]
    fn snapshot_reference_price_prefers_last() {
        let snap = MarketSnapshot {
            conid: 1,
            last: Some(Decimal::new(200, 0)),
            bid: Some(Decimal::new(100, 0)),
            ask: Some(Decimal::new(102, 0)),
        };
        assert_eq!(snap.reference_price(), Some(Decimal::new(200, 0)));

        let no_last = MarketSnapshot { last: None, ..snap };
        assert_eq!(no_last.reference_price(), Some(Decimal::new(101, 0)));

        let empty = MarketSnapshot {
            conid: 1,
            last: None,
            bid: None,
            ask: None,
        };
        assert_eq!(empty.reference_price(), None);
    }

    #[test]
    fn aggregate_totals_count_only_placed_orders() {
        let placed = ExecutionResult {
            row_index: 2,
            symbol: "AAPL".into(),
            requested_qty: 2,
            fill_price: Some(Decimal::new(200, 0)),
            order_id: Some("X1".into()),
            outcome: Outcome::Placed,
            message: String::new(),
            timestamp: Utc::now(),
        };
        let rejected = ExecutionResult {
            row_index: 3,
            symbol: "ZZZZ".into(),
            requested_qty: 1,
            fill_price: None,
            order_id: None,
            outcome: Outcome::Rejected,
            message: "unresolved symbol".into(),
            timestamp: Utc::now(),
        };
        let agg = AggregateResult {
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            results: vec![placed, rejected],
        };
        assert_eq!(agg.total(), 2);
        assert_eq!(agg.successes(), 1);
        assert_eq!(agg.failures(), 1);
        assert_eq!(agg.total_notional(), Decimal::new(400, 0));
    }
}
