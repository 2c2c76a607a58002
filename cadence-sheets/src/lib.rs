//! Worksheet adapter for the recurring-order table.
//!
//! The engine only ever sees [`OrderSheet`]: an ordered read of the declared
//! orders plus a sequenced, bounded log append per row. The transport behind
//! it is the [`Worksheet`] trait — Google Sheets in production,
//! [`memory::MemoryWorksheet`] in tests and dry runs. All operations are
//! serialized through one mutex; the underlying API client is not assumed
//! re-entrant.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use cadence_core::{Frequency, RecurringOrder, RowIndex, RowStatus, SheetRow};

pub mod google;
pub mod memory;

pub use google::{GoogleSheets, GoogleSheetsSettings};
pub use memory::MemoryWorksheet;

/// Errors raised by the sheet adapter.
#[derive(Debug, Error)]
pub enum SheetError {
    /// The header row lacks required columns.
    #[error("sheet schema error: missing required column(s): {}", missing.join(", "))]
    Schema { missing: Vec<String> },
    /// Authentication against the spreadsheet API failed.
    #[error("sheet authentication failed: {0}")]
    Auth(String),
    /// Transport or API-level failure.
    #[error("sheet I/O error: {0}")]
    Io(String),
}

/// Minimal transport surface over one worksheet. Rows and columns are
/// 1-based, matching spreadsheet addressing.
#[async_trait]
pub trait Worksheet: Send + Sync {
    /// Every populated row, row-major. Trailing empty cells may be absent.
    async fn read_all(&self) -> Result<Vec<Vec<String>>, SheetError>;

    /// The populated cells of one row.
    async fn read_row(&self, row: RowIndex) -> Result<Vec<String>, SheetError>;

    /// Overwrite a single cell.
    async fn update_cell(&self, row: RowIndex, col: usize, value: &str)
        -> Result<(), SheetError>;
}

/// Column positions discovered from the header row (0-based within a row).
#[derive(Debug)]
struct HeaderMap {
    status: usize,
    symbol: usize,
    price: Option<usize>,
    amount: Option<usize>,
    qty: Option<usize>,
    frequency: usize,
}

impl HeaderMap {
    /// Identify columns by header name, case-insensitively with whitespace
    /// trimmed. Unknown columns are ignored; missing required ones fail
    /// with a schema error naming them.
    fn discover(header_row: &[String]) -> Result<Self, SheetError> {
        let find = |names: &[&str]| {
            header_row.iter().position(|cell| {
                let cell = cell.trim();
                names.iter().any(|name| cell.eq_ignore_ascii_case(name))
            })
        };
        let status = find(&["status"]);
        let symbol = find(&["stock symbol", "symbol"]);
        let frequency = find(&["frequency"]);

        let mut missing = Vec::new();
        if status.is_none() {
            missing.push("Status".to_string());
        }
        if symbol.is_none() {
            missing.push("Stock Symbol".to_string());
        }
        if frequency.is_none() {
            missing.push("Frequency".to_string());
        }
        if !missing.is_empty() {
            return Err(SheetError::Schema { missing });
        }

        Ok(Self {
            status: status.unwrap(),
            symbol: symbol.unwrap(),
            price: find(&["price"]),
            amount: find(&["amount"]),
            qty: find(&["qty to buy", "quantity", "qty"]),
            frequency: frequency.unwrap(),
        })
    }
}

/// The recurring-order table plus its append-only log cells.
pub struct OrderSheet {
    worksheet: Arc<dyn Worksheet>,
    lock: Mutex<()>,
    /// First log column, 1-based (7 = G).
    log_start_column: usize,
    max_log_columns: usize,
}

impl OrderSheet {
    pub fn new(
        worksheet: Arc<dyn Worksheet>,
        log_start_column: usize,
        max_log_columns: usize,
    ) -> Self {
        Self {
            worksheet,
            lock: Mutex::new(()),
            log_start_column: log_start_column.max(1),
            max_log_columns: max_log_columns.max(1),
        }
    }

    /// Read the declared orders in row order. Header is row 1, data starts
    /// at row 2. Inactive rows are dropped; active rows that fail to parse
    /// come back as [`SheetRow::Invalid`] so the caller can record a
    /// row-scoped error without aborting.
    pub async fn list_orders(&self) -> Result<Vec<SheetRow>, SheetError> {
        let _guard = self.lock.lock().await;
        let rows = self.worksheet.read_all().await?;
        let Some(header) = rows.first() else {
            return Err(SheetError::Schema {
                missing: vec!["Status".into(), "Stock Symbol".into(), "Frequency".into()],
            });
        };
        let headers = HeaderMap::discover(header)?;

        let mut orders = Vec::new();
        for (index, row) in rows.iter().enumerate().skip(1) {
            let row_index = index + 1;
            if row.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            let status = RowStatus::parse(cell(row, headers.status));
            if !status.is_active() {
                continue;
            }
            orders.push(parse_active_row(&headers, row, row_index, status));
        }
        debug!(rows = orders.len(), "listed active recurring orders");
        Ok(orders)
    }

    /// Append a message to the row's log cells: the first empty log column
    /// from the configured start takes the write. When every log column is
    /// full the last one is overwritten with a truncation marker. Writes
    /// are at-least-once; callers embed timestamps so duplicates are
    /// harmless.
    pub async fn append_log(&self, row: RowIndex, message: &str) -> Result<(), SheetError> {
        let _guard = self.lock.lock().await;
        let cells = self.worksheet.read_row(row).await?;
        let start = self.log_start_column;
        let last = start + self.max_log_columns - 1;

        let mut target = None;
        for col in start..=last {
            let occupied = cells
                .get(col - 1)
                .map(|cell| !cell.trim().is_empty())
                .unwrap_or(false);
            if !occupied {
                target = Some(col);
                break;
            }
        }
        match target {
            Some(col) => self.worksheet.update_cell(row, col, message).await,
            None => {
                let truncated = format!("\u{26a0} log full | {message}");
                self.worksheet.update_cell(row, last, &truncated).await
            }
        }
    }
}

fn cell(row: &[String], col: usize) -> &str {
    row.get(col).map(String::as_str).unwrap_or("")
}

fn parse_active_row(
    headers: &HeaderMap,
    row: &[String],
    row_index: RowIndex,
    status: RowStatus,
) -> SheetRow {
    let symbol = cell(row, headers.symbol).trim().to_uppercase();
    let invalid = |reason: String| SheetRow::Invalid {
        row_index,
        symbol: symbol.clone(),
        reason,
    };

    let frequency = match Frequency::from_str(cell(row, headers.frequency)) {
        Ok(freq) => freq,
        Err(reason) => return invalid(reason),
    };
    let price_hint = match parse_decimal_cell(headers.price.map(|c| cell(row, c))) {
        Ok(value) => value,
        Err(reason) => return invalid(format!("bad price: {reason}")),
    };
    let amount_usd = match parse_decimal_cell(headers.amount.map(|c| cell(row, c))) {
        Ok(value) => value,
        Err(reason) => return invalid(format!("bad amount: {reason}")),
    };
    let qty_to_buy = match parse_quantity_cell(headers.qty.map(|c| cell(row, c))) {
        Ok(value) => value,
        Err(reason) => return invalid(format!("bad quantity: {reason}")),
    };

    let order = RecurringOrder {
        row_index,
        status,
        symbol,
        price_hint,
        amount_usd,
        qty_to_buy,
        frequency,
        log: String::new(),
    };
    match order.validate() {
        Ok(()) => SheetRow::Order(order),
        Err(reason) => SheetRow::Invalid {
            row_index,
            symbol: order.symbol,
            reason,
        },
    }
}

/// Parse a money cell, tolerating `$` and thousands separators.
fn parse_decimal_cell(cell: Option<&str>) -> Result<Option<Decimal>, String> {
    let Some(raw) = cell else { return Ok(None) };
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    cleaned
        .parse()
        .map(Some)
        .map_err(|_| format!("'{raw}' is not a number"))
}

fn parse_quantity_cell(cell: Option<&str>) -> Result<Option<u32>, String> {
    let Some(value) = parse_decimal_cell(cell)? else {
        return Ok(None);
    };
    if value.fract() != Decimal::ZERO || value < Decimal::ZERO {
        return Err(format!("'{value}' is not a whole share count"));
    }
    value
        .to_u32()
        .map(Some)
        .ok_or_else(|| format!("'{value}' is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::Frequency;

    fn sheet_with(rows: Vec<Vec<&str>>) -> OrderSheet {
        let ws = Arc::new(MemoryWorksheet::with_rows(
            rows.into_iter()
                .map(|r| r.into_iter().map(String::from).collect())
                .collect(),
        ));
        OrderSheet::new(ws, 7, 3)
    }

    const HEADER: [&str; 7] = [
        "Status",
        "Stock Symbol",
        "Price",
        "Amount",
        "Qty to buy",
        "Frequency",
        "Log",
    ];

    #[tokio::test]
    async fn lists_active_orders_with_row_indices() {
        let sheet = sheet_with(vec![
            HEADER.to_vec(),
            vec!["Active", "aapl", "200", "", "2", "Daily", ""],
            vec!["Inactive", "MSFT", "", "500", "", "Weekly", ""],
            vec!["active", "SPY", "", "$500.00", "", "weekly", ""],
        ]);
        let rows = sheet.list_orders().await.unwrap();
        assert_eq!(rows.len(), 2);
        match &rows[0] {
            SheetRow::Order(order) => {
                assert_eq!(order.row_index, 2);
                assert_eq!(order.symbol, "AAPL");
                assert_eq!(order.qty_to_buy, Some(2));
                assert_eq!(order.frequency, Frequency::Daily);
            }
            other => panic!("expected order, got {other:?}"),
        }
        match &rows[1] {
            SheetRow::Order(order) => {
                assert_eq!(order.row_index, 4);
                assert_eq!(order.amount_usd, Some(Decimal::new(50000, 2)));
                assert_eq!(order.frequency, Frequency::Weekly);
            }
            other => panic!("expected order, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_required_columns_are_named() {
        let sheet = sheet_with(vec![vec!["Status", "Price", "Amount"]]);
        let err = sheet.list_orders().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Stock Symbol"), "{message}");
        assert!(message.contains("Frequency"), "{message}");
        assert!(!message.contains("Status,"), "{message}");
    }

    #[tokio::test]
    async fn malformed_active_row_is_row_scoped() {
        let sheet = sheet_with(vec![
            HEADER.to_vec(),
            vec!["Active", "AAPL", "", "", "two", "Daily", ""],
            vec!["Active", "SPY", "", "500", "", "Weekly", ""],
        ]);
        let rows = sheet.list_orders().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[0], SheetRow::Invalid { row_index: 2, .. }));
        assert!(matches!(&rows[1], SheetRow::Order(_)));
    }

    #[tokio::test]
    async fn unknown_frequency_is_invalid_not_defaulted() {
        let sheet = sheet_with(vec![
            HEADER.to_vec(),
            vec!["Active", "AAPL", "", "", "1", "Fortnightly", ""],
        ]);
        let rows = sheet.list_orders().await.unwrap();
        match &rows[0] {
            SheetRow::Invalid { reason, .. } => assert!(reason.contains("fortnightly")),
            other => panic!("expected invalid row, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn append_log_takes_first_empty_log_column() {
        let sheet = sheet_with(vec![
            HEADER.to_vec(),
            vec!["Active", "AAPL", "", "", "2", "Daily", "old entry"],
        ]);
        sheet.append_log(2, "new entry").await.unwrap();
        let row = sheet.worksheet.read_row(2).await.unwrap();
        assert_eq!(row[6], "old entry");
        assert_eq!(row[7], "new entry");
    }

    #[tokio::test]
    async fn append_log_overwrites_last_column_when_full() {
        let sheet = sheet_with(vec![
            HEADER.to_vec(),
            vec!["Active", "AAPL", "", "", "2", "Daily", "a", "b", "c"],
        ]);
        sheet.append_log(2, "overflow").await.unwrap();
        let row = sheet.worksheet.read_row(2).await.unwrap();
        assert_eq!(row.len(), 9);
        assert!(row[8].contains("log full"));
        assert!(row[8].contains("overflow"));
    }

    #[test]
    fn quantity_cells_must_be_whole() {
        assert_eq!(parse_quantity_cell(Some("3")).unwrap(), Some(3));
        assert_eq!(parse_quantity_cell(Some("")).unwrap(), None);
        assert!(parse_quantity_cell(Some("2.5")).is_err());
        assert!(parse_quantity_cell(Some("-1")).is_err());
    }
}
