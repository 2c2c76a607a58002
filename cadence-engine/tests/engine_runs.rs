//! End-to-end engine runs against the mock broker, an in-memory worksheet,
//! and a capture webhook. The production OAuth signer and session lifecycle
//! are in the loop for every scenario.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::America::New_York;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence_broker::BrokerClient;
use cadence_core::{Frequency, Outcome};
use cadence_engine::{EngineError, OrderEngine, Trigger};
use cadence_notify::Notifier;
use cadence_sheets::{MemoryWorksheet, OrderSheet, Worksheet};
use cadence_test_utils::{MockBroker, MockWebhook, TestKeys};

const HEADER: [&str; 7] = [
    "Status",
    "Stock Symbol",
    "Price",
    "Amount",
    "Qty to buy",
    "Frequency",
    "Log",
];

/// 2025-09-15 10:00 America/New_York, a Monday.
fn monday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 14, 0, 0).unwrap()
}

/// 2025-09-16, a Tuesday.
fn tuesday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 16, 14, 0, 0).unwrap()
}

struct Harness {
    mock: MockBroker,
    webhook: MockWebhook,
    worksheet: Arc<MemoryWorksheet>,
    engine: Arc<OrderEngine>,
    cancel: CancellationToken,
}

impl Harness {
    async fn with_rows(rows: Vec<Vec<&str>>) -> Result<Self> {
        Self::with_rows_and_pause(rows, Duration::from_millis(5)).await
    }

    async fn with_rows_and_pause(rows: Vec<Vec<&str>>, pause: Duration) -> Result<Self> {
        let keys = TestKeys::generate()?;
        let mock = MockBroker::start(&keys).await?;
        let webhook = MockWebhook::start().await?;

        let broker = Arc::new(BrokerClient::new(keys.broker_settings(&mock.base_url()))?);
        let worksheet = Arc::new(MemoryWorksheet::with_rows(
            rows.into_iter()
                .map(|row| row.into_iter().map(String::from).collect())
                .collect(),
        ));
        let sheet = Arc::new(OrderSheet::new(
            Arc::clone(&worksheet) as Arc<dyn Worksheet>,
            7,
            5,
        ));
        let notifier = Arc::new(Notifier::new(
            webhook.url(),
            "Cadence".into(),
            Duration::from_secs(2),
            New_York,
        ));
        let cancel = CancellationToken::new();
        let engine = Arc::new(OrderEngine::new(
            broker,
            sheet,
            notifier,
            New_York,
            pause,
            cancel.clone(),
        ));
        Ok(Self {
            mock,
            webhook,
            worksheet,
            engine,
            cancel,
        })
    }

    async fn log_cell(&self, row: usize, col: usize) -> String {
        let cells = self.worksheet.read_row(row).await.unwrap();
        cells.get(col - 1).cloned().unwrap_or_default()
    }

    async fn first_embed_title(&self) -> String {
        let payloads = self.webhook.state().payloads().await;
        payloads
            .first()
            .and_then(|p| p["embeds"][0]["title"].as_str())
            .unwrap_or_default()
            .to_string()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_daily_buy_by_quantity() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "2", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, Some("200.00"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.total(), 1);
    let result = &agg.results[0];
    assert_eq!(result.outcome, Outcome::Placed);
    assert_eq!(result.symbol, "AAPL");
    assert_eq!(result.requested_qty, 2);
    assert_eq!(result.fill_price.unwrap().to_string(), "200.00");
    assert!(result.order_id.is_some());
    assert_eq!(agg.total_notional().to_string(), "400.00");

    // Log line lands in the first log column (G).
    let log = h.log_cell(2, 7).await;
    assert!(log.contains("AAPL 2 @ $200.00"), "{log}");
    assert!(log.contains(&format!("id={}", result.order_id.as_ref().unwrap())));
    assert!(log.contains("| Daily"), "{log}");

    // Summary notification went out.
    let payloads = h.webhook.state().payloads().await;
    assert_eq!(payloads.len(), 1);
    let summary = payloads[0]["embeds"][0]["fields"][0]["value"]
        .as_str()
        .unwrap();
    assert!(summary.contains("**Total:** 1"), "{summary}");
    assert!(summary.contains("**Success:** 1"), "{summary}");
    let body = payloads[0].to_string();
    assert!(body.contains("400.00"), "notional missing: {body}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_weekly_by_notional_on_monday() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "SPY", "", "500", "", "Weekly", ""],
    ])
    .await?;
    h.mock.state().set_symbol("SPY", 756733).await;
    h.mock
        .state()
        .set_snapshot(756733, Some("445.75"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.successes(), 1);
    assert_eq!(agg.results[0].requested_qty, 1);

    let placed = h.mock.state().placed_orders().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0]["orders"][0]["quantity"], 1);
    assert_eq!(placed[0]["orders"][0]["orderType"], "MKT");
    assert_eq!(placed[0]["orders"][0]["tif"], "DAY");
    assert_eq!(placed[0]["orders"][0]["side"], "BUY");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_weekly_order_filtered_out_on_tuesday() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "SPY", "", "500", "", "Weekly", ""],
    ])
    .await?;

    let agg = h.engine.execute_due(tuesday(), Trigger::Scheduled).await?;
    assert!(agg.is_empty());

    // Not a single broker call: no handshake, no orders.
    assert_eq!(h.mock.state().lst_derivation_count().await, 0);
    assert!(h.mock.state().placed_orders().await.is_empty());

    let title = h.first_embed_title().await;
    assert!(title.contains("No Orders Today"), "{title}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_unresolved_symbol_is_rejected_and_batch_continues() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "ZZZZZZ", "", "", "1", "Daily", ""],
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, Some("200.00"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.total(), 2);

    // Ascending row order.
    assert_eq!(agg.results[0].row_index, 2);
    assert_eq!(agg.results[0].outcome, Outcome::Rejected);
    assert_eq!(agg.results[0].message, "unresolved symbol");
    assert_eq!(agg.results[1].row_index, 3);
    assert_eq!(agg.results[1].outcome, Outcome::Placed);

    let log = h.log_cell(2, 7).await;
    assert!(log.contains("FAILED - unresolved symbol"), "{log}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_session_expiry_mid_batch_replays_once() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
        vec!["Active", "MSFT", "", "", "1", "Daily", ""],
    ])
    .await?;
    let state = h.mock.state();
    state.set_symbol("AAPL", 265598).await;
    state.set_symbol("MSFT", 272093).await;
    state.set_snapshot(265598, Some("200.00"), None, None).await;
    state.set_snapshot(272093, Some("410.00"), None, None).await;
    // The second order submission hits an expired session.
    state.fail_unauthorized_on_order(2).await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.successes(), 2);
    assert!(agg.results.iter().all(|r| r.outcome == Outcome::Placed));

    // Initial derivation plus exactly one re-derivation.
    assert_eq!(state.lst_derivation_count().await, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_concurrent_trigger_returns_busy() -> Result<()> {
    let h = Harness::with_rows_and_pause(
        vec![
            HEADER.to_vec(),
            vec!["Active", "AAPL", "", "", "1", "Daily", ""],
            vec!["Active", "MSFT", "", "", "1", "Daily", ""],
        ],
        Duration::from_millis(300),
    )
    .await?;
    let state = h.mock.state();
    state.set_symbol("AAPL", 265598).await;
    state.set_symbol("MSFT", 272093).await;
    state.set_snapshot(265598, Some("200.00"), None, None).await;
    state.set_snapshot(272093, Some("410.00"), None, None).await;

    let engine = Arc::clone(&h.engine);
    let scheduled = tokio::spawn(async move {
        engine.execute_due(monday(), Trigger::Scheduled).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The manual trigger lands while the scheduled run is mid-batch.
    let manual = h
        .engine
        .execute_due(monday(), Trigger::Manual { frequency: None })
        .await;
    assert!(matches!(manual, Err(EngineError::Busy)));

    let agg = scheduled.await??;
    assert_eq!(agg.successes(), 2);
    // Only the scheduled run touched the broker.
    assert_eq!(h.mock.state().placed_orders().await.len(), 2);
    assert_eq!(h.webhook.state().payloads().await.len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_share_notional_is_rejected_without_an_order() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "PENNY", "", "1.00", "", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("PENNY", 42).await;
    h.mock
        .state()
        .set_snapshot(42, Some("1.50"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.results[0].outcome, Outcome::Rejected);
    assert_eq!(agg.results[0].message, "sub-share notional");
    assert!(h.mock.state().placed_orders().await.is_empty());
    let log = h.log_cell(2, 7).await;
    assert!(log.contains("sub-share notional"), "{log}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_quantity_overrides_notional() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "500", "3", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, Some("200.00"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.results[0].requested_qty, 3);
    let placed = h.mock.state().placed_orders().await;
    assert_eq!(placed[0]["orders"][0]["quantity"], 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mid_price_backstops_a_missing_last() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "400", "", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, None, Some("199.00"), Some("201.00"))
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    // mid = 200.00 -> qty 2
    assert_eq!(agg.results[0].requested_qty, 2);
    assert_eq!(
        agg.results[0].fill_price.unwrap(),
        rust_decimal::Decimal::from(200)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn no_price_anywhere_is_rejected() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "400", "", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.results[0].outcome, Outcome::Rejected);
    assert_eq!(agg.results[0].message, "no price");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn price_hint_backstops_an_empty_snapshot() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "210.00", "420", "", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.results[0].outcome, Outcome::Placed);
    assert_eq!(agg.results[0].requested_qty, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_row_is_reported_and_batch_continues() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "two", "Daily", ""],
        vec!["Active", "MSFT", "", "", "1", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("MSFT", 272093).await;
    h.mock
        .state()
        .set_snapshot(272093, Some("410.00"), None, None)
        .await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.total(), 2);
    assert_eq!(agg.results[0].outcome, Outcome::Rejected);
    assert!(agg.results[0].message.contains("invalid row"));
    assert_eq!(agg.results[1].outcome, Outcome::Placed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn manual_frequency_filter_bypasses_the_calendar() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "SPY", "", "500", "", "Weekly", ""],
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
    ])
    .await?;
    let state = h.mock.state();
    state.set_symbol("SPY", 756733).await;
    state.set_snapshot(756733, Some("445.75"), None, None).await;

    // Tuesday, but the manual weekly run fires anyway; the daily row is
    // filtered out by the frequency restriction.
    let agg = h
        .engine
        .execute_due(
            tuesday(),
            Trigger::Manual {
                frequency: Some(Frequency::Weekly),
            },
        )
        .await?;
    assert_eq!(agg.total(), 1);
    assert_eq!(agg.results[0].symbol, "SPY");
    assert_eq!(agg.results[0].outcome, Outcome::Placed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_skips_remaining_orders() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
        vec!["Active", "MSFT", "", "", "1", "Daily", ""],
    ])
    .await?;
    h.cancel.cancel();

    let agg = h
        .engine
        .execute_due(monday(), Trigger::Manual { frequency: None })
        .await?;
    assert_eq!(agg.total(), 2);
    assert!(agg
        .results
        .iter()
        .all(|r| r.outcome == Outcome::Skipped && r.message == "shutdown"));
    assert!(h.mock.state().placed_orders().await.is_empty());
    let log = h.log_cell(2, 7).await;
    assert!(log.contains("skipped - shutdown"), "{log}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn sheet_schema_failure_aborts_with_terminal_notification() -> Result<()> {
    let h = Harness::with_rows(vec![vec!["Status", "Price"]]).await?;

    let err = h
        .engine
        .execute_due(monday(), Trigger::Scheduled)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Sheet(_)), "{err}");

    let title = h.first_embed_title().await;
    assert!(title.contains("System Error"), "{title}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_sheet_sends_no_orders_notification_without_broker_calls() -> Result<()> {
    let h = Harness::with_rows(vec![HEADER.to_vec()]).await?;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert!(agg.is_empty());
    assert_eq!(h.mock.state().lst_derivation_count().await, 0);
    let title = h.first_embed_title().await;
    assert!(title.contains("No Orders Today"), "{title}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn broker_refusal_is_an_error_outcome_and_batch_continues() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
        vec!["Active", "MSFT", "", "", "1", "Daily", ""],
    ])
    .await?;
    let state = h.mock.state();
    state.set_symbol("AAPL", 265598).await;
    state.set_symbol("MSFT", 272093).await;
    state.set_snapshot(265598, Some("200.00"), None, None).await;
    state.set_snapshot(272093, Some("410.00"), None, None).await;
    state.reject_next_order("insufficient funds").await;

    let agg = h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    assert_eq!(agg.results[0].outcome, Outcome::Error);
    assert!(agg.results[0].message.contains("insufficient funds"));
    assert_eq!(agg.results[1].outcome, Outcome::Placed);

    let json = serde_json::to_value(&agg.results)?;
    assert_eq!(json.as_array().map(Vec::len), Some(2));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_runs_append_to_successive_log_columns() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, Some("200.00"), None, None)
        .await;

    h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    h.engine.execute_due(tuesday(), Trigger::Scheduled).await?;

    let first = h.log_cell(2, 7).await;
    let second = h.log_cell(2, 8).await;
    assert!(first.contains("2025-09-15"), "{first}");
    assert!(second.contains("2025-09-16"), "{second}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn run_statistics_accumulate() -> Result<()> {
    let h = Harness::with_rows(vec![
        HEADER.to_vec(),
        vec!["Active", "AAPL", "", "", "1", "Daily", ""],
    ])
    .await?;
    h.mock.state().set_symbol("AAPL", 265598).await;
    h.mock
        .state()
        .set_snapshot(265598, Some("200.00"), None, None)
        .await;

    h.engine.execute_due(monday(), Trigger::Scheduled).await?;
    h.engine.execute_due(tuesday(), Trigger::Scheduled).await?;

    let stats = h.engine.stats();
    assert_eq!(stats.executions, 2);
    assert_eq!(stats.successes, 2);
    assert_eq!(stats.failures, 0);
    assert!(stats.last_summary.unwrap().contains("total=1"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_rate_limit_is_retried_once() -> Result<()> {
    let h = Harness::with_rows(vec![HEADER.to_vec()]).await?;
    h.webhook.state().rate_limit_next().await;

    h.engine.execute_due(monday(), Trigger::Scheduled).await?;

    // First POST got 429, the retry landed.
    let payloads = h.webhook.state().payloads().await;
    assert_eq!(payloads.len(), 1);
    Ok(())
}
