//! Webhook notifications for engine runs and service lifecycle.
//!
//! One POST per scheduler tick. A failed notification never fails the run:
//! it is logged, retried once after a short pause (honoring `Retry-After`
//! on 429), and then recorded only.

use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use cadence_core::{AggregateResult, ExecutionResult, Outcome};

const COLOR_SUCCESS: u32 = 0x00ff00;
const COLOR_MIXED: u32 = 0xffa500;
const COLOR_FAILURE: u32 = 0xff0000;
const COLOR_INFO: u32 = 0x0099ff;

/// How many per-order detail lines one embed carries before the overflow
/// field takes over.
const DETAIL_LIMIT: usize = 5;
const RETRY_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook transport error: {0}")]
    Transport(String),
    #[error("webhook returned status {status}")]
    Status {
        status: u16,
        retry_after: Option<u64>,
    },
}

/// Structured webhook dispatcher.
pub struct Notifier {
    client: Client,
    webhook_url: String,
    username: String,
    timezone: Tz,
}

impl Notifier {
    pub fn new(webhook_url: String, username: String, timeout: Duration, timezone: Tz) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create webhook client");
        Self {
            client,
            webhook_url,
            username,
            timezone,
        }
    }

    /// Report a completed run: summary plus per-order detail.
    pub async fn send_run_report(&self, aggregate: &AggregateResult) {
        let total = aggregate.total();
        let successes = aggregate.successes();
        let failures = aggregate.failures();

        let (title, color) = if failures == 0 && successes > 0 {
            ("\u{1f680} Recurring Orders Executed", COLOR_SUCCESS)
        } else if successes > 0 {
            ("\u{26a0} Recurring Orders Partially Executed", COLOR_MIXED)
        } else if failures > 0 {
            ("\u{274c} Recurring Orders Failed", COLOR_FAILURE)
        } else {
            ("\u{1f4cb} Recurring Orders", COLOR_INFO)
        };

        let mut fields = vec![json!({
            "name": "Summary",
            "value": format!(
                "**Total:** {total}\n**Success:** {successes}\n**Failed:** {failures}"
            ),
            "inline": true,
        })];
        let notional = aggregate.total_notional();
        if notional > Decimal::ZERO {
            fields.push(json!({
                "name": "Total Invested",
                "value": format!("${notional:.2}"),
                "inline": true,
            }));
        }
        fields.push(json!({
            "name": "Execution Time",
            "value": self.local_timestamp(),
            "inline": true,
        }));

        let details: Vec<String> = aggregate
            .results
            .iter()
            .take(DETAIL_LIMIT)
            .map(order_line)
            .collect();
        if !details.is_empty() {
            fields.push(json!({
                "name": "Order Details",
                "value": details.join("\n\n"),
                "inline": false,
            }));
        }
        if aggregate.results.len() > DETAIL_LIMIT {
            fields.push(json!({
                "name": "Additional Orders",
                "value": format!(
                    "... and {} more orders",
                    aggregate.results.len() - DETAIL_LIMIT
                ),
                "inline": false,
            }));
        }

        self.dispatch(self.embed(title, color, None, fields)).await;
    }

    /// The "no orders today" variant: the tick ran, the due set was empty.
    pub async fn send_no_orders(&self, active_orders: usize, upcoming: &[String]) {
        let mut lines = vec![
            format!("Checked {active_orders} active recurring order(s)"),
            "No orders scheduled for today".to_string(),
        ];
        if !upcoming.is_empty() {
            lines.push("**Upcoming:**".to_string());
            lines.extend(upcoming.iter().take(3).cloned());
            if upcoming.len() > 3 {
                lines.push(format!("... and {} more", upcoming.len() - 3));
            }
        }
        let fields = vec![json!({
            "name": "Daily Check",
            "value": lines.join("\n"),
            "inline": false,
        })];
        self.dispatch(self.embed(
            "\u{1f4cb} No Orders Today",
            COLOR_INFO,
            None,
            fields,
        ))
        .await;
    }

    /// A batch aborted before per-order execution could finish.
    pub async fn send_terminal_failure(&self, context: &str, error: &str) {
        self.dispatch(self.embed(
            "\u{1f4a5} Recurring Orders System Error",
            COLOR_FAILURE,
            Some(format!("{context}\n```{error}```")),
            Vec::new(),
        ))
        .await;
    }

    /// Service lifecycle messages (started, stopped, terminal supervisor
    /// failure).
    pub async fn send_lifecycle(&self, title: &str, message: &str, is_error: bool) {
        let color = if is_error { COLOR_FAILURE } else { COLOR_INFO };
        self.dispatch(self.embed(title, color, Some(message.to_string()), Vec::new()))
            .await;
    }

    fn embed(
        &self,
        title: &str,
        color: u32,
        description: Option<String>,
        fields: Vec<Value>,
    ) -> Value {
        let mut embed = json!({
            "title": title,
            "color": color,
            "timestamp": Utc::now().to_rfc3339(),
            "fields": fields,
            "footer": { "text": "Cadence Recurring Orders" },
        });
        if let Some(description) = description {
            embed["description"] = json!(description);
        }
        json!({
            "username": self.username,
            "embeds": [embed],
        })
    }

    fn local_timestamp(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d %H:%M:%S %Z")
            .to_string()
    }

    /// Send with the single-retry policy. Failures are logged, never raised.
    async fn dispatch(&self, payload: Value) {
        match self.post(&payload).await {
            Ok(()) => info!("webhook notification sent"),
            Err(err) => {
                warn!(error = %err, "webhook notification failed, retrying once");
                let pause = match &err {
                    NotifyError::Status {
                        status: 429,
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => RETRY_PAUSE,
                };
                tokio::time::sleep(pause).await;
                if let Err(err) = self.post(&payload).await {
                    error!(error = %err, "webhook notification failed twice, giving up");
                }
            }
        }
    }

    async fn post(&self, payload: &Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(payload)
            .send()
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse().ok());
            Err(NotifyError::Status {
                status: status.as_u16(),
                retry_after,
            })
        }
    }
}

fn order_line(result: &ExecutionResult) -> String {
    match result.outcome {
        Outcome::Placed => {
            let mut line = format!(
                "\u{1f7e2} **{}**: {} share(s)",
                result.symbol, result.requested_qty
            );
            if let Some(price) = result.fill_price {
                line.push_str(&format!(" @ ${price:.2}"));
            }
            if let Some(notional) = result.notional() {
                line.push_str(&format!(" (${notional:.2})"));
            }
            if let Some(order_id) = &result.order_id {
                line.push_str(&format!("\n   Order ID: `{order_id}`"));
            }
            line
        }
        Outcome::Skipped => format!("\u{23ed} **{}**: {}", result.symbol, result.message),
        Outcome::Rejected | Outcome::Error => {
            let mut message = result.message.clone();
            if message.len() > 80 {
                message.truncate(80);
                message.push_str("...");
            }
            format!("\u{1f534} **{}**: {}", result.symbol, message)
        }
    }
}
