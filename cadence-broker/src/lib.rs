//! OAuth1-signed client for the broker's web API.
//!
//! A single [`BrokerClient`] value lives for the whole process and is shared
//! by reference; the live session token behind it is refreshed lazily and
//! swapped atomically, so callers never observe a half-derived token.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use rand::Rng;
use reqwest::{header::AUTHORIZATION, Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use cadence_core::{Conid, MarketSnapshot, OrderId, OrderTicket, Position};

pub mod lst;
pub mod signer;
pub mod tickler;

pub use lst::LiveSessionToken;
pub use signer::{load_private_key, OauthSigner};
pub use tickler::spawn_tickler;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by the broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failures (network, timeouts, exhausted retries).
    #[error("transport error: {0}")]
    Transport(String),
    /// OAuth signing, token derivation or verification failed, or the
    /// session could not be re-established after a replay.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Non-auth 4xx/5xx surfaced with status and body.
    #[error("broker error (status {status}): {body}")]
    Api { status: u16, body: String },
    /// The confirmation-reply loop exceeded its budget or never produced an
    /// order id.
    #[error("order protocol error: {0}")]
    OrderProtocol(String),
    /// Wraps payload parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Request parameters invalid for the broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

/// Everything needed to construct a [`BrokerClient`]. The service layer maps
/// the application config into this.
pub struct BrokerSettings {
    pub base_url: String,
    pub consumer_key: String,
    pub access_token: String,
    /// Base64 RSA-OAEP ciphertext of the access token secret.
    pub access_token_secret: String,
    /// Hex-encoded Diffie-Hellman prime.
    pub dh_prime: String,
    pub realm: String,
    pub signature_key_path: std::path::PathBuf,
    pub encryption_key_path: std::path::PathBuf,
    pub account_id: Option<String>,
    pub call_timeout: Duration,
}

const MAX_TRANSPORT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;
const MAX_REPLY_ITERATIONS: u32 = 5;
/// Broker positions endpoint page size.
const POSITIONS_PAGE_SIZE: usize = 30;

/// Outcome of one signed call, before the auth-replay layer dispatches.
enum CallOutcome {
    Ok(Value),
    AuthExpired,
    Failed(BrokerError),
}

/// One step of the order confirmation dialog.
#[derive(Debug)]
enum ReplyStep {
    /// Acknowledged; the broker issued an order id.
    Ack(OrderId),
    /// A confirmation prompt that must be answered before proceeding.
    Prompt(String),
    /// The broker refused the order outright.
    Refused(String),
}

/// A thin, typed wrapper over the broker's web API.
pub struct BrokerClient {
    http: Client,
    base_url: String,
    signer: OauthSigner,
    access_token_secret: String,
    dh_prime: BigUint,
    session: Mutex<Option<Arc<LiveSessionToken>>>,
    account: Mutex<Option<String>>,
    call_timeout: Duration,
}

impl BrokerClient {
    pub fn new(settings: BrokerSettings) -> BrokerResult<Self> {
        let signature_key = load_private_key(&settings.signature_key_path)?;
        let encryption_key = load_private_key(&settings.encryption_key_path)?;
        let dh_prime = BigUint::parse_bytes(
            settings.dh_prime.trim().trim_start_matches("0x").as_bytes(),
            16,
        )
        .ok_or_else(|| BrokerError::Auth("dh_prime is not valid hex".into()))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(settings.call_timeout)
            .build()
            .map_err(|err| BrokerError::Other(format!("failed to create HTTP client: {err}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            signer: OauthSigner::new(
                settings.consumer_key,
                settings.access_token,
                settings.realm,
                signature_key,
                encryption_key,
            ),
            access_token_secret: settings.access_token_secret,
            dh_prime,
            session: Mutex::new(None),
            account: Mutex::new(settings.account_id),
            call_timeout: settings.call_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Drop the current session token, forcing re-derivation on the next
    /// authenticated call.
    pub async fn invalidate_session(&self) {
        let mut guard = self.session.lock().await;
        if guard.take().is_some() {
            info!("live session token invalidated");
        }
    }

    /// Returns a valid session token, deriving a fresh one when none is held
    /// or the held one is within the refresh threshold of expiry.
    async fn session_token(&self) -> BrokerResult<Arc<LiveSessionToken>> {
        let mut guard = self.session.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_valid(Utc::now()) {
                return Ok(Arc::clone(token));
            }
        }
        let fresh = Arc::new(self.derive_session_token().await?);
        *guard = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Full live-session-token handshake: DH challenge out, DH response and
    /// token signature back, HMAC verification before the token is stored.
    async fn derive_session_token(&self) -> BrokerResult<LiveSessionToken> {
        let url = self.url("/oauth/live_session_token");
        let decrypted_secret = self
            .signer
            .decrypt_access_token_secret(&self.access_token_secret)?;
        let prepend_hex = hex::encode(&decrypted_secret);

        let dh_random = lst::generate_dh_random(&self.dh_prime);
        let challenge_hex = lst::dh_challenge(&self.dh_prime, &dh_random).to_str_radix(16);

        let header = self
            .signer
            .lst_request_header(&url, &challenge_hex, &prepend_hex)?;
        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, header)
            .send()
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| BrokerError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(BrokerError::Auth(format!(
                "live session token request failed (status {status}): {body}"
            )));
        }
        let payload: LstResponse = serde_json::from_str(&body)
            .map_err(|err| BrokerError::Serialization(format!("bad LST response: {err}")))?;

        let dh_response = BigUint::parse_bytes(
            payload
                .diffie_hellman_response
                .trim()
                .trim_start_matches("0x")
                .as_bytes(),
            16,
        )
        .ok_or_else(|| BrokerError::Auth("diffie_hellman_response is not valid hex".into()))?;

        let shared = lst::shared_secret(&self.dh_prime, &dh_response, &dh_random);
        let token = lst::derive_token(&shared, &decrypted_secret);
        if !lst::verify_token(
            &token,
            &self.signer.consumer_key,
            &payload.live_session_token_signature,
        ) {
            return Err(BrokerError::Auth(
                "live session token signature verification failed".into(),
            ));
        }

        let expires_at = DateTime::<Utc>::from_timestamp_millis(
            payload.live_session_token_expiration,
        )
        .ok_or_else(|| BrokerError::Auth("live session token expiration out of range".into()))?;
        info!(%expires_at, "derived live session token");
        Ok(LiveSessionToken { token, expires_at })
    }

    /// One signed attempt plus transport/5xx retries; 401s and session-expiry
    /// bodies surface as a tagged outcome for the replay layer.
    async fn call_with_retry(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> CallOutcome {
        let token = match self.session_token().await {
            Ok(token) => token,
            Err(err) => return CallOutcome::Failed(err),
        };
        let url = self.url(path);

        for attempt in 1..=MAX_TRANSPORT_ATTEMPTS {
            let header = match self
                .signer
                .signed_header(method.as_str(), &url, query, &token.token)
            {
                Ok(header) => header,
                Err(err) => return CallOutcome::Failed(err),
            };
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(AUTHORIZATION, header)
                .timeout(self.call_timeout);
            if !query.is_empty() {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let result = request.send().await;
            let (status, text) = match result {
                Ok(response) => {
                    let status = response.status();
                    match response.text().await {
                        Ok(text) => (status, text),
                        Err(err) => {
                            if attempt < MAX_TRANSPORT_ATTEMPTS {
                                self.backoff(attempt).await;
                                continue;
                            }
                            return CallOutcome::Failed(BrokerError::Transport(err.to_string()));
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, attempt, %url, "broker call transport failure");
                    if attempt < MAX_TRANSPORT_ATTEMPTS {
                        self.backoff(attempt).await;
                        continue;
                    }
                    return CallOutcome::Failed(BrokerError::Transport(err.to_string()));
                }
            };

            if status == StatusCode::UNAUTHORIZED || text.contains("Session expired") {
                return CallOutcome::AuthExpired;
            }
            if status.is_server_error() {
                warn!(%status, attempt, %url, "broker call server error");
                if attempt < MAX_TRANSPORT_ATTEMPTS {
                    self.backoff(attempt).await;
                    continue;
                }
                return CallOutcome::Failed(BrokerError::Api {
                    status: status.as_u16(),
                    body: text,
                });
            }
            if !status.is_success() {
                return CallOutcome::Failed(BrokerError::Api {
                    status: status.as_u16(),
                    body: text,
                });
            }
            return match serde_json::from_str::<Value>(&text) {
                Ok(value) => CallOutcome::Ok(value),
                Err(_) if text.trim().is_empty() => CallOutcome::Ok(Value::Null),
                Err(err) => CallOutcome::Failed(BrokerError::Serialization(format!(
                    "failed to parse broker response: {err}"
                ))),
            };
        }
        unreachable!("retry loop always returns")
    }

    /// Exponential backoff with +/-20% jitter: 500ms, 1s, capped by attempts.
    async fn backoff(&self, attempt: u32) {
        let base = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let delay = Duration::from_millis((base as f64 * jitter) as u64);
        tokio::time::sleep(delay).await;
    }

    /// Signed request with the one-shot auth replay around the retrying
    /// inner call: on session expiry the token is discarded, re-derived
    /// once, and the request replayed once.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> BrokerResult<Value> {
        match self.call_with_retry(method.clone(), path, query, body).await {
            CallOutcome::Ok(value) => Ok(value),
            CallOutcome::Failed(err) => Err(err),
            CallOutcome::AuthExpired => {
                info!(%path, "session expired, re-deriving live session token and replaying");
                self.invalidate_session().await;
                match self.call_with_retry(method, path, query, body).await {
                    CallOutcome::Ok(value) => Ok(value),
                    CallOutcome::Failed(err) => Err(err),
                    CallOutcome::AuthExpired => Err(BrokerError::Auth(
                        "session expired again after replay".into(),
                    )),
                }
            }
        }
    }

    /// Keep-alive ping holding the brokerage session open.
    pub async fn tickle(&self) -> BrokerResult<()> {
        self.request_json(Method::GET, "/tickle", &[], None)
            .await
            .map(|_| ())
    }

    /// Resolve a symbol to its contract id, taking the first US stock match.
    /// `Ok(None)` means the search returned nothing usable.
    pub async fn resolve_symbol(&self, symbol: &str) -> BrokerResult<Option<Conid>> {
        let query = vec![("symbol".to_string(), symbol.to_string())];
        let value = self
            .request_json(Method::GET, "/iserver/secdef/search", &query, None)
            .await?;
        let hits: Vec<SecdefHit> = serde_json::from_value(value)
            .map_err(|err| BrokerError::Serialization(format!("bad secdef response: {err}")))?;

        let stock = hits.iter().find(|hit| {
            hit.symbol
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(symbol))
                && hit
                    .sections
                    .iter()
                    .any(|section| section.sec_type.as_deref() == Some("STK"))
        });
        let chosen = stock.or_else(|| hits.first());
        Ok(chosen.and_then(|hit| hit.conid()))
    }

    /// Last/bid/ask snapshot (fields 31, 84, 86).
    pub async fn market_snapshot(&self, conid: Conid) -> BrokerResult<MarketSnapshot> {
        let query = vec![
            ("conids".to_string(), conid.to_string()),
            ("fields".to_string(), "31,84,86".to_string()),
        ];
        let value = self
            .request_json(Method::GET, "/iserver/marketdata/snapshot", &query, None)
            .await?;
        let rows = value
            .as_array()
            .ok_or_else(|| BrokerError::Serialization("snapshot response is not a list".into()))?;
        let row = rows.first().cloned().unwrap_or(Value::Null);
        Ok(MarketSnapshot {
            conid,
            last: parse_price_field(row.get("31")),
            bid: parse_price_field(row.get("84")),
            ask: parse_price_field(row.get("86")),
        })
    }

    /// The account the engine trades: configured id if present, otherwise
    /// the first account the broker reports, cached for the process.
    pub async fn account_id(&self) -> BrokerResult<String> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }
        let value = self
            .request_json(Method::GET, "/iserver/accounts", &[], None)
            .await?;
        let accounts: AccountsResponse = serde_json::from_value(value)
            .map_err(|err| BrokerError::Serialization(format!("bad accounts response: {err}")))?;
        let account = accounts
            .selected_account
            .or_else(|| accounts.accounts.into_iter().next())
            .ok_or_else(|| BrokerError::Other("broker reports no accounts".into()))?;
        info!(%account, "discovered brokerage account");
        *guard = Some(account.clone());
        Ok(account)
    }

    /// Submit an order, automatically answering the broker's confirmation
    /// prompts. The reply dialog is a bounded state machine: each prompt is
    /// confirmed with `true`, and the budget caps runaway dialogs.
    pub async fn place_order(&self, account: &str, ticket: &OrderTicket) -> BrokerResult<OrderId> {
        let mut order = json!({
            "acctId": account,
            "conid": ticket.conid,
            "orderType": ticket.order_type.as_str(),
            "side": ticket.side.as_str(),
            "tif": ticket.tif.as_str(),
            "quantity": ticket.quantity,
        });
        if let Some(price) = ticket.price {
            order["price"] = json!(price);
        }
        if let Some(coid) = &ticket.client_order_id {
            order["cOID"] = json!(coid);
        }
        let payload = json!({ "orders": [order] });

        let mut response = self
            .request_json(
                Method::POST,
                &format!("/iserver/account/{account}/orders"),
                &[],
                Some(&payload),
            )
            .await?;

        for _ in 0..MAX_REPLY_ITERATIONS {
            match interpret_order_response(&response)? {
                ReplyStep::Ack(order_id) => return Ok(order_id),
                ReplyStep::Refused(message) => {
                    return Err(BrokerError::OrderProtocol(message));
                }
                ReplyStep::Prompt(reply_id) => {
                    debug!(%reply_id, "answering order confirmation prompt");
                    response = self
                        .request_json(
                            Method::POST,
                            &format!("/iserver/reply/{reply_id}"),
                            &[],
                            Some(&json!({ "confirmed": true })),
                        )
                        .await?;
                }
            }
        }
        Err(BrokerError::OrderProtocol(format!(
            "confirmation replies exceeded budget of {MAX_REPLY_ITERATIONS}"
        )))
    }

    /// Orders currently known to the brokerage session.
    pub async fn live_orders(&self) -> BrokerResult<Vec<LiveOrder>> {
        let value = self
            .request_json(Method::GET, "/iserver/account/orders", &[], None)
            .await?;
        let response: LiveOrdersResponse = serde_json::from_value(value)
            .map_err(|err| BrokerError::Serialization(format!("bad orders response: {err}")))?;
        Ok(response.orders)
    }

    /// All positions for an account, walking the paginated endpoint.
    pub async fn positions(&self, account: &str) -> BrokerResult<Vec<Position>> {
        let mut positions = Vec::new();
        for page in 0.. {
            let value = self
                .request_json(
                    Method::GET,
                    &format!("/portfolio/{account}/positions/{page}"),
                    &[],
                    None,
                )
                .await?;
            let rows: Vec<PositionRow> = serde_json::from_value(value).map_err(|err| {
                BrokerError::Serialization(format!("bad positions response: {err}"))
            })?;
            let count = rows.len();
            positions.extend(rows.into_iter().map(PositionRow::into_position));
            if count < POSITIONS_PAGE_SIZE {
                break;
            }
        }
        Ok(positions)
    }
}

/// Classify one response of the order dialog.
fn interpret_order_response(value: &Value) -> BrokerResult<ReplyStep> {
    let first = match value {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    if let Some(order_id) = first.get("order_id").and_then(value_as_string) {
        return Ok(ReplyStep::Ack(order_id));
    }
    if let Some(reply_id) = first.get("id").and_then(value_as_string) {
        return Ok(ReplyStep::Prompt(reply_id));
    }
    if let Some(error) = first
        .get("error")
        .or_else(|| value.get("error"))
        .and_then(value_as_string)
    {
        return Ok(ReplyStep::Refused(error));
    }
    Err(BrokerError::OrderProtocol(format!(
        "unrecognized order response: {value}"
    )))
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Snapshot fields occasionally carry a letter prefix (e.g. `C` marking a
/// close price); strip anything before the numeric part.
fn parse_price_field(value: Option<&Value>) -> Option<Decimal> {
    let raw = match value? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let trimmed = raw.trim_start_matches(|c: char| !c.is_ascii_digit() && c != '-' && c != '.');
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

#[derive(Deserialize)]
struct LstResponse {
    diffie_hellman_response: String,
    live_session_token_signature: String,
    live_session_token_expiration: i64,
}

#[derive(Deserialize)]
struct SecdefHit {
    conid: Option<Value>,
    symbol: Option<String>,
    #[serde(default)]
    sections: Vec<SecdefSection>,
}

impl SecdefHit {
    fn conid(&self) -> Option<Conid> {
        match self.conid.as_ref()? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct SecdefSection {
    #[serde(rename = "secType")]
    sec_type: Option<String>,
}

#[derive(Deserialize)]
struct AccountsResponse {
    #[serde(default)]
    accounts: Vec<String>,
    #[serde(rename = "selectedAccount")]
    selected_account: Option<String>,
}

/// An order as reported by the live orders endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct LiveOrder {
    #[serde(rename = "orderId")]
    pub order_id: Value,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "totalSize", default)]
    pub total_size: Option<Value>,
}

#[derive(Deserialize, Default)]
struct LiveOrdersResponse {
    #[serde(default)]
    orders: Vec<LiveOrder>,
}

#[derive(Deserialize)]
struct PositionRow {
    conid: i64,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(rename = "contractDesc", default)]
    contract_desc: Option<String>,
    position: Decimal,
    #[serde(rename = "mktPrice", default)]
    mkt_price: Option<Decimal>,
    #[serde(rename = "mktValue", default)]
    mkt_value: Option<Decimal>,
}

impl PositionRow {
    fn into_position(self) -> Position {
        Position {
            conid: self.conid,
            symbol: self
                .ticker
                .or(self.contract_desc)
                .unwrap_or_default(),
            quantity: self.position,
            market_price: self.mkt_price,
            market_value: self.mkt_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_ack_is_recognized() {
        let response = json!([{ "order_id": "1234", "order_status": "Submitted" }]);
        match interpret_order_response(&response).unwrap() {
            ReplyStep::Ack(id) => assert_eq!(id, "1234"),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn numeric_order_id_is_stringified() {
        let response = json!([{ "order_id": 987654 }]);
        match interpret_order_response(&response).unwrap() {
            ReplyStep::Ack(id) => assert_eq!(id, "987654"),
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn confirmation_prompt_is_recognized() {
        let response = json!([{ "id": "reply-1", "message": ["You are about to..."] }]);
        match interpret_order_response(&response).unwrap() {
            ReplyStep::Prompt(id) => assert_eq!(id, "reply-1"),
            other => panic!("expected prompt, got {other:?}"),
        }
    }

    #[test]
    fn error_object_is_refusal() {
        let response = json!({ "error": "insufficient funds" });
        match interpret_order_response(&response).unwrap() {
            ReplyStep::Refused(message) => assert!(message.contains("insufficient")),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[test]
    fn price_fields_tolerate_letter_prefixes() {
        assert_eq!(
            parse_price_field(Some(&json!("200.00"))),
            Some(Decimal::new(20000, 2))
        );
        assert_eq!(
            parse_price_field(Some(&json!("C199.50"))),
            Some(Decimal::new(19950, 2))
        );
        assert_eq!(parse_price_field(Some(&json!(42))), Some(Decimal::from(42)));
        assert_eq!(parse_price_field(Some(&json!(""))), None);
        assert_eq!(parse_price_field(None), None);
    }
}
