//! In-process mock of the broker's web API.
//!
//! Performs the server side of the live-session-token handshake with real
//! math, then validates the HMAC signature of every authenticated request
//! against the token it issued — so tests exercise the production signing
//! path end to end. Behavior is scripted through [`BrokerState`]: symbol
//! tables, snapshots, confirmation prompts, injected failures.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hmac::{Hmac, Mac};
use hyper::body::to_bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use num_bigint::BigUint;
use rand::RngCore;
use serde_json::{json, Value};
use sha1::Sha1;
use sha2::Sha256;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use cadence_broker::lst::to_signed_magnitude_bytes;
use cadence_broker::signer::base_string;

use crate::keys::{TestKeys, TEST_DH_PRIME_HEX};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Scripted behavior and observed traffic.
#[derive(Default)]
struct Inner {
    symbols: HashMap<String, i64>,
    /// conid -> (last, bid, ask), each omitted when None.
    snapshots: HashMap<i64, (Option<String>, Option<String>, Option<String>)>,
    accounts: Vec<String>,
    positions: Vec<Value>,
    /// Prompts the next order dialog walks through before the ack.
    confirmation_prompts: u32,
    pending_prompts: u32,
    fail_unauthorized: u32,
    fail_server_errors: u32,
    /// 401 exactly when the nth (1-based) order submission arrives.
    fail_unauthorized_on_order: Option<u32>,
    order_submissions_seen: u32,
    reject_next_order: Option<String>,
    corrupt_lst_signature: bool,
    next_order_id: u64,
    placed: Vec<Value>,
    replies: Vec<String>,
    tickles: u64,
    lst_derivations: u64,
    lst: Option<Vec<u8>>,
}

/// Shared handle onto the mock's state.
#[derive(Clone)]
pub struct BrokerState {
    prime: BigUint,
    consumer_key: String,
    secret: Vec<u8>,
    inner: Arc<Mutex<Inner>>,
}

impl BrokerState {
    fn new(keys: &TestKeys) -> Self {
        Self {
            prime: BigUint::parse_bytes(TEST_DH_PRIME_HEX.as_bytes(), 16).expect("prime hex"),
            consumer_key: keys.consumer_key.clone(),
            secret: keys.access_token_secret_plain.clone(),
            inner: Arc::new(Mutex::new(Inner {
                accounts: vec!["DU1234567".into()],
                next_order_id: 1000,
                ..Inner::default()
            })),
        }
    }

    pub async fn set_symbol(&self, symbol: &str, conid: i64) {
        self.inner
            .lock()
            .await
            .symbols
            .insert(symbol.to_uppercase(), conid);
    }

    pub async fn set_snapshot(
        &self,
        conid: i64,
        last: Option<&str>,
        bid: Option<&str>,
        ask: Option<&str>,
    ) {
        self.inner.lock().await.snapshots.insert(
            conid,
            (
                last.map(String::from),
                bid.map(String::from),
                ask.map(String::from),
            ),
        );
    }

    /// Make the next order dialog issue `count` confirmation prompts before
    /// acknowledging.
    pub async fn set_confirmation_prompts(&self, count: u32) {
        self.inner.lock().await.confirmation_prompts = count;
    }

    /// Answer the next `count` authenticated requests with 401.
    pub async fn fail_unauthorized(&self, count: u32) {
        self.inner.lock().await.fail_unauthorized = count;
    }

    /// Answer the next `count` authenticated requests with 500.
    pub async fn fail_server_errors(&self, count: u32) {
        self.inner.lock().await.fail_server_errors = count;
    }

    /// Answer the nth (1-based) order submission with a 401, once.
    pub async fn fail_unauthorized_on_order(&self, nth: u32) {
        self.inner.lock().await.fail_unauthorized_on_order = Some(nth);
    }

    /// Refuse the next order with an error object.
    pub async fn reject_next_order(&self, message: &str) {
        self.inner.lock().await.reject_next_order = Some(message.to_string());
    }

    /// Hand out a bogus token signature on the next handshake.
    pub async fn corrupt_lst_signature(&self, corrupt: bool) {
        self.inner.lock().await.corrupt_lst_signature = corrupt;
    }

    pub async fn set_positions(&self, positions: Vec<Value>) {
        self.inner.lock().await.positions = positions;
    }

    pub async fn placed_orders(&self) -> Vec<Value> {
        self.inner.lock().await.placed.clone()
    }

    pub async fn confirmed_replies(&self) -> Vec<String> {
        self.inner.lock().await.replies.clone()
    }

    pub async fn tickle_count(&self) -> u64 {
        self.inner.lock().await.tickles
    }

    pub async fn lst_derivation_count(&self) -> u64 {
        self.inner.lock().await.lst_derivations
    }
}

/// The running mock server.
pub struct MockBroker {
    addr: SocketAddr,
    state: BrokerState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(keys: &TestKeys) -> Result<Self> {
        let state = BrokerState::new(keys);
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let std_listener = listener.into_std()?;
        std_listener.set_nonblocking(true)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let route_state = state.clone();
        let make_svc = make_service_fn(move |_| {
            let state = route_state.clone();
            let addr = addr;
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(route(req, state, addr).await) }
                }))
            }
        });
        let server = Server::from_tcp(std_listener)?.serve(make_svc);
        let handle = tokio::spawn(async move {
            if let Err(err) = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %err, "mock broker server exited with error");
            }
        });
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        self.state.clone()
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn route(req: Request<Body>, state: BrokerState, addr: SocketAddr) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();
    let body_bytes = match to_bytes(body).await {
        Ok(bytes) => bytes,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    if method == Method::POST && path == "/oauth/live_session_token" {
        return handle_lst(&parts, state).await;
    }

    // Everything else is an authenticated call.
    if let Some(resp) = check_auth(&parts, &state, addr, &path, &query).await {
        return resp;
    }
    if let Some(resp) = injected_failure(&state).await {
        return resp;
    }

    match (method, path.as_str()) {
        (Method::GET, "/tickle") => {
            state.inner.lock().await.tickles += 1;
            json_response(json!({ "session": "mock", "iserver": { "authStatus": { "authenticated": true } } }))
        }
        (Method::GET, "/iserver/secdef/search") => handle_secdef(&state, &query).await,
        (Method::GET, "/iserver/marketdata/snapshot") => handle_snapshot(&state, &query).await,
        (Method::GET, "/iserver/accounts") => {
            let inner = state.inner.lock().await;
            json_response(json!({
                "accounts": inner.accounts,
                "selectedAccount": inner.accounts.first(),
            }))
        }
        (Method::GET, "/iserver/account/orders") => {
            json_response(json!({ "orders": [] }))
        }
        (Method::POST, _) if path.starts_with("/iserver/reply/") => {
            let reply_id = path.trim_start_matches("/iserver/reply/").to_string();
            handle_reply(&state, reply_id, &body_bytes).await
        }
        (Method::POST, _)
            if path.starts_with("/iserver/account/") && path.ends_with("/orders") =>
        {
            handle_order_create(&state, &body_bytes).await
        }
        (Method::GET, _) if path.starts_with("/portfolio/") => handle_positions(&state, &path).await,
        _ => error_response(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

/// Server side of the token handshake, with real Diffie-Hellman math.
async fn handle_lst(parts: &hyper::http::request::Parts, state: BrokerState) -> Response<Body> {
    let Some(params) = oauth_params(parts) else {
        return error_response(StatusCode::UNAUTHORIZED, "missing OAuth header");
    };
    if params.get("oauth_consumer_key").map(String::as_str) != Some(state.consumer_key.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "unknown consumer key");
    }
    let Some(challenge_hex) = params.get("diffie_hellman_challenge") else {
        return error_response(StatusCode::BAD_REQUEST, "missing diffie_hellman_challenge");
    };
    let Some(challenge) = BigUint::parse_bytes(challenge_hex.as_bytes(), 16) else {
        return error_response(StatusCode::BAD_REQUEST, "challenge is not hex");
    };

    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);
    let server_random = BigUint::from_bytes_be(&random) % (&state.prime - 2u8) + 2u8;
    let response = BigUint::from(2u8).modpow(&server_random, &state.prime);
    let shared = challenge.modpow(&server_random, &state.prime);

    let mut mac =
        HmacSha1::new_from_slice(&to_signed_magnitude_bytes(&shared)).expect("HMAC key");
    mac.update(&state.secret);
    let token = mac.finalize().into_bytes().to_vec();

    let mut inner = state.inner.lock().await;
    inner.lst_derivations += 1;
    let signature = if inner.corrupt_lst_signature {
        "deadbeef".to_string()
    } else {
        let mut sig_mac = HmacSha1::new_from_slice(&token).expect("HMAC key");
        sig_mac.update(state.consumer_key.as_bytes());
        hex::encode(sig_mac.finalize().into_bytes())
    };
    inner.lst = Some(token);

    let expiration = chrono::Utc::now().timestamp_millis() + 24 * 3600 * 1000;
    json_response(json!({
        "diffie_hellman_response": response.to_str_radix(16),
        "live_session_token_signature": signature,
        "live_session_token_expiration": expiration,
    }))
}

/// Validate the HMAC-SHA256 request signature against the issued token.
/// Returns an error response on failure, None when the request is good.
async fn check_auth(
    parts: &hyper::http::request::Parts,
    state: &BrokerState,
    addr: SocketAddr,
    path: &str,
    query: &str,
) -> Option<Response<Body>> {
    let Some(token) = state.inner.lock().await.lst.clone() else {
        return Some(error_response(StatusCode::UNAUTHORIZED, "no session"));
    };
    let Some(params) = oauth_params(parts) else {
        return Some(error_response(StatusCode::UNAUTHORIZED, "missing OAuth header"));
    };
    let Some(signature) = params.get("oauth_signature") else {
        return Some(error_response(StatusCode::UNAUTHORIZED, "missing signature"));
    };
    let claimed = percent_decode(signature);

    let mut base_params: Vec<(String, String)> = params
        .iter()
        .filter(|(key, _)| *key != "oauth_signature" && *key != "realm")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        base_params.push((percent_decode(key), percent_decode(value)));
    }

    let url = format!("http://{addr}{path}");
    let base = base_string(parts.method.as_str(), &url, &base_params);
    let mut mac = HmacSha256::new_from_slice(&token).expect("HMAC key");
    mac.update(base.as_bytes());
    let expected = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        mac.finalize().into_bytes(),
    );

    if expected != claimed {
        return Some(error_response(
            StatusCode::UNAUTHORIZED,
            "request signature mismatch",
        ));
    }
    None
}

async fn injected_failure(state: &BrokerState) -> Option<Response<Body>> {
    let mut inner = state.inner.lock().await;
    if inner.fail_unauthorized > 0 {
        inner.fail_unauthorized -= 1;
        return Some(error_response(StatusCode::UNAUTHORIZED, "Session expired"));
    }
    if inner.fail_server_errors > 0 {
        inner.fail_server_errors -= 1;
        return Some(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "injected server error",
        ));
    }
    None
}

async fn handle_secdef(state: &BrokerState, query: &str) -> Response<Body> {
    let symbol = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("symbol="))
        .map(percent_decode)
        .unwrap_or_default()
        .to_uppercase();
    let inner = state.inner.lock().await;
    match inner.symbols.get(&symbol) {
        Some(conid) => json_response(json!([{
            "conid": conid.to_string(),
            "symbol": symbol,
            "description": "NASDAQ",
            "sections": [{ "secType": "STK" }],
        }])),
        None => json_response(json!([])),
    }
}

async fn handle_snapshot(state: &BrokerState, query: &str) -> Response<Body> {
    let conid: i64 = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("conids="))
        .and_then(|raw| percent_decode(raw).parse().ok())
        .unwrap_or_default();
    let inner = state.inner.lock().await;
    let mut row = json!({ "conid": conid });
    if let Some((last, bid, ask)) = inner.snapshots.get(&conid) {
        if let Some(last) = last {
            row["31"] = json!(last);
        }
        if let Some(bid) = bid {
            row["84"] = json!(bid);
        }
        if let Some(ask) = ask {
            row["86"] = json!(ask);
        }
    }
    json_response(json!([row]))
}

async fn handle_order_create(state: &BrokerState, body: &[u8]) -> Response<Body> {
    let payload: Value = match serde_json::from_slice(body) {
        Ok(payload) => payload,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let mut inner = state.inner.lock().await;
    inner.order_submissions_seen += 1;
    if inner.fail_unauthorized_on_order == Some(inner.order_submissions_seen) {
        inner.fail_unauthorized_on_order = None;
        return error_response(StatusCode::UNAUTHORIZED, "Session expired");
    }
    if let Some(message) = inner.reject_next_order.take() {
        return json_response(json!({ "error": message }));
    }
    inner.placed.push(payload);
    if inner.confirmation_prompts > 0 {
        inner.pending_prompts = inner.confirmation_prompts;
        inner.confirmation_prompts = 0;
        return json_response(json!([{
            "id": format!("reply-{}", inner.pending_prompts),
            "message": ["You are about to submit a market order."],
        }]));
    }
    inner.next_order_id += 1;
    let order_id = inner.next_order_id;
    json_response(json!([{ "order_id": order_id.to_string(), "order_status": "Submitted" }]))
}

async fn handle_reply(state: &BrokerState, reply_id: String, body: &[u8]) -> Response<Body> {
    let confirmed = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("confirmed").and_then(Value::as_bool))
        .unwrap_or(false);
    if !confirmed {
        return error_response(StatusCode::BAD_REQUEST, "reply must confirm");
    }
    let mut inner = state.inner.lock().await;
    inner.replies.push(reply_id);
    inner.pending_prompts = inner.pending_prompts.saturating_sub(1);
    if inner.pending_prompts > 0 {
        let next = json!([{
            "id": format!("reply-{}", inner.pending_prompts),
            "message": ["One more confirmation."],
        }]);
        return json_response(next);
    }
    inner.next_order_id += 1;
    let order_id = inner.next_order_id;
    json_response(json!([{ "order_id": order_id.to_string(), "order_status": "Submitted" }]))
}

async fn handle_positions(state: &BrokerState, path: &str) -> Response<Body> {
    let page: usize = path
        .rsplit('/')
        .next()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0);
    let inner = state.inner.lock().await;
    let start = page * 30;
    let rows: Vec<Value> = inner
        .positions
        .iter()
        .skip(start)
        .take(30)
        .cloned()
        .collect();
    json_response(Value::Array(rows))
}

/// Parse `OAuth realm="...", k="v", ...` into a map.
fn oauth_params(parts: &hyper::http::request::Parts) -> Option<HashMap<String, String>> {
    let header = parts.headers.get("authorization")?.to_str().ok()?;
    let rest = header.strip_prefix("OAuth ")?;
    let mut params = HashMap::new();
    for piece in rest.split(", ") {
        let (key, value) = piece.split_once('=')?;
        params.insert(key.to_string(), value.trim_matches('"').to_string());
    }
    Some(params)
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[index + 1..index + 3], 16) {
                out.push(byte);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn json_response(body: Value) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("response construction cannot fail")
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(json!({ "error": message }).to_string()))
        .expect("response construction cannot fail")
}
