//! Local HTTP surface: manual trigger, status, health.
//!
//! Bound to loopback and unauthenticated by design; the only callers are
//! the CLI and the operator's curl.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadence_core::Frequency;
use cadence_engine::{EngineError, OrderEngine, SchedulerStatus, Trigger};

/// Everything a request handler can reach.
pub struct HttpState {
    pub engine: Arc<OrderEngine>,
    pub scheduler_status: Arc<Mutex<SchedulerStatus>>,
}

/// Launch the loopback API server. Shuts down when the token is cancelled.
pub fn spawn_http_server(
    addr: SocketAddr,
    state: Arc<HttpState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let make_svc = make_service_fn(move |_| {
            let state = Arc::clone(&state);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(route(req, state).await) }
                }))
            }
        });
        let server = Server::bind(&addr).serve(make_svc);
        info!(%addr, "local API listening");
        let graceful = server.with_graceful_shutdown(async move {
            cancel.cancelled().await;
        });
        if let Err(err) = graceful.await {
            error!(error = %err, %addr, "local API server terminated");
        } else {
            info!(%addr, "local API server shutdown");
        }
    })
}

async fn route(req: Request<Body>, state: Arc<HttpState>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    match (method, path.as_str()) {
        (Method::POST, "/recurring/execute") => handle_execute(state, query.as_deref()).await,
        (Method::GET, "/recurring/status") => handle_status(state).await,
        (Method::GET, "/service/health") => json_response(
            StatusCode::OK,
            json!({ "status": "healthy", "timestamp": Utc::now().to_rfc3339() }),
        ),
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({ "status": "error", "message": "not found" }),
        ),
    }
}

async fn handle_execute(state: Arc<HttpState>, query: Option<&str>) -> Response<Body> {
    let frequency = match query_param(query, "frequency") {
        None => None,
        Some(raw) => match Frequency::from_str(&raw) {
            Ok(frequency) => Some(frequency),
            Err(err) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    json!({ "status": "error", "message": err }),
                )
            }
        },
    };

    match state
        .engine
        .execute_due(Utc::now(), Trigger::Manual { frequency })
        .await
    {
        Ok(aggregate) => json_response(
            StatusCode::OK,
            json!({
                "status": "ok",
                "total": aggregate.total(),
                "successes": aggregate.successes(),
                "failures": aggregate.failures(),
                "total_notional": aggregate.total_notional(),
                "results": aggregate.results,
            }),
        ),
        Err(EngineError::Busy) => {
            json_response(StatusCode::CONFLICT, json!({ "status": "busy" }))
        }
        Err(err @ (EngineError::Sheet(_) | EngineError::Broker(_))) => json_response(
            StatusCode::BAD_GATEWAY,
            json!({ "status": "error", "message": err.to_string() }),
        ),
    }
}

async fn handle_status(state: Arc<HttpState>) -> Response<Body> {
    let stats = state.engine.stats();
    let scheduler = state
        .scheduler_status
        .lock()
        .expect("scheduler status lock")
        .clone();
    let due_preview = state.engine.due_preview().await.unwrap_or_default();
    let uptime_secs = (Utc::now() - scheduler.started_at).num_seconds();

    json_response(
        StatusCode::OK,
        json!({
            "status": "running",
            "started_at": scheduler.started_at.to_rfc3339(),
            "uptime_secs": uptime_secs,
            "next_fire": scheduler.next_fire.map(|t| t.to_rfc3339()),
            "last_health_tick": scheduler.last_health_tick.map(|t| t.to_rfc3339()),
            "statistics": {
                "executions": stats.executions,
                "successes": stats.successes,
                "failures": stats.failures,
                "last_run_at": stats.last_run_at.map(|t| t.to_rfc3339()),
                "last_summary": stats.last_summary,
                "last_error": stats.last_error,
            },
            "due_today": due_preview,
        }),
    )
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("response construction cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_are_extracted() {
        assert_eq!(
            query_param(Some("frequency=daily"), "frequency").as_deref(),
            Some("daily")
        );
        assert_eq!(
            query_param(Some("a=1&frequency=weekly"), "frequency").as_deref(),
            Some("weekly")
        );
        assert_eq!(query_param(Some("a=1"), "frequency"), None);
        assert_eq!(query_param(None, "frequency"), None);
    }
}
