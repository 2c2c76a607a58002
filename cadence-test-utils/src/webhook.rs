//! Capture sink standing in for the notification webhook.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hyper::body::to_bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Inner {
    payloads: Vec<Value>,
    rate_limit_next: bool,
}

#[derive(Clone, Default)]
pub struct WebhookState {
    inner: Arc<Mutex<Inner>>,
}

impl WebhookState {
    /// Everything POSTed so far.
    pub async fn payloads(&self) -> Vec<Value> {
        self.inner.lock().await.payloads.clone()
    }

    /// Make the next POST answer 429 with a `Retry-After`.
    pub async fn rate_limit_next(&self) {
        self.inner.lock().await.rate_limit_next = true;
    }
}

pub struct MockWebhook {
    addr: SocketAddr,
    state: WebhookState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockWebhook {
    pub async fn start() -> Result<Self> {
        let state = WebhookState::default();
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let std_listener = listener.into_std()?;
        std_listener.set_nonblocking(true)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let route_state = state.clone();
        let make_svc = make_service_fn(move |_| {
            let state = route_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(capture(req, state).await) }
                }))
            }
        });
        let server = Server::from_tcp(std_listener)?.serve(make_svc);
        let handle = tokio::spawn(async move {
            let _ = server
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}/webhook", self.addr)
    }

    #[must_use]
    pub fn state(&self) -> WebhookState {
        self.state.clone()
    }
}

impl Drop for MockWebhook {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn capture(req: Request<Body>, state: WebhookState) -> Response<Body> {
    let body = to_bytes(req.into_body()).await.unwrap_or_default();
    let mut inner = state.inner.lock().await;
    if inner.rate_limit_next {
        inner.rate_limit_next = false;
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("Retry-After", "1")
            .body(Body::empty())
            .expect("response construction cannot fail");
    }
    if let Ok(payload) = serde_json::from_slice(&body) {
        inner.payloads.push(payload);
    }
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .expect("response construction cannot fail")
}
