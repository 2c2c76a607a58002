//! Session keep-alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::BrokerClient;

/// Consecutive failures after which the session token is presumed dead.
const FAILURE_LIMIT: u32 = 3;

/// Spawn the background keep-alive loop. Failures are logged and never take
/// the process down; three in a row invalidate the live session token so the
/// next authenticated call derives a fresh one.
pub fn spawn_tickler(
    client: Arc<BrokerClient>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("tickler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match client.tickle().await {
                        Ok(()) => {
                            consecutive_failures = 0;
                            debug!("tickle ok");
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            warn!(
                                error = %err,
                                failures = consecutive_failures,
                                "tickle failed"
                            );
                            if consecutive_failures >= FAILURE_LIMIT {
                                warn!("{FAILURE_LIMIT} consecutive tickle failures, invalidating session");
                                client.invalidate_session().await;
                                consecutive_failures = 0;
                            }
                        }
                    }
                }
            }
        }
    })
}
