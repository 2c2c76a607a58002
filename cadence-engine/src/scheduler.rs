//! Daily trigger and health tick in the business timezone.
//!
//! A single cooperative loop sleeps until the next fire instant, computed
//! fresh after every wake-up so wall-clock jumps can only skip a tick, never
//! replay one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{EngineError, OrderEngine, Trigger};

/// Status snapshot maintained for the operator surfaces.
#[derive(Clone, Debug)]
pub struct SchedulerStatus {
    pub started_at: DateTime<Utc>,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_health_tick: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    engine: Arc<OrderEngine>,
    fire_time: NaiveTime,
    timezone: Tz,
    health_interval: Duration,
    misfire_grace: chrono::Duration,
    status: Arc<Mutex<SchedulerStatus>>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<OrderEngine>,
        fire_time: NaiveTime,
        timezone: Tz,
        health_interval: Duration,
        misfire_grace: chrono::Duration,
    ) -> Self {
        Self {
            engine,
            fire_time,
            timezone,
            health_interval,
            misfire_grace,
            status: Arc::new(Mutex::new(SchedulerStatus {
                started_at: Utc::now(),
                next_fire: None,
                last_health_tick: None,
            })),
        }
    }

    /// Shared handle for the status endpoint.
    #[must_use]
    pub fn status_handle(&self) -> Arc<Mutex<SchedulerStatus>> {
        Arc::clone(&self.status)
    }

    /// The first instant strictly after `now` at which the daily trigger
    /// fires.
    #[must_use]
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_fire_after(self.fire_time, self.timezone, now)
    }

    /// Run until cancelled. Engine failures propagate so the supervisor can
    /// restart the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next = self.next_fire_after(Utc::now());
            self.status.lock().expect("status lock").next_fire = Some(next);
            info!(next_fire = %next, "scheduler armed");

            // Wait for the fire instant, serving health ticks meanwhile.
            loop {
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("scheduler stopped");
                        return Ok(());
                    }
                    _ = health.tick() => {
                        self.health_tick();
                    }
                    _ = tokio::time::sleep(wait) => break,
                }
            }

            let now = Utc::now();
            if now - next > self.misfire_grace {
                // The process slept past the fire time. Skip, never replay.
                warn!(scheduled = %next, woke = %now, "missed fire time beyond grace, skipping tick");
                continue;
            }

            match self.engine.execute_due(now, Trigger::Scheduled).await {
                Ok(aggregate) => {
                    info!(
                        total = aggregate.total(),
                        successes = aggregate.successes(),
                        "scheduled run complete"
                    );
                }
                Err(EngineError::Busy) => {
                    warn!("scheduled run skipped, engine busy");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn health_tick(&self) {
        let mut status = self.status.lock().expect("status lock");
        status.last_health_tick = Some(Utc::now());
        debug!(
            next_fire = ?status.next_fire,
            uptime_secs = (Utc::now() - status.started_at).num_seconds(),
            "health tick"
        );
    }
}

/// The first instant strictly after `now` at which a daily `fire_time`
/// trigger fires in `tz`, DST-aware. A nonexistent local time
/// (spring-forward gap) falls through to the next day.
#[must_use]
pub fn next_fire_after(fire_time: NaiveTime, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_today = now.with_timezone(&tz).date_naive();
    for day_offset in 0..3 {
        let date = local_today + Days::new(day_offset);
        let candidate = tz.from_local_datetime(&date.and_time(fire_time)).earliest();
        if let Some(candidate) = candidate {
            let candidate = candidate.with_timezone(&Utc);
            if candidate > now {
                return candidate;
            }
        }
    }
    // Every zone has a representable fire time within three days.
    now + chrono::Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;

    fn scheduler_at(fire: &str) -> (NaiveTime, Tz) {
        (
            NaiveTime::parse_from_str(fire, "%H:%M").unwrap(),
            New_York,
        )
    }

    fn next_fire(fire_time: NaiveTime, tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
        next_fire_after(fire_time, tz, now)
    }

    #[test]
    fn fires_today_when_before_fire_time() {
        let (fire_time, tz) = scheduler_at("09:00");
        // 2025-06-10 08:00 EDT == 12:00 UTC.
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();
        let next = next_fire(fire_time, tz, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 10, 13, 0, 0).unwrap());
    }

    #[test]
    fn fires_tomorrow_when_past_fire_time() {
        let (fire_time, tz) = scheduler_at("09:00");
        // 2025-06-10 10:30 EDT.
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 14, 30, 0).unwrap();
        let next = next_fire(fire_time, tz, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 6, 11, 13, 0, 0).unwrap());
    }

    #[test]
    fn honors_dst_transition() {
        let (fire_time, tz) = scheduler_at("09:00");
        // 2025-11-01 is EDT (UTC-4); 2025-11-02 the US falls back to EST
        // (UTC-5), so 09:00 local moves from 13:00 to 14:00 UTC.
        let now = Utc.with_ymd_and_hms(2025, 11, 1, 20, 0, 0).unwrap();
        let next = next_fire(fire_time, tz, now);
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 11, 2, 14, 0, 0).unwrap());
    }

    #[test]
    fn nonexistent_local_time_rolls_forward() {
        // 02:30 does not exist on 2025-03-09 in New York (spring forward).
        let (fire_time, tz) = scheduler_at("02:30");
        let now = Utc.with_ymd_and_hms(2025, 3, 9, 5, 0, 0).unwrap();
        let next = next_fire(fire_time, tz, now);
        // Next representable 02:30 local is March 10, 06:30 UTC (EDT).
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 6, 30, 0).unwrap());
    }
}
