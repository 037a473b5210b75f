//! Periodic background loops.
//!
//! [`run_periodic`] drives an interval-based job until the shutdown signal
//! fires. Ticks that arrive while a run is still in progress are skipped,
//! never queued. [`SingleFlight`] extends the same guarantee to callers
//! that trigger a job out of band (e.g. an operator-requested sweep).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Run `job` every `interval` until `shutdown` fires.
///
/// The first run happens one full interval after start. A shutdown
/// received while a run is in progress takes effect once it completes.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                job().await;
            }
            _ = shutdown.changed() => {
                info!(task = name, "periodic task shutting down");
                break;
            }
        }
    }
}

/// Guarantees at most one concurrent execution of a job.
#[derive(Clone, Default)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

/// Held while the job runs; releases the flight on drop.
pub struct FlightGuard {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flight, or `None` if a run is already active.
    pub fn try_begin(&self) -> Option<FlightGuard> {
        match self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(FlightGuard {
                busy: Arc::clone(&self.busy),
            }),
            Err(_) => {
                debug!("single-flight job already running, skipping");
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
