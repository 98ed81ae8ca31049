use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::manager::StopwatchManager;

const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Snapshot published to the stopwatch display on every tick.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub struct StopwatchView {
    pub elapsed_seconds: i64,
    pub target_reached: bool,
}

/// Drives [StopwatchManager::tick] once a second until cancelled,
/// publishing the recomputed view. Ticks only read the clock; the
/// persisted slot is never touched after `start`, so a missed or
/// doubled tick cannot skew anything.
pub async fn run_ticker(
    manager: Arc<Mutex<StopwatchManager>>,
    display: watch::Sender<StopwatchView>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut next_tick = tokio::time::Instant::now();
    loop {
        let view = {
            let mut manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
            let elapsed_seconds = manager.tick();
            StopwatchView {
                elapsed_seconds,
                target_reached: manager.target_reached(),
            }
        };
        let _ = display.send(view);

        next_tick += TICK_PERIOD;
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep_until(next_tick) => (),
        }
    }
}
