//! Single-slot, latest-value-wins buffer between the stream worker and the
//! fixed-cadence consumer.
//!
//! Pushes never queue: a newer update replaces the pending one, except that
//! fields the newer update lacks are kept from the pending one, so a trade
//! print survives a book update landing in the same interval. Lock hold time
//! is O(1) on both sides.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::types::FeedUpdate;

/// 20 Hz.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
pub struct UpdateThrottle {
    slot: Mutex<Option<FeedUpdate>>,
}

impl UpdateThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, update: FeedUpdate) {
        if update.is_empty() {
            return;
        }
        let mut slot = self.slot.lock();
        *slot = Some(match slot.take() {
            Some(pending) => update.merged_over(pending),
            None => update,
        });
    }

    /// Take the pending update, leaving the slot empty.
    pub fn flush(&self) -> Option<FeedUpdate> {
        self.slot.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Flush every `period` until cancelled, handing each pending update to
    /// `deliver`. Empty ticks are no-ops.
    pub async fn run(&self, period: Duration, cancel: CancellationToken, mut deliver: impl FnMut(FeedUpdate)) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("throttle stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Some(update) = self.flush() {
                        deliver(update);
                    }
                }
            }
        }
    }
}
