//! Client-side sleep scheduling.

use rand::Rng;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::Session;
use crate::state;

impl Session {
    /// Block until the next exchange is due: the jittered sleep elapses, a
    /// wake signal arrives, or the session is cancelled. Server-side
    /// sessions and closing sessions return immediately.
    pub(crate) async fn wait_interval(&self) {
        let base = *self.sleep.lock().unwrap();
        if base.is_zero() || self.state.closing() {
            return;
        }
        let w = jittered(base, self.jitter.load(Ordering::Relaxed), &mut rand::thread_rng());
        let mut tick = self.ticker.lock().await;
        let t = tick.get_or_insert_with(|| {
            let mut i = tokio::time::interval(w);
            i.set_missed_tick_behavior(MissedTickBehavior::Skip);
            i
        });
        // Resetting discards any tick backlog from an earlier period, so a
        // long sleep cannot be cut short by stale expirations.
        t.reset_after(w);
        tracing::trace!(id = %self.device, sleep = ?w, "sleeping");
        let mut wake = self.wake_rx.lock().await;
        tokio::select! {
            _ = t.tick() => {}
            _ = wake.recv() => {}
            _ = self.ctx.cancelled() => {
                self.state.set(state::CLOSING);
            }
        }
    }
}

/// Perturb `base` by a uniform draw in `(-base, +base)` milliseconds,
/// applied with probability `jitter`/100. Negative results flip positive;
/// an exact zero falls back to the base interval.
fn jittered<R: Rng>(base: Duration, jitter: u8, rng: &mut R) -> Duration {
    if jitter == 0 || jitter > 100 || base <= Duration::from_millis(1) {
        return base;
    }
    if jitter < 100 && rng.gen_range(0u8..100) >= jitter {
        return base;
    }
    let span = base.as_millis() as i64;
    let mut d = rng.gen_range(0..span);
    if rng.gen_range(0u8..2) == 1 {
        d = -d;
    }
    let out = span + d;
    match out.unsigned_abs() {
        0 => base,
        ms => Duration::from_millis(ms),
    }
}
