//! Fixed-rate tick loop for hostlink peers.
//!
//! Each process runs one cooperative loop: wait for the tick, call
//! `PeerNode::tick`, run game logic, repeat. Service calls and link I/O
//! happen on other tasks and never block the loop.
//!
//! ```ignore
//! let mut ticks = TickLoop::new(TickConfig::with_rate(30));
//! loop {
//!     let info = ticks.wait_for_tick().await;
//!     for event in node.tick() { /* ... */ }
//!     game.update(&mut node, info.dt);
//!     ticks.record_tick_end();
//! }
//! ```
//!
//! A tick that wakes late skips ahead instead of bursting to catch up.

use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Ticks per second, 1 to [`Self::MAX_RATE_HZ`].
    pub rate_hz: u32,
    /// Upper bound of the random delay added to the first tick, so that
    /// peers started together do not tick in lockstep.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            rate_hz: 30,
            initial_jitter: Duration::from_millis(2),
        }
    }
}

impl TickConfig {
    pub const MAX_RATE_HZ: u32 = 128;

    pub fn with_rate(rate_hz: u32) -> Self {
        Self {
            rate_hz,
            ..Default::default()
        }
    }

    /// Clamps `rate_hz` into the supported range.
    pub fn validated(mut self) -> Self {
        let clamped = self.rate_hz.clamp(1, Self::MAX_RATE_HZ);
        if clamped != self.rate_hz {
            warn!(rate = self.rate_hz, clamped, "tick rate out of range, clamping");
            self.rate_hz = clamped;
        }
        self
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_hz.max(1)))
    }
}

/// One fired tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickInfo {
    /// Starts at 1.
    pub tick: u64,
    /// Always the configured tick duration.
    pub dt: Duration,
    /// The tick woke more than 10% of a tick late.
    pub overrun: bool,
    /// Whole ticks skipped because of the overrun.
    pub ticks_skipped: u64,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

pub struct TickLoop {
    rate_hz: u32,
    tick_duration: Duration,
    tick_count: u64,
    next_tick: Instant,
    tick_start: Option<Instant>,
    paused: bool,
    total_skipped: u64,
}

impl TickLoop {
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();
        let tick_duration = config.tick_duration();

        let jitter = if config.initial_jitter.is_zero() {
            Duration::ZERO
        } else {
            let max = config.initial_jitter.as_micros() as u64;
            Duration::from_micros(rand::rng().random_range(0..max.max(1)))
        };
        debug!(rate_hz = config.rate_hz, jitter_us = jitter.as_micros() as u64, "tick loop created");

        Self {
            rate_hz: config.rate_hz,
            tick_duration,
            tick_count: 0,
            next_tick: Instant::now() + tick_duration + jitter,
            tick_start: None,
            paused: false,
            total_skipped: 0,
        }
    }

    pub fn with_rate(rate_hz: u32) -> Self {
        Self::new(TickConfig::with_rate(rate_hz))
    }

    /// Waits for the next tick. Pends forever while paused.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        if self.paused {
            std::future::pending::<()>().await;
        }

        let scheduled = self.next_tick;
        time::sleep_until(scheduled).await;

        let now = Instant::now();
        self.tick_count += 1;
        self.tick_start = Some(now);

        let late_by = now.saturating_duration_since(scheduled);
        let overrun = late_by > self.tick_duration / 10;
        let mut ticks_skipped = 0;
        if overrun {
            ticks_skipped = (late_by.as_nanos() / self.tick_duration.as_nanos()) as u64;
            if ticks_skipped > 0 {
                warn!(
                    tick = self.tick_count,
                    skipped = ticks_skipped,
                    late_ms = late_by.as_secs_f64() * 1000.0,
                    "tick overrun, skipping ahead"
                );
            }
        }
        self.total_skipped += ticks_skipped;
        self.next_tick = if overrun {
            now + self.tick_duration
        } else {
            scheduled + self.tick_duration
        };

        trace!(tick = self.tick_count, overrun, "tick");
        TickInfo {
            tick: self.tick_count,
            dt: self.tick_duration,
            overrun,
            ticks_skipped,
        }
    }

    /// Marks the end of the current tick's work. Warns when the work took
    /// longer than a tick.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        if elapsed >= self.tick_duration {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                budget_ms = self.tick_duration.as_secs_f64() * 1000.0,
                "tick exceeded its budget"
            );
        }
    }

    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "tick loop paused");
        }
    }

    /// Resumes one tick from now, without catching up on the pause.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.next_tick = Instant::now() + self.tick_duration;
            debug!(tick = self.tick_count, "tick loop resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn total_skipped(&self) -> u64 {
        self.total_skipped
    }

    pub fn rate_hz(&self) -> u32 {
        self.rate_hz
    }

    pub fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}
