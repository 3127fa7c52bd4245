//! Passive per-stream delay and bitrate estimation
//!
//! Values are computed over fixed windows. Readers always get the last closed
//! window, so a reading can be up to one window old.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Window {
    start: Option<Instant>,
    bytes: u64,
    delay_total: Duration,
    samples: u32,
    /// Bits per second of the last closed window
    bitrate: f64,
    /// Mean delay of the last closed window
    delay: Duration,
}

/// Fixed-window bitrate and mean-delay estimator for one stream
pub struct BitrateEstimator {
    window: Duration,
    inner: Mutex<Window>,
}

impl BitrateEstimator {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(Window {
                start: None,
                bytes: 0,
                delay_total: Duration::ZERO,
                samples: 0,
                bitrate: 0.0,
                delay: Duration::ZERO,
            }),
        }
    }

    /// Record a packet arriving now
    pub fn record(&self, bytes: usize, delay: Duration) {
        self.record_at(Instant::now(), bytes, delay);
    }

    /// Record a packet that arrived at `now`
    pub fn record_at(&self, now: Instant, bytes: usize, delay: Duration) {
        let mut w = self.inner.lock();
        let start = *w.start.get_or_insert(now);

        w.bytes += bytes as u64;
        w.delay_total += delay;
        w.samples += 1;

        let elapsed = now.saturating_duration_since(start);
        if elapsed >= self.window {
            w.bitrate = (w.bytes * 8) as f64 / elapsed.as_secs_f64();
            w.delay = w.delay_total / w.samples;

            w.start = Some(now);
            w.bytes = 0;
            w.delay_total = Duration::ZERO;
            w.samples = 0;
        }
    }

    /// Bits per second over the last closed window
    #[must_use]
    pub fn bitrate(&self) -> f64 {
        self.inner.lock().bitrate
    }

    /// Mean per-packet delay over the last closed window
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.inner.lock().delay
    }
}

/// Relative transit time of packets on one stream.
///
/// Transit = arrival time − media time (RTP timestamp / clock rate), both
/// measured from the first packet. Publisher and hub clocks are not
/// synchronized, so only differences between transit times carry meaning:
/// the delay sample is the transit above the smallest transit seen so far.
pub struct TransitClock {
    clock_rate: u32,
    origin: Option<Instant>,
    last_timestamp: u32,
    extended_timestamp: i64,
    min_transit: Option<f64>,
}

/// Result of observing one packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transit {
    /// Transit time in seconds relative to the first packet
    pub seconds: f64,
    /// Queuing delay relative to the fastest packet seen
    pub delay: Duration,
}

impl TransitClock {
    #[must_use]
    pub const fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            origin: None,
            last_timestamp: 0,
            extended_timestamp: 0,
            min_transit: None,
        }
    }

    pub fn observe(&mut self, timestamp: u32, arrival: Instant) -> Transit {
        let origin = match self.origin {
            Some(origin) => {
                // Unwrap the 32-bit timestamp; reordered packets step backwards.
                let step = i64::from(timestamp.wrapping_sub(self.last_timestamp) as i32);
                self.extended_timestamp += step;
                origin
            }
            None => {
                self.origin = Some(arrival);
                self.extended_timestamp = 0;
                arrival
            }
        };
        self.last_timestamp = timestamp;

        let arrival_secs = arrival.saturating_duration_since(origin).as_secs_f64();
        let media_secs = if self.clock_rate == 0 {
            0.0
        } else {
            self.extended_timestamp as f64 / f64::from(self.clock_rate)
        };
        let seconds = arrival_secs - media_secs;

        let min = self.min_transit.map_or(seconds, |m| m.min(seconds));
        self.min_transit = Some(min);

        Transit {
            seconds,
            delay: Duration::from_secs_f64((seconds - min).max(0.0)),
        }
    }
}
