//! Per-direction transfer rate monitor.
//!
//! Every connection owns two monitors, one for bytes written and one for
//! bytes read. A monitor accumulates bytes into fixed sample windows and
//! derives instantaneous, smoothed (EMA), average and peak rates from them.
//!
//! The same samples drive pacing: [`FlowMonitor::delay`] tells the caller
//! how long to sleep before the next chunk may be moved so that no sample
//! ever carries more than the per-sample budget. The budget is the
//! configured rate scaled to one sample, rounded up to a whole number of
//! chunks, which makes the observed peak rate bounded by
//! [`FlowMonitor::ceiling`].

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Default length of one sample window.
pub const DEFAULT_SAMPLE_RATE: Duration = Duration::from_millis(100);

/// Default smoothing window of the current-rate EMA.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Point-in-time view of a monitor. Rates are bytes per second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonitorStatus {
    /// Whether the monitor is still accounting transfers.
    pub active: bool,
    pub start: Instant,
    pub duration: Duration,
    /// Time since the last non-empty update.
    pub idle: Duration,
    pub bytes: u64,
    pub samples: u64,
    /// Rate of the last completed sample.
    pub inst_rate: i64,
    /// Exponential moving average over the smoothing window.
    pub cur_rate: i64,
    pub avg_rate: i64,
    pub peak_rate: i64,
}

/// Sliding-sample transfer rate monitor. Safe to share between tasks.
pub struct FlowMonitor {
    sample_rate: Duration,
    window: Duration,
    state: Mutex<MonitorState>,
}

struct MonitorState {
    active: bool,
    start: Instant,
    bytes: u64,
    samples: u64,
    r_sample: f64,
    r_ema: f64,
    r_peak: f64,
    /// Bytes accumulated in the current sample.
    s_bytes: u64,
    /// Start of the current sample.
    s_last: Instant,
    /// Time of the last non-empty update.
    t_last: Instant,
}

impl FlowMonitor {
    pub fn new() -> Self {
        Self::with_rates(DEFAULT_SAMPLE_RATE, DEFAULT_WINDOW)
    }

    /// Create a monitor with explicit sample and smoothing windows.
    /// A zero sample rate falls back to [`DEFAULT_SAMPLE_RATE`].
    pub fn with_rates(sample_rate: Duration, window: Duration) -> Self {
        let sample_rate = if sample_rate.is_zero() {
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate
        };
        let window = window.max(sample_rate);
        let now = Instant::now();
        Self {
            sample_rate,
            window,
            state: Mutex::new(MonitorState {
                active: true,
                start: now,
                bytes: 0,
                samples: 0,
                r_sample: 0.0,
                r_ema: 0.0,
                r_peak: 0.0,
                s_bytes: 0,
                s_last: now,
                t_last: now,
            }),
        }
    }

    pub fn sample_rate(&self) -> Duration {
        self.sample_rate
    }

    /// Record `n` transferred bytes.
    pub fn update(&self, n: usize) {
        let mut state = self.lock();
        state.update(n as u64, Instant::now(), self.sample_rate, self.window);
    }

    /// Stop accounting. Further updates are ignored and pacing is disabled.
    pub fn done(&self) {
        let mut state = self.lock();
        state.update(0, Instant::now(), self.sample_rate, self.window);
        state.active = false;
    }

    /// Bytes one sample may carry at `rate`, in whole `chunk`s.
    pub fn budget(&self, rate: i64, chunk: usize) -> u64 {
        let chunk = chunk.max(1) as u64;
        let limit = round(rate.max(0) as f64 * self.sample_rate.as_secs_f64()).max(1) as u64;
        limit.div_ceil(chunk) * chunk
    }

    /// Highest rate, in bytes per second, the pacing can ever let through.
    pub fn ceiling(&self, rate: i64, chunk: usize) -> i64 {
        round(self.budget(rate, chunk) as f64 / self.sample_rate.as_secs_f64())
    }

    /// How long to wait before moving up to `chunk` more bytes at `rate`.
    ///
    /// Zero means the chunk fits the current sample's budget. Otherwise the
    /// returned duration is the remainder of the current sample. A
    /// non-positive rate disables pacing.
    pub fn delay(&self, rate: i64, chunk: usize) -> Duration {
        if rate <= 0 {
            return Duration::ZERO;
        }
        let budget = self.budget(rate, chunk);
        let now = Instant::now();
        let mut state = self.lock();
        state.update(0, now, self.sample_rate, self.window);
        if !state.active || state.s_bytes + chunk as u64 <= budget {
            return Duration::ZERO;
        }
        (state.s_last + self.sample_rate).saturating_duration_since(now)
    }

    pub fn status(&self) -> MonitorStatus {
        let now = Instant::now();
        let mut state = self.lock();
        state.update(0, now, self.sample_rate, self.window);
        let duration = now.saturating_duration_since(state.start);
        let avg_rate = if duration.is_zero() {
            0
        } else {
            round(state.bytes as f64 / duration.as_secs_f64())
        };
        MonitorStatus {
            active: state.active,
            start: state.start,
            duration,
            idle: now.saturating_duration_since(state.t_last),
            bytes: state.bytes,
            samples: state.samples,
            inst_rate: round(state.r_sample),
            cur_rate: round(state.r_ema),
            avg_rate,
            peak_rate: round(state.r_peak),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // The state holds plain counters; a panic mid-update leaves them usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FlowMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorState {
    fn update(&mut self, n: u64, now: Instant, sample_rate: Duration, window: Duration) {
        if !self.active {
            return;
        }
        if n > 0 {
            self.t_last = now;
        }
        self.s_bytes += n;
        self.bytes += n;

        let elapsed = now.saturating_duration_since(self.s_last);
        if elapsed < sample_rate {
            return;
        }
        let t = elapsed.as_secs_f64();
        self.r_sample = self.s_bytes as f64 / t;
        if self.r_sample > self.r_peak {
            self.r_peak = self.r_sample;
        }
        // Longer samples weigh more, like the *nix load average.
        if self.samples > 0 {
            let w = (-t / window.as_secs_f64()).exp();
            self.r_ema = self.r_sample + w * (self.r_ema - self.r_sample);
        } else {
            self.r_ema = self.r_sample;
        }
        self.samples += 1;
        self.s_bytes = 0;
        self.s_last = now;
    }
}

/// Round half away from zero for the non-negative values used here.
pub fn round(x: f64) -> i64 {
    if x.fract() >= 0.5 {
        x.ceil() as i64
    } else {
        x.floor() as i64
    }
}
