//! Local time source and the clock-offset estimator.
//!
//! Offsets are estimated with an NTP-like two-message exchange. The
//! inlet stamps a probe with its send time `t0`; the outlet records its
//! receive time `t1` and reply time `t2`; the inlet stamps the arrival
//! `t3`. Among the exchanges kept in a sliding window, the one with the
//! smallest round-trip time is taken as the current estimate.

use serde::Deserialize;
use std::{
    collections::VecDeque,
    sync::OnceLock,
    time::{Duration, Instant},
};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic local time in seconds.
///
/// The reference point is fixed on first use within the process, so
/// readings are only comparable across processes after applying a
/// clock offset.
pub fn local_clock() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Tuning knobs for the clock synchronization exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClockSyncConfig {
    /// Period between background probes once the first estimate exists.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Number of probes sent right after connecting.
    pub probe_burst: usize,
    /// Spacing between the probes of the initial burst.
    #[serde(with = "humantime_serde")]
    pub burst_spacing: Duration,
    /// Maximum number of exchanges kept in the window.
    pub window_size: usize,
    /// Exchanges older than this are no longer eligible as best estimate.
    #[serde(with = "humantime_serde")]
    pub max_probe_age: Duration,
    /// An offset jump larger than this (in seconds) is treated as a clock
    /// reset of the peer and discards the window.
    pub reset_threshold: f64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_burst: 8,
            burst_spacing: Duration::from_millis(10),
            window_size: 16,
            max_probe_age: Duration::from_secs(60),
            reset_threshold: 1.0,
        }
    }
}

impl ClockSyncConfig {
    /// Frequent probing for links with unstable latency.
    pub fn aggressive() -> Self {
        Self {
            probe_interval: Duration::from_millis(500),
            probe_burst: 16,
            burst_spacing: Duration::from_millis(5),
            window_size: 64,
            max_probe_age: Duration::from_secs(10),
            reset_threshold: 1.0,
        }
    }
}

/// Timestamps of one completed probe round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeExchange {
    /// Local time the probe was sent.
    pub t0: f64,
    /// Remote time the probe was received.
    pub t1: f64,
    /// Remote time the reply was sent.
    pub t2: f64,
    /// Local time the reply arrived.
    pub t3: f64,
}

impl ProbeExchange {
    /// Time spent on the wire, excluding the remote processing time.
    pub fn round_trip(&self) -> f64 {
        (self.t3 - self.t0) - (self.t2 - self.t1)
    }

    /// Value to add to a remote timestamp to express it in local time.
    pub fn offset(&self) -> f64 {
        ((self.t0 - self.t1) + (self.t3 - self.t2)) / 2.0
    }
}

/// Outcome of one exchange as kept in the estimator window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OffsetSample {
    pub offset: f64,
    pub round_trip: f64,
    /// Local time at which the exchange completed.
    pub taken_at: f64,
}

/// Minimum round-trip selection over a sliding window of exchanges.
#[derive(Debug)]
pub struct ClockEstimator {
    config: ClockSyncConfig,
    window: VecDeque<OffsetSample>,
    clock_reset: bool,
}

impl ClockEstimator {
    pub fn new(config: ClockSyncConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            config,
            clock_reset: false,
        }
    }

    /// Records a completed exchange. Returns `None` when the exchange is
    /// inconsistent (negative round trip) and was discarded.
    pub fn add(&mut self, exchange: ProbeExchange) -> Option<OffsetSample> {
        let round_trip = exchange.round_trip();
        if !round_trip.is_finite() || round_trip < 0.0 {
            return None;
        }

        let sample = OffsetSample {
            offset: exchange.offset(),
            round_trip,
            taken_at: exchange.t3,
        };

        if let Some(best) = self.best(exchange.t3)
            && (sample.offset - best.offset).abs() > self.config.reset_threshold
            && sample.round_trip < self.config.reset_threshold
        {
            self.window.clear();
            self.clock_reset = true;
        }

        self.window.push_back(sample);
        while self.window.len() > self.config.window_size.max(1) {
            self.window.pop_front();
        }
        Some(sample)
    }

    /// The exchange with the smallest round trip among those not older
    /// than `max_probe_age`. Falls back to the newest exchange when all
    /// of them are stale.
    pub fn best(&self, now: f64) -> Option<OffsetSample> {
        let max_age = self.config.max_probe_age.as_secs_f64();
        self.window
            .iter()
            .filter(|sample| now - sample.taken_at <= max_age)
            .min_by(|a, b| a.round_trip.total_cmp(&b.round_trip))
            .or_else(|| self.window.back())
            .copied()
    }

    pub fn offset(&self, now: f64) -> Option<f64> {
        self.best(now).map(|sample| sample.offset)
    }

    /// Returns whether a peer clock reset was detected since the last
    /// call, and clears the flag.
    pub fn take_clock_reset(&mut self) -> bool {
        std::mem::take(&mut self.clock_reset)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
