//! RTT estimation and remote clock tracking.
//!
//! Round trips are measured on acknowledged pings only. The smoothed RTT
//! follows RFC 6298 and drives the resend delay; the clock delta lets timed
//! messages be placed on the local timeline.

use std::time::Duration;

use crate::core::PeerConfig;

/// RTT smoothing constants.
pub mod constants {
    use std::time::Duration;

    /// Alpha for SRTT smoothing (0.125 = 1/8).
    pub const SRTT_ALPHA: f64 = 0.125;

    /// Beta for RTTVAR smoothing (0.25 = 1/4).
    pub const RTTVAR_BETA: f64 = 0.25;

    /// Smallest RTT sample ever recorded.
    pub const MIN_RTT_SAMPLE: Duration = Duration::from_millis(1);

    /// Samples at or beyond this are discarded; 16-bit ticks cannot express them.
    pub const MAX_RTT_SAMPLE: Duration = Duration::from_millis(u16::MAX as u64);

    /// Longest elapsed time credited to the clock delta warm-up per sample.
    pub const MAX_DELTA_WEIGHT_STEP: f64 = 1.0;
}

/// RTT estimator implementing RFC 6298 smoothing.
#[derive(Debug, Clone, Default)]
pub struct RttEstimator {
    /// Smoothed RTT in milliseconds.
    srtt: f64,
    /// RTT variance in milliseconds.
    rttvar: f64,
    /// Most recent sample.
    last: Option<Duration>,
}

impl RttEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute an RTT sample from a ping acknowledgement.
    ///
    /// `elapsed` is the time since the ping was last sent and `processing`
    /// the remote's delay between receiving the ping and sending the ack.
    /// Returns `None` if the pair is inconsistent.
    pub fn sample(elapsed: Duration, processing: Duration) -> Option<Duration> {
        if elapsed < processing || elapsed >= constants::MAX_RTT_SAMPLE {
            return None;
        }
        Some((elapsed - processing).max(constants::MIN_RTT_SAMPLE))
    }

    /// Update the estimate with a new sample.
    ///
    /// - First measurement: SRTT = sample, RTTVAR = sample / 2
    /// - Subsequent: RTTVAR = 0.75 * RTTVAR + 0.25 * |SRTT - sample|
    /// - SRTT = 0.875 * SRTT + 0.125 * sample
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;

        if self.last.is_none() {
            self.srtt = sample_ms;
            self.rttvar = sample_ms / 2.0;
        } else {
            self.rttvar = (1.0 - constants::RTTVAR_BETA) * self.rttvar
                + constants::RTTVAR_BETA * (self.srtt - sample_ms).abs();
            self.srtt =
                (1.0 - constants::SRTT_ALPHA) * self.srtt + constants::SRTT_ALPHA * sample_ms;
        }
        self.last = Some(sample);
    }

    /// Smoothed RTT, `None` before the first sample.
    pub fn rtt(&self) -> Option<Duration> {
        self.last
            .map(|_| Duration::from_micros((self.srtt.max(1.0) * 1000.0).round() as u64))
    }

    /// Smoothed RTT in whole milliseconds, zero before the first sample.
    pub fn rtt_ms(&self) -> u16 {
        self.rtt()
            .map_or(0, |rtt| rtt.as_millis().min(u128::from(u16::MAX)) as u16)
    }

    /// Most recent raw sample.
    pub fn last_sample(&self) -> Option<Duration> {
        self.last
    }

    /// RTT variance.
    pub fn rttvar(&self) -> Duration {
        Duration::from_micros((self.rttvar * 1000.0).round() as u64)
    }

    /// Delay before a reliable message is sent again.
    ///
    /// Without a sample this is the configured maximum, otherwise
    /// `rtt + jitter` clamped to the configured bounds.
    pub fn resend_delay(&self, config: &PeerConfig) -> Duration {
        match self.rtt() {
            None => config.resend_delay_max,
            Some(rtt) => (rtt + config.resend_delay_jitter)
                .clamp(config.resend_delay_min, config.resend_delay_max),
        }
    }
}

/// Running estimate of `local ticks - remote ticks` in the 16-bit tick space.
///
/// The average is circular: every sample moves it along the shortest path
/// around the 65536 ring, so wrapping ticks do not drag it across the range.
#[derive(Debug, Clone, Default)]
pub struct ClockDelta {
    average: f64,
    count: f64,
    last: u16,
    last_update: Option<i64>,
}

impl ClockDelta {
    /// Create an empty estimate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new delta sample at local tick `now`.
    ///
    /// The weight of the previous average is `stability`, capped by
    /// `1 - 1/count` where `count` accumulates seconds between samples.
    /// Early samples therefore move the average almost all the way.
    pub fn update(&mut self, delta: u16, now: i64, stability: f64) {
        let elapsed = self
            .last_update
            .map_or(0.0, |last| (now - last).max(0) as f64 / 1000.0)
            .min(constants::MAX_DELTA_WEIGHT_STEP);
        self.count += elapsed;
        let max = if self.count < 1.0 {
            0.0
        } else {
            1.0 - 1.0 / self.count
        };
        let weight = stability.clamp(0.0, max);

        let offset = f64::from(delta.wrapping_sub(self.average()) as i16);
        let average = self.average + offset * (1.0 - weight);
        self.average = average.rem_euclid(65536.0);
        self.last = delta;
        self.last_update = Some(now);
    }

    /// Whether at least one sample was recorded.
    pub fn is_known(&self) -> bool {
        self.last_update.is_some()
    }

    /// Averaged delta, rounded to the tick ring.
    pub fn average(&self) -> u16 {
        (self.average.round() as i64).rem_euclid(65536) as u16
    }

    /// Averaged delta with fractional part.
    pub fn average_exact(&self) -> f64 {
        self.average
    }

    /// Most recent sample.
    pub fn last(&self) -> u16 {
        self.last
    }
}
