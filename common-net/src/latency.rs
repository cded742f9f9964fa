//! End-to-end latency from in-band capture timestamps.
//!
//! Capture timestamps come from the sender's clock and arrival timestamps
//! from the receiver's, so a sample is only meaningful once the offset
//! between the two clocks has been estimated through a PING/PONG exchange.
//! Until then latency is reported as unknown, never as zero.

use std::fmt;

use tracing::warn;

use crate::clock::{micros_to_ms, Micros};
use crate::error::SessionError;
use crate::media::MediaUnit;
use crate::metrics::media_metrics;

/// One PING/PONG measurement. `offset` is `local - remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetSample {
    pub offset: Micros,
    pub round_trip: Micros,
}

/// NTP-style offset estimator. Keeps the sample with the smallest round
/// trip, whose midpoint assumption has the least error.
#[derive(Debug, Default, Clone)]
pub struct ClockSync {
    best: Option<OffsetSample>,
    samples: u64,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// `ping_sent_at` and `received_at` are local; `remote_at` is the peer's
    /// timestamp on its PONG. Samples whose round trip is negative or whose
    /// arithmetic overflows are discarded.
    pub fn record(
        &mut self,
        ping_sent_at: Micros,
        remote_at: Micros,
        received_at: Micros,
    ) -> Option<OffsetSample> {
        let round_trip = received_at.checked_sub(ping_sent_at).filter(|rtt| *rtt >= 0)?;
        let offset = ping_sent_at
            .checked_add(round_trip / 2)?
            .checked_sub(remote_at)?;
        let sample = OffsetSample { offset, round_trip };
        self.samples += 1;
        if self.best.map_or(true, |best| sample.round_trip <= best.round_trip) {
            self.best = Some(sample);
        }
        Some(sample)
    }

    pub fn offset(&self) -> Result<Micros, SessionError> {
        self.best
            .map(|sample| sample.offset)
            .ok_or(SessionError::ClockSyncUnavailable)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// `None` when the stamps are too far apart to represent.
pub fn instantaneous_latency(capture: Micros, arrival: Micros, offset: Micros) -> Option<Micros> {
    arrival.checked_sub(capture)?.checked_sub(offset)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Latency {
    Unknown,
    Measured { instant_ms: f64, smoothed_ms: f64 },
}

impl Latency {
    pub fn smoothed_ms(&self) -> Option<f64> {
        match self {
            Latency::Unknown => None,
            Latency::Measured { smoothed_ms, .. } => Some(*smoothed_ms),
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Latency::Unknown => f.write_str("unknown"),
            Latency::Measured { smoothed_ms, .. } => write!(f, "{smoothed_ms:.1} ms"),
        }
    }
}

/// Exponential moving average over per-unit latency samples.
#[derive(Debug, Clone)]
pub struct LatencyMeter {
    alpha: f64,
    smoothed_ms: Option<f64>,
}

impl LatencyMeter {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            smoothed_ms: None,
        }
    }

    /// Fold one received unit into the average. Units without an arrival
    /// stamp or with unusable timestamps, and any unit while `offset` is
    /// unknown, yield `Unknown` and leave the average untouched.
    pub fn observe(&mut self, unit: &MediaUnit, offset: Option<Micros>) -> Latency {
        let (Some(arrival), Some(offset)) = (unit.arrival_timestamp, offset) else {
            return Latency::Unknown;
        };
        let Some(latency) = instantaneous_latency(unit.capture_timestamp, arrival, offset) else {
            warn!(sequence = unit.sequence, "unit timestamp out of range, latency sample skipped");
            return Latency::Unknown;
        };
        let instant_ms = micros_to_ms(latency);
        let smoothed_ms = match self.smoothed_ms {
            None => instant_ms,
            Some(previous) => self.alpha * instant_ms + (1.0 - self.alpha) * previous,
        };
        self.smoothed_ms = Some(smoothed_ms);
        media_metrics().set_latency_ms(smoothed_ms);
        Latency::Measured {
            instant_ms,
            smoothed_ms,
        }
    }

    pub fn current(&self) -> Latency {
        match self.smoothed_ms {
            None => Latency::Unknown,
            Some(smoothed_ms) => Latency::Measured {
                instant_ms: smoothed_ms,
                smoothed_ms,
            },
        }
    }
}
