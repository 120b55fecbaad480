//! # Round-Trip Estimation
//!
//! Integer mean/variance estimator fed by acknowledgements. Each sample
//! moves the mean by 1/8 of the error and the variance by 1/4, the same
//! gains as RFC 6298 but in whole milliseconds.
//!
//! The estimator also keeps the lowest mean and highest variance seen in the
//! current throttle interval; at each interval boundary they become the
//! `last_*` reference values the packet throttle compares against.

use crate::time::time_difference;

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;

/// Per-peer RTT statistics in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RttEstimator {
    /// Smoothed mean round-trip time.
    pub round_trip_time: u32,
    /// Smoothed mean deviation.
    pub round_trip_time_variance: u32,
    /// Reference mean from the previous throttle interval.
    pub last_round_trip_time: u32,
    /// Reference variance from the previous throttle interval.
    pub last_round_trip_time_variance: u32,
    pub lowest_round_trip_time: u32,
    pub highest_round_trip_time_variance: u32,
    /// Service time at which the current throttle interval began (0 = never).
    pub epoch: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        RttEstimator {
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            highest_round_trip_time_variance: 0,
            epoch: 0,
        }
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one sample. `first` seeds the estimator instead of blending.
    pub fn update(&mut self, sample: u32, first: bool) {
        let sample = sample.max(1);
        if first {
            self.round_trip_time = sample;
            self.round_trip_time_variance = sample.div_ceil(2);
        } else {
            self.round_trip_time_variance -= self.round_trip_time_variance / 4;
            if sample >= self.round_trip_time {
                let diff = sample - self.round_trip_time;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time += diff / 8;
            } else {
                let diff = self.round_trip_time - sample;
                self.round_trip_time_variance += diff / 4;
                self.round_trip_time -= diff / 8;
            }
        }

        if self.round_trip_time < self.lowest_round_trip_time {
            self.lowest_round_trip_time = self.round_trip_time;
        }
        if self.round_trip_time_variance > self.highest_round_trip_time_variance {
            self.highest_round_trip_time_variance = self.round_trip_time_variance;
        }
    }

    /// Start a new throttle interval if `interval` ms have passed since the
    /// last one. Returns `true` when the reference values were rolled.
    pub fn roll_epoch(&mut self, now: u32, interval: u32) -> bool {
        if self.epoch != 0 && time_difference(now, self.epoch) < interval {
            return false;
        }
        self.last_round_trip_time = self.lowest_round_trip_time;
        self.last_round_trip_time_variance = self.highest_round_trip_time_variance.max(1);
        self.lowest_round_trip_time = self.round_trip_time;
        self.highest_round_trip_time_variance = self.round_trip_time_variance;
        self.epoch = now;
        true
    }

    /// Initial retransmission timeout for a newly sent reliable command.
    #[inline]
    pub fn retransmit_timeout(&self) -> u32 {
        self.round_trip_time
            .saturating_add(self.round_trip_time_variance.saturating_mul(4))
    }
}
