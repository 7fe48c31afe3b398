//! Go-back-N bookkeeping helpers: acknowledgement range checks, receive
//! sequence classification and the retransmit timeout estimator.

use std::time::Duration;

use crate::config::RetransmitConfig;
use crate::protocol::{seq_distance, SEQ_MODULUS};

/// Received sequence distances below this are treated as frames from the
/// future (a gap); the rest are stale duplicates.
const REORDER_HORIZON: u8 = SEQ_MODULUS / 2;

/// How a received I-frame relates to the expected sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxSequence {
    Expected,
    /// Already delivered; the peer missed our acknowledgement.
    Duplicate,
    /// A frame before this one was lost.
    OutOfOrder,
}

pub fn classify(seq: u8, expected: u8) -> RxSequence {
    match seq_distance(expected, seq) {
        0 => RxSequence::Expected,
        d if d < REORDER_HORIZON => RxSequence::OutOfOrder,
        _ => RxSequence::Duplicate,
    }
}

/// Frames released by acknowledgement `ack` when the oldest outstanding
/// frame has sequence `base`. `None` when `ack` is outside the window.
pub fn acked_count(base: u8, ack: u8, in_flight: u8) -> Option<u8> {
    let count = seq_distance(base, ack);
    (count <= in_flight).then_some(count)
}

/// Smoothed RTT estimator with exponential backoff.
///
/// `rto = clamp(srtt + 4 * rttvar, min, max)`; samples only come from frames
/// that were never retransmitted.
#[derive(Debug, Clone)]
pub struct RtoEstimator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    initial: Duration,
    min: Duration,
    max: Duration,
}

impl RtoEstimator {
    pub fn new(config: &RetransmitConfig) -> Self {
        let (min, max) = (config.min_timeout(), config.max_timeout());
        let initial = config.initial_timeout().clamp(min, max);
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: initial,
            initial,
            min,
            max,
        }
    }

    #[inline]
    pub fn current(&self) -> Duration {
        self.rto
    }

    #[inline]
    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + self.rttvar * 4).clamp(self.min, self.max);
    }

    /// Double the timeout after an expiry.
    pub fn backoff(&mut self) {
        self.rto = (self.rto * 2).clamp(self.min, self.max);
    }

    pub fn reset(&mut self) {
        self.srtt = None;
        self.rttvar = Duration::ZERO;
        self.rto = self.initial;
    }
}
