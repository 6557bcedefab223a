//! Bounded peer reputation.
//!
//! Scores live in `0..=MAX_SCORE`. Successful service moves a score toward the maximum by a share
//! of the remaining gap that depends on latency. Failures scale the score down. Every success
//! below the maximum strictly increases the score and every failure above zero strictly decreases
//! it.

use core::time::Duration;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::IntoStaticStr;

use crate::odr_config::OdrConfig;

const MAX_SCORE: u8 = 100;
const INITIAL_SCORE: u8 = 50;

// Weights are in fifths.
const WEIGHT_DENOMINATOR: u16 = 5;
const FAST_SUCCESS_WEIGHT: u16 = 3;
const NORMAL_SUCCESS_WEIGHT: u16 = 2;
const SLOW_SUCCESS_WEIGHT: u16 = 1;
const HARD_FAILURE_RETENTION: u16 = 2;
const SOFT_FAILURE_RETENTION: u16 = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    Served { latency: Duration },
    Stale,
    Timeout,
    Invalid,
    PeerLost,
    ConnectFailed,
}

impl Outcome {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Served { .. })
    }
}

#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Deserialize,
    Serialize,
)]
pub struct Score(u8);

impl Default for Score {
    fn default() -> Self {
        Self(INITIAL_SCORE)
    }
}

impl Score {
    pub const MAX: Self = Self(MAX_SCORE);
    pub const MIN: Self = Self(0);

    #[must_use]
    pub fn new(value: u8) -> Self {
        Self(value.min(MAX_SCORE))
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn apply(self, outcome: Outcome, config: &OdrConfig) -> Self {
        let old = u16::from(self.0);

        let new = match outcome {
            Outcome::Served { latency } => {
                let weight = if latency <= config.fast_response {
                    FAST_SUCCESS_WEIGHT
                } else if latency <= config.slow_response {
                    NORMAL_SUCCESS_WEIGHT
                } else {
                    SLOW_SUCCESS_WEIGHT
                };

                let gap = u16::from(MAX_SCORE) - old;

                old + (gap * weight).div_ceil(WEIGHT_DENOMINATOR)
            }
            Outcome::Timeout | Outcome::Invalid | Outcome::ConnectFailed => {
                old * HARD_FAILURE_RETENTION / WEIGHT_DENOMINATOR
            }
            Outcome::Stale | Outcome::PeerLost => {
                old * SOFT_FAILURE_RETENTION / WEIGHT_DENOMINATOR
            }
        };

        Self(u8::try_from(new).unwrap_or(MAX_SCORE).min(MAX_SCORE))
    }
}
