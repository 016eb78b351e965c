//! Slot selection strategies.
//!
//! `RoundRobin` picks a uniformly random slot on every call. It does not
//! rotate a cursor; the name is kept because deployed configurations use it,
//! and switching to strict rotation would change how load spreads.

use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::connection::RawConnection;
use crate::health::HealthTrackedConnection;

/// How the pool chooses a slot for each `acquire`.
///
/// Names are matched ignoring case, `_` and `-`, in config files as well as
/// through `FromStr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum SelectionStrategy {
    /// Uniform random slot.
    #[default]
    RoundRobin,
    /// Slot with the fewest outstanding requests; ties go to the lowest index.
    LeastLoaded,
}

impl SelectionStrategy {
    /// Picks a slot index in `[0, slots.len())`.
    ///
    /// `slots` is never empty for a constructed pool.
    pub fn select<C: RawConnection>(self, slots: &[HealthTrackedConnection<C>]) -> usize {
        match self {
            SelectionStrategy::RoundRobin => random_index(slots.len()),
            SelectionStrategy::LeastLoaded => {
                least_loaded_index(slots.iter().map(HealthTrackedConnection::outstanding_requests))
            }
        }
    }
}

impl FromStr for SelectionStrategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match normalized.as_str() {
            "roundrobin" => Ok(SelectionStrategy::RoundRobin),
            "leastloaded" => Ok(SelectionStrategy::LeastLoaded),
            _ => Err(ConfigError::UnknownStrategy(value.to_string())),
        }
    }
}

impl TryFrom<String> for SelectionStrategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn random_index(len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    rand::thread_rng().gen_range(0..len)
}

/// Index of the smallest load; `min_by_key` keeps the first of equal minima.
fn least_loaded_index(loads: impl Iterator<Item = usize>) -> usize {
    loads
        .enumerate()
        .min_by_key(|(_, load)| *load)
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}
