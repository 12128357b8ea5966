//! delay schedules - how fast a credential may be guessed
//!
//! a schedule maps "failed attempts so far" to "wait before the next
//! attempt". the entry with the largest threshold not above the current
//! count applies. an infinite delay locks the credential, and so does any
//! count past the final threshold; only a reset unlocks it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// most entries a schedule may carry
pub const MAX_DELAY_ENTRIES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delay {
    Seconds(u32),
    Infinite,
}

impl Delay {
    /// `u32::MAX` means infinite, as in the hardware schedule format
    pub fn from_raw(secs: u32) -> Self {
        if secs == u32::MAX {
            Delay::Infinite
        } else {
            Delay::Seconds(secs)
        }
    }
}

/// outcome of checking a credential's attempt counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Wait { remaining_secs: u64 },
    Locked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelaySchedule {
    entries: BTreeMap<u32, Delay>,
}

impl DelaySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder: add `attempts -> delay`
    pub fn with(mut self, attempts: u32, delay: Delay) -> Self {
        self.entries.insert(attempts, delay);
        self
    }

    pub fn from_raw(raw: &BTreeMap<u32, u32>) -> Self {
        Self {
            entries: raw.iter().map(|(&a, &d)| (a, Delay::from_raw(d))).collect(),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u32, Delay)> + '_ {
        self.entries.iter().map(|(&a, &d)| (a, d))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// the final threshold; a counter above it is locked
    pub fn final_threshold(&self) -> Option<u32> {
        self.entries.keys().next_back().copied()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.entries.is_empty() {
            return Err("schedule is empty".into());
        }
        if self.entries.len() > MAX_DELAY_ENTRIES {
            return Err(format!("schedule has more than {} entries", MAX_DELAY_ENTRIES));
        }
        if self.entries.contains_key(&0) {
            return Err("thresholds must be greater than zero".into());
        }
        let last = self.final_threshold();
        if let Some((&threshold, _)) = self
            .entries
            .iter()
            .find(|(a, d)| **d == Delay::Infinite && Some(**a) != last)
        {
            return Err(format!("infinite delay at {} hides later entries", threshold));
        }
        Ok(())
    }

    /// the delay that applies once `attempts` failures have happened
    pub fn delay_for(&self, attempts: u32) -> Option<Delay> {
        if attempts == 0 {
            return None;
        }
        if self.final_threshold().is_some_and(|t| attempts > t) {
            return Some(Delay::Infinite);
        }
        self.entries.range(..=attempts).next_back().map(|(_, d)| *d)
    }

    pub fn is_locked(&self, attempts: u32) -> bool {
        self.delay_for(attempts) == Some(Delay::Infinite)
    }

    /// may another attempt happen at `now`, given the last failure time
    ///
    /// a clock reading earlier than `last_failure` counts as no time elapsed.
    pub fn check(&self, attempts: u32, last_failure: u64, now: u64) -> Verdict {
        match self.delay_for(attempts) {
            None | Some(Delay::Seconds(0)) => Verdict::Allowed,
            Some(Delay::Infinite) => Verdict::Locked,
            Some(Delay::Seconds(secs)) => {
                let elapsed = now.saturating_sub(last_failure);
                let secs = u64::from(secs);
                if elapsed >= secs {
                    Verdict::Allowed
                } else {
                    Verdict::Wait { remaining_secs: secs - elapsed }
                }
            }
        }
    }
}
