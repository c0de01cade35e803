//! Retention policy parsing.
//!
//! A policy is `<integer><unit>` with unit one of y, w, d, h, m
//! (case-insensitive). Unit letters are matched by containment, checked
//! in that order. Anything unusable falls back to twelve weeks.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

const MINUTES_PER_HOUR: u64 = 60;
const MINUTES_PER_DAY: u64 = 24 * MINUTES_PER_HOUR;
const MINUTES_PER_WEEK: u64 = 7 * MINUTES_PER_DAY;
const MINUTES_PER_YEAR: u64 = 365 * MINUTES_PER_DAY;

pub const DEFAULT_RETENTION_MINUTES: u64 = 12 * MINUTES_PER_WEEK;

/// Maximum age a snapshot may reach before it is pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Retention {
    minutes: u64,
}

impl Retention {
    pub const fn from_minutes(minutes: u64) -> Self {
        Self { minutes }
    }

    pub fn minutes(&self) -> u64 {
        self.minutes
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.minutes.saturating_mul(60))
    }

    /// Strictly older than the cutoff. An age exactly at the cutoff is kept.
    pub fn is_expired(&self, age: Duration) -> bool {
        age > self.as_duration()
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::from_minutes(DEFAULT_RETENTION_MINUTES)
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} minutes", self.minutes)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetentionWarning {
    #[error("Unknown retention policy set: {0}.")]
    UnknownUnit(String),

    #[error("Malformed retention policy set: {0}.")]
    InvalidAmount(String),
}

/// Outcome of resolving a policy: always a usable cutoff, maybe a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub retention: Retention,
    pub warning: Option<RetentionWarning>,
}

impl Resolution {
    fn fallback(warning: RetentionWarning) -> Self {
        Self {
            retention: Retention::default(),
            warning: Some(warning),
        }
    }
}

/// Resolve an optional policy string into a cutoff.
///
/// A missing policy silently yields the default.
pub fn resolve(policy: Option<&str>) -> Resolution {
    let Some(raw) = policy else {
        return Resolution {
            retention: Retention::default(),
            warning: None,
        };
    };

    let text = raw.trim();
    let digits_end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (amount, unit) = text.split_at(digits_end);

    let Ok(amount) = amount.parse::<u64>() else {
        return Resolution::fallback(RetentionWarning::InvalidAmount(raw.to_string()));
    };

    let unit = unit.trim().to_ascii_lowercase();
    let factor = [
        ('y', MINUTES_PER_YEAR),
        ('w', MINUTES_PER_WEEK),
        ('d', MINUTES_PER_DAY),
        ('h', MINUTES_PER_HOUR),
        ('m', 1),
    ]
    .into_iter()
    .find(|(letter, _)| unit.contains(*letter))
    .map(|(_, factor)| factor);

    let Some(factor) = factor else {
        return Resolution::fallback(RetentionWarning::UnknownUnit(raw.to_string()));
    };

    match amount.checked_mul(factor) {
        Some(minutes) => Resolution {
            retention: Retention::from_minutes(minutes),
            warning: None,
        },
        None => Resolution::fallback(RetentionWarning::InvalidAmount(raw.to_string())),
    }
}
