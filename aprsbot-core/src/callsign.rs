//! Station identity: normalized callsigns used as peer keys and frame addresses.

use std::fmt;
use std::str::FromStr;

/// Width of the addressee field in a message frame. No callsign may exceed it.
pub const MAX_CALLSIGN_LEN: usize = 9;

/// Normalized callsign (optionally with `-SSID`): uppercase ASCII alphanumerics and `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Callsign(String);

impl Callsign {
    /// Normalize `raw` into a callsign. Slashed zeros become `0`; anything outside
    /// `[A-Z0-9-]` is dropped after uppercasing.
    pub fn new(raw: &str) -> Result<Self, CallsignError> {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                'Ø' | 'ø' => '0',
                other => other.to_ascii_uppercase(),
            })
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if normalized.is_empty() {
            return Err(CallsignError::Empty);
        }
        if normalized.len() > MAX_CALLSIGN_LEN {
            return Err(CallsignError::TooLong(normalized));
        }
        Ok(Callsign(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Callsign without its SSID suffix (`AD8IS-10` -> `AD8IS`).
    pub fn base(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for Callsign {
    type Err = CallsignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Callsign::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallsignError {
    #[error("callsign is empty")]
    Empty,
    #[error("callsign {0:?} is longer than {MAX_CALLSIGN_LEN} characters")]
    TooLong(String),
}
