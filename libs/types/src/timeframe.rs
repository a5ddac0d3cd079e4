//! Candle timeframes
//!
//! Boundaries are aligned to the Unix epoch (a 5m bucket always starts on a
//! multiple of 300 seconds). All values are in seconds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::SeriesError;

/// Supported candle timeframes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    /// 1 minute
    M1,
    /// 3 minutes
    M3,
    /// 5 minutes
    M5,
    /// 15 minutes
    M15,
    /// 30 minutes
    M30,
    /// 1 hour
    H1,
    /// 2 hours
    H2,
    /// 4 hours
    H4,
    /// 6 hours
    H6,
    /// 12 hours
    H12,
    /// 1 day
    D1,
    /// 1 week
    W1,
}

impl Timeframe {
    /// Duration of this timeframe in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 3 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 3600,
            Timeframe::H2 => 2 * 3600,
            Timeframe::H4 => 4 * 3600,
            Timeframe::H6 => 6 * 3600,
            Timeframe::H12 => 12 * 3600,
            Timeframe::D1 => 86400,
            Timeframe::W1 => 7 * 86400,
        }
    }

    /// All supported timeframes, shortest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::M1,
            Timeframe::M3,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H2,
            Timeframe::H4,
            Timeframe::H6,
            Timeframe::H12,
            Timeframe::D1,
            Timeframe::W1,
        ]
    }

    /// Short label used in series keys and exchange stream names (`1m`, `4h`).
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }

    /// Parse a label such as `5m` or `1h`.
    pub fn parse(label: &str) -> Result<Self, SeriesError> {
        let wanted = label.trim().to_ascii_lowercase();
        Timeframe::all()
            .iter()
            .copied()
            .find(|tf| tf.label() == wanted)
            .ok_or_else(|| SeriesError::InvalidTimeframe(label.to_string()))
    }

    /// Align a timestamp (seconds) to this timeframe's boundary (floor).
    pub fn align(&self, time_s: i64) -> i64 {
        time_s.div_euclid(self.seconds()) * self.seconds()
    }

    /// Whether `self` is a strictly longer exact multiple of `base`.
    pub fn is_multiple_of(&self, base: Timeframe) -> bool {
        self.seconds() > base.seconds() && self.seconds() % base.seconds() == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = SeriesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::parse(s)
    }
}

impl TryFrom<String> for Timeframe {
    type Error = SeriesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Timeframe::parse(&value)
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.label().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_timeframe_seconds() {
        assert_eq!(Timeframe::M1.seconds(), 60);
        assert_eq!(Timeframe::H1.seconds(), 3600);
        assert_eq!(Timeframe::D1.seconds(), 86_400);
    }

    #[test]
    fn test_timeframe_alignment() {
        let ts = 5 * 60 + 30; // 5m30s
        assert_eq!(Timeframe::M1.align(ts), 300);
        assert_eq!(Timeframe::M5.align(ts), 300);
        assert_eq!(Timeframe::M15.align(ts), 0);
    }

    #[test]
    fn test_alignment_before_epoch_floors() {
        assert_eq!(Timeframe::M1.align(-1), -60);
    }

    #[test]
    fn test_parse_labels() {
        for tf in Timeframe::all() {
            assert_eq!(Timeframe::parse(tf.label()).unwrap(), *tf);
        }
        assert_eq!(Timeframe::parse(" 4H ").unwrap(), Timeframe::H4);
        assert!(Timeframe::parse("7m").is_err());
    }

    #[test]
    fn test_is_multiple_of() {
        assert!(Timeframe::M5.is_multiple_of(Timeframe::M1));
        assert!(Timeframe::H1.is_multiple_of(Timeframe::M15));
        assert!(!Timeframe::M1.is_multiple_of(Timeframe::M1));
        assert!(!Timeframe::M5.is_multiple_of(Timeframe::M3));
        assert!(!Timeframe::M1.is_multiple_of(Timeframe::M5));
    }

    #[test]
    fn test_serializes_as_label() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Timeframe = serde_json::from_str("\"1d\"").unwrap();
        assert_eq!(back, Timeframe::D1);
    }

    proptest! {
        #[test]
        fn prop_align_is_bucket_floor(t in -10_000_000i64..10_000_000, idx in 0usize..12) {
            let tf = Timeframe::all()[idx];
            let start = tf.align(t);
            prop_assert!(start <= t);
            prop_assert!(t - start < tf.seconds());
            prop_assert_eq!(start.rem_euclid(tf.seconds()), 0);
            prop_assert_eq!(tf.align(start), start);
        }
    }
}
