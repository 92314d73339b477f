//! Shared primitives for the mnemo memory engine.

#![deny(unsafe_code)]

/// Schema version written to `config.json` and checked by the index on open.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub mod time {
    //! UTC, millisecond-precision timestamps used throughout the chain and index.

    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Milliseconds since the Unix epoch, UTC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Timestamp(i64);

    impl Timestamp {
        /// The current wall-clock time.
        pub fn now() -> Self {
            let ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system clock before unix epoch")
                .as_millis() as i64;
            Self(ms)
        }

        /// Construct from raw milliseconds since epoch.
        pub fn from_millis(ms: i64) -> Self {
            Self(ms)
        }

        /// Raw milliseconds since epoch.
        pub fn as_millis(&self) -> i64 {
            self.0
        }

        /// Seconds elapsed between `self` and an earlier `other` (may be negative
        /// if `other` is in the future relative to `self`).
        pub fn age_seconds_since(&self, other: Timestamp) -> f64 {
            (self.0 - other.0) as f64 / 1000.0
        }

        /// Render as an ISO-8601 / RFC3339 string with millisecond precision,
        /// e.g. `2026-07-27T12:34:56.789Z`. Hand-rolled (no `chrono`/`time`
        /// dependency): the civil calendar math is simple enough, deterministic,
        /// and this is the one on-disk byte format the chain's signatures are
        /// computed over, so it must not depend on a library's formatting quirks.
        pub fn to_rfc3339_millis(&self) -> String {
            let total_ms = self.0;
            let ms_part = total_ms.rem_euclid(1000);
            let total_secs = total_ms.div_euclid(1000);
            let days = total_secs.div_euclid(86_400);
            let secs_of_day = total_secs.rem_euclid(86_400);
            let (year, month, day) = civil_from_days(days);
            let hour = secs_of_day / 3600;
            let minute = (secs_of_day % 3600) / 60;
            let second = secs_of_day % 60;
            format!(
                "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{ms_part:03}Z"
            )
        }

        /// Parse an RFC3339 millisecond-precision UTC timestamp of the form
        /// produced by [`Timestamp::to_rfc3339_millis`].
        pub fn from_rfc3339_millis(s: &str) -> Result<Self, String> {
            let s = s.strip_suffix('Z').ok_or_else(|| format!("missing UTC 'Z' suffix: {s}"))?;
            let (date, time) = s.split_once('T').ok_or_else(|| format!("missing 'T': {s}"))?;
            let mut date_parts = date.split('-');
            let year: i64 = date_parts
                .next()
                .ok_or("missing year")?
                .parse()
                .map_err(|_| "bad year".to_string())?;
            let month: i64 = date_parts
                .next()
                .ok_or("missing month")?
                .parse()
                .map_err(|_| "bad month".to_string())?;
            let day: i64 = date_parts
                .next()
                .ok_or("missing day")?
                .parse()
                .map_err(|_| "bad day".to_string())?;
            let (hms, ms) = time.split_once('.').ok_or("missing millis")?;
            let ms: i64 = ms.parse().map_err(|_| "bad millis".to_string())?;
            let mut hms_parts = hms.split(':');
            let hour: i64 = hms_parts
                .next()
                .ok_or("missing hour")?
                .parse()
                .map_err(|_| "bad hour".to_string())?;
            let minute: i64 = hms_parts
                .next()
                .ok_or("missing minute")?
                .parse()
                .map_err(|_| "bad minute".to_string())?;
            let second: i64 = hms_parts
                .next()
                .ok_or("missing second")?
                .parse()
                .map_err(|_| "bad second".to_string())?;
            let days = days_from_civil(year, month, day);
            let total_secs = days * 86_400 + hour * 3600 + minute * 60 + second;
            Ok(Self(total_secs * 1000 + ms))
        }
    }

    impl Serialize for Timestamp {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.to_rfc3339_millis())
        }
    }

    impl<'de> Deserialize<'de> for Timestamp {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let s = String::deserialize(deserializer)?;
            Timestamp::from_rfc3339_millis(&s).map_err(serde::de::Error::custom)
        }
    }

    // Howard Hinnant's civil_from_days / days_from_civil algorithm (public domain),
    // valid for the proleptic Gregorian calendar.
    fn civil_from_days(z: i64) -> (i64, i64, i64) {
        let z = z + 719_468;
        let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
        let doe = (z - era * 146_097) as i64;
        let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
        let y = yoe + era * 400;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let d = doy - (153 * mp + 2) / 5 + 1;
        let m = if mp < 10 { mp + 3 } else { mp - 9 };
        let y = if m <= 2 { y + 1 } else { y };
        (y, m, d)
    }

    fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
        let y = if m <= 2 { y - 1 } else { y };
        let era = if y >= 0 { y } else { y - 399 } / 400;
        let yoe = y - era * 400;
        let mp = if m > 2 { m - 3 } else { m + 9 };
        let doy = (153 * mp + 2) / 5 + d - 1;
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        era * 146_097 + doe - 719_468
    }

}

pub mod ids {
    //! Monotonic, process-local sequence helper used where a caller needs a
    //! cheap incrementing counter without touching the chain (e.g. ring-buffer
    //! event ids in the telemetry sink).

    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    /// Return a fresh monotonically increasing id, starting at 1.
    pub fn next_monotonic_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }
}

pub mod error {
    //! Shared error-kind fragments reused across crates' own `thiserror` enums.

    use thiserror::Error;

    /// A chain/index integrity error kind, carrying the offending sequence
    /// number. Produced by `mnemo-chain::verify_chain` and surfaced unchanged
    /// through `mnemo::verify_chain`.
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum IntegrityErrorKind {
        /// `seq` did not increase by exactly 1 from the previous entry.
        #[error("sequence gap at seq {0}")]
        SequenceGap(u64),
        /// `prev_hash` did not match the canonical hash of the previous entry.
        #[error("prev_hash mismatch at seq {0}")]
        PrevHashMismatch(u64),
        /// The Ed25519 signature did not verify over the canonical skeleton.
        #[error("signature invalid at seq {0}")]
        SignatureInvalid(u64),
        /// A present CAS blob's digest did not match the entry's `content_hash`.
        #[error("content tampered at seq {0}")]
        ContentTampered(u64),
        /// The stored line could not be parsed as a `ChainEntry`.
        #[error("malformed entry at seq {0}: {1}")]
        MalformedEntry(u64, String),
    }
}
