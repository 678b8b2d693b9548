//! Upload admission: TTL parsing and the size/TTL ceilings applied before
//! a drop becomes visible.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("invalid duration `{0}`, use a value like 30m, 24h or 7d")]
    InvalidDuration(String),
    #[error("requested TTL of {requested}s exceeds the maximum of {max}s")]
    TtlTooLong { requested: u64, max: u64 },
}

/// Parse `<positive integer><unit>` with unit one of `s`, `m`, `h`, `d`.
pub fn parse_duration(raw: &str) -> Result<u64, AdmissionError> {
    let invalid = || AdmissionError::InvalidDuration(raw.to_string());

    let trimmed = raw.trim();
    let mut chars = trimmed.chars();
    let unit = chars.next_back().ok_or_else(invalid)?;
    let digits = chars.as_str();

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        _ => return Err(invalid()),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    if amount == 0 {
        return Err(invalid());
    }
    amount.checked_mul(multiplier).ok_or_else(invalid)
}

/// Read-only ceilings consumed by the upload path.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionPolicy {
    pub max_file_size: u64,
    pub max_ttl_secs: u64,
}

impl AdmissionPolicy {
    pub fn new(max_file_size: u64, max_ttl_secs: u64) -> Self {
        Self {
            max_file_size,
            max_ttl_secs,
        }
    }

    /// Validate a requested TTL and return it in seconds.
    pub fn ttl_secs(&self, raw: &str) -> Result<u64, AdmissionError> {
        let requested = parse_duration(raw)?;
        if requested > self.max_ttl_secs {
            return Err(AdmissionError::TtlTooLong {
                requested,
                max: self.max_ttl_secs,
            });
        }
        Ok(requested)
    }

    /// Absolute expiry for a drop created at `now`.
    pub fn expires_at(&self, raw: &str, now: i64) -> Result<i64, AdmissionError> {
        let ttl = self.ttl_secs(raw)?;
        // ttl <= max_ttl_secs, which config keeps well inside i64.
        Ok(now.saturating_add(ttl as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THIRTY_DAYS: u64 = 30 * 86_400;

    #[test]
    fn parses_each_unit() {
        assert_eq!(parse_duration("45s"), Ok(45));
        assert_eq!(parse_duration("30m"), Ok(1_800));
        assert_eq!(parse_duration("24h"), Ok(86_400));
        assert_eq!(parse_duration("7d"), Ok(604_800));
        assert_eq!(parse_duration(" 1m "), Ok(60));
    }

    #[test]
    fn rejects_malformed_durations() {
        for raw in ["0m", "-5h", "abc", "30", "", "m", "5w", "1.5h", "+5h", "5 h", "5H"] {
            assert_eq!(
                parse_duration(raw),
                Err(AdmissionError::InvalidDuration(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overflowing_amounts() {
        assert!(parse_duration("99999999999999999999d").is_err());
        assert!(parse_duration("999999999999999999d").is_err());
    }

    #[test]
    fn enforces_ttl_ceiling() {
        let policy = AdmissionPolicy::new(1024, THIRTY_DAYS);
        assert_eq!(policy.ttl_secs("30d"), Ok(THIRTY_DAYS));
        assert_eq!(
            policy.ttl_secs("31d"),
            Err(AdmissionError::TtlTooLong {
                requested: 31 * 86_400,
                max: THIRTY_DAYS
            })
        );
        assert!(matches!(
            policy.ttl_secs("721h"),
            Err(AdmissionError::TtlTooLong { .. })
        ));
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let policy = AdmissionPolicy::new(1024, 3_600);
        assert_eq!(policy.expires_at("1m", 1_000), Ok(1_060));
        assert!(policy.expires_at("2h", 1_000).is_err());
    }
}
