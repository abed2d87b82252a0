//! Call domain primitives shared by the device client and the server
//!
//! The composite id is the dedup key of the whole pipeline: the ingestor uses
//! it to skip call-log rows it has already stored, and the server uses it as
//! the upsert key for `start_call` / `batch_sync_calls`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of call as reported by the OS call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Incoming,
    Outgoing,
    Missed,
    Rejected,
    Blocked,
}

impl CallType {
    /// Map an Android `CallLog.Calls.TYPE` code
    pub fn from_os_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(CallType::Incoming),
            2 => Some(CallType::Outgoing),
            3 => Some(CallType::Missed),
            5 => Some(CallType::Rejected),
            6 => Some(CallType::Blocked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Incoming => "incoming",
            CallType::Outgoing => "outgoing",
            CallType::Missed => "missed",
            CallType::Rejected => "rejected",
            CallType::Blocked => "blocked",
        }
    }

    /// Missed and rejected calls both count as "missed" in contact stats
    pub fn counts_as_missed(&self) -> bool {
        matches!(self, CallType::Missed | CallType::Rejected)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incoming" => Ok(CallType::Incoming),
            "outgoing" => Ok(CallType::Outgoing),
            "missed" => Ok(CallType::Missed),
            "rejected" => Ok(CallType::Rejected),
            "blocked" => Ok(CallType::Blocked),
            other => Err(crate::Error::InvalidInput(format!("Unknown call type: {}", other))),
        }
    }
}

/// Which SIM slots the ingestor tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SimSelection {
    Off,
    Sim1,
    Sim2,
    #[default]
    Both,
}

impl SimSelection {
    /// Whether a call-log row placed on `subscription_id` is tracked.
    ///
    /// `sim1`/`sim2` are the subscription ids configured for each slot; an
    /// unconfigured slot only matches rows that carry no subscription id.
    pub fn matches(&self, subscription_id: Option<i64>, sim1: Option<i64>, sim2: Option<i64>) -> bool {
        match self {
            SimSelection::Off => false,
            SimSelection::Sim1 => subscription_id == sim1,
            SimSelection::Sim2 => subscription_id == sim2,
            SimSelection::Both => true,
        }
    }
}

/// Normalise a raw phone number towards E.164.
///
/// - `+` prefixed numbers keep their country code
/// - `00` international prefix becomes `+`
/// - with a default country code, a leading trunk `0` is replaced by it and
///   national numbers (10 digits or fewer) get it prepended
/// - short codes (fewer than 7 digits) are returned as bare digits
///
/// Returns an empty string for withheld/unknown numbers.
pub fn normalize_phone_number(raw: &str, default_country_code: Option<&str>) -> String {
    let trimmed = raw.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return String::new();
    }
    if has_plus {
        return format!("+{}", digits);
    }
    if let Some(rest) = digits.strip_prefix("00") {
        if !rest.is_empty() {
            return format!("+{}", rest);
        }
    }
    if digits.len() < 7 {
        return digits;
    }

    let cc = default_country_code
        .map(|c| c.trim().trim_start_matches('+'))
        .filter(|c| !c.is_empty() && c.chars().all(|ch| ch.is_ascii_digit()));

    match cc {
        Some(cc) => {
            if let Some(national) = digits.strip_prefix('0') {
                format!("+{}{}", cc, national)
            } else if digits.len() <= 10 {
                format!("+{}{}", cc, digits)
            } else {
                format!("+{}", digits)
            }
        }
        None => digits,
    }
}

/// Digits of a phone number, for file names and loose matching
pub fn phone_digits(number: &str) -> String {
    number.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Deterministic call key: `{type}-{device}-{number}-{timestamp_ms}`.
///
/// Pure function of its inputs; re-ingesting the same call-log row always
/// yields the same id.
pub fn composite_id(call_type: CallType, device_id: &str, normalized_number: &str, timestamp_ms: i64) -> String {
    let clean_number: String = normalized_number
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    let device = device_id.trim();
    let device = if device.is_empty() { "unknown_dev" } else { device };
    format!("{}-{}-{}-{}", call_type.as_str(), device, clean_number, timestamp_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_id_is_deterministic() {
        let a = composite_id(CallType::Incoming, "devA", "+919876543210", 1_700_000_000_000);
        let b = composite_id(CallType::Incoming, "devA", "+919876543210", 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a, "incoming-devA-+919876543210-1700000000000");
    }

    #[test]
    fn test_composite_id_distinguishes_inputs() {
        let base = composite_id(CallType::Incoming, "devA", "+15550001111", 1000);
        assert_ne!(base, composite_id(CallType::Outgoing, "devA", "+15550001111", 1000));
        assert_ne!(base, composite_id(CallType::Incoming, "devB", "+15550001111", 1000));
        assert_ne!(base, composite_id(CallType::Incoming, "devA", "+15550001112", 1000));
        assert_ne!(base, composite_id(CallType::Incoming, "devA", "+15550001111", 1001));
    }

    #[test]
    fn test_composite_id_blank_device() {
        let id = composite_id(CallType::Missed, "  ", "12345", 5);
        assert_eq!(id, "missed-unknown_dev-12345-5");
    }

    #[test]
    fn test_normalize_keeps_plus() {
        assert_eq!(normalize_phone_number("+91 98765-43210", Some("91")), "+919876543210");
    }

    #[test]
    fn test_normalize_double_zero_prefix() {
        assert_eq!(normalize_phone_number("0044 20 7946 0018", None), "+442079460018");
    }

    #[test]
    fn test_normalize_trunk_prefix_with_country() {
        assert_eq!(normalize_phone_number("098765 43210", Some("+91")), "+919876543210");
        assert_eq!(normalize_phone_number("9876543210", Some("91")), "+919876543210");
    }

    #[test]
    fn test_normalize_without_country_returns_digits() {
        assert_eq!(normalize_phone_number("(555) 000-1111", None), "5550001111");
    }

    #[test]
    fn test_normalize_short_codes_and_unknown() {
        assert_eq!(normalize_phone_number("121", Some("91")), "121");
        assert_eq!(normalize_phone_number("Unknown", Some("91")), "");
    }

    #[test]
    fn test_sim_selection() {
        assert!(!SimSelection::Off.matches(Some(1), Some(1), Some(2)));
        assert!(SimSelection::Sim1.matches(Some(1), Some(1), Some(2)));
        assert!(!SimSelection::Sim1.matches(Some(2), Some(1), Some(2)));
        assert!(SimSelection::Sim2.matches(Some(2), Some(1), Some(2)));
        assert!(SimSelection::Both.matches(None, Some(1), Some(2)));
    }

    #[test]
    fn test_call_type_codes_and_parse() {
        assert_eq!(CallType::from_os_code(3), Some(CallType::Missed));
        assert_eq!(CallType::from_os_code(4), None);
        assert_eq!("Outgoing".parse::<CallType>().unwrap(), CallType::Outgoing);
        assert!("voicemail".parse::<CallType>().is_err());
    }
}
