use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Id = String;

/// Number of fractional digits carried by [`Amount`].
pub const AMOUNT_SCALE: u32 = 2;
const AMOUNT_FACTOR: i64 = 100;

/// Fixed-point fare amount (two fractional digits, stored as minor units).
///
/// On the wire it is a plain JSON number (`2.35`). Strings are accepted on input
/// as well since some equipment firmwares quote decimals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AmountError {
    #[error("invalid amount '{0}'")]
    Invalid(String),
    #[error("amount '{0}' has more than {AMOUNT_SCALE} fractional digits")]
    TooPrecise(String),
}

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_minor_units(units: i64) -> Self {
        Self(units)
    }

    pub fn minor_units(&self) -> i64 {
        self.0
    }

    fn from_f64(v: f64) -> Result<Self, AmountError> {
        if !v.is_finite() {
            return Err(AmountError::Invalid(v.to_string()));
        }
        let scaled = v * AMOUNT_FACTOR as f64;
        let rounded = scaled.round();
        // f64 noise (2.35 * 100 = 234.99999999999997) is fine, a third digit is not
        if (scaled - rounded).abs() > 1e-6 {
            return Err(AmountError::TooPrecise(v.to_string()));
        }
        // 2^63 is exact in f64; `as` would saturate silently
        if rounded < i64::MIN as f64 || rounded >= i64::MAX as f64 {
            return Err(AmountError::Invalid(v.to_string()));
        }
        Ok(Self(rounded as i64))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        let valid = |p: &str| p.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !valid(int_part) || !valid(frac_part) {
            return Err(AmountError::Invalid(s.to_string()));
        }
        if frac_part.len() > AMOUNT_SCALE as usize {
            return Err(AmountError::TooPrecise(s.to_string()));
        }

        let int: i64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| AmountError::Invalid(s.to_string()))?
        };
        let mut frac: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part
                .parse()
                .map_err(|_| AmountError::Invalid(s.to_string()))?
        };
        for _ in frac_part.len()..AMOUNT_SCALE as usize {
            frac *= 10;
        }

        let units = int
            .checked_mul(AMOUNT_FACTOR)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(|| AmountError::Invalid(s.to_string()))?;
        Ok(Self(if negative { -units } else { units }))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:02}",
            abs / AMOUNT_FACTOR as u64,
            abs % AMOUNT_FACTOR as u64
        )
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0 as f64 / AMOUNT_FACTOR as f64)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => v
                .checked_mul(AMOUNT_FACTOR)
                .map(Amount)
                .ok_or_else(|| serde::de::Error::custom(AmountError::Invalid(v.to_string()))),
            Raw::Float(v) => Amount::from_f64(v).map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Normalized fare-validation event as it travels through the pipeline.
///
/// Gateways build it from their transport-native message; everything
/// downstream (dispatcher, broker, cache, storage) only ever sees this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationEvent {
    pub equipment_id: Id,
    pub token_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub amount: Amount,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ValidationEvent {
    /// Event stamped with the current time; remaining fields start empty.
    pub fn new(equipment_id: impl Into<Id>, token_id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            equipment_id: equipment_id.into(),
            token_id: token_id.into(),
            timestamp: Utc::now(),
            location: location.into(),
            amount: Amount::ZERO,
            event_type: "validation".to_string(),
            status: String::new(),
            sequence: 0,
            session_id: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_amount(mut self, amount: Amount) -> Self {
        self.amount = amount;
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Transport-level identity wins over whatever the payload claimed.
    pub fn with_equipment_id(mut self, equipment_id: impl Into<Id>) -> Self {
        self.equipment_id = equipment_id.into();
        self
    }

    /// `equipmentId_sequence`, used as broker message id for tracing/dedup.
    pub fn message_id(&self) -> String {
        format!("{}_{}", self.equipment_id, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_parses_and_formats() {
        assert_eq!("2.35".parse::<Amount>().unwrap().minor_units(), 235);
        assert_eq!("4".parse::<Amount>().unwrap().minor_units(), 400);
        assert_eq!("0.5".parse::<Amount>().unwrap().minor_units(), 50);
        assert_eq!("-1.05".parse::<Amount>().unwrap().minor_units(), -105);
        assert_eq!(Amount::from_minor_units(-105).to_string(), "-1.05");
        assert_eq!(Amount::from_minor_units(7).to_string(), "0.07");

        assert!(matches!("1.234".parse::<Amount>(), Err(AmountError::TooPrecise(_))));
        assert!(matches!("abc".parse::<Amount>(), Err(AmountError::Invalid(_))));
        assert!(matches!(".".parse::<Amount>(), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn amount_accepts_numbers_and_strings() {
        let a: Amount = serde_json::from_str("2.35").unwrap();
        let b: Amount = serde_json::from_str("\"2.35\"").unwrap();
        let c: Amount = serde_json::from_str("3").unwrap();
        assert_eq!(a.minor_units(), 235);
        assert_eq!(a, b);
        assert_eq!(c.minor_units(), 300);
        assert_eq!(serde_json::to_string(&a).unwrap(), "2.35");
        assert!(serde_json::from_str::<Amount>("2.355").is_err());
    }

    #[test]
    fn out_of_range_amounts_are_rejected() {
        for raw in ["1e300", "-1e300", "1e17"] {
            let err = serde_json::from_str::<Amount>(raw).unwrap_err();
            assert!(err.to_string().contains("invalid amount"), "{raw}: {err}");
        }
        let big: Amount = serde_json::from_str("9e16").unwrap();
        assert_eq!(big.minor_units(), 9_000_000_000_000_000_000);
    }

    #[test]
    fn event_uses_canonical_wire_names() {
        let evt = ValidationEvent::new("EQ-1", "TOKEN-9", "STATION-NORD")
            .with_amount(Amount::from_minor_units(180))
            .with_status("success")
            .with_sequence(42)
            .with_session("S-1")
            .with_metadata("firmware", "1.2.3");

        let v = serde_json::to_value(&evt).unwrap();
        for key in [
            "equipmentId", "tokenId", "timestamp", "location", "amount", "type", "status",
            "sequence", "sessionId", "metadata",
        ] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["type"], "validation");
        assert_eq!(evt.message_id(), "EQ-1_42");

        let back: ValidationEvent = serde_json::from_value(v).unwrap();
        assert_eq!(back, evt);
    }

    #[test]
    fn equipment_id_can_be_overridden() {
        let evt = ValidationEvent::new("from-payload", "T", "L").with_equipment_id("from-header");
        assert_eq!(evt.equipment_id, "from-header");
    }
}
