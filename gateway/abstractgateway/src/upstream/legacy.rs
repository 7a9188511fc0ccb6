//! Adapter between the first-generation equipment wire schema and [`ValidationEvent`].
//!
//! Older readers still send `CardId` and an enumerated `Result`. The canonical
//! model only knows `tokenId` and a free-form `status`; the legacy fields are
//! derived on demand and never stored next to the canonical ones.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};

use super::event::{Amount, ValidationEvent};

/// Event type assigned to everything arriving through the legacy schema.
pub const LEGACY_EVENT_TYPE: &str = "validation";

/// Serialized by name. Deserialized from the name in any case, or from the
/// ordinal (`0`, `1`, `2`) that equipment emitting a numeric enum sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationResult {
    Success,
    Failure,
    Error,
}

impl<'de> Deserialize<'de> for ValidationResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Ordinal(u64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Ordinal(0) => Ok(ValidationResult::Success),
            Raw::Ordinal(1) => Ok(ValidationResult::Failure),
            Raw::Ordinal(2) => Ok(ValidationResult::Error),
            Raw::Ordinal(n) => Err(de::Error::custom(format!("unknown validation result ordinal {n}"))),
            Raw::Name(name) => match name.trim().to_ascii_lowercase().as_str() {
                "success" => Ok(ValidationResult::Success),
                "failure" => Ok(ValidationResult::Failure),
                "error" => Ok(ValidationResult::Error),
                _ => Err(de::Error::unknown_variant(&name, &["Success", "Failure", "Error"])),
            },
        }
    }
}

impl ValidationResult {
    /// Case-insensitive; anything unrecognised is reported as `Error`.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "success" => ValidationResult::Success,
            "failure" => ValidationResult::Failure,
            _ => ValidationResult::Error,
        }
    }

    pub fn as_status(&self) -> &'static str {
        match self {
            ValidationResult::Success => "success",
            ValidationResult::Failure => "failure",
            ValidationResult::Error => "error",
        }
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_status())
    }
}

/// First-generation wire shape (PascalCase, `CardId` + `Result`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LegacyValidationEvent {
    pub equipment_id: String,
    pub card_id: String,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub amount: Amount,
    pub result: ValidationResult,
    #[serde(default)]
    pub sequence: i64,
    #[serde(default)]
    pub session_id: String,
}

impl From<LegacyValidationEvent> for ValidationEvent {
    fn from(l: LegacyValidationEvent) -> Self {
        ValidationEvent {
            equipment_id: l.equipment_id,
            token_id: l.card_id,
            timestamp: l.timestamp,
            location: l.location,
            amount: l.amount,
            event_type: LEGACY_EVENT_TYPE.to_string(),
            status: l.result.as_status().to_string(),
            sequence: l.sequence,
            session_id: l.session_id,
            metadata: BTreeMap::new(),
        }
    }
}

impl ValidationEvent {
    /// Legacy `cardId` view.
    pub fn card_id(&self) -> &str {
        &self.token_id
    }

    /// Legacy `result` view.
    pub fn result(&self) -> ValidationResult {
        ValidationResult::from_status(&self.status)
    }

    pub fn to_legacy(&self) -> LegacyValidationEvent {
        LegacyValidationEvent {
            equipment_id: self.equipment_id.clone(),
            card_id: self.token_id.clone(),
            timestamp: self.timestamp,
            location: self.location.clone(),
            amount: self.amount,
            result: self.result(),
            sequence: self.sequence,
            session_id: self.session_id.clone(),
        }
    }
}
