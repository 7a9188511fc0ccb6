use abstractgateway::{Amount, ValidationEvent};
use chrono::{TimeZone, Utc};

pub const NORD: &str = "STATION-NORD";
pub const SUD: &str = "STATION-SUD";

/// Deterministic event: fixed timestamp, `EQ-000001`, STATION-NORD.
pub fn event(seq: i64) -> ValidationEvent {
    event_at(seq, NORD)
}

pub fn event_at(seq: i64, location: &str) -> ValidationEvent {
    let ts = Utc
        .with_ymd_and_hms(2026, 10, 19, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    ValidationEvent::new("EQ-000001", format!("TOKEN-{seq}"), location)
        .with_timestamp(ts + chrono::Duration::milliseconds(seq))
        .with_amount(Amount::from_minor_units(250))
        .with_status("success")
        .with_session("SESSION-1")
        .with_sequence(seq)
}

/// [`event`] carrying reader metadata.
pub fn tagged_event(seq: i64) -> ValidationEvent {
    event(seq)
        .with_metadata("firmware", "4.2.1")
        .with_metadata("reader", format!("R-{}", seq % 3))
}
