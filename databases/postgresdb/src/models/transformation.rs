use abstractgateway::ValidationEvent;
use tokio_postgres::types::ToSql;

/// Owned parameter wrapper so we can build dynamic SQL with dynamic binds.
pub struct SqlParam(pub Box<dyn ToSql + Sync + Send>);

impl SqlParam {
    pub fn i64(v: i64) -> Self { Self(Box::new(v)) }
    pub fn text(v: impl Into<String>) -> Self { Self(Box::new(v.into())) }
    pub fn json(v: serde_json::Value) -> Self { Self(Box::new(v)) }
    pub fn timestamptz(v: chrono::DateTime<chrono::Utc>) -> Self { Self(Box::new(v)) }
}

impl std::fmt::Debug for SqlParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

/// Column order used for every insert; `event_row` must follow it.
pub const VALIDATION_COLUMNS: [&str; 11] = [
    "equipment_id",
    "token_id",
    "validated_at",
    "location",
    "amount_minor",
    "event_type",
    "status",
    "sequence",
    "session_id",
    "metadata",
    "message_id",
];

/// One event -> one row of bind parameters.
pub fn event_row(evt: &ValidationEvent) -> Vec<SqlParam> {
    let metadata = serde_json::Value::Object(
        evt.metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    );

    vec![
        SqlParam::text(evt.equipment_id.clone()),
        SqlParam::text(evt.token_id.clone()),
        SqlParam::timestamptz(evt.timestamp),
        SqlParam::text(evt.location.clone()),
        SqlParam::i64(evt.amount.minor_units()),
        SqlParam::text(evt.event_type.clone()),
        SqlParam::text(evt.status.clone()),
        SqlParam::i64(evt.sequence),
        SqlParam::text(evt.session_id.clone()),
        SqlParam::json(metadata),
        SqlParam::text(evt.message_id()),
    ]
}
