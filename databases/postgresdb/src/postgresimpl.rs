use abstractdatabase::{StoreConfig, StoreError, StoreResult, ValidationStore};
use abstractgateway::{ValidationEvent, MAX_BATCH_SIZE};
use async_trait::async_trait;

use crate::{
    models::transformation::{event_row, SqlParam, VALIDATION_COLUMNS},
    postgresclient::PostgresClient,
};

#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("invalid identifier '{0}' (only [A-Za-z_][A-Za-z0-9_]* allowed)")]
    InvalidIdentifier(String),

    #[error("batch of {0} rows exceeds the limit of {MAX_BATCH_SIZE}")]
    BatchTooLarge(usize),

    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match &e {
            DbError::Postgres(pg) if pg.is_closed() => StoreError::Unavailable(e.to_string()),
            DbError::Postgres(pg) => match pg.code().map(|c| c.code()) {
                // class 22 = data exception, class 23 = integrity violation
                Some(code) if code.starts_with("22") || code.starts_with("23") => {
                    StoreError::Rejected(e.to_string())
                }
                // class 08 = connection exception
                Some(code) if code.starts_with("08") => StoreError::Unavailable(e.to_string()),
                _ => StoreError::Backend(e.to_string()),
            },
            DbError::InvalidIdentifier(_) | DbError::BatchTooLarge(_) => {
                StoreError::Rejected(e.to_string())
            }
            DbError::Serde(_) => StoreError::Backend(e.to_string()),
        }
    }
}

fn validate_ident(s: &str) -> Result<(), DbError> {
    if abstractdatabase::model::configuration::is_identifier(s) {
        Ok(())
    } else {
        Err(DbError::InvalidIdentifier(s.to_string()))
    }
}

fn as_refs(params: &[SqlParam]) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    params
        .iter()
        .map(|p| (&*p.0) as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

pub fn create_table_sql(table: &str) -> Result<String, DbError> {
    validate_ident(table)?;
    Ok(format!(
        r#"
        CREATE TABLE IF NOT EXISTS {t} (
            id            BIGSERIAL PRIMARY KEY,
            equipment_id  TEXT        NOT NULL,
            token_id      TEXT        NOT NULL,
            validated_at  TIMESTAMPTZ NOT NULL,
            location      TEXT        NOT NULL,
            amount_minor  BIGINT      NOT NULL,
            event_type    TEXT        NOT NULL,
            status        TEXT        NOT NULL,
            sequence      BIGINT      NOT NULL,
            session_id    TEXT        NOT NULL,
            metadata      JSONB       NOT NULL DEFAULT '{{}}'::jsonb,
            message_id    TEXT        NOT NULL,
            inserted_at   TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
        t = table
    ))
}

/// Not unique: redelivery may legitimately insert the same message twice.
pub fn create_index_sql(table: &str) -> Result<String, DbError> {
    validate_ident(table)?;
    Ok(format!(
        "CREATE INDEX IF NOT EXISTS {t}_message_id_idx ON {t} (message_id)",
        t = table
    ))
}

/// Multi-row insert for one batch. A single statement is atomic on its own,
/// so no explicit transaction is needed.
pub fn build_insert(table: &str, batch: &[ValidationEvent]) -> Result<(String, Vec<SqlParam>), DbError> {
    validate_ident(table)?;
    if batch.len() > MAX_BATCH_SIZE {
        return Err(DbError::BatchTooLarge(batch.len()));
    }

    let width = VALIDATION_COLUMNS.len();
    let mut rows = Vec::with_capacity(batch.len());
    let mut params: Vec<SqlParam> = Vec::with_capacity(batch.len() * width);

    for (r, evt) in batch.iter().enumerate() {
        let placeholders: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
        rows.push(format!("({})", placeholders.join(", ")));
        params.extend(event_row(evt));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        table,
        VALIDATION_COLUMNS.join(", "),
        rows.join(", ")
    );
    Ok((sql, params))
}

pub struct PostgresValidationStore {
    name: String,
    table: String,
    client: PostgresClient,
}

impl PostgresValidationStore {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, DbError> {
        validate_ident(&cfg.table)?;
        let client = PostgresClient::connect(cfg).await?;
        Ok(Self::new(format!("pg-{}", cfg.database), &cfg.table, client))
    }

    pub fn new(name: impl Into<String>, table: impl Into<String>, client: PostgresClient) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            client,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the target table and its lookup index if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), DbError> {
        self.client.execute(&create_table_sql(&self.table)?, &[]).await?;
        self.client.execute(&create_index_sql(&self.table)?, &[]).await?;
        log::info!("{}: schema ready (table {})", self.name, self.table);
        Ok(())
    }

    pub async fn count_rows(&self) -> Result<i64, DbError> {
        validate_ident(&self.table)?;
        let rows = self
            .client
            .query(&format!("SELECT COUNT(*) FROM {}", self.table), &[])
            .await?;
        Ok(rows.first().map(|r| r.get::<_, i64>(0)).unwrap_or(0))
    }

    async fn insert_batch(&self, batch: &[ValidationEvent]) -> Result<u64, DbError> {
        let (sql, params) = build_insert(&self.table, batch)?;
        let refs = as_refs(&params);
        self.client.execute(&sql, &refs).await
    }
}

#[async_trait]
impl ValidationStore for PostgresValidationStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn bulk_insert(&self, batch: &[ValidationEvent]) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }
        match self.insert_batch(batch).await {
            Ok(n) => {
                log::debug!("{}: inserted {} rows", self.name, n);
                Ok(n)
            }
            Err(e) => {
                log::warn!("{}: bulk insert of {} rows failed: {e}", self.name, batch.len());
                Err(e.into())
            }
        }
    }

    async fn close(&self) -> StoreResult<()> {
        // tokio-postgres closes the connection once the last client clone is dropped
        log::info!("{}: closing (connection closed: {})", self.name, self.client.is_closed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abstractgateway::Amount;

    fn evt(seq: i64) -> ValidationEvent {
        ValidationEvent::new("EQ-000001", "TOKEN", "STATION-NORD")
            .with_amount(Amount::from_minor_units(250))
            .with_sequence(seq)
    }

    #[test]
    fn insert_has_one_placeholder_per_value() {
        let batch: Vec<_> = (0..3).map(evt).collect();
        let (sql, params) = build_insert("validations", &batch).unwrap();

        let width = VALIDATION_COLUMNS.len();
        assert_eq!(params.len(), 3 * width);
        assert!(sql.starts_with("INSERT INTO validations (equipment_id, token_id,"));
        assert!(sql.contains("($1, $2,"));
        assert!(sql.contains(&format!("${})", 3 * width)));
        assert!(!sql.contains(&format!("${}", 3 * width + 1)));
    }

    #[test]
    fn rejects_bad_identifiers_and_oversized_batches() {
        assert!(matches!(
            build_insert("validations;--", &[evt(1)]),
            Err(DbError::InvalidIdentifier(_))
        ));
        let big: Vec<_> = (0..(MAX_BATCH_SIZE as i64 + 1)).map(evt).collect();
        assert!(matches!(build_insert("validations", &big), Err(DbError::BatchTooLarge(_))));
        assert!(create_table_sql("bad name").is_err());
    }

    #[test]
    fn schema_sql_targets_table() {
        let sql = create_table_sql("fare_validations").unwrap();
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS fare_validations"));
        assert!(sql.contains("'{}'::jsonb"));
        let idx = create_index_sql("fare_validations").unwrap();
        assert!(idx.contains("fare_validations_message_id_idx"));
    }

    #[test]
    fn local_errors_map_to_rejections() {
        let e: StoreError = DbError::InvalidIdentifier("x y".into()).into();
        assert!(matches!(e, StoreError::Rejected(_)));
        assert!(!e.is_retryable());
    }
}
