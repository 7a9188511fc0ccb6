use std::sync::Arc;

use abstractdatabase::StoreConfig;
use tokio_postgres::{Client, NoTls, Row};

use crate::postgresimpl::DbError;

/// Shared tokio-postgres client; queries issued concurrently are pipelined
/// over the one connection.
#[derive(Clone)]
pub struct PostgresClient {
    client: Arc<Client>,
}

impl PostgresClient {
    pub async fn connect(cfg: &StoreConfig) -> Result<Self, DbError> {
        let (client, connection) = tokio_postgres::connect(&cfg.connection_string(), NoTls)
            .await
            .map_err(DbError::Postgres)?;

        // Drive the connection in the background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("Postgres connection error: {e}");
            }
        });

        log::info!(
            "connected to postgres {}:{}/{} as {}",
            cfg.host,
            cfg.port,
            cfg.database,
            cfg.user
        );

        Ok(Self {
            client: Arc::new(client),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<u64, DbError> {
        self.client.execute(sql, params).await.map_err(DbError::Postgres)
    }

    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        self.client.query(sql, params).await.map_err(DbError::Postgres)
    }
}
