//! PostgreSQL storage nodes.
//!
//! Each node gets its own connection pool and a table named after the
//! location. Rows are `(mac, ts_ms, signal)` with no uniqueness
//! constraint, so repeated batches are stored repeatedly.

use crate::config::DatabaseConfig;
use crate::observation::Observation;
use crate::shard_router::{ObservationStore, StorageError, StoreConnector};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info, instrument};

/// Rows per INSERT statement, three bind parameters each.
const INSERT_CHUNK_ROWS: usize = 10_000;

const MAX_NODE_NAME_LEN: usize = 63;

/// Node names become table identifiers, so only a safe subset is allowed.
pub fn validate_node_name(name: &str) -> Result<(), StorageError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NODE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidNodeName(name.to_string()))
    }
}

/// Opens one PostgreSQL pool per node.
pub struct PgConnector {
    config: DatabaseConfig,
}

impl PgConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    #[instrument(skip(self, target))]
    async fn connect(
        &self,
        name: &str,
        target: &str,
    ) -> Result<Box<dyn ObservationStore>, StorageError> {
        validate_node_name(name)?;

        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout())
            .connect(target)
            .await
            .map_err(|source| StorageError::Connect {
                name: name.to_string(),
                source,
            })?;

        let store = PgObservationStore {
            table: name.to_string(),
            pool,
        };
        store.ensure_table().await?;

        info!(node = %name, "Connected to PostgreSQL node");
        Ok(Box::new(store))
    }
}

pub struct PgObservationStore {
    table: String,
    pool: PgPool,
}

impl PgObservationStore {
    async fn ensure_table(&self) -> Result<(), StorageError> {
        let ddl = format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (mac TEXT NOT NULL, ts_ms BIGINT NOT NULL, signal SMALLINT NOT NULL)"#,
            self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|source| StorageError::Connect {
                name: self.table.clone(),
                source,
            })?;
        Ok(())
    }

    fn insert_error(&self, source: sqlx::Error) -> StorageError {
        StorageError::Insert {
            name: self.table.clone(),
            source,
        }
    }
}

#[async_trait]
impl ObservationStore for PgObservationStore {
    #[instrument(skip(self, observations), fields(node = %self.table, count = observations.len()))]
    async fn insert(&self, observations: &[Observation]) -> Result<u64, StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|source| self.insert_error(source))?;

        let mut stored = 0;
        for chunk in observations.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!(r#"INSERT INTO "{}" (mac, ts_ms, signal) "#, self.table));
            builder.push_values(chunk, |mut row, observation| {
                row.push_bind(&observation.mac)
                    .push_bind(observation.timestamp_ms)
                    .push_bind(i16::from(observation.signal));
            });

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|source| self.insert_error(source))?;
            stored += result.rows_affected();
        }

        tx.commit().await.map_err(|source| self.insert_error(source))?;

        debug!(stored, "Observations committed");
        Ok(stored)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
