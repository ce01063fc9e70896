//! `PostgreSQL` checkpoint storage for Tally.
//!
//! Implements the [`CheckpointStore`] trait from `tally-core`. Each checkpoint is one
//! row in `aggregator_checkpoints`, keyed by `(pipeline, version)`, so several
//! pipelines can share a database. A commit inserts the new row and prunes old ones
//! in a single transaction: a crash either leaves the new checkpoint fully visible
//! or not at all.
//!
//! # Example
//!
//! ```no_run
//! use tally_postgres::PostgresCheckpointStore;
//! use tally_core::CheckpointStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresCheckpointStore::connect("postgres://localhost/tally", "merchant-totals").await?;
//! store.migrate().await?;
//!
//! if let Some(checkpoint) = store.latest().await? {
//!     println!("resuming from v{}", checkpoint.version);
//! }
//! # Ok(())
//! # }
//! ```

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use tally_core::{Checkpoint, CheckpointError, CheckpointStore};

/// Default number of checkpoints kept per pipeline.
pub const DEFAULT_RETAIN: i64 = 5;

const UNIQUE_VIOLATION: &str = "23505";

/// `PostgreSQL`-backed [`CheckpointStore`].
#[derive(Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
    pipeline: String,
    retain: i64,
}

impl PostgresCheckpointStore {
    /// Wrap an existing pool. Checkpoints are stored under `pipeline`.
    #[must_use]
    pub fn from_pool(pool: PgPool, pipeline: impl Into<String>) -> Self {
        Self {
            pool,
            pipeline: pipeline.into(),
            retain: DEFAULT_RETAIN,
        }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] if the connection cannot be established.
    pub async fn connect(
        database_url: &str,
        pipeline: impl Into<String>,
    ) -> Result<Self, CheckpointError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .map_err(|e| CheckpointError::Read {
                location: "postgres".to_string(),
                reason: format!("Failed to connect: {e}"),
            })?;
        Ok(Self::from_pool(pool, pipeline))
    }

    /// Keep the newest `retain` checkpoints (at least one).
    #[must_use]
    pub fn with_retain(mut self, retain: i64) -> Self {
        self.retain = retain.max(1);
        self
    }

    /// Create the checkpoint table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Write`] if the migration fails.
    pub async fn migrate(&self) -> Result<(), CheckpointError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CheckpointError::Write {
                version: 0,
                reason: format!("Migration failed: {e}"),
            })
    }

    /// The pipeline name checkpoints are stored under.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn location(&self, version: Option<i64>) -> String {
        match version {
            Some(version) => format!("postgres:aggregator_checkpoints/{}/v{version}", self.pipeline),
            None => format!("postgres:aggregator_checkpoints/{}", self.pipeline),
        }
    }

    /// Committed versions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Read`] if the query fails.
    pub async fn versions(&self) -> Result<Vec<u64>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT version FROM aggregator_checkpoints WHERE pipeline = $1 ORDER BY version",
        )
        .bind(&self.pipeline)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CheckpointError::Read {
            location: self.location(None),
            reason: e.to_string(),
        })?;

        rows.iter()
            .map(|row| {
                let version: i64 = row.try_get("version").map_err(|e| CheckpointError::Read {
                    location: self.location(None),
                    reason: e.to_string(),
                })?;
                u64::try_from(version).map_err(|e| CheckpointError::Corrupt {
                    location: self.location(Some(version)),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn insert_and_prune(&self, checkpoint: &Checkpoint) -> Result<u64, CheckpointError> {
        let write_error = |reason: String| CheckpointError::Write {
            version: checkpoint.version,
            reason,
        };
        let version = i64::try_from(checkpoint.version).map_err(|e| write_error(e.to_string()))?;
        let payload = checkpoint.to_bytes()?;

        let mut tx = self.pool.begin().await.map_err(|e| write_error(e.to_string()))?;

        let inserted = sqlx::query(
            r"
            INSERT INTO aggregator_checkpoints (pipeline, version, payload, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(&self.pipeline)
        .bind(version)
        .bind(&payload)
        .bind(checkpoint.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            let duplicate = e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code == UNIQUE_VIOLATION);
            return Err(if duplicate {
                CheckpointError::AlreadyExists {
                    version: checkpoint.version,
                }
            } else {
                write_error(e.to_string())
            });
        }

        let pruned = sqlx::query(
            "DELETE FROM aggregator_checkpoints WHERE pipeline = $1 AND version <= $2",
        )
        .bind(&self.pipeline)
        .bind(version - self.retain)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e.to_string()))?
        .rows_affected();

        tx.commit().await.map_err(|e| write_error(e.to_string()))?;
        Ok(pruned)
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    fn latest(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT version, payload FROM aggregator_checkpoints
                WHERE pipeline = $1
                ORDER BY version DESC
                LIMIT 1
                ",
            )
            .bind(&self.pipeline)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| CheckpointError::Read {
                location: self.location(None),
                reason: e.to_string(),
            })?;

            let Some(row) = row else {
                return Ok(None);
            };
            let version: i64 = row.try_get("version").map_err(|e| CheckpointError::Read {
                location: self.location(None),
                reason: e.to_string(),
            })?;
            let location = self.location(Some(version));
            let payload: Vec<u8> = row.try_get("payload").map_err(|e| CheckpointError::Read {
                location: location.clone(),
                reason: e.to_string(),
            })?;

            Checkpoint::from_bytes(&payload, &location).map(Some)
        })
    }

    fn commit<'a>(
        &'a self,
        checkpoint: &'a Checkpoint,
    ) -> Pin<Box<dyn Future<Output = Result<(), CheckpointError>> + Send + 'a>> {
        Box::pin(async move {
            let pruned = self.insert_and_prune(checkpoint).await?;

            tracing::debug!(
                pipeline = %self.pipeline,
                version = checkpoint.version,
                pruned,
                "Checkpoint stored"
            );
            metrics::counter!("tally_postgres_checkpoints_pruned_total").increment(pruned);
            Ok(())
        })
    }
}
