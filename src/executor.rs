use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::query::TileQuery;
use crate::TileSource;

/// SQLSTATE Postgres reports when `statement_timeout` cancels a query.
const QUERY_CANCELED: &str = "57014";

/// Slack on top of the database-side timeout before we give up waiting on
/// the connection ourselves.
pub(crate) const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// Opens a read-only transaction whose statements the server cancels after
/// `timeout`. Rolling back or committing returns the connection to the pool
/// in a known state.
pub(crate) async fn begin_read_only(
    pool: &PgPool,
    timeout: Duration,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await?;
    sqlx::query(&format!(
        "SET LOCAL statement_timeout = {}",
        timeout.as_millis()
    ))
    .execute(&mut *tx)
    .await?;

    Ok(tx)
}

/// Whether `err` is Postgres cancelling a statement that ran into
/// `statement_timeout`.
pub(crate) fn is_query_canceled(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED)
    )
}

/// The result of rendering a tile.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TileOutcome {
    Tile(Vec<u8>),
    /// The query ran but no features fell inside the tile.
    Empty,
}

impl TileOutcome {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            TileOutcome::Tile(bytes) => bytes,
            TileOutcome::Empty => Vec::new(),
        }
    }
}

/// Renders tiles by running one read-only query per tile against a pool.
#[derive(Clone, Debug)]
pub struct TileExecutor {
    pool: PgPool,
    timeout: Duration,
}

impl TileExecutor {
    pub fn new(pool: PgPool, timeout: Duration) -> TileExecutor {
        TileExecutor { pool, timeout }
    }

    async fn fetch(&self, query: &TileQuery) -> Result<Option<Vec<u8>>, sqlx::Error> {
        let sql = query.sql();
        let mut tx = begin_read_only(&self.pool, self.timeout).await?;

        let row = query.bind(sqlx::query(&sql)).fetch_one(&mut *tx).await?;
        let tile: Option<Vec<u8>> = row.try_get(0)?;
        tx.commit().await?;

        Ok(tile)
    }

    fn query_error(&self, query: &TileQuery, source: sqlx::Error) -> Error {
        if is_query_canceled(&source) {
            Error::QueryTimeout {
                layer: query.layer.name.clone(),
                tile: query.tile,
                timeout: self.timeout,
            }
        } else {
            Error::Query {
                layer: query.layer.name.clone(),
                tile: query.tile,
                source,
            }
        }
    }
}

#[async_trait]
impl TileSource for TileExecutor {
    async fn render_mvt(&self, query: &TileQuery) -> Result<TileOutcome> {
        debug!(
            layer = %query.layer.name,
            zoom = query.tile.zoom,
            x = query.tile.x,
            y = query.tile.y,
            "rendering tile"
        );

        let result = match tokio::time::timeout(self.timeout + TIMEOUT_GRACE, self.fetch(query)).await
        {
            Ok(result) => result.map_err(|e| self.query_error(query, e)),
            Err(_) => Err(Error::QueryTimeout {
                layer: query.layer.name.clone(),
                tile: query.tile,
                timeout: self.timeout,
            }),
        };

        match result {
            Ok(Some(bytes)) if !bytes.is_empty() => Ok(TileOutcome::Tile(bytes)),
            Ok(_) => Ok(TileOutcome::Empty),
            Err(e) => {
                error!(error = %e, "tile query failed");
                Err(e)
            }
        }
    }
}
