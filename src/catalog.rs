//! The catalog of servable layers.
//!
//! Layers are discovered by introspecting the database through a
//! [`LayerSource`]. Each refresh builds a complete [`CatalogSnapshot`] off to
//! the side and then publishes it with a single atomic pointer swap, so
//! readers never block and never observe a half-built catalog. A failed
//! refresh leaves the last published snapshot in place.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::executor::begin_read_only;
use crate::layer::{Attribute, Layer, LayerDetails, SourceKind};
use crate::query::quote_ident;
use crate::tile::Bounds;

/// Where layer metadata comes from.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Lists every servable layer with its listing-tier fields populated.
    async fn list_layers(&self) -> Result<Vec<Layer>, sqlx::Error>;

    /// Loads the attribute list of one layer.
    async fn layer_details(&self, layer: &Layer) -> Result<LayerDetails, sqlx::Error>;

    /// Computes the extent of one layer's data in EPSG:4326.
    async fn layer_extent(&self, layer: &Layer) -> Result<Option<Bounds>, sqlx::Error>;
}

const TABLE_LAYERS_SQL: &str = r#"
SELECT DISTINCT ON (n.nspname, c.relname)
    n.nspname::text AS schema_name,
    c.relname::text AS table_name,
    a.attname::text AS geometry_column,
    coalesce(postgis_typmod_srid(a.atttypmod), 0) AS srid,
    postgis_typmod_type(a.atttypmod) AS geometry_type,
    coalesce(d.description, '') AS description,
    pk.attname::text AS id_column,
    c.relkind IN ('r', 'm', 'p') AS stored
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
JOIN pg_attribute a ON a.attrelid = c.oid
JOIN pg_type t ON t.oid = a.atttypid
LEFT JOIN pg_description d ON d.objoid = c.oid AND d.objsubid = 0
LEFT JOIN LATERAL (
    SELECT ia.attname
    FROM pg_index i
    JOIN pg_attribute ia ON ia.attrelid = i.indrelid AND ia.attnum = i.indkey[0]
    WHERE i.indrelid = c.oid AND i.indisprimary AND i.indnatts = 1
) pk ON true
WHERE c.relkind IN ('r', 'v', 'm', 'p')
    AND NOT c.relispartition
    AND t.typname = 'geometry'
    AND a.attnum > 0
    AND NOT a.attisdropped
    AND has_table_privilege(c.oid, 'select')
    AND n.nspname NOT IN ('pg_catalog', 'information_schema')
ORDER BY n.nspname, c.relname, a.attnum
"#;

const FUNCTION_LAYERS_SQL: &str = r#"
SELECT DISTINCT ON (n.nspname, p.proname)
    n.nspname::text AS schema_name,
    p.proname::text AS function_name,
    a.arg_name AS geometry_column,
    coalesce(d.description, '') AS description
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
CROSS JOIN LATERAL unnest(p.proallargtypes, p.proargmodes::text[], p.proargnames)
    WITH ORDINALITY AS a(arg_type, arg_mode, arg_name, ord)
LEFT JOIN pg_description d ON d.objoid = p.oid
WHERE p.proretset
    AND p.pronargs = 2
    AND p.proargtypes[0] = 'geometry'::regtype::oid
    AND p.proargtypes[1] = 'integer'::regtype::oid
    AND a.arg_mode = 't'
    AND a.arg_type = 'geometry'::regtype::oid
    AND has_function_privilege(p.oid, 'execute')
    AND n.nspname NOT IN ('pg_catalog', 'information_schema')
ORDER BY n.nspname, p.proname, a.ord
"#;

const TABLE_ATTRIBUTES_SQL: &str = r#"
SELECT
    a.attname::text,
    format_type(a.atttypid, a.atttypmod),
    coalesce(col_description(a.attrelid, a.attnum), '')
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = $1
    AND c.relname = $2
    AND a.attname <> $3
    AND a.attnum > 0
    AND NOT a.attisdropped
ORDER BY a.attnum
"#;

const FUNCTION_ATTRIBUTES_SQL: &str = r#"
SELECT
    a.arg_name,
    format_type(a.arg_type, NULL),
    ''::text
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
CROSS JOIN LATERAL unnest(p.proallargtypes, p.proargmodes::text[], p.proargnames)
    WITH ORDINALITY AS a(arg_type, arg_mode, arg_name, ord)
WHERE n.nspname = $1
    AND p.proname = $2
    AND a.arg_name <> $3
    AND p.pronargs = 2
    AND p.proargtypes[0] = 'geometry'::regtype::oid
    AND p.proargtypes[1] = 'integer'::regtype::oid
    AND a.arg_mode = 't'
ORDER BY a.ord
"#;

/// Extent query for a table layer. Identifiers come from the catalog.
///
/// Stored relations try the planner's estimate first and only scan when
/// there are no statistics; the estimate binds the names as `$1`-`$3`.
fn table_extent_sql(layer: &Layer) -> String {
    let estimated = if layer.stored {
        "ST_EstimatedExtent($1, $2, $3)::geometry"
    } else {
        "NULL::geometry"
    };

    format!(
        "SELECT ST_XMin(ext), ST_YMin(ext), ST_XMax(ext), ST_YMax(ext) FROM (\
         SELECT ST_Transform(ST_SetSRID(coalesce({estimated}, \
         (SELECT ST_Extent({geom})::geometry FROM {schema}.{table})), {srid}), 4326) AS ext) AS extent",
        estimated = estimated,
        geom = quote_ident(&layer.geometry_column),
        srid = layer.srid,
        schema = quote_ident(&layer.schema),
        table = quote_ident(&layer.source),
    )
}

type TableRow = (
    String,
    String,
    String,
    i32,
    Option<String>,
    String,
    Option<String>,
    bool,
);

type FunctionRow = (String, String, String, String);

type ExtentRow = (Option<f64>, Option<f64>, Option<f64>, Option<f64>);

/// Introspects a PostGIS database. Every statement runs in a read-only
/// transaction under the same `statement_timeout` as tile queries.
#[derive(Clone, Debug)]
pub struct PgLayerSource {
    pool: PgPool,
    timeout: Duration,
}

impl PgLayerSource {
    pub fn new(pool: PgPool, timeout: Duration) -> PgLayerSource {
        PgLayerSource { pool, timeout }
    }

    async fn fetch_all<T>(&self, sql: &'static str) -> Result<Vec<T>, sqlx::Error>
    where
        T: for<'r> FromRow<'r, PgRow> + Send + Unpin,
    {
        let mut tx = begin_read_only(&self.pool, self.timeout).await?;
        let rows = sqlx::query_as::<_, T>(sql).fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows)
    }
}

#[async_trait]
impl LayerSource for PgLayerSource {
    async fn list_layers(&self) -> Result<Vec<Layer>, sqlx::Error> {
        let (tables, functions) = futures::try_join!(
            self.fetch_all::<TableRow>(TABLE_LAYERS_SQL),
            self.fetch_all::<FunctionRow>(FUNCTION_LAYERS_SQL),
        )?;

        let mut layers = Vec::with_capacity(tables.len() + functions.len());
        for (schema, table, geom, srid, geometry_type, description, id_column, stored) in tables {
            if srid <= 0 {
                warn!(
                    schema = %schema,
                    table = %table,
                    column = %geom,
                    "skipping geometry column without a declared SRID"
                );
                continue;
            }
            let mut layer = Layer::table(
                &schema,
                &table,
                &geom,
                srid,
                geometry_type,
                id_column,
                description,
            );
            layer.stored = stored;
            layers.push(layer);
        }
        for (schema, function, geom, description) in functions {
            layers.push(Layer::function(&schema, &function, &geom, description));
        }

        Ok(layers)
    }

    async fn layer_details(&self, layer: &Layer) -> Result<LayerDetails, sqlx::Error> {
        let attributes_sql = match layer.kind {
            SourceKind::Table => TABLE_ATTRIBUTES_SQL,
            SourceKind::Function => FUNCTION_ATTRIBUTES_SQL,
        };

        let mut tx = begin_read_only(&self.pool, self.timeout).await?;
        let attributes = sqlx::query_as::<_, (String, String, String)>(attributes_sql)
            .bind(&layer.schema)
            .bind(&layer.source)
            .bind(&layer.geometry_column)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|(name, sql_type, description)| Attribute {
                name,
                sql_type,
                description,
            })
            .collect();
        tx.commit().await?;

        debug!(layer = %layer.name, "loaded layer attributes");
        Ok(LayerDetails { attributes })
    }

    async fn layer_extent(&self, layer: &Layer) -> Result<Option<Bounds>, sqlx::Error> {
        if layer.kind == SourceKind::Function {
            return Ok(None);
        }

        let sql = table_extent_sql(layer);
        let mut query = sqlx::query_as::<_, ExtentRow>(&sql);
        if layer.stored {
            query = query
                .bind(&layer.schema)
                .bind(&layer.source)
                .bind(&layer.geometry_column);
        }

        let mut tx = begin_read_only(&self.pool, self.timeout).await?;
        let extent = match query.fetch_one(&mut *tx).await? {
            (Some(west), Some(south), Some(east), Some(north)) => Some(Bounds {
                west,
                south,
                east,
                north,
            }),
            _ => None,
        };
        tx.commit().await?;

        debug!(layer = %layer.name, "loaded layer extent");
        Ok(extent)
    }
}

/// One immutable generation of the catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    layers: BTreeMap<String, Arc<Layer>>,
}

impl CatalogSnapshot {
    /// Builds a snapshot, keeping the first layer seen for any given name.
    fn build(generation: u64, layers: Vec<Layer>) -> CatalogSnapshot {
        let mut map = BTreeMap::new();
        for layer in layers {
            match map.entry(layer.name.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(Arc::new(layer));
                }
                Entry::Occupied(_) => {
                    warn!(layer = %layer.name, kind = ?layer.kind, "duplicate layer name, skipping");
                }
            }
        }

        CatalogSnapshot {
            generation,
            layers: map,
        }
    }

    /// Zero until the first successful refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Layer>> {
        self.layers.get(name)
    }

    pub fn layers(&self) -> impl Iterator<Item = &Arc<Layer>> {
        self.layers.values()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

pub struct LayerCatalog {
    current: ArcSwap<CatalogSnapshot>,
    refresh_lock: Mutex<()>,
}

impl Default for LayerCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerCatalog {
    pub fn new() -> LayerCatalog {
        LayerCatalog {
            current: ArcSwap::from_pointee(CatalogSnapshot::default()),
            refresh_lock: Mutex::new(()),
        }
    }

    /// The currently published snapshot. Holding on to it keeps that
    /// generation alive regardless of later refreshes.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.current.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Layer>> {
        self.current.load().get(name).cloned()
    }

    pub fn get_or_not_found(&self, name: &str) -> Result<Arc<Layer>> {
        self.get(name)
            .ok_or_else(|| Error::LayerNotFound(name.to_string()))
    }

    /// Introspects `source` and publishes the result as a new generation.
    ///
    /// Only one refresh builds at a time. On failure the published snapshot
    /// is left untouched.
    pub async fn refresh<S>(&self, source: &S) -> Result<Arc<CatalogSnapshot>>
    where
        S: LayerSource + ?Sized,
    {
        let _guard = self.refresh_lock.lock().await;

        let layers = match source.list_layers().await {
            Ok(layers) => layers,
            Err(e) => {
                let current = self.current.load();
                warn!(
                    error = %e,
                    generation = current.generation,
                    layers = current.len(),
                    "catalog refresh failed, keeping previous snapshot"
                );
                return Err(Error::CatalogRefresh(e));
            }
        };

        let generation = self.current.load().generation + 1;
        let snapshot = Arc::new(CatalogSnapshot::build(generation, layers));
        self.current.store(Arc::clone(&snapshot));

        info!(
            generation,
            layers = snapshot.len(),
            "published layer catalog"
        );
        Ok(snapshot)
    }

    /// Refreshes the catalog every `period` until the returned task is
    /// aborted. Failures are logged by [`LayerCatalog::refresh`].
    pub fn spawn_refresh_task(
        self: &Arc<Self>,
        source: Arc<dyn LayerSource>,
        period: Duration,
    ) -> JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let _ = catalog.refresh(source.as_ref()).await;
            }
        })
    }
}
