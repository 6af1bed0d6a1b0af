//! Building the SQL that renders one tile of one layer.
//!
//! Only identifiers that came out of catalog introspection (schema, source,
//! geometry, id and attribute column names) are interpolated into the
//! statement, and always quoted. Everything that depends on the request
//! (tile bounds, buffer, resolution, feature cap, layer name) is bound as a
//! parameter. Requested attribute names are resolved against the layer's
//! attribute list and the catalog's spelling is what ends up in the SQL.
//!
//! Parameters:
//!
//! | #       | value                                     |
//! |---------|-------------------------------------------|
//! | $1-$4   | tile bounds (west, south, east, north)    |
//! | $5-$8   | buffered tile bounds, clipped to the grid |
//! | $9      | resolution (tile extent)                  |
//! | $10     | buffer, in tile extent units              |
//! | $11     | max features                              |
//! | $12     | MVT layer name                            |
//! | $13     | zoom (function layers only)               |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgArguments, Postgres};
use sqlx::query::Query;

use crate::error::{Error, Result};
use crate::layer::{Layer, SourceKind};
use crate::tile::{Bounds, TileCoord, TILE_SRID};

pub const MIN_RESOLUTION: u32 = 256;
pub const MAX_RESOLUTION: u32 = 16384;

/// Name of the encoded geometry column inside the generated query.
const MVT_GEOM: &str = "mvt_geom";

/// Quotes an identifier for direct use in SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The knobs bounding how much work one tile can cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TileLimits {
    /// Margin around the tile, in tile extent units.
    pub buffer: u32,
    /// Tile extent: the integer grid geometries are quantized to.
    pub resolution: u32,
    pub max_features: u32,
}

impl TileLimits {
    pub fn validate(&self) -> Result<()> {
        if !(MIN_RESOLUTION..=MAX_RESOLUTION).contains(&self.resolution) {
            return Err(Error::invalid_parameter(
                "resolution",
                format!(
                    "{} is outside {}..={}",
                    self.resolution, MIN_RESOLUTION, MAX_RESOLUTION
                ),
            ));
        }
        if self.buffer > self.resolution {
            return Err(Error::invalid_parameter(
                "buffer",
                format!("{} exceeds the resolution {}", self.buffer, self.resolution),
            ));
        }
        if self.max_features == 0 {
            return Err(Error::invalid_parameter("limit", "must be at least 1"));
        }
        Ok(())
    }
}

/// Per-request overrides, as recognized on the tile endpoint's query string.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TileParams {
    pub buffer: Option<u32>,
    pub resolution: Option<u32>,
    pub limit: Option<u32>,
    /// Comma separated attribute names.
    pub properties: Option<String>,
}

impl TileParams {
    /// Applies the overrides to `defaults`. The feature cap can be lowered
    /// but never raised above the configured maximum.
    pub fn limits(&self, defaults: &TileLimits) -> Result<TileLimits> {
        let limits = TileLimits {
            buffer: self.buffer.unwrap_or(defaults.buffer),
            resolution: self.resolution.unwrap_or(defaults.resolution),
            max_features: match self.limit {
                Some(limit) => limit.min(defaults.max_features),
                None => defaults.max_features,
            },
        };
        limits.validate()?;
        Ok(limits)
    }

    fn property_names(&self) -> Option<Vec<&str>> {
        let names: Vec<&str> = self
            .properties
            .as_deref()?
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();

        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }
}

/// Everything needed to render one tile.
#[derive(Clone, Debug)]
pub struct TileQuery {
    pub layer: Arc<Layer>,
    pub tile: TileCoord,
    pub limits: TileLimits,
    /// Attribute columns to carry into the tile, as spelled in the catalog.
    pub columns: Vec<String>,
}

/// The values bound to a [`TileQuery`]'s placeholders.
#[derive(Clone, Debug, PartialEq)]
pub struct TileParameters {
    /// `$1`-`$4`
    pub tile: Bounds,
    /// `$5`-`$8`
    pub query: Bounds,
    /// `$9`
    pub resolution: i32,
    /// `$10`
    pub buffer: i32,
    /// `$11`
    pub max_features: i64,
    /// `$12`
    pub layer_name: String,
    /// `$13`, bound for function layers only.
    pub zoom: Option<i32>,
}

impl TileQuery {
    /// Resolves the requested attributes against the layer. `limits` are
    /// expected to come from [`TileParams::limits`]. Attribute columns are
    /// taken from the layer's details; without details the tile carries
    /// geometry only.
    pub fn new(
        layer: Arc<Layer>,
        tile: TileCoord,
        limits: TileLimits,
        params: &TileParams,
    ) -> Result<TileQuery> {
        let details = layer.details();

        let columns = match params.property_names() {
            None => details
                .map(|d| d.attributes.iter().map(|a| a.name.clone()).collect())
                .unwrap_or_default(),
            Some(names) => {
                let mut columns: Vec<String> = Vec::with_capacity(names.len());
                for name in names {
                    let attribute = details.and_then(|d| d.attribute(name)).ok_or_else(|| {
                        Error::invalid_parameter(
                            "properties",
                            format!("'{}' is not an attribute of {}", name, layer.name),
                        )
                    })?;
                    if !columns.contains(&attribute.name) {
                        columns.push(attribute.name.clone());
                    }
                }
                columns
            }
        };

        Ok(TileQuery {
            layer,
            tile,
            limits,
            columns,
        })
    }

    /// Alias of the encoded geometry, chosen so it never shadows an
    /// attribute column.
    fn geometry_alias(&self) -> String {
        let mut alias = String::from(MVT_GEOM);
        while self.columns.iter().any(|c| *c == alias) {
            alias.push('_');
        }
        alias
    }

    /// Row order applied before the feature cap. It is total, so the same
    /// data always yields the same features.
    fn order_by(&self, geom: &str) -> String {
        let layer = &self.layer;
        if let Some(id) = &layer.id_column {
            return format!("t.{}", quote_ident(id));
        }

        let mut keys = vec![geom.to_string()];
        if layer.stored {
            keys.push(String::from("t.tableoid"));
            keys.push(String::from("t.ctid"));
        } else if let Some(details) = layer.details() {
            // Not every type has a btree ordering, but every type has a text form.
            keys.extend(
                details
                    .attributes
                    .iter()
                    .map(|a| format!("t.{}::text", quote_ident(&a.name))),
            );
        }
        keys.join(", ")
    }

    pub fn sql(&self) -> String {
        let layer = &self.layer;
        let geom = format!("t.{}", quote_ident(&layer.geometry_column));
        let source = format!(
            "{}.{}",
            quote_ident(&layer.schema),
            quote_ident(&layer.source)
        );
        let alias = self.geometry_alias();

        let tile_geom = if layer.needs_transform() {
            format!("ST_Transform({}, {})", geom, TILE_SRID)
        } else {
            geom.clone()
        };

        let columns: String = self
            .columns
            .iter()
            .map(|c| format!(", t.{}", quote_ident(c)))
            .collect();

        let (from, filter) = match layer.kind {
            SourceKind::Table => {
                // Densify the envelope first so its edges follow the target
                // projection instead of joining four transformed corners.
                let query_bounds = if layer.needs_transform() {
                    format!(
                        "ST_Transform(ST_Segmentize(bounds.query, ($7 - $5) / 4), {})",
                        layer.srid
                    )
                } else {
                    String::from("bounds.query")
                };
                (
                    format!("{} AS t, bounds", source),
                    format!("WHERE {} && {}", geom, query_bounds),
                )
            }
            SourceKind::Function => (
                format!("bounds CROSS JOIN LATERAL {}(bounds.query, $13) AS t", source),
                String::new(),
            ),
        };

        format!(
            "WITH bounds AS (\
             SELECT ST_MakeEnvelope($1, $2, $3, $4, {srid}) AS tile, \
             ST_MakeEnvelope($5, $6, $7, $8, {srid}) AS query), \
             mvt_rows AS (\
             SELECT ST_AsMVTGeom({tile_geom}, bounds.tile::box2d, $9, $10, true) AS {geom_alias}{columns} \
             FROM {from} {filter} \
             ORDER BY {order} \
             LIMIT $11) \
             SELECT ST_AsMVT(mvt_rows.*, $12, $9, '{alias}') FROM mvt_rows WHERE {geom_alias} IS NOT NULL",
            srid = TILE_SRID,
            tile_geom = tile_geom,
            geom_alias = quote_ident(&alias),
            alias = alias,
            columns = columns,
            from = from,
            filter = filter,
            order = self.order_by(&geom),
        )
    }

    /// The values for [`TileQuery::sql`]'s placeholders.
    pub fn parameters(&self) -> TileParameters {
        let query = self
            .tile
            .buffered_bounds(self.limits.resolution, self.limits.buffer)
            .clamp_to_mercator();

        // Limits are validated, so the extent and buffer fit an i32.
        TileParameters {
            tile: self.tile.bounds(),
            query,
            resolution: self.limits.resolution as i32,
            buffer: self.limits.buffer as i32,
            max_features: i64::from(self.limits.max_features),
            layer_name: self.layer.name.clone(),
            zoom: match self.layer.kind {
                SourceKind::Table => None,
                SourceKind::Function => Some(i32::from(self.tile.zoom)),
            },
        }
    }

    /// Binds this query's parameters, in the order [`TileQuery::sql`] expects.
    pub fn bind<'q>(
        &self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        let params = self.parameters();

        let query = query
            .bind(params.tile.west)
            .bind(params.tile.south)
            .bind(params.tile.east)
            .bind(params.tile.north)
            .bind(params.query.west)
            .bind(params.query.south)
            .bind(params.query.east)
            .bind(params.query.north)
            .bind(params.resolution)
            .bind(params.buffer)
            .bind(params.max_features)
            .bind(params.layer_name);

        match params.zoom {
            Some(zoom) => query.bind(zoom),
            None => query,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_approx_eq::assert_approx_eq;
    use async_trait::async_trait;

    use super::*;
    use crate::catalog::LayerSource;
    use crate::layer::{Attribute, LayerDetails};
    use crate::tile::WEB_MERCATOR_MAX;

    const DEFAULTS: TileLimits = TileLimits {
        buffer: 256,
        resolution: 4096,
        max_features: 50_000,
    };

    struct Details(Vec<&'static str>);

    #[async_trait]
    impl LayerSource for Details {
        async fn list_layers(&self) -> Result<Vec<Layer>, sqlx::Error> {
            Ok(vec![])
        }

        async fn layer_details(&self, _layer: &Layer) -> Result<LayerDetails, sqlx::Error> {
            Ok(LayerDetails {
                attributes: self
                    .0
                    .iter()
                    .map(|name| Attribute {
                        name: name.to_string(),
                        sql_type: String::from("text"),
                        description: String::new(),
                    })
                    .collect(),
            })
        }

        async fn layer_extent(&self, _layer: &Layer) -> Result<Option<Bounds>, sqlx::Error> {
            Ok(None)
        }
    }

    async fn detailed(layer: Layer, attributes: Vec<&'static str>) -> Arc<Layer> {
        let layer = Arc::new(layer);
        layer
            .ensure_details(&Details(attributes), Duration::from_secs(5))
            .await
            .unwrap();
        layer
    }

    fn build(layer: Arc<Layer>, tile: TileCoord, params: &TileParams) -> Result<TileQuery> {
        TileQuery::new(layer, tile, params.limits(&DEFAULTS)?, params)
    }

    fn countries() -> Layer {
        Layer::table(
            "public",
            "countries",
            "geom",
            4326,
            Some(String::from("MULTIPOLYGON")),
            Some(String::from("gid")),
            String::new(),
        )
    }

    #[test]
    fn test_default_limits() {
        let limits = TileParams::default().limits(&DEFAULTS).unwrap();
        assert_eq!(DEFAULTS, limits);
    }

    #[test]
    fn test_limit_overrides() {
        let params = TileParams {
            buffer: Some(64),
            resolution: Some(512),
            limit: Some(10),
            properties: None,
        };
        let limits = params.limits(&DEFAULTS).unwrap();
        assert_eq!(64, limits.buffer);
        assert_eq!(512, limits.resolution);
        assert_eq!(10, limits.max_features);

        let greedy = TileParams {
            limit: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(50_000, greedy.limits(&DEFAULTS).unwrap().max_features);
    }

    #[test]
    fn test_invalid_limit_overrides() {
        for params in [
            TileParams {
                resolution: Some(0),
                ..Default::default()
            },
            TileParams {
                resolution: Some(1 << 20),
                ..Default::default()
            },
            TileParams {
                limit: Some(0),
                ..Default::default()
            },
            TileParams {
                buffer: Some(8192),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                params.limits(&DEFAULTS),
                Err(Error::InvalidParameter { .. })
            ));
        }
    }

    #[test]
    fn test_default_parameters() {
        let tile = TileCoord::new(2, 1, 1);
        let query = build(Arc::new(countries()), tile, &TileParams::default()).unwrap();
        let params = query.parameters();

        assert_eq!(tile.bounds(), params.tile);
        assert_eq!(tile.buffered_bounds(4096, 256), params.query);
        assert_eq!(4096, params.resolution);
        assert_eq!(256, params.buffer);
        assert_eq!(50_000, params.max_features);
        assert_eq!("public.countries", params.layer_name);
        assert_eq!(None, params.zoom);
    }

    #[test]
    fn test_overridden_and_capped_parameters() {
        let tile = TileCoord::new(3, 2, 5);
        let overrides = TileParams {
            buffer: Some(32),
            resolution: Some(512),
            limit: Some(7),
            properties: None,
        };
        let params = build(Arc::new(countries()), tile, &overrides)
            .unwrap()
            .parameters();

        assert_eq!(512, params.resolution);
        assert_eq!(32, params.buffer);
        assert_eq!(7, params.max_features);
        assert_eq!(tile.buffered_bounds(512, 32), params.query);

        let greedy = TileParams {
            limit: Some(u32::MAX),
            ..Default::default()
        };
        let params = build(Arc::new(countries()), tile, &greedy)
            .unwrap()
            .parameters();
        assert_eq!(i64::from(DEFAULTS.max_features), params.max_features);
    }

    #[test]
    fn test_query_envelope_stays_on_the_grid() {
        let params = build(
            Arc::new(countries()),
            TileCoord::new(0, 0, 0),
            &TileParams::default(),
        )
        .unwrap()
        .parameters();

        assert_approx_eq!(-WEB_MERCATOR_MAX, params.query.west, 1e-6);
        assert_approx_eq!(WEB_MERCATOR_MAX, params.query.north, 1e-6);
        assert_approx_eq!(WEB_MERCATOR_MAX, params.query.east, 1e-6);
        assert_approx_eq!(-WEB_MERCATOR_MAX, params.query.south, 1e-6);
    }

    #[tokio::test]
    async fn test_function_parameters_include_zoom() {
        let layer = Layer::function("tiles", "parcels", "geom", String::new());
        let layer = detailed(layer, vec![]).await;
        let params = build(layer, TileCoord::new(14, 1, 1), &TileParams::default())
            .unwrap()
            .parameters();
        assert_eq!(Some(14), params.zoom);
    }

    #[tokio::test]
    async fn test_table_sql_transforms_and_orders() {
        let layer = detailed(countries(), vec!["name", "pop"]).await;
        let query = build(layer, TileCoord::new(2, 1, 1), &TileParams::default()).unwrap();
        let sql = query.sql();

        assert!(sql.contains("ST_AsMVTGeom(ST_Transform(t.\"geom\", 3857), bounds.tile::box2d, $9, $10, true) AS \"mvt_geom\""));
        assert!(sql.contains(
            "WHERE t.\"geom\" && ST_Transform(ST_Segmentize(bounds.query, ($7 - $5) / 4), 4326)"
        ));
        assert!(sql.contains("FROM \"public\".\"countries\" AS t, bounds"));
        assert!(sql.contains(", t.\"name\", t.\"pop\""));
        assert!(sql.contains("ORDER BY t.\"gid\" LIMIT $11"));
        assert!(sql.contains("ST_AsMVT(mvt_rows.*, $12, $9, 'mvt_geom')"));
        assert!(!sql.contains("$13"));
    }

    #[tokio::test]
    async fn test_mercator_table_skips_transform() {
        let layer = Layer::table("osm", "roads", "way", 3857, None, None, String::new());
        let layer = detailed(layer, vec![]).await;
        let sql = build(layer, TileCoord::new(0, 0, 0), &TileParams::default())
            .unwrap()
            .sql();

        assert!(!sql.contains("ST_Transform"));
        assert!(sql.contains("WHERE t.\"way\" && bounds.query"));
    }

    #[tokio::test]
    async fn test_order_without_key_is_total() {
        // Stored relations break geometry ties on the row's physical address.
        let table = Layer::table("osm", "roads", "way", 3857, None, None, String::new());
        let table = detailed(table, vec!["name"]).await;
        let sql = build(table, TileCoord::new(0, 0, 0), &TileParams::default())
            .unwrap()
            .sql();
        assert!(sql.contains("ORDER BY t.\"way\", t.tableoid, t.ctid LIMIT $11"));

        // Views and functions fall back to every attribute.
        let mut view = Layer::table("osm", "pois", "geom", 3857, None, None, String::new());
        view.stored = false;
        let view = detailed(view, vec!["name", "tags"]).await;
        let params = TileParams {
            properties: Some(String::from("name")),
            ..Default::default()
        };
        let sql = build(view, TileCoord::new(0, 0, 0), &params).unwrap().sql();
        assert!(sql.contains(
            "ORDER BY t.\"geom\", t.\"name\"::text, t.\"tags\"::text LIMIT $11"
        ));
        assert!(!sql.contains("ctid"));
    }

    #[tokio::test]
    async fn test_function_sql() {
        let layer = Layer::function("tiles", "parcels", "geom", String::new());
        let layer = detailed(layer, vec!["owner"]).await;
        let sql = build(layer, TileCoord::new(14, 1, 1), &TileParams::default())
            .unwrap()
            .sql();

        assert!(sql.contains("bounds CROSS JOIN LATERAL \"tiles\".\"parcels\"(bounds.query, $13) AS t"));
        assert!(sql.contains(", t.\"owner\""));
        assert!(sql.contains("ORDER BY t.\"geom\", t.\"owner\"::text"));
        assert!(!sql.contains("ST_Transform"));
        assert!(!sql.contains(" && "));
    }

    #[tokio::test]
    async fn test_geometry_alias_avoids_attribute_names() {
        let layer = Layer::table("osm", "roads", "way", 3857, None, None, String::new());
        let layer = detailed(layer, vec!["mvt_geom", "mvt_geom_"]).await;
        let sql = build(layer, TileCoord::new(0, 0, 0), &TileParams::default())
            .unwrap()
            .sql();

        assert!(sql.contains("AS \"mvt_geom__\", t.\"mvt_geom\", t.\"mvt_geom_\" FROM"));
        assert!(sql.contains("ST_AsMVT(mvt_rows.*, $12, $9, 'mvt_geom__')"));
        assert!(sql.ends_with("WHERE \"mvt_geom__\" IS NOT NULL"));
    }

    #[tokio::test]
    async fn test_property_subset() {
        let layer = detailed(countries(), vec!["name", "pop", "iso"]).await;
        let params = TileParams {
            properties: Some(String::from(" iso, name ,iso")),
            ..Default::default()
        };
        let query = build(layer, TileCoord::new(1, 0, 0), &params).unwrap();

        assert_eq!(vec!["iso", "name"], query.columns);
        assert!(query.sql().contains(", t.\"iso\", t.\"name\" FROM"));
    }

    #[tokio::test]
    async fn test_unknown_property_rejected() {
        let layer = detailed(countries(), vec!["name"]).await;
        let params = TileParams {
            properties: Some(String::from("name,\"gid\"; DROP TABLE countries")),
            ..Default::default()
        };
        let err = build(layer, TileCoord::new(1, 0, 0), &params).unwrap_err();

        assert!(matches!(err, Error::InvalidParameter { ref param, .. } if param == "properties"));
        assert_eq!(400, err.status_code());
    }

    #[test]
    fn test_sql_is_stable() {
        let layer = Arc::new(countries());
        let sql = || {
            build(Arc::clone(&layer), TileCoord::new(5, 3, 9), &TileParams::default())
                .unwrap()
                .sql()
        };
        assert_eq!(sql(), sql());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!("\"roads\"", quote_ident("roads"));
        assert_eq!("\"a\"\"b\"", quote_ident("a\"b"));
    }
}
