//! # Tile Summoner
//!
//! Serve the spatial tables and functions of a PostGIS database as Mapbox
//! Vector Tiles.
//!
//! ## How it works
//!
//! The [`catalog::LayerCatalog`] introspects the database for tables, views
//! and functions that can back a tile layer. A tile request is validated
//! ([`tile::TileCoord`]), resolved against the catalog, turned into a single
//! bounded SQL statement ([`query::TileQuery`]) and rendered by PostGIS
//! itself through `ST_AsMVT` ([`executor::TileExecutor`]).
//!
//! The [`server`] module wires this up behind an HTTP API; the
//! `tile-summoner` binary runs it.
//!
//! ## Known Limitations
//!
//! Tiles are always cut from the EPSG:3857 web mercator grid. Table layers in
//! other projections are transformed on the fly, which is slower than storing
//! data in web mercator to begin with. Function layers receive web mercator
//! bounds and must return web mercator geometries.
//!
//! Nothing is cached; put a cache in front of the server if you need one.

#![deny(warnings)]

use async_trait::async_trait;

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod layer;
pub mod query;
pub mod server;
pub mod tile;
pub mod views;

pub use error::{Error, Result};
pub use executor::TileOutcome;
pub use tile::get_epsg_3857_tile_bounds;

/// Renders tiles. The main implementation is [`executor::TileExecutor`].
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Renders the Mapbox vector tile described by `query`.
    ///
    /// A tile without features is [`TileOutcome::Empty`], not an error.
    async fn render_mvt(&self, query: &query::TileQuery) -> Result<TileOutcome>;
}
