//! HTTP API.
//!
//! | Route                          | Response                                |
//! |--------------------------------|-----------------------------------------|
//! | `/`, `/index.html`             | HTML layer list                         |
//! | `/index.json`                  | refreshes the catalog, lists layers     |
//! | `/{layer}.json`                | layer metadata including details        |
//! | `/{layer}.html`                | map preview of one layer                |
//! | `/{layer}/{z}/{x}/{y}.{ext}`   | vector tile                             |

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::catalog::{LayerCatalog, LayerSource};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::layer::{Attribute, Layer};
use crate::query::{TileParams, TileQuery};
use crate::tile::TileCoord;
use crate::views::{render_template, IndexView, LayerPreviewView, LayerRow};
use crate::TileSource;

/// Default zoom range advertised in layer metadata.
const MIN_ZOOM: u8 = 0;
const MAX_ZOOM: u8 = 22;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<LayerCatalog>,
    pub layers: Arc<dyn LayerSource>,
    pub tiles: Arc<dyn TileSource>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout();

    Router::new()
        .route("/", get(index_html))
        .route("/index.html", get(index_html))
        .route("/index.json", get(index_json))
        .route("/:resource", get(layer_resource))
        .route("/:layer/:zoom/:x/:tile", get(tile))
        .layer(Extension(state))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(CorsLayer::permissive()),
        )
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct LayerSummary<'a> {
    #[serde(flatten)]
    layer: &'a Layer,
    detailurl: String,
}

#[derive(Serialize)]
struct LayerDocument<'a> {
    #[serde(flatten)]
    layer: &'a Layer,
    tileurl: String,
    bounds: [f64; 4],
    center: [f64; 2],
    minzoom: u8,
    maxzoom: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    attribution: Option<&'a str>,
    attributes: &'a [Attribute],
}

fn tile_url(config: &Config, layer: &Layer) -> String {
    format!("{}/{}/{{z}}/{{x}}/{{y}}.pbf", config.url_base(), layer.name)
}

async fn index_json(Extension(state): Extension<AppState>) -> Response {
    // A failed refresh has already been logged; keep serving what we have.
    let snapshot = match state.catalog.refresh(state.layers.as_ref()).await {
        Ok(snapshot) => snapshot,
        Err(_) => state.catalog.snapshot(),
    };

    let url_base = state.config.url_base();
    let index: BTreeMap<&str, LayerSummary> = snapshot
        .layers()
        .map(|layer| {
            (
                layer.name.as_str(),
                LayerSummary {
                    layer: layer.as_ref(),
                    detailurl: format!("{}/{}.json", url_base, layer.name),
                },
            )
        })
        .collect();

    Json(&index).into_response()
}

async fn layer_resource(
    Extension(state): Extension<AppState>,
    Path(resource): Path<String>,
) -> Result<Response> {
    match resource.rsplit_once('.') {
        Some((name, "json")) => layer_json(&state, name).await,
        Some((name, "html")) => layer_html(&state, name),
        _ => Err(Error::LayerNotFound(resource.clone())),
    }
}

async fn layer_json(state: &AppState, name: &str) -> Result<Response> {
    let layer = state.catalog.get_or_not_found(name)?;
    let timeout = state.config.query_timeout();
    let details = layer.ensure_details(state.layers.as_ref(), timeout).await?;

    // The extent only positions previews; a layer too big to measure in time
    // is still served.
    let extent = match layer.ensure_extent(state.layers.as_ref(), timeout).await {
        Ok(extent) => extent,
        Err(e) => {
            warn!(layer = %layer.name, error = %e, "unable to load layer extent");
            None
        }
    };
    let bounds = extent.unwrap_or_else(|| TileCoord::new(0, 0, 0).lonlat_bounds());
    let (center_lon, center_lat) = bounds.center();

    let document = LayerDocument {
        layer: &layer,
        tileurl: tile_url(&state.config, &layer),
        bounds: bounds.to_array(),
        center: [center_lon, center_lat],
        minzoom: MIN_ZOOM,
        maxzoom: MAX_ZOOM,
        attribution: Some(state.config.attribution.as_str()).filter(|a| !a.is_empty()),
        attributes: &details.attributes,
    };

    Ok(Json(&document).into_response())
}

fn layer_html(state: &AppState, name: &str) -> Result<Response> {
    let layer = state.catalog.get_or_not_found(name)?;
    let tiles = tile_url(&state.config, &layer);
    Ok(render_template(LayerPreviewView::new(&layer, &tiles)))
}

async fn index_html(Extension(state): Extension<AppState>) -> Response {
    let snapshot = state.catalog.snapshot();
    render_template(IndexView {
        layers: snapshot.layers().map(|layer| LayerRow::from(layer.as_ref())).collect(),
    })
}

async fn tile(
    Extension(state): Extension<AppState>,
    Path((layer, zoom, x, tile)): Path<(String, String, String, String)>,
    Query(params): Query<TileParams>,
) -> Result<Response> {
    let layer = state.catalog.get_or_not_found(&layer)?;
    let tile = TileCoord::from_path(&zoom, &x, &tile)?;
    let limits = params.limits(&state.config.tile_limits())?;

    layer
        .ensure_details(state.layers.as_ref(), state.config.query_timeout())
        .await?;
    let query = TileQuery::new(layer, tile, limits, &params)?;

    let outcome = state.tiles.render_mvt(&query).await.map_err(|e| {
        warn!(tile = %tile, error = %e, "unable to render tile");
        e
    })?;

    Ok((
        [(header::CONTENT_TYPE, tile.format.content_type())],
        outcome.into_bytes(),
    )
        .into_response())
}
