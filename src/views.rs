//! HTML views.

use askama::Template;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

use crate::layer::{Layer, SourceKind};

/// Renders `template`, answering with a bare 500 if that fails.
pub fn render_template<T: Template>(template: T) -> Response {
    match template.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Template rendering failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Template rendering error").into_response()
        }
    }
}

/// Encodes `value` as a JavaScript string literal that can sit inside a
/// `<script>` element.
fn script_literal(value: &str) -> String {
    serde_json::Value::from(value)
        .to_string()
        .replace("</", "<\\/")
}

pub struct LayerRow {
    pub name: String,
    pub kind: &'static str,
    pub description: String,
}

impl From<&Layer> for LayerRow {
    fn from(layer: &Layer) -> Self {
        LayerRow {
            name: layer.name.clone(),
            kind: match layer.kind {
                SourceKind::Table => "table",
                SourceKind::Function => "function",
            },
            description: layer.description.clone(),
        }
    }
}

/// The layer list served at `/`.
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexView {
    pub layers: Vec<LayerRow>,
}

/// A map previewing one layer.
#[derive(Template)]
#[template(path = "layer.html")]
pub struct LayerPreviewView {
    pub name: String,
    pub name_literal: String,
    pub tiles_literal: String,
}

impl LayerPreviewView {
    pub fn new(layer: &Layer, tile_url: &str) -> LayerPreviewView {
        LayerPreviewView {
            name: layer.name.clone(),
            name_literal: script_literal(&layer.name),
            tiles_literal: script_literal(tile_url),
        }
    }
}
