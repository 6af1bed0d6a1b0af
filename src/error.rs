use std::time::Duration;

use crate::tile::TileCoord;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid tile coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid value for parameter '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Catalog refresh failed: {0}")]
    CatalogRefresh(#[source] sqlx::Error),

    #[error("Unable to load details for layer {layer}: {source}")]
    LayerDetails {
        layer: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Loading details for layer {layer} exceeded {timeout:?}")]
    LayerDetailsTimeout { layer: String, timeout: Duration },

    #[error("Tile query for {layer} at {tile} failed: {source}")]
    Query {
        layer: String,
        tile: TileCoord,
        #[source]
        source: sqlx::Error,
    },

    #[error("Tile query for {layer} at {tile} exceeded {timeout:?}")]
    QueryTimeout {
        layer: String,
        tile: TileCoord,
        timeout: Duration,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid YAML configuration: {0}")]
    ConfigYaml(#[from] serde_yaml::Error),
}

impl Error {
    /// HTTP status the request boundary should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidCoordinate(_) | Error::InvalidParameter { .. } => 400,
            Error::LayerNotFound(_) => 404,
            Error::CatalogRefresh(_) => 503,
            Error::QueryTimeout { .. } | Error::LayerDetailsTimeout { .. } => 504,
            Error::LayerDetails { .. }
            | Error::Query { .. }
            | Error::Config(_)
            | Error::ConfigYaml(_) => 500,
        }
    }

    pub(crate) fn invalid_parameter(param: &str, message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            param: param.to_string(),
            message: message.into(),
        }
    }
}
