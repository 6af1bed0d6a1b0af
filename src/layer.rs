//! Layer descriptors discovered from the database catalog.
//!
//! A [`Layer`] carries two tiers of metadata. The listing tier (name, source,
//! geometry column, SRID, ...) is filled in when the catalog is refreshed.
//! The detail tier needs further introspection and is only loaded the first
//! time somebody asks for it. It is split in two: the attribute list, which
//! every tile request needs, and the extent, which only layer metadata
//! needs and which can be expensive to compute. Both are cached on the
//! descriptor for as long as that catalog generation is published, and both
//! loads are bounded by the query timeout.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::catalog::LayerSource;
use crate::error::{Error, Result};
use crate::executor::{is_query_canceled, TIMEOUT_GRACE};
use crate::tile::{Bounds, TILE_SRID};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// A table, view or materialized view with a geometry column.
    Table,
    /// A set-returning function taking `(bounds geometry, zoom integer)`.
    Function,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LayerDetails {
    /// Non-geometry columns in declaration order.
    pub attributes: Vec<Attribute>,
}

impl LayerDetails {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Layer {
    /// Catalog-unique name, `schema.source`.
    pub name: String,
    pub schema: String,
    /// Relation or function name within `schema`.
    pub source: String,
    pub kind: SourceKind,
    pub geometry_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<String>,
    pub srid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_column: Option<String>,
    pub description: String,
    /// Backed by heap storage (a table, partitioned table or materialized
    /// view): rows have a physical address and the planner keeps statistics.
    #[serde(skip)]
    pub stored: bool,
    #[serde(skip)]
    details: OnceCell<LayerDetails>,
    /// Extent in EPSG:4326; the inner `None` means the layer has no data.
    #[serde(skip)]
    extent: OnceCell<Option<Bounds>>,
}

impl Layer {
    pub fn table(
        schema: &str,
        table: &str,
        geometry_column: &str,
        srid: i32,
        geometry_type: Option<String>,
        id_column: Option<String>,
        description: String,
    ) -> Layer {
        Layer {
            name: format!("{}.{}", schema, table),
            schema: schema.to_string(),
            source: table.to_string(),
            kind: SourceKind::Table,
            geometry_column: geometry_column.to_string(),
            geometry_type,
            srid,
            id_column,
            description,
            stored: true,
            details: OnceCell::new(),
            extent: OnceCell::new(),
        }
    }

    /// Function sources are handed tile bounds in web mercator and must
    /// return geometries in the same projection.
    pub fn function(
        schema: &str,
        function: &str,
        geometry_column: &str,
        description: String,
    ) -> Layer {
        Layer {
            name: format!("{}.{}", schema, function),
            schema: schema.to_string(),
            source: function.to_string(),
            kind: SourceKind::Function,
            geometry_column: geometry_column.to_string(),
            geometry_type: None,
            srid: TILE_SRID,
            id_column: None,
            description,
            stored: false,
            details: OnceCell::new(),
            extent: OnceCell::new(),
        }
    }

    pub fn needs_transform(&self) -> bool {
        self.srid != TILE_SRID
    }

    /// Returns the attribute tier if it has already been loaded.
    pub fn details(&self) -> Option<&LayerDetails> {
        self.details.get()
    }

    /// Loads the attribute tier through `source` on first use. Concurrent
    /// callers wait on the same load, so the attributes are introspected once.
    pub async fn ensure_details<S>(&self, source: &S, timeout: Duration) -> Result<&LayerDetails>
    where
        S: LayerSource + ?Sized,
    {
        self.details
            .get_or_try_init(|| self.introspect(timeout, source.layer_details(self)))
            .await
    }

    /// Loads the layer's extent through `source` on first use.
    pub async fn ensure_extent<S>(&self, source: &S, timeout: Duration) -> Result<Option<Bounds>>
    where
        S: LayerSource + ?Sized,
    {
        self.extent
            .get_or_try_init(|| self.introspect(timeout, source.layer_extent(self)))
            .await
            .copied()
    }

    async fn introspect<T, F>(&self, timeout: Duration, load: F) -> Result<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(timeout + TIMEOUT_GRACE, load).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if !is_query_canceled(&e) => Err(Error::LayerDetails {
                layer: self.name.clone(),
                source: e,
            }),
            Ok(Err(_)) | Err(_) => Err(Error::LayerDetailsTimeout {
                layer: self.name.clone(),
                timeout,
            }),
        }
    }
}
