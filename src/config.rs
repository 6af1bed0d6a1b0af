//! Server configuration.
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! command line flags and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::query::TileLimits;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Public base URL used in tile and metadata links. Derived from host and
    /// port when unset.
    pub url_base: Option<String>,
    /// Tile buffer, in tile extent units.
    pub default_buffer: u32,
    /// Tile extent.
    pub default_resolution: u32,
    pub max_features_per_tile: u32,
    pub attribution: String,
    pub query_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Period of the background catalog refresh; 0 disables it.
    pub catalog_refresh_secs: u64,
    pub max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: String::from("postgresql://localhost/postgres"),
            host: String::from("localhost"),
            port: 7800,
            url_base: None,
            default_buffer: 256,
            default_resolution: 4096,
            max_features_per_tile: 50_000,
            attribution: String::new(),
            query_timeout_secs: 10,
            request_timeout_secs: 30,
            catalog_refresh_secs: 0,
            max_connections: 10,
        }
    }
}

impl Config {
    pub fn from_yaml(data: &str) -> Result<Config> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("unable to read {}: {}", path.display(), e)))?;
        Config::from_yaml(&data)
    }

    /// Builds the effective configuration from parsed command line arguments.
    pub fn from_args(args: &Args) -> Result<Config> {
        let mut config = match &args.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(url) = &args.database_url {
            config.database_url = url.clone();
        }
        if let Some(host) = &args.host {
            config.host = host.clone();
        }
        if let Some(port) = args.port {
            config.port = port;
        }
        if let Some(url_base) = &args.url_base {
            config.url_base = Some(url_base.clone());
        }
        if let Some(refresh) = args.catalog_refresh_secs {
            config.catalog_refresh_secs = refresh;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tile_limits()
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.query_timeout_secs == 0 {
            return Err(Error::Config(String::from(
                "query_timeout_secs must be at least 1",
            )));
        }
        if self.query_timeout_secs >= self.request_timeout_secs {
            return Err(Error::Config(format!(
                "query_timeout_secs ({}) must be shorter than request_timeout_secs ({})",
                self.query_timeout_secs, self.request_timeout_secs
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::Config(String::from(
                "max_connections must be at least 1",
            )));
        }
        Ok(())
    }

    pub fn tile_limits(&self) -> TileLimits {
        TileLimits {
            buffer: self.default_buffer,
            resolution: self.default_resolution,
            max_features: self.max_features_per_tile,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url_base(&self) -> String {
        match &self.url_base {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.listen_addr()),
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn catalog_refresh(&self) -> Option<Duration> {
        match self.catalog_refresh_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Serve PostGIS tables and functions as vector tiles.
#[derive(Parser, Debug, Default)]
#[command(name = "tile-summoner", version)]
pub struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "TILE_SUMMONER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Listen host
    #[arg(long, env = "TILE_SUMMONER_HOST")]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "TILE_SUMMONER_PORT")]
    pub port: Option<u16>,

    /// Public base URL for generated links
    #[arg(long, env = "TILE_SUMMONER_URL_BASE")]
    pub url_base: Option<String>,

    /// Seconds between background catalog refreshes (0 disables)
    #[arg(long, env = "TILE_SUMMONER_CATALOG_REFRESH_SECS")]
    pub catalog_refresh_secs: Option<u64>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}
