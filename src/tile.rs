//! Slippy map tile coordinates and their EPSG:3857 extents.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// SRID of the projection tiles are cut from.
pub const TILE_SRID: i32 = 3857;

/// Half the width of the web mercator plane, in meters.
pub const WEB_MERCATOR_MAX: f64 = 20_037_508.342_789_244;

/// Deepest zoom level we accept. 2^30 columns still fits comfortably in a u32.
pub const MAX_ZOOM: u8 = 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TileFormat {
    /// Mapbox vector tile, requested as either `.pbf` or `.mvt`.
    Mvt,
}

impl TileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            TileFormat::Mvt => "pbf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            TileFormat::Mvt => "application/vnd.mapbox-vector-tile",
        }
    }
}

impl FromStr for TileFormat {
    type Err = Error;

    fn from_str(ext: &str) -> Result<Self> {
        match ext {
            "pbf" | "mvt" => Ok(TileFormat::Mvt),
            other => Err(Error::InvalidCoordinate(format!(
                "unsupported tile format '{}'",
                other
            ))),
        }
    }
}

/// A bounding box. Units depend on where it came from: meters for tile
/// bounds, degrees for layer extents.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Bounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Grows the box by `margin` on every side.
    pub fn expand(&self, margin: f64) -> Bounds {
        Bounds {
            west: self.west - margin,
            south: self.south - margin,
            east: self.east + margin,
            north: self.north + margin,
        }
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.west + self.east) / 2.0,
            (self.south + self.north) / 2.0,
        )
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }

    /// Clips projected bounds to the web mercator plane. Buffered tiles at
    /// the edge of the grid otherwise reach past it.
    pub fn clamp_to_mercator(&self) -> Bounds {
        Bounds {
            west: self.west.max(-WEB_MERCATOR_MAX),
            south: self.south.max(-WEB_MERCATOR_MAX),
            east: self.east.min(WEB_MERCATOR_MAX),
            north: self.north.min(WEB_MERCATOR_MAX),
        }
    }
}

/// Computes the EPSG:3857 bounds of a tile, padded by `buffer` units of a
/// `resolution`-wide tile grid.
pub fn get_epsg_3857_tile_bounds(resolution: u32, zoom: u8, x: u32, y: u32, buffer: u32) -> Bounds {
    let tile_width = 2.0 * WEB_MERCATOR_MAX / 2f64.powi(i32::from(zoom));

    // Tile rows grow southwards while mercator northings grow northwards.
    let west = -WEB_MERCATOR_MAX + f64::from(x) * tile_width;
    let north = WEB_MERCATOR_MAX - f64::from(y) * tile_width;

    let bounds = Bounds {
        west,
        south: north - tile_width,
        east: west + tile_width,
        north,
    };

    if buffer == 0 || resolution == 0 {
        bounds
    } else {
        bounds.expand(tile_width * f64::from(buffer) / f64::from(resolution))
    }
}

/// A z/x/y tile address plus the format it was requested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
    pub format: TileFormat,
}

impl TileCoord {
    pub fn new(zoom: u8, x: u32, y: u32) -> TileCoord {
        TileCoord {
            zoom,
            x,
            y,
            format: TileFormat::Mvt,
        }
    }

    /// Parses the `{zoom}/{x}/{y}.{ext}` path segments of a tile request and
    /// rejects anything outside the tile grid.
    pub fn from_path(zoom: &str, x: &str, y_ext: &str) -> Result<TileCoord> {
        let (y, ext) = y_ext.rsplit_once('.').ok_or_else(|| {
            Error::InvalidCoordinate(format!("missing format extension in '{}'", y_ext))
        })?;

        let tile = TileCoord {
            zoom: parse_component("zoom", zoom)?,
            x: parse_component("x", x)?,
            y: parse_component("y", y)?,
            format: ext.parse()?,
        };

        if tile.is_valid() {
            Ok(tile)
        } else {
            Err(Error::InvalidCoordinate(format!(
                "{} is outside the tile grid",
                tile
            )))
        }
    }

    /// Number of tiles along either axis at this zoom level.
    pub fn grid_size(&self) -> u64 {
        1u64 << self.zoom.min(63)
    }

    pub fn is_valid(&self) -> bool {
        self.zoom <= MAX_ZOOM
            && u64::from(self.x) < self.grid_size()
            && u64::from(self.y) < self.grid_size()
    }

    /// EPSG:3857 bounds of this tile.
    pub fn bounds(&self) -> Bounds {
        get_epsg_3857_tile_bounds(0, self.zoom, self.x, self.y, 0)
    }

    /// EPSG:3857 bounds of this tile padded by `buffer` grid units.
    pub fn buffered_bounds(&self, resolution: u32, buffer: u32) -> Bounds {
        get_epsg_3857_tile_bounds(resolution, self.zoom, self.x, self.y, buffer)
    }

    /// Longitude/latitude bounds of this tile.
    pub fn lonlat_bounds(&self) -> Bounds {
        let (west, north) = slippy_map_tilenames::tile2lonlat(self.x, self.y, self.zoom);
        let (east, south) = slippy_map_tilenames::tile2lonlat(self.x + 1, self.y + 1, self.zoom);
        Bounds {
            west,
            south,
            east,
            north,
        }
    }

    pub fn children(&self) -> [TileCoord; 4] {
        let (zoom, x, y) = (self.zoom + 1, self.x * 2, self.y * 2);
        [
            TileCoord { zoom, x, y, ..*self },
            TileCoord { zoom, x: x + 1, y, ..*self },
            TileCoord { zoom, x, y: y + 1, ..*self },
            TileCoord { zoom, x: x + 1, y: y + 1, ..*self },
        ]
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}",
            self.zoom,
            self.x,
            self.y,
            self.format.extension()
        )
    }
}

fn parse_component<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidCoordinate(format!("{} '{}' is not a valid integer", name, value)))
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    fn assert_bounds_eq(a: Bounds, b: Bounds) {
        assert_approx_eq!(a.west, b.west, 1e-6);
        assert_approx_eq!(a.south, b.south, 1e-6);
        assert_approx_eq!(a.east, b.east, 1e-6);
        assert_approx_eq!(a.north, b.north, 1e-6);
    }

    fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
        let lon = x / WEB_MERCATOR_MAX * 180.0;
        let lat = (2.0 * (y / WEB_MERCATOR_MAX * std::f64::consts::PI).exp().atan()
            - std::f64::consts::FRAC_PI_2)
            .to_degrees();
        (lon, lat)
    }

    #[test]
    fn test_zoom_zero_covers_the_world() {
        let tile = TileCoord::from_path("0", "0", "0.pbf").unwrap();
        assert!(tile.is_valid());
        assert_bounds_eq(
            tile.bounds(),
            Bounds {
                west: -WEB_MERCATOR_MAX,
                south: -WEB_MERCATOR_MAX,
                east: WEB_MERCATOR_MAX,
                north: WEB_MERCATOR_MAX,
            },
        );
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        assert!(matches!(
            TileCoord::from_path("0", "1", "0.pbf"),
            Err(Error::InvalidCoordinate(_))
        ));
        assert!(matches!(
            TileCoord::from_path("3", "2", "8.pbf"),
            Err(Error::InvalidCoordinate(_))
        ));
        assert!(matches!(
            TileCoord::from_path("31", "0", "0.pbf"),
            Err(Error::InvalidCoordinate(_))
        ));
        assert!(TileCoord::from_path("3", "7", "7.mvt").is_ok());
    }

    #[test]
    fn test_malformed_paths_rejected() {
        for (z, x, y) in [
            ("a", "0", "0.pbf"),
            ("0", "-1", "0.pbf"),
            ("0", "0", "0"),
            ("0", "0", "0.png"),
            ("0", "0", ".pbf"),
        ] {
            assert!(
                matches!(TileCoord::from_path(z, x, y), Err(Error::InvalidCoordinate(_))),
                "{}/{}/{} should be rejected",
                z,
                x,
                y
            );
        }
    }

    #[test]
    fn test_validity_at_every_zoom() {
        for zoom in 0..=MAX_ZOOM {
            let last = (1u64 << zoom) - 1;
            let last = last as u32;
            assert!(TileCoord::new(zoom, last, last).is_valid());
            if let Some(past) = last.checked_add(1) {
                assert!(!TileCoord::new(zoom, past, 0).is_valid());
                assert!(!TileCoord::new(zoom, 0, past).is_valid());
            }
        }
    }

    #[test]
    fn test_children_subdivide_parent() {
        for tile in [
            TileCoord::new(0, 0, 0),
            TileCoord::new(3, 5, 2),
            TileCoord::new(12, 2047, 1361),
        ] {
            let children = tile.children();
            let covered = children
                .iter()
                .skip(1)
                .fold(children[0].bounds(), |acc, child| acc.union(&child.bounds()));
            assert_bounds_eq(tile.bounds(), covered);

            let area: f64 = children
                .iter()
                .map(|c| c.bounds().width() * c.bounds().height())
                .sum();
            let parent_area = tile.bounds().width() * tile.bounds().height();
            assert!((area - parent_area).abs() / parent_area < 1e-9);
        }
    }

    #[test]
    fn test_north_is_up() {
        let top = TileCoord::new(1, 0, 0).bounds();
        let bottom = TileCoord::new(1, 0, 1).bounds();
        assert_approx_eq!(top.south, 0.0, 1e-6);
        assert_approx_eq!(bottom.north, 0.0, 1e-6);
        assert!(top.north > bottom.north);
    }

    #[test]
    fn test_buffered_bounds() {
        let tile = TileCoord::new(2, 1, 1);
        let plain = tile.bounds();
        let buffered = tile.buffered_bounds(4096, 256);
        let margin = plain.width() * 256.0 / 4096.0;

        assert_approx_eq!(buffered.west, plain.west - margin, 1e-6);
        assert_approx_eq!(buffered.north, plain.north + margin, 1e-6);
        assert_bounds_eq(tile.buffered_bounds(4096, 0), plain);
    }

    #[test]
    fn test_clamp_to_mercator() {
        let world = TileCoord::new(0, 0, 0);
        let clamped = world.buffered_bounds(4096, 256).clamp_to_mercator();
        assert_bounds_eq(clamped, world.bounds());

        // Interior edges keep their buffer.
        let tile = TileCoord::new(2, 1, 1);
        let buffered = tile.buffered_bounds(4096, 256);
        assert_bounds_eq(buffered.clamp_to_mercator(), buffered);
    }

    #[test]
    fn test_lonlat_bounds_match_mercator_bounds() {
        let tile = TileCoord::new(5, 17, 11);
        let merc = tile.bounds();
        let lonlat = tile.lonlat_bounds();

        let (west, north) = mercator_to_lonlat(merc.west, merc.north);
        let (east, south) = mercator_to_lonlat(merc.east, merc.south);
        assert_approx_eq!(lonlat.west, west, 1e-6);
        assert_approx_eq!(lonlat.north, north, 1e-6);
        assert_approx_eq!(lonlat.east, east, 1e-6);
        assert_approx_eq!(lonlat.south, south, 1e-6);
    }

    #[test]
    fn test_display() {
        assert_eq!("4/3/2.pbf", TileCoord::new(4, 3, 2).to_string());
    }
}
