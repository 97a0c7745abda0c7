//! Accumulates the web-mercator tiles touched by changed features so
//! downstream render caches can be invalidated after the import.

use crate::geom::{Bbox, wkt_bbox};
use crate::project::Projection;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

const MERC_HALF_WORLD: f64 = 20_037_508.342789244;
/// Features spanning more tiles than this are not expired tile-by-tile.
const MAX_TILES_PER_FEATURE: u64 = 1 << 16;

pub struct ExpireTiles {
    projection: Projection,
    zoom: Option<u8>,
    tiles: BTreeSet<(u32, u32)>,
}

impl ExpireTiles {
    pub fn new(projection: Projection, zoom: Option<u8>) -> ExpireTiles {
        ExpireTiles {
            projection,
            zoom,
            tiles: BTreeSet::new(),
        }
    }

    pub fn from_bbox(&mut self, bbox: Bbox) {
        let Some(zoom) = self.zoom else { return };
        let n = 1u64 << zoom;
        let (x0, y1) = self.tile_fraction(bbox.min_x, bbox.min_y, n);
        let (x1, y0) = self.tile_fraction(bbox.max_x, bbox.max_y, n);
        let span = (u64::from(x1 - x0) + 1) * (u64::from(y1 - y0) + 1);
        if span > MAX_TILES_PER_FEATURE {
            return;
        }
        for tx in x0..=x1 {
            for ty in y0..=y1 {
                self.tiles.insert((tx, ty));
            }
        }
    }

    pub fn from_points(&mut self, points: &[(f64, f64)]) {
        if let Some(bbox) = Bbox::from_points(points) {
            self.from_bbox(bbox);
        }
    }

    /// Expire from geometry text handed back by the database.
    pub fn from_wkt(&mut self, wkt: &str) {
        if let Some(bbox) = wkt_bbox(wkt) {
            self.from_bbox(bbox);
        }
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Writes one `zoom/x/y` line per expired tile.
    pub fn write_list(&self, path: &Path) -> Result<()> {
        let Some(zoom) = self.zoom else { return Ok(()) };
        let mut out = std::io::BufWriter::new(
            std::fs::File::create(path)
                .with_context(|| format!("couldn't create expire list {:?}", path))?,
        );
        for (x, y) in &self.tiles {
            writeln!(out, "{}/{}/{}", zoom, x, y)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Working-SRS coordinate to a tile index at `n = 2^zoom`. The y
    /// axis flips: tile rows count down from the north edge.
    fn tile_fraction(&self, x: f64, y: f64, n: u64) -> (u32, u32) {
        let (mx, my) = match self.projection {
            Projection::SphericalMercator => (x, y),
            Projection::LatLong => Projection::SphericalMercator
                .project(y.clamp(-85.0511, 85.0511), x.clamp(-180.0, 180.0)),
        };
        let max = (n - 1) as f64;
        let tx = ((mx + MERC_HALF_WORLD) / (2.0 * MERC_HALF_WORLD) * n as f64)
            .floor()
            .clamp(0.0, max);
        let ty = ((MERC_HALF_WORLD - my) / (2.0 * MERC_HALF_WORLD) * n as f64)
            .floor()
            .clamp(0.0, max);
        (tx as u32, ty as u32)
    }
}
