//! Import options, fixed at startup and shared read-only.

use crate::project::Projection;
use anyhow::{Result, bail};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Options {
    pub conninfo: String,
    /// Output tables are named `{prefix}_{point|line|polygon|roads}`.
    pub prefix: String,
    pub style: PathBuf,
    pub projection: Projection,
    /// Keep the middle store durable so diffs can be applied later.
    pub slim: bool,
    /// Add to existing tables instead of recreating them.
    pub append: bool,
    /// Drop the slim-mode lookup indexes after import.
    pub droptemp: bool,
    pub enable_hstore: bool,
    pub enable_hstore_index: bool,
    /// Tag-key prefixes collected into dedicated hstore columns.
    pub hstore_columns: Vec<String>,
    /// Emit one MULTIPOLYGON per relation instead of a polygon per ring.
    pub enable_multi: bool,
    pub exclude_broken_polygons: bool,
    pub parallel_indexing: bool,
    pub tablespace_data: Option<String>,
    pub tablespace_index: Option<String>,
    /// Zoom level for the expired-tile list; tile output is skipped
    /// when unset.
    pub expire_tiles_zoom: Option<u8>,
    pub expire_output: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            conninfo: String::new(),
            prefix: "planet_osm".to_string(),
            style: PathBuf::from("default.style"),
            projection: Projection::SphericalMercator,
            slim: false,
            append: false,
            droptemp: false,
            enable_hstore: false,
            enable_hstore_index: false,
            hstore_columns: Vec::new(),
            enable_multi: false,
            exclude_broken_polygons: false,
            parallel_indexing: true,
            tablespace_data: None,
            tablespace_index: None,
            expire_tiles_zoom: None,
            expire_output: None,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.append && !self.slim {
            bail!("--append can only be used with slim mode");
        }
        if self.droptemp && !self.slim {
            bail!("--drop only makes sense with slim mode");
        }
        if self.enable_hstore_index && !self.enable_hstore && self.hstore_columns.is_empty() {
            bail!("hstore indexes requested without any hstore output");
        }
        Ok(())
    }
}
