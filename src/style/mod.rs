//! Style file parsing.
//!
//! A style file tells the import which tags survive into the output
//! tables, as which column type, and how they steer classification.
//! Each non-comment line is `osm_type tag_key column_type flags`, e.g.
//!
//! ```text
//! node,way  highway   text  linear
//! way       building  text  polygon
//! node,way  source    text  delete
//! ```

use anyhow::{Context, Result, bail};
use std::ops::BitOr;
use std::path::Path;

/// Classification flags of one style entry, kept as a bit set because
/// `phstore` is the combination of `polygon` and `delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TagFlags(u8);

impl TagFlags {
    pub const NONE: TagFlags = TagFlags(0);
    pub const POLYGON: TagFlags = TagFlags(1);
    pub const LINEAR: TagFlags = TagFlags(2);
    pub const NOCACHE: TagFlags = TagFlags(4);
    pub const DELETE: TagFlags = TagFlags(8);
    pub const PHSTORE: TagFlags = TagFlags(1 | 8);

    pub fn contains(self, other: TagFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TagFlags) {
        self.0 |= other.0;
    }

    /// True for plain `delete` entries, false for `phstore` ones even
    /// though both carry the delete bit.
    pub fn is_delete_only(self) -> bool {
        self == TagFlags::DELETE
    }
}

impl BitOr for TagFlags {
    type Output = TagFlags;

    fn bitor(self, other: TagFlags) -> TagFlags {
        TagFlags(self.0 | other.0)
    }
}

/// One recognised tag entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagInfo {
    pub name: String,
    pub column_type: String,
    pub flags: TagFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsmType {
    Node,
    Way,
}

/// Per-OSM-type projection of recognised tags, in style-file order.
/// Immutable after load; the entry order becomes the column order of
/// the output tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportList {
    node: Vec<TagInfo>,
    way: Vec<TagInfo>,
}

impl ExportList {
    pub fn add(&mut self, osm_type: OsmType, info: TagInfo) {
        match osm_type {
            OsmType::Node => self.node.push(info),
            OsmType::Way => self.way.push(info),
        }
    }

    pub fn get(&self, osm_type: OsmType) -> &[TagInfo] {
        match osm_type {
            OsmType::Node => &self.node,
            OsmType::Way => &self.way,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Style {
    pub export: ExportList,
    pub enable_way_area: bool,
}

const MAX_WIDTHS: [usize; 4] = [23, 63, 23, 127];
const FIELD_NAMES: [&str; 4] = ["object type", "tag", "column type", "flags"];

pub fn read_style_file(path: &Path) -> Result<Style> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("couldn't open style file {:?}", path))?;
    parse_style(&text)
}

pub fn parse_style(text: &str) -> Result<Style> {
    let mut export = ExportList::default();
    let mut enable_way_area = true;
    let mut num_read = 0usize;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 3 {
            bail!(
                "error reading style file line {} (fields={})",
                lineno,
                fields.len()
            );
        }
        for (i, field) in fields.iter().enumerate().take(4) {
            if field.len() > MAX_WIDTHS[i] {
                bail!(
                    "style file line {}: {} field longer than {} characters",
                    lineno,
                    FIELD_NAMES[i],
                    MAX_WIDTHS[i]
                );
            }
        }

        let mut flags = TagFlags::NONE;
        if let Some(flag_list) = fields.get(3) {
            for token in flag_list.split(',').filter(|t| !t.is_empty()) {
                match token {
                    "polygon" => flags.insert(TagFlags::POLYGON),
                    "linear" => flags.insert(TagFlags::LINEAR),
                    "nocache" => flags.insert(TagFlags::NOCACHE),
                    "delete" => flags.insert(TagFlags::DELETE),
                    "phstore" => flags.insert(TagFlags::PHSTORE),
                    other => {
                        tracing::warn!("unknown flag '{}' line {}, ignored", other, lineno);
                    }
                }
            }
        }

        let name = fields[1];
        if !flags.is_delete_only() && (name.contains('?') || name.contains('*')) {
            bail!("wildcard '{}' in non-delete style entry", name);
        }

        if name == "way_area" && flags == TagFlags::DELETE {
            enable_way_area = false;
        }

        let info = TagInfo {
            name: name.to_string(),
            column_type: fields[2].to_string(),
            flags,
        };

        let mut kept = false;
        if fields[0].contains("node") {
            export.add(OsmType::Node, info.clone());
            kept = true;
        }
        if fields[0].contains("way") {
            export.add(OsmType::Way, info);
            kept = true;
        }
        if !kept {
            bail!("unrecognised object type on style file line {}", lineno);
        }
        num_read += 1;
    }

    if num_read == 0 {
        bail!("unable to parse any valid columns from the style file");
    }

    Ok(Style {
        export,
        enable_way_area,
    })
}
