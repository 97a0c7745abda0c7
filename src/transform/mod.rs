//! Tag transform: decides, per feature, what survives into the output
//! tables and how the feature is classified.
//!
//! The four filters never mutate their inputs; each returns the
//! cleaned tag set (delete-flagged entries stripped) plus the
//! classification verdicts, or `None` when the feature is dropped.

use crate::style::{ExportList, OsmType, TagFlags};
use crate::tags::Tags;
use crate::utils::wild_match;
use anyhow::{Result, bail};

/// Highways that also belong in the roads table. Any railway and
/// administrative boundaries qualify as well.
const ROADS_HIGHWAYS: [&str; 8] = [
    "motorway",
    "motorway_link",
    "trunk",
    "trunk_link",
    "primary",
    "primary_link",
    "secondary",
    "secondary_link",
];

#[derive(Debug, Clone, PartialEq)]
pub struct WayOutcome {
    pub tags: Tags,
    pub polygon: bool,
    pub roads: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelOutcome {
    pub tags: Tags,
    /// Parallel to the member slice handed in: true when the member
    /// way is wholly represented by the assembled relation and its
    /// standalone rows should be deleted.
    pub superseded: Vec<bool>,
    pub is_boundary: bool,
    pub is_polygon: bool,
    pub roads: bool,
}

pub struct TagTransform {
    export: ExportList,
    enable_hstore: bool,
}

impl TagTransform {
    pub fn new(export: ExportList, enable_hstore: bool) -> Result<TagTransform> {
        if !enable_hstore {
            for osm_type in [OsmType::Node, OsmType::Way] {
                for info in export.get(osm_type) {
                    if info.flags.contains(TagFlags::PHSTORE) && !info.flags.is_delete_only() {
                        bail!(
                            "style entry '{}' has flag phstore but hstore output is disabled",
                            info.name
                        );
                    }
                }
            }
        }
        Ok(TagTransform {
            export,
            enable_hstore,
        })
    }

    pub fn filter_node_tags(&self, tags: &Tags) -> Option<Tags> {
        self.basic_filter(OsmType::Node, tags).map(|(tags, _)| tags)
    }

    pub fn filter_way_tags(&self, tags: &Tags) -> Option<WayOutcome> {
        let (cleaned, flags) = self.basic_filter(OsmType::Way, tags)?;
        let polygon = polygon_verdict(&cleaned, flags);
        let roads = roads_verdict(&cleaned);
        Some(WayOutcome {
            tags: cleaned,
            polygon,
            roads,
        })
    }

    /// Relation-level filter. A relation whose only tag is `type` is
    /// kept so member tag pull-up can still decide its fate.
    pub fn filter_rel_tags(&self, tags: &Tags) -> Option<Tags> {
        let own: Vec<_> = tags.iter().filter(|t| t.key != "type").collect();
        if own.is_empty() {
            return Some(tags.clone());
        }
        let (mut cleaned, _) = self.basic_filter(OsmType::Way, tags)?;
        if let Some(ty) = tags.get("type") {
            cleaned.set("type", ty);
        }
        Some(cleaned)
    }

    /// Assembles the effective tag set of a route / multipolygon /
    /// boundary relation from its own tags and, for otherwise untagged
    /// relations, the tags of its non-inner members. Flags each member
    /// whose tags are fully subsumed by the assembled set.
    pub fn filter_rel_member_tags(
        &self,
        rel_tags: &Tags,
        member_tags: &[Tags],
        member_roles: &[String],
    ) -> Option<RelOutcome> {
        let rel_type = rel_tags.get("type")?;
        let (is_polygon_type, is_boundary) = match rel_type {
            "multipolygon" => (true, false),
            "boundary" => (false, true),
            "route" => (false, false),
            _ => return None,
        };

        let mut assembled = rel_tags.clone();
        assembled.remove("type");

        if assembled.is_empty() && (is_polygon_type || is_boundary) {
            for (i, mtags) in member_tags.iter().enumerate() {
                if member_roles.get(i).map(String::as_str) == Some("inner") {
                    continue;
                }
                for tag in mtags.iter() {
                    if !assembled.contains(&tag.key) {
                        assembled.set(tag.key.clone(), tag.value.clone());
                    }
                }
            }
        }

        let (cleaned, _flags) = self.basic_filter(OsmType::Way, &assembled)?;

        let superseded = member_tags
            .iter()
            .map(|mtags| {
                !mtags.is_empty()
                    && mtags
                        .iter()
                        .all(|t| cleaned.get(&t.key) == Some(t.value.as_str()))
            })
            .collect();

        Some(RelOutcome {
            roads: roads_verdict(&cleaned),
            tags: cleaned,
            superseded,
            is_boundary,
            is_polygon: is_polygon_type,
        })
    }

    /// Shared projection: strip delete-flagged tags, keep the rest,
    /// accumulate classification flags from matching rules. `None`
    /// when no rule matched any tag.
    fn basic_filter(&self, osm_type: OsmType, tags: &Tags) -> Option<(Tags, TagFlags)> {
        let rules = self.export.get(osm_type);
        let mut cleaned = Tags::new();
        let mut flags = TagFlags::NONE;
        let mut matched = false;

        for tag in tags.iter() {
            let rule = rules.iter().find(|info| {
                if info.flags.is_delete_only() {
                    wild_match(&info.name, &tag.key)
                } else {
                    info.name == tag.key
                }
            });
            match rule {
                Some(info) if info.flags.is_delete_only() => {}
                Some(info) => {
                    matched = true;
                    flags.insert(info.flags);
                    cleaned.set(tag.key.clone(), tag.value.clone());
                }
                None => {
                    cleaned.set(tag.key.clone(), tag.value.clone());
                }
            }
        }

        if matched { Some((cleaned, flags)) } else { None }
    }

    pub fn hstore_enabled(&self) -> bool {
        self.enable_hstore
    }
}

/// Style flags decide, then an explicit `area` tag overrides.
fn polygon_verdict(tags: &Tags, flags: TagFlags) -> bool {
    match tags.get("area") {
        Some("yes") | Some("true") | Some("1") => true,
        Some("no") | Some("false") | Some("0") => false,
        _ => flags.contains(TagFlags::POLYGON),
    }
}

fn roads_verdict(tags: &Tags) -> bool {
    if let Some(highway) = tags.get("highway")
        && ROADS_HIGHWAYS.contains(&highway)
    {
        return true;
    }
    if tags.get("railway").is_some_and(|r| !r.is_empty()) {
        return true;
    }
    tags.get("boundary") == Some("administrative")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::parse_style;

    fn transform() -> TagTransform {
        let style = parse_style(
            "node,way highway   text linear\n\
             node,way building  text polygon\n\
             node,way natural   text polygon\n\
             node,way railway   text linear\n\
             node,way boundary  text linear\n\
             node,way name      text linear\n\
             node,way area      text linear # way_area column control\n\
             node,way note:*    text delete\n",
        )
        .unwrap();
        TagTransform::new(style.export, false).unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().copied().collect()
    }

    #[test]
    fn node_with_recognised_tag_is_kept() {
        let t = transform();
        let cleaned = t
            .filter_node_tags(&tags(&[("highway", "bus_stop"), ("note:de", "x")]))
            .unwrap();
        assert_eq!(cleaned.get("highway"), Some("bus_stop"));
        assert!(!cleaned.contains("note:de"));
    }

    #[test]
    fn node_with_no_recognised_tag_is_dropped() {
        let t = transform();
        assert!(t.filter_node_tags(&tags(&[("ref:fr", "77")])).is_none());
    }

    #[test]
    fn unrecognised_tags_survive_into_residual_set() {
        let t = transform();
        let out = t
            .filter_way_tags(&tags(&[("highway", "primary"), ("surface", "asphalt")]))
            .unwrap();
        assert_eq!(out.tags.get("surface"), Some("asphalt"));
    }

    #[test]
    fn way_polygon_flag_comes_from_style() {
        let t = transform();
        let out = t.filter_way_tags(&tags(&[("building", "yes")])).unwrap();
        assert!(out.polygon);
        assert!(!out.roads);

        let out = t.filter_way_tags(&tags(&[("highway", "residential")])).unwrap();
        assert!(!out.polygon);
    }

    #[test]
    fn area_tag_overrides_polygon_verdict() {
        let t = transform();
        let out = t
            .filter_way_tags(&tags(&[("highway", "pedestrian"), ("area", "yes")]))
            .unwrap();
        assert!(out.polygon);

        let out = t
            .filter_way_tags(&tags(&[("building", "yes"), ("area", "no")]))
            .unwrap();
        assert!(!out.polygon);
    }

    #[test]
    fn roads_membership() {
        let t = transform();
        assert!(t.filter_way_tags(&tags(&[("highway", "primary")])).unwrap().roads);
        assert!(!t.filter_way_tags(&tags(&[("highway", "residential")])).unwrap().roads);
        assert!(t.filter_way_tags(&tags(&[("railway", "rail")])).unwrap().roads);
        assert!(
            t.filter_way_tags(&tags(&[("boundary", "administrative")]))
                .unwrap()
                .roads
        );
    }

    #[test]
    fn multipolygon_members_superseded_when_subsumed() {
        let t = transform();
        let rel = tags(&[("type", "multipolygon"), ("natural", "water")]);
        let members = vec![tags(&[("natural", "water")]), tags(&[("natural", "water")])];
        let roles = vec!["outer".to_string(), "inner".to_string()];
        let out = t.filter_rel_member_tags(&rel, &members, &roles).unwrap();
        assert!(out.is_polygon);
        assert!(!out.is_boundary);
        assert_eq!(out.superseded, vec![true, true]);
        assert_eq!(out.tags.get("natural"), Some("water"));
        assert!(!out.tags.contains("type"));
    }

    #[test]
    fn member_with_extra_tags_not_superseded() {
        let t = transform();
        let rel = tags(&[("type", "multipolygon"), ("natural", "water")]);
        let members = vec![tags(&[("natural", "water"), ("name", "Inner pond")])];
        let roles = vec!["outer".to_string()];
        let out = t.filter_rel_member_tags(&rel, &members, &roles).unwrap();
        assert_eq!(out.superseded, vec![false]);
    }

    #[test]
    fn untagged_multipolygon_pulls_tags_from_outer_members() {
        let t = transform();
        let rel = tags(&[("type", "multipolygon")]);
        let members = vec![
            tags(&[("natural", "wood")]),
            tags(&[("natural", "scrub")]), // inner: ignored for pull-up
        ];
        let roles = vec!["outer".to_string(), "inner".to_string()];
        let out = t.filter_rel_member_tags(&rel, &members, &roles).unwrap();
        assert_eq!(out.tags.get("natural"), Some("wood"));
        assert_eq!(out.superseded, vec![true, false]);
    }

    #[test]
    fn boundary_relation_flags_boundary_not_polygon() {
        let t = transform();
        let rel = tags(&[
            ("type", "boundary"),
            ("boundary", "administrative"),
            ("name", "Shire"),
        ]);
        let out = t.filter_rel_member_tags(&rel, &[], &[]).unwrap();
        assert!(out.is_boundary);
        assert!(!out.is_polygon);
        assert!(out.roads);
    }

    #[test]
    fn route_relation_is_linear() {
        let t = transform();
        let rel = tags(&[("type", "route"), ("highway", "primary")]);
        let out = t.filter_rel_member_tags(&rel, &[], &[]).unwrap();
        assert!(!out.is_polygon);
        assert!(!out.is_boundary);
    }

    #[test]
    fn unsupported_relation_type_dropped() {
        let t = transform();
        let rel = tags(&[("type", "site"), ("natural", "water")]);
        assert!(t.filter_rel_member_tags(&rel, &[], &[]).is_none());
    }

    #[test]
    fn phstore_requires_hstore_mode() {
        let style = parse_style("way building text phstore\n").unwrap();
        assert!(TagTransform::new(style.export.clone(), false).is_err());
        assert!(TagTransform::new(style.export, true).is_ok());
    }
}
