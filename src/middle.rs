//! Contract to the middle store holding raw OSM primitives, plus an
//! in-memory implementation used by the binary and the tests.

use crate::tags::Tags;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub member_type: MemberType,
    pub id: i64,
    pub role: String,
}

impl Member {
    pub fn way<R: Into<String>>(id: i64, role: R) -> Member {
        Member {
            member_type: MemberType::Way,
            id,
            role: role.into(),
        }
    }
}

/// Random-access queries against the primitive store. Coordinates come
/// back as raw `(lat, lon)` degrees; projection happens downstream.
pub trait Middle {
    fn get_node(&self, id: i64) -> Option<(f64, f64)>;

    fn get_way(&self, id: i64) -> Option<(Tags, Vec<(f64, f64)>)>;

    /// Bulk fetch preserving input order; missing ways are skipped, so
    /// the result may be shorter than `ids`.
    fn get_ways_bulk(&self, ids: &[i64]) -> Vec<(i64, Tags, Vec<(f64, f64)>)> {
        ids.iter()
            .filter_map(|&id| self.get_way(id).map(|(tags, coords)| (id, tags, coords)))
            .collect()
    }

    fn get_relation(&self, id: i64) -> Option<(Vec<Member>, Tags)>;

    fn relations_using_way(&self, id: i64) -> Vec<i64>;

    /// Resolve node refs to coordinates, skipping refs the store has
    /// never seen.
    fn get_node_list(&self, refs: &[i64]) -> Vec<(f64, f64)> {
        refs.iter().filter_map(|&id| self.get_node(id)).collect()
    }
}

#[derive(Default)]
pub struct RamMiddle {
    nodes: HashMap<i64, (f64, f64)>,
    ways: HashMap<i64, (Tags, Vec<i64>)>,
    relations: HashMap<i64, (Vec<Member>, Tags)>,
    way_rels: HashMap<i64, Vec<i64>>,
}

impl RamMiddle {
    pub fn new() -> RamMiddle {
        RamMiddle::default()
    }

    pub fn add_node(&mut self, id: i64, lat: f64, lon: f64) {
        self.nodes.insert(id, (lat, lon));
    }

    pub fn add_way(&mut self, id: i64, refs: Vec<i64>, tags: Tags) {
        self.ways.insert(id, (tags, refs));
    }

    pub fn add_relation(&mut self, id: i64, members: Vec<Member>, tags: Tags) {
        for member in &members {
            if member.member_type == MemberType::Way {
                let rels = self.way_rels.entry(member.id).or_default();
                if !rels.contains(&id) {
                    rels.push(id);
                }
            }
        }
        self.relations.insert(id, (members, tags));
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }
}

impl Middle for RamMiddle {
    fn get_node(&self, id: i64) -> Option<(f64, f64)> {
        self.nodes.get(&id).copied()
    }

    fn get_way(&self, id: i64) -> Option<(Tags, Vec<(f64, f64)>)> {
        let (tags, refs) = self.ways.get(&id)?;
        Some((tags.clone(), self.get_node_list(refs)))
    }

    fn get_relation(&self, id: i64) -> Option<(Vec<Member>, Tags)> {
        self.relations.get(&id).cloned()
    }

    fn relations_using_way(&self, id: i64) -> Vec<i64> {
        self.way_rels.get(&id).cloned().unwrap_or_default()
    }
}
