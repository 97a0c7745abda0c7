//! Per-feature processing: receives node/way/relation callbacks from
//! the front-end, classifies through the tag transform, builds
//! geometry, and streams rows into the four output tables.
//!
//! Polygon-candidate ways are deferred: they may be consumed by a
//! multipolygon relation and must then be suppressed from the
//! standalone tables, so their verdict is only rendered in the pending
//! passes after all relations have been seen.

use crate::config::Options;
use crate::db::Database;
use crate::expire::ExpireTiles;
use crate::geom::{GeometryBuilder, point_wkt};
use crate::middle::{Member, MemberType, Middle};
use crate::style::Style;
use crate::table::{OutputTable, TableKind};
use crate::tags::Tags;
use crate::tracker::IdTracker;
use crate::transform::TagTransform;
use anyhow::{Result, bail};

struct Tables {
    point: OutputTable,
    line: OutputTable,
    polygon: OutputTable,
    roads: OutputTable,
}

pub struct Emitter<'a> {
    options: &'a Options,
    middle: &'a dyn Middle,
    transform: TagTransform,
    builder: GeometryBuilder,
    enable_way_area: bool,
    tables: Tables,
    ways_pending: IdTracker,
    ways_done: IdTracker,
    rels_pending: IdTracker,
    expire: ExpireTiles,
}

impl<'a> Emitter<'a> {
    pub fn new(
        options: &'a Options,
        middle: &'a dyn Middle,
        style: Style,
        mut connect: impl FnMut() -> Result<Box<dyn Database>>,
    ) -> Result<Emitter<'a>> {
        let transform = TagTransform::new(style.export.clone(), options.enable_hstore)?;
        let builder = GeometryBuilder {
            exclude_broken_polygons: options.exclude_broken_polygons,
            enable_multi: options.enable_multi,
        };

        let mut make_table = |kind| -> Result<OutputTable> {
            let mut table = OutputTable::new(kind, options, &style.export, connect()?);
            table.setup()?;
            Ok(table)
        };
        let tables = Tables {
            point: make_table(TableKind::Point)?,
            line: make_table(TableKind::Line)?,
            polygon: make_table(TableKind::Polygon)?,
            roads: make_table(TableKind::Roads)?,
        };

        Ok(Emitter {
            ways_pending: IdTracker::new(&options.prefix, "ways_pending", connect()?)?,
            ways_done: IdTracker::new(&options.prefix, "ways_done", connect()?)?,
            rels_pending: IdTracker::new(&options.prefix, "rels_pending", connect()?)?,
            expire: ExpireTiles::new(options.projection, options.expire_tiles_zoom),
            options,
            middle,
            transform,
            builder,
            enable_way_area: style.enable_way_area,
            tables,
        })
    }

    pub fn node_add(&mut self, id: i64, lat: f64, lon: f64, tags: &Tags) -> Result<()> {
        let Some(cleaned) = self.transform.filter_node_tags(tags) else {
            return Ok(());
        };
        let (x, y) = self.options.projection.project(lat, lon);
        self.expire.from_points(&[(x, y)]);
        self.tables.point.write(id, &cleaned, &point_wkt(x, y))
    }

    /// Linear ways are emitted immediately; polygon candidates only
    /// get marked pending (see module docs).
    pub fn way_add(&mut self, id: i64, refs: &[i64], tags: &Tags) -> Result<()> {
        let Some(outcome) = self.transform.filter_way_tags(tags) else {
            return Ok(());
        };
        if outcome.polygon {
            return self.ways_pending.mark(id);
        }
        let coords = self.middle.get_node_list(refs);
        self.out_way(id, tags, &coords, false)
    }

    pub fn relation_add(&mut self, id: i64, members: &[Member], tags: &Tags) -> Result<()> {
        // Only a limited subset of type= is supported
        match tags.get("type") {
            Some("route") | Some("multipolygon") | Some("boundary") => {}
            _ => return Ok(()),
        }
        self.process_relation(id, members, tags, false)
    }

    pub fn node_modify(&mut self, id: i64, lat: f64, lon: f64, tags: &Tags) -> Result<()> {
        self.require_slim()?;
        self.node_delete(id)?;
        self.node_add(id, lat, lon, tags)
    }

    pub fn way_modify(&mut self, id: i64, refs: &[i64], tags: &Tags) -> Result<()> {
        self.require_slim()?;
        self.way_delete(id)?;
        self.way_add(id, refs, tags)
    }

    pub fn relation_modify(&mut self, id: i64, members: &[Member], tags: &Tags) -> Result<()> {
        self.require_slim()?;
        self.relation_delete(id)?;
        self.relation_add(id, members, tags)
    }

    pub fn node_delete(&mut self, id: i64) -> Result<()> {
        self.require_slim()?;
        let prior = self.tables.point.geometries_for(id)?;
        if !prior.is_empty() {
            for wkt in &prior {
                self.expire.from_wkt(wkt);
            }
            self.tables.point.delete_row(id)?;
        }
        Ok(())
    }

    pub fn way_delete(&mut self, id: i64) -> Result<()> {
        self.require_slim()?;
        self.delete_way_rows(id)
    }

    pub fn relation_delete(&mut self, id: i64) -> Result<()> {
        self.require_slim()?;
        self.delete_relation_rows(id)
    }

    /// Deferred-pass entry: fetch a pending way from the middle and
    /// run it through the way pipeline, unless a relation already
    /// consumed it.
    pub fn pending_way(&mut self, id: i64, exists: bool) -> Result<()> {
        if self.ways_done.is_marked(id) {
            return Ok(());
        }
        if let Some((tags, coords)) = self.middle.get_way(id) {
            self.out_way(id, &tags, &coords, exists)?;
        }
        Ok(())
    }

    /// Deferred-pass entry for relations.
    pub fn pending_relation(&mut self, id: i64, exists: bool) -> Result<()> {
        if let Some((members, tags)) = self.middle.get_relation(id) {
            self.process_relation(id, &members, &tags, exists)?;
        }
        Ok(())
    }

    pub fn pop_pending_way(&mut self) -> Result<Option<i64>> {
        self.ways_pending.pop_lowest()
    }

    pub fn pop_pending_rel(&mut self) -> Result<Option<i64>> {
        self.rels_pending.pop_lowest()
    }

    pub fn way_is_done(&self, id: i64) -> bool {
        self.ways_done.is_marked(id)
    }

    /// Way pipeline, shared by ingest and the deferred replay. Raw
    /// `(lat, lon)` coordinates; reprojection happens here.
    pub fn out_way(
        &mut self,
        id: i64,
        tags: &Tags,
        coords: &[(f64, f64)],
        exists: bool,
    ) -> Result<()> {
        if exists {
            self.delete_way_rows(id)?;
            // geometry changed: every relation built from this way
            // needs rebuilding too
            for rel in self.middle.relations_using_way(id) {
                self.rels_pending.mark(rel)?;
            }
        }

        let Some(outcome) = self.transform.filter_way_tags(tags) else {
            return Ok(());
        };

        let projected = self.project_all(coords);
        let built = self.builder.way_geometries(
            &projected,
            outcome.polygon,
            self.options.projection.split_at(),
        );

        let mut tags = outcome.tags;
        for b in &built {
            self.expire.from_bbox(b.bbox);
            if b.is_polygon() {
                if b.area > 0.0 && self.enable_way_area {
                    tags.set("way_area", format_area(b.area));
                }
                self.tables.polygon.write(id, &tags, &b.wkt)?;
            } else {
                self.tables.line.write(id, &tags, &b.wkt)?;
                if outcome.roads {
                    self.tables.roads.write(id, &tags, &b.wkt)?;
                }
            }
        }
        Ok(())
    }

    /// Relation pipeline: resolve way members through the middle,
    /// classify, build, emit under the negated id, and supersede
    /// members wholly represented by the assembled polygon.
    pub fn process_relation(
        &mut self,
        id: i64,
        members: &[Member],
        rel_tags: &Tags,
        exists: bool,
    ) -> Result<()> {
        if exists {
            self.delete_relation_rows(id)?;
        }

        if self.transform.filter_rel_tags(rel_tags).is_none() {
            return Ok(());
        }

        let way_ids: Vec<i64> = members
            .iter()
            .filter(|m| m.member_type == MemberType::Way)
            .map(|m| m.id)
            .collect();
        let fetched = self.middle.get_ways_bulk(&way_ids);
        if fetched.is_empty() {
            return Ok(());
        }

        // Roles are matched back by scanning the member array from the
        // fetched position onwards; member counts are small.
        let roles: Vec<String> = fetched
            .iter()
            .enumerate()
            .map(|(i, (wid, _, _))| {
                members
                    .iter()
                    .skip(i)
                    .chain(members.iter().take(i))
                    .find(|m| m.member_type == MemberType::Way && m.id == *wid)
                    .map(|m| m.role.clone())
                    .unwrap_or_default()
            })
            .collect();
        let member_tags: Vec<Tags> = fetched.iter().map(|(_, tags, _)| tags.clone()).collect();

        let Some(outcome) = self
            .transform
            .filter_rel_member_tags(rel_tags, &member_tags, &roles)
        else {
            return Ok(());
        };

        let split_at = self.options.projection.split_at();
        let projected: Vec<Vec<(f64, f64)>> = fetched
            .iter()
            .map(|(_, _, coords)| self.project_all(coords))
            .collect();

        let built = self
            .builder
            .relation_geometries(&projected, outcome.is_polygon, split_at);
        if built.is_empty() {
            return Ok(());
        }

        let mut tags = outcome.tags.clone();
        for b in &built {
            self.expire.from_bbox(b.bbox);
            if b.is_polygon() {
                if b.area > 0.0 && self.enable_way_area {
                    tags.set("way_area", format_area(b.area));
                }
                self.tables.polygon.write(-id, &tags, &b.wkt)?;
            } else {
                self.tables.line.write(-id, &tags, &b.wkt)?;
                if outcome.roads {
                    self.tables.roads.write(-id, &tags, &b.wkt)?;
                }
            }
        }

        // Members fully folded into the multipolygon: mark them done
        // and drop their standalone rows so they don't show up twice
        if outcome.is_polygon {
            for (i, (wid, _, _)) in fetched.iter().enumerate() {
                if outcome.superseded[i] {
                    self.ways_done.mark(*wid)?;
                    self.delete_way_rows(*wid)?;
                }
            }
        }

        // Boundaries additionally emit any closed rings as polygons;
        // the linear parts are already out
        if outcome.is_boundary {
            let built = self.builder.relation_geometries(&projected, true, split_at);
            for b in &built {
                self.expire.from_bbox(b.bbox);
                if b.is_polygon() {
                    if b.area > 0.0 && self.enable_way_area {
                        tags.set("way_area", format_area(b.area));
                    }
                    self.tables.polygon.write(-id, &tags, &b.wkt)?;
                }
            }
        }

        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        self.tables.point.commit()?;
        self.tables.line.commit()?;
        self.tables.polygon.commit()?;
        self.tables.roads.commit()?;
        self.ways_pending.commit()?;
        self.ways_done.commit()?;
        self.rels_pending.commit()
    }

    /// Finalises all four tables, in parallel when configured, then
    /// writes the expired-tile list. Failures are collected so every
    /// table gets its chance to finish.
    pub fn stop(self) -> Result<()> {
        let Tables {
            point,
            line,
            polygon,
            roads,
        } = self.tables;
        let tables = vec![point, line, polygon, roads];

        let mut failures: Vec<String> = Vec::new();
        if self.options.parallel_indexing {
            let handles: Vec<_> = tables
                .into_iter()
                .map(|mut table| {
                    let name = table.name().to_string();
                    (name, std::thread::spawn(move || table.finish()))
                })
                .collect();
            for (name, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failures.push(format!("{}: {:#}", name, err)),
                    Err(_) => failures.push(format!("{}: finalisation thread panicked", name)),
                }
            }
        } else {
            for mut table in tables {
                if let Err(err) = table.finish() {
                    failures.push(format!("{}: {:#}", table.name(), err));
                }
            }
        }
        if !failures.is_empty() {
            bail!("table finalisation failed: {}", failures.join("; "));
        }

        if let Some(path) = &self.options.expire_output {
            self.expire.write_list(path)?;
            tracing::info!(
                "wrote {} expired tiles to {:?}",
                self.expire.tile_count(),
                path
            );
        }
        Ok(())
    }

    pub fn expire(&self) -> &ExpireTiles {
        &self.expire
    }

    /// Row deletion for a way id. Only meaningful in slim mode, and
    /// skipped in drop-temp mode where the id indexes are gone.
    fn delete_way_rows(&mut self, id: i64) -> Result<()> {
        if !self.options.slim || self.options.droptemp {
            return Ok(());
        }
        self.tables.roads.delete_row(id)?;
        self.probe_delete(TableKind::Line, id)?;
        self.probe_delete(TableKind::Polygon, id)
    }

    /// Relations live under negated ids.
    fn delete_relation_rows(&mut self, id: i64) -> Result<()> {
        self.tables.roads.delete_row(-id)?;
        self.probe_delete(TableKind::Line, -id)?;
        self.probe_delete(TableKind::Polygon, -id)
    }

    /// Expire the old geometry and delete the row, but only issue the
    /// DELETE when the probe says the object was ever there.
    fn probe_delete(&mut self, kind: TableKind, id: i64) -> Result<()> {
        let table = match kind {
            TableKind::Line => &mut self.tables.line,
            TableKind::Polygon => &mut self.tables.polygon,
            TableKind::Point => &mut self.tables.point,
            TableKind::Roads => &mut self.tables.roads,
        };
        let prior = table.geometries_for(id)?;
        if prior.is_empty() {
            return Ok(());
        }
        for wkt in &prior {
            self.expire.from_wkt(wkt);
        }
        table.delete_row(id)?;
        Ok(())
    }

    fn project_all(&self, coords: &[(f64, f64)]) -> Vec<(f64, f64)> {
        coords
            .iter()
            .map(|&(lat, lon)| self.options.projection.project(lat, lon))
            .collect()
    }

    fn require_slim(&self) -> Result<()> {
        if !self.options.slim {
            bail!("cannot apply diffs unless in slim mode");
        }
        Ok(())
    }
}

/// Six significant digits, the way the area used to be printed.
fn format_area(area: f64) -> String {
    if area == 0.0 {
        return "0".to_string();
    }
    let exp = area.abs().log10().floor() as i32;
    let digits = 5 - exp;
    let rounded = if digits >= 0 {
        let f = 10f64.powi(digits);
        (area * f).round() / f
    } else {
        let f = 10f64.powi(-digits);
        (area / f).round() * f
    };
    if exp < -4 || exp >= 15 {
        format!("{:e}", rounded)
    } else {
        format!("{}", rounded)
    }
}
