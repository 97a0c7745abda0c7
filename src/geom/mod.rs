//! Geometry assembly: ordered coordinate sequences in, WKT out.
//!
//! Ways become linestrings (split at a length threshold) or, when the
//! tag transform asked for a polygon and the ring closes, polygons.
//! Relation members are merged end-to-end into longer lines or into
//! closed rings which are then nested into (multi)polygons. A build
//! that cannot produce a valid geometry yields an empty vector; the
//! caller emits nothing and moves on.

use geo::algorithm::area::Area;
use geo_types::{LineString, Polygon};
use std::fmt::Write;

/// Axis-aligned bounds of a geometry in the working SRS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn from_points(points: &[(f64, f64)]) -> Option<Bbox> {
        let (&(x0, y0), rest) = points.split_first()?;
        let mut bbox = Bbox {
            min_x: x0,
            min_y: y0,
            max_x: x0,
            max_y: y0,
        };
        for &(x, y) in rest {
            bbox.min_x = bbox.min_x.min(x);
            bbox.min_y = bbox.min_y.min(y);
            bbox.max_x = bbox.max_x.max(x);
            bbox.max_y = bbox.max_y.max(y);
        }
        Some(bbox)
    }
}

/// One finished geometry: extended-WKT body, area (zero for lines) and
/// bounds for tile expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Built {
    pub wkt: String,
    pub area: f64,
    pub bbox: Bbox,
}

impl Built {
    pub fn is_polygon(&self) -> bool {
        self.wkt.starts_with("POLYGON") || self.wkt.starts_with("MULTIPOLYGON")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GeometryBuilder {
    /// Drop assembled rings that fail closure or collapse to zero area
    /// instead of emitting their fragments as lines.
    pub exclude_broken_polygons: bool,
    /// Emit one MULTIPOLYGON per relation instead of a POLYGON per
    /// outer ring.
    pub enable_multi: bool,
}

impl GeometryBuilder {
    /// Geometries for a single way. `make_polygon` is the pre-build
    /// classification; an unclosed "polygon" falls back to split
    /// linestrings, so the caller must re-classify from the WKT.
    pub fn way_geometries(
        &self,
        coords: &[(f64, f64)],
        make_polygon: bool,
        split_at: f64,
    ) -> Vec<Built> {
        if coords.len() < 2 {
            return Vec::new();
        }
        if make_polygon && is_closed(coords) && coords.len() >= 4 {
            if self.exclude_broken_polygons && ring_self_intersects(coords) {
                return Vec::new();
            }
            return ring_polygon(coords).into_iter().collect();
        }
        split_line(coords, split_at)
            .into_iter()
            .filter_map(|part| line_built(&part))
            .collect()
    }

    /// Geometries for a relation's way members. With `make_polygon`
    /// the fragments are joined into closed rings and nested into
    /// polygons; otherwise they are merged end-to-end and split like
    /// ordinary long lines.
    pub fn relation_geometries(
        &self,
        members: &[Vec<(f64, f64)>],
        make_polygon: bool,
        split_at: f64,
    ) -> Vec<Built> {
        let fragments: Vec<&[(f64, f64)]> = members
            .iter()
            .filter(|m| m.len() >= 2)
            .map(|m| m.as_slice())
            .collect();
        if fragments.is_empty() {
            return Vec::new();
        }

        if !make_polygon {
            return merge_fragments(&fragments)
                .into_iter()
                .flat_map(|line| split_line(&line, split_at))
                .filter_map(|part| line_built(&part))
                .collect();
        }

        let rings: Vec<Vec<(f64, f64)>> = merge_fragments(&fragments)
            .into_iter()
            .filter(|chain| is_closed(chain) && chain.len() >= 4)
            .filter(|ring| ring_area(ring) > 0.0)
            .filter(|ring| !(self.exclude_broken_polygons && ring_self_intersects(ring)))
            .collect();
        if rings.is_empty() {
            return Vec::new();
        }

        let nested = nest_rings(rings);
        if self.enable_multi {
            multipolygon_built(&nested).into_iter().collect()
        } else {
            nested
                .iter()
                .filter_map(|(outer, holes)| polygon_built(outer, holes))
                .collect()
        }
    }
}

fn is_closed(coords: &[(f64, f64)]) -> bool {
    coords.len() >= 2 && coords.first() == coords.last()
}

fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    (b.0 - a.0).hypot(b.1 - a.1)
}

fn to_line_string(coords: &[(f64, f64)]) -> LineString<f64> {
    LineString::from(coords.to_vec())
}

fn ring_area(ring: &[(f64, f64)]) -> f64 {
    Polygon::new(to_line_string(ring), vec![]).unsigned_area()
}

/// Cut a coordinate chain into pieces no longer than `split_at`,
/// interpolating an extra vertex where a segment crosses the limit so
/// consecutive pieces share an endpoint.
fn split_line(coords: &[(f64, f64)], split_at: f64) -> Vec<Vec<(f64, f64)>> {
    let mut parts = Vec::new();
    let mut part = vec![coords[0]];
    let mut part_len = 0.0;

    for &next in &coords[1..] {
        let mut from = *part.last().expect("part never empty");
        loop {
            let seg = dist(from, next);
            if seg == 0.0 {
                break;
            }
            if part_len + seg <= split_at {
                part.push(next);
                part_len += seg;
                break;
            }
            let t = (split_at - part_len) / seg;
            let cut = (from.0 + t * (next.0 - from.0), from.1 + t * (next.1 - from.1));
            if cut != from {
                part.push(cut);
            }
            parts.push(std::mem::replace(&mut part, vec![cut]));
            part_len = 0.0;
            from = cut;
        }
    }

    if part.len() >= 2 {
        parts.push(part);
    }
    parts
}

/// Join fragments end-to-end (either orientation) into maximal chains.
fn merge_fragments(fragments: &[&[(f64, f64)]]) -> Vec<Vec<(f64, f64)>> {
    let mut pool: Vec<Vec<(f64, f64)>> = fragments.iter().map(|f| f.to_vec()).collect();
    let mut chains = Vec::new();

    while let Some(mut chain) = pool.pop() {
        loop {
            if is_closed(&chain) {
                break;
            }
            let tail = *chain.last().expect("chain never empty");
            let head = chain[0];
            let next = pool.iter().position(|frag| {
                let (f, l) = (frag[0], *frag.last().expect("fragment never empty"));
                f == tail || l == tail || f == head || l == head
            });
            let Some(idx) = next else { break };
            let mut frag = pool.swap_remove(idx);
            let tail = *chain.last().expect("chain never empty");
            if frag[0] == tail {
                chain.extend(frag.into_iter().skip(1));
            } else if *frag.last().expect("fragment never empty") == tail {
                frag.reverse();
                chain.extend(frag.into_iter().skip(1));
            } else if *frag.last().expect("fragment never empty") == chain[0] {
                frag.extend(chain.into_iter().skip(1));
                chain = frag;
            } else {
                frag.reverse();
                frag.extend(chain.into_iter().skip(1));
                chain = frag;
            }
        }
        chains.push(chain);
    }

    chains
}

/// Nest rings by even-odd depth: a ring inside an even number of
/// already-placed rings starts a new outer, one at odd depth becomes a
/// hole of its immediate container. Rings are considered largest-first
/// so containers are placed before their contents; an island sitting
/// inside a hole lands at depth two and comes out as its own polygon
/// rather than a hole nested in a hole.
fn nest_rings(mut rings: Vec<Vec<(f64, f64)>>) -> Vec<(Vec<(f64, f64)>, Vec<Vec<(f64, f64)>>)> {
    rings.sort_by(|a, b| {
        ring_area(b)
            .partial_cmp(&ring_area(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut nested: Vec<(Vec<(f64, f64)>, Vec<Vec<(f64, f64)>>)> = Vec::new();
    // placement order, outermost first: (outer index, hole index)
    let mut placed: Vec<(usize, Option<usize>)> = Vec::new();
    for ring in rings {
        let probe = interior_probe(&ring);
        let mut depth = 0;
        let mut innermost = None;
        for &(oi, hi) in &placed {
            let container: &[(f64, f64)] = match hi {
                None => &nested[oi].0,
                Some(h) => &nested[oi].1[h],
            };
            if point_in_ring(probe, container) {
                depth += 1;
                innermost = Some(oi);
            }
        }
        if depth % 2 == 0 {
            nested.push((ring, Vec::new()));
            placed.push((nested.len() - 1, None));
        } else {
            // odd depth: the innermost container is an outer
            let oi = innermost.expect("odd depth implies a container");
            nested[oi].1.push(ring);
            placed.push((oi, Some(nested[oi].1.len() - 1)));
        }
    }
    nested
}

/// A point for containment probes: the midpoint of the ring's first
/// segment, nudged towards the vertex centroid off the boundary.
fn interior_probe(ring: &[(f64, f64)]) -> (f64, f64) {
    let n = (ring.len() - 1).max(1) as f64;
    let (cx, cy) = ring[..ring.len() - 1]
        .iter()
        .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x, sy + y));
    let centroid = (cx / n, cy / n);
    let mid = (
        (ring[0].0 + ring[1].0) / 2.0,
        (ring[0].1 + ring[1].1) / 2.0,
    );
    (
        mid.0 + (centroid.0 - mid.0) * 1e-9,
        mid.1 + (centroid.1 - mid.1) * 1e-9,
    )
}

fn point_in_ring(point: (f64, f64), ring: &[(f64, f64)]) -> bool {
    // Ray cast along +x
    let mut inside = false;
    for pair in ring.windows(2) {
        let (x1, y1) = pair[0];
        let (x2, y2) = pair[1];
        if (y1 > point.1) != (y2 > point.1) {
            let x_cross = x1 + (point.1 - y1) / (y2 - y1) * (x2 - x1);
            if x_cross > point.0 {
                inside = !inside;
            }
        }
    }
    inside
}

/// Pairwise proper-intersection test over non-adjacent ring segments.
/// Quadratic, but only run under `exclude_broken_polygons` and rings
/// are short in practice.
fn ring_self_intersects(ring: &[(f64, f64)]) -> bool {
    let segs: Vec<_> = ring.windows(2).collect();
    for i in 0..segs.len() {
        for j in (i + 2)..segs.len() {
            if i == 0 && j == segs.len() - 1 {
                continue;
            }
            if proper_intersect(segs[i][0], segs[i][1], segs[j][0], segs[j][1]) {
                return true;
            }
        }
    }
    false
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

fn proper_intersect(a: (f64, f64), b: (f64, f64), c: (f64, f64), d: (f64, f64)) -> bool {
    let d1 = cross(a, b, c);
    let d2 = cross(a, b, d);
    let d3 = cross(c, d, a);
    let d4 = cross(c, d, b);
    (d1 * d2 < 0.0) && (d3 * d4 < 0.0)
}

fn line_built(coords: &[(f64, f64)]) -> Option<Built> {
    if coords.len() < 2 {
        return None;
    }
    let mut wkt = String::from("LINESTRING(");
    write_coord_seq(&mut wkt, coords);
    wkt.push(')');
    Some(Built {
        wkt,
        area: 0.0,
        bbox: Bbox::from_points(coords)?,
    })
}

fn ring_polygon(ring: &[(f64, f64)]) -> Option<Built> {
    polygon_built(ring, &[])
}

fn polygon_built(outer: &[(f64, f64)], holes: &[Vec<(f64, f64)>]) -> Option<Built> {
    let outer_area = ring_area(outer);
    if outer_area == 0.0 {
        return None;
    }
    let area = (outer_area - holes.iter().map(|h| ring_area(h)).sum::<f64>()).max(0.0);
    let mut wkt = String::from("POLYGON(");
    write_polygon_body(&mut wkt, outer, holes);
    wkt.push(')');
    Some(Built {
        wkt,
        area,
        bbox: Bbox::from_points(outer)?,
    })
}

fn multipolygon_built(nested: &[(Vec<(f64, f64)>, Vec<Vec<(f64, f64)>>)]) -> Option<Built> {
    let mut area = 0.0;
    let mut all_points = Vec::new();
    let mut wkt = String::from("MULTIPOLYGON(");
    for (i, (outer, holes)) in nested.iter().enumerate() {
        if i > 0 {
            wkt.push(',');
        }
        wkt.push('(');
        write_polygon_body(&mut wkt, outer, holes);
        wkt.push(')');
        area += (ring_area(outer) - holes.iter().map(|h| ring_area(h)).sum::<f64>()).max(0.0);
        all_points.extend_from_slice(outer);
    }
    wkt.push(')');
    Some(Built {
        wkt,
        area,
        bbox: Bbox::from_points(&all_points)?,
    })
}

fn write_polygon_body(out: &mut String, outer: &[(f64, f64)], holes: &[Vec<(f64, f64)>]) {
    out.push('(');
    write_coord_seq(out, outer);
    out.push(')');
    for hole in holes {
        out.push_str(",(");
        write_coord_seq(out, hole);
        out.push(')');
    }
}

fn write_coord_seq(out: &mut String, coords: &[(f64, f64)]) {
    for (i, (x, y)) in coords.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{} {}", x, y);
    }
}

pub fn point_wkt(x: f64, y: f64) -> String {
    format!("POINT({} {})", x, y)
}

/// Bounds of any WKT body, by scanning its coordinate pairs. Used by
/// the expire probe, which gets geometry text back from the database.
pub fn wkt_bbox(wkt: &str) -> Option<Bbox> {
    let mut numbers = Vec::new();
    let mut token = String::new();
    for c in wkt.chars() {
        if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E' {
            token.push(c);
        } else if !token.is_empty() {
            if let Ok(v) = token.parse::<f64>() {
                numbers.push(v);
            }
            token.clear();
        }
    }
    if let Ok(v) = token.parse::<f64>() {
        numbers.push(v);
    }
    let points: Vec<(f64, f64)> = numbers.chunks_exact(2).map(|p| (p[0], p[1])).collect();
    Bbox::from_points(&points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> GeometryBuilder {
        GeometryBuilder::default()
    }

    #[test]
    fn short_way_becomes_single_linestring() {
        let built = builder().way_geometries(&[(0.0, 0.0), (3.0, 4.0)], false, 100.0);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].wkt, "LINESTRING(0 0,3 4)");
        assert_eq!(built[0].area, 0.0);
    }

    #[test]
    fn long_way_splits_with_shared_endpoints() {
        // 250 km straight line, 100 km limit -> 100 + 100 + 50
        let coords = vec![(0.0, 0.0), (250_000.0, 0.0)];
        let built = builder().way_geometries(&coords, false, 100_000.0);
        assert_eq!(built.len(), 3);
        // cut points are interpolated, so compare with a tolerance
        assert!((built[0].bbox.max_x - 100_000.0).abs() < 1e-6);
        assert!((built[1].bbox.min_x - 100_000.0).abs() < 1e-6);
        assert!((built[1].bbox.max_x - 200_000.0).abs() < 1e-6);
        assert_eq!(built[2].bbox.max_x, 250_000.0);
    }

    #[test]
    fn split_parts_never_exceed_limit() {
        let coords: Vec<(f64, f64)> = (0..60).map(|i| (i as f64 * 7_000.0, 0.0)).collect();
        for part in split_line(&coords, 100_000.0) {
            let len: f64 = part.windows(2).map(|w| dist(w[0], w[1])).sum();
            assert!(len <= 100_000.0 + 1e-6, "part length {} too long", len);
        }
    }

    #[test]
    fn closed_polygon_way_builds_polygon_with_area() {
        let ring = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)];
        let built = builder().way_geometries(&ring, true, 100_000.0);
        assert_eq!(built.len(), 1);
        assert!(built[0].wkt.starts_with("POLYGON(("));
        assert!((built[0].area - 100.0).abs() < 1e-9);
        assert!(built[0].is_polygon());
    }

    #[test]
    fn unclosed_polygon_request_collapses_to_line() {
        let coords = vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)];
        let built = builder().way_geometries(&coords, true, 100_000.0);
        assert_eq!(built.len(), 1);
        assert!(built[0].wkt.starts_with("LINESTRING"));
        assert!(!built[0].is_polygon());
    }

    #[test]
    fn relation_fragments_assemble_into_ring() {
        // square split across two member ways, second reversed
        let members = vec![
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)],
            vec![(0.0, 0.0), (0.0, 10.0), (10.0, 10.0)],
        ];
        let built = builder().relation_geometries(&members, true, 100_000.0);
        assert_eq!(built.len(), 1);
        assert!(built[0].wkt.starts_with("POLYGON"));
        assert!((built[0].area - 100.0).abs() < 1e-9);
    }

    #[test]
    fn inner_ring_becomes_hole() {
        let members = vec![
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)],
            vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0), (4.0, 4.0)],
        ];
        let mut b = builder();
        b.enable_multi = true;
        let built = b.relation_geometries(&members, true, 100_000.0);
        assert_eq!(built.len(), 1);
        assert!(built[0].wkt.starts_with("MULTIPOLYGON((("));
        assert!(built[0].wkt.contains("),("), "hole missing: {}", built[0].wkt);
        assert!((built[0].area - 96.0).abs() < 1e-9);
    }

    #[test]
    fn island_inside_hole_becomes_its_own_polygon() {
        // lake with an island: outer boundary, donut hole, island in
        // the hole. The island must come out as a second outer, not a
        // hole nested inside a hole.
        let members = vec![
            vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0), (0.0, 0.0)],
            vec![(2.0, 2.0), (8.0, 2.0), (8.0, 8.0), (2.0, 8.0), (2.0, 2.0)],
            vec![(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0), (4.0, 4.0)],
        ];
        let built = builder().relation_geometries(&members, true, 100_000.0);
        assert_eq!(built.len(), 2);
        assert!(built[0].wkt.contains("),("), "donut missing its hole: {}", built[0].wkt);
        assert!((built[0].area - 64.0).abs() < 1e-9);
        assert!(!built[1].wkt.contains("),("), "island must be solid: {}", built[1].wkt);
        assert!((built[1].area - 4.0).abs() < 1e-9);

        let mut multi = builder();
        multi.enable_multi = true;
        let built = multi.relation_geometries(&members, true, 100_000.0);
        assert_eq!(built.len(), 1);
        assert!((built[0].area - 68.0).abs() < 1e-9);
    }

    #[test]
    fn unclosed_relation_ring_yields_nothing() {
        let members = vec![vec![(0.0, 0.0), (10.0, 0.0), (10.0, 10.0)]];
        let built = builder().relation_geometries(&members, true, 100_000.0);
        assert!(built.is_empty());
    }

    #[test]
    fn linear_relation_merges_members() {
        let members = vec![
            vec![(0.0, 0.0), (5.0, 0.0)],
            vec![(5.0, 0.0), (9.0, 0.0)],
        ];
        let built = builder().relation_geometries(&members, false, 100_000.0);
        assert_eq!(built.len(), 1);
        assert_eq!(built[0].wkt, "LINESTRING(0 0,5 0,9 0)");
    }

    #[test]
    fn broken_ring_dropped_only_with_exclude_flag() {
        // asymmetric bowtie: self-intersecting, nonzero shoelace area
        let ring = vec![(0.0, 0.0), (10.0, 0.0), (2.0, 6.0), (10.0, 10.0), (0.0, 0.0)];
        let lenient = builder().way_geometries(&ring, true, 100_000.0);
        assert_eq!(lenient.len(), 1);
        assert!(lenient[0].is_polygon());

        let mut strict = builder();
        strict.exclude_broken_polygons = true;
        assert!(strict.way_geometries(&ring, true, 100_000.0).is_empty());
    }

    #[test]
    fn wkt_bbox_scans_all_rings() {
        let bbox = wkt_bbox("POLYGON((0 0,10 0,10 10,0 10,0 0),(2 2,3 2,3 3,2 2))").unwrap();
        assert_eq!(bbox.min_x, 0.0);
        assert_eq!(bbox.max_x, 10.0);
        assert_eq!(bbox.max_y, 10.0);
    }

    #[test]
    fn wkt_bbox_handles_negatives_and_exponents() {
        let bbox = wkt_bbox("POINT(-0.1 5.15e1)").unwrap();
        assert_eq!(bbox.min_x, -0.1);
        assert_eq!(bbox.min_y, 51.5);
    }
}
