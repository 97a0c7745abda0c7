//! One destination table: schema setup, buffered COPY streaming, row
//! deletion for incremental runs, and the post-load finalisation pass
//! (cluster by geometry, then indexes).

use crate::config::Options;
use crate::db::Database;
use crate::style::{ExportList, OsmType, TagFlags};
use crate::tags::Tags;
use anyhow::{Context, Result, bail};
use std::fmt::Write as _;
use std::time::Instant;

/// Buffered COPY bytes before a batch is streamed out.
const COPY_FLUSH_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Point,
    Line,
    Polygon,
    Roads,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Point,
        TableKind::Line,
        TableKind::Polygon,
        TableKind::Roads,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            TableKind::Point => "point",
            TableKind::Line => "line",
            TableKind::Polygon => "polygon",
            TableKind::Roads => "roads",
        }
    }

    /// Polygon tables hold both POLYGON and MULTIPOLYGON, so the
    /// declared type stays GEOMETRY.
    fn geom_type(self) -> &'static str {
        match self {
            TableKind::Point => "POINT",
            TableKind::Line | TableKind::Roads => "LINESTRING",
            TableKind::Polygon => "GEOMETRY",
        }
    }

    fn export_type(self) -> OsmType {
        match self {
            TableKind::Point => OsmType::Node,
            _ => OsmType::Way,
        }
    }
}

pub struct OutputTable {
    kind: TableKind,
    name: String,
    srid: i32,
    columns: Vec<(String, String)>,
    hstore_columns: Vec<String>,
    enable_hstore: bool,
    enable_hstore_index: bool,
    append: bool,
    slim: bool,
    droptemp: bool,
    tablespace_data: Option<String>,
    tablespace_index: Option<String>,
    copy_cmd: String,
    buffer: Vec<u8>,
    db: Box<dyn Database>,
}

impl OutputTable {
    pub fn new(
        kind: TableKind,
        options: &Options,
        export: &ExportList,
        db: Box<dyn Database>,
    ) -> OutputTable {
        let name = format!("{}_{}", options.prefix, kind.suffix());

        // delete-flagged entries (plain delete and phstore alike)
        // never become columns
        let columns: Vec<(String, String)> = export
            .get(kind.export_type())
            .iter()
            .filter(|info| !info.flags.contains(TagFlags::DELETE))
            .map(|info| (info.name.clone(), info.column_type.clone()))
            .collect();

        let mut col_list = String::from("\"osm_id\"");
        for (col, _) in &columns {
            let _ = write!(col_list, ",\"{}\"", col);
        }
        for col in &options.hstore_columns {
            let _ = write!(col_list, ",\"{}\"", col);
        }
        if options.enable_hstore {
            col_list.push_str(",\"tags\"");
        }
        col_list.push_str(",\"way\"");
        let copy_cmd = format!("COPY {} ({}) FROM STDIN", name, col_list);

        OutputTable {
            kind,
            name,
            srid: options.projection.srid(),
            columns,
            hstore_columns: options.hstore_columns.clone(),
            enable_hstore: options.enable_hstore,
            enable_hstore_index: options.enable_hstore_index,
            append: options.append,
            slim: options.slim,
            droptemp: options.droptemp,
            tablespace_data: options.tablespace_data.clone(),
            tablespace_index: options.tablespace_index.clone(),
            copy_cmd,
            buffer: Vec::new(),
            db,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Creates the table unless appending to an existing import.
    pub fn setup(&mut self) -> Result<()> {
        if self.append {
            return Ok(());
        }
        self.db
            .execute(&format!("DROP TABLE IF EXISTS {}", self.name))?;

        let mut ddl = format!("CREATE TABLE {} (\"osm_id\" BIGINT", self.name);
        for (col, sql_type) in &self.columns {
            let _ = write!(ddl, ",\"{}\" {}", col, sql_type);
        }
        for col in &self.hstore_columns {
            let _ = write!(ddl, ",\"{}\" hstore", col);
        }
        if self.enable_hstore {
            ddl.push_str(",\"tags\" hstore");
        }
        let _ = write!(
            ddl,
            ",\"way\" geometry({},{}))",
            self.kind.geom_type(),
            self.srid
        );
        self.db
            .execute(&ddl)
            .with_context(|| format!("couldn't create table {}", self.name))
    }

    /// Appends one COPY line; streams the buffer when it crosses the
    /// flush bound.
    pub fn write(&mut self, osm_id: i64, tags: &Tags, wkt: &str) -> Result<()> {
        let mut line = osm_id.to_string();

        for (col, _) in &self.columns {
            line.push('\t');
            match tags.get(col) {
                Some(value) => line.push_str(&copy_escape(value)),
                None => line.push_str("\\N"),
            }
        }

        for prefix in &self.hstore_columns {
            let pairs: Vec<_> = tags
                .iter()
                .filter(|t| t.key.starts_with(prefix.as_str()))
                .map(|t| (t.key[prefix.len()..].to_string(), t.value.clone()))
                .collect();
            line.push('\t');
            if pairs.is_empty() {
                line.push_str("\\N");
            } else {
                line.push_str(&copy_escape(&hstore_encode(&pairs)));
            }
        }

        if self.enable_hstore {
            let residual: Vec<_> = tags
                .iter()
                .filter(|t| !self.is_column(&t.key) && !self.in_hstore_column(&t.key))
                .map(|t| (t.key.clone(), t.value.clone()))
                .collect();
            line.push('\t');
            line.push_str(&copy_escape(&hstore_encode(&residual)));
        }

        let _ = write!(line, "\tSRID={};{}\n", self.srid, wkt);

        self.buffer.extend_from_slice(line.as_bytes());
        if self.buffer.len() >= COPY_FLUSH_BYTES {
            self.pause_copy()?;
        }
        Ok(())
    }

    /// Ends the active COPY batch so interleaved DML sees every row
    /// written so far. The next `write` starts a fresh batch.
    pub fn pause_copy(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        self.db
            .copy(&self.copy_cmd, &data)
            .with_context(|| format!("copy into {} failed", self.name))
    }

    pub fn delete_row(&mut self, osm_id: i64) -> Result<u64> {
        self.pause_copy()?;
        self.db.execute_id(
            &format!("DELETE FROM {} WHERE osm_id = $1", self.name),
            osm_id,
        )
    }

    /// Geometry text of existing rows for an id, for the expire probe.
    pub fn geometries_for(&mut self, osm_id: i64) -> Result<Vec<String>> {
        self.pause_copy()?;
        self.db.query_text(
            &format!("SELECT ST_AsText(way) FROM {} WHERE osm_id = $1", self.name),
            osm_id,
        )
    }

    pub fn commit(&mut self) -> Result<()> {
        self.pause_copy()
    }

    pub fn teardown(self) {}

    /// Post-load finalisation: cluster rows by geometry, then build
    /// the spatial and lookup indexes. Skipped entirely in append mode
    /// since the table is already indexed.
    pub fn finish(&mut self) -> Result<()> {
        self.pause_copy()?;
        if !self.buffer.is_empty() {
            bail!(
                "internal error: buffer for {} has {} bytes after end of copy",
                self.name,
                self.buffer.len()
            );
        }
        if self.append {
            return Ok(());
        }

        let started = Instant::now();
        tracing::info!("sorting data and creating indexes for {}", self.name);
        self.db.execute(&format!("ANALYZE {}", self.name))?;

        let tmp_tablespace = self
            .tablespace_data
            .as_deref()
            .map(|ts| format!(" TABLESPACE {}", ts))
            .unwrap_or_default();
        self.db.execute(&format!(
            "CREATE TABLE {}_tmp{} AS SELECT * FROM {} ORDER BY way",
            self.name, tmp_tablespace, self.name
        ))?;
        self.db.execute(&format!("DROP TABLE {}", self.name))?;
        self.db.execute(&format!(
            "ALTER TABLE {}_tmp RENAME TO {}",
            self.name, self.name
        ))?;

        let index_tablespace = self
            .tablespace_index
            .as_deref()
            .map(|ts| format!(" TABLESPACE {}", ts))
            .unwrap_or_default();
        // full fillfactor only when the table will never be updated
        let fillfactor = if self.slim && !self.droptemp {
            ""
        } else {
            " WITH (FILLFACTOR=100)"
        };
        self.db.execute(&format!(
            "CREATE INDEX {}_index ON {} USING GIST (way){}{}",
            self.name, self.name, fillfactor, index_tablespace
        ))?;

        if self.slim && !self.droptemp {
            // diff application needs the id lookup
            self.db.execute(&format!(
                "CREATE INDEX {}_pkey ON {} USING BTREE (osm_id){}",
                self.name, self.name, index_tablespace
            ))?;
        }

        if self.enable_hstore_index {
            if self.enable_hstore {
                self.db.execute(&format!(
                    "CREATE INDEX {}_tags_index ON {} USING GIN (tags){}",
                    self.name, self.name, index_tablespace
                ))?;
            }
            for (i, col) in self.hstore_columns.iter().enumerate() {
                self.db.execute(&format!(
                    "CREATE INDEX {}_hstore_{}_index ON {} USING GIN (\"{}\"){}",
                    self.name, i, self.name, col, index_tablespace
                ))?;
            }
        }

        self.db
            .execute(&format!("GRANT SELECT ON {} TO PUBLIC", self.name))?;
        self.db.execute(&format!("ANALYZE {}", self.name))?;
        tracing::info!(
            "indexes on {} created in {}s",
            self.name,
            started.elapsed().as_secs()
        );
        Ok(())
    }

    fn is_column(&self, key: &str) -> bool {
        self.columns.iter().any(|(col, _)| col == key)
    }

    fn in_hstore_column(&self, key: &str) -> bool {
        self.hstore_columns
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }
}

/// COPY text format: tab, newline, carriage return and backslash must
/// be escaped; everything else passes through.
fn copy_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// `"k"=>"v",...` with embedded quotes and backslashes escaped.
fn hstore_encode(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "\"{}\"=>\"{}\"", hstore_escape(k), hstore_escape(v));
    }
    out
}

fn hstore_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::parse_style;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Log {
        statements: Arc<Mutex<Vec<String>>>,
        copies: Arc<Mutex<Vec<(String, String)>>>,
    }

    struct Recorder(Log);

    impl Database for Recorder {
        fn execute(&mut self, sql: &str) -> Result<()> {
            self.0.statements.lock().unwrap().push(sql.to_string());
            Ok(())
        }

        fn execute_id(&mut self, sql: &str, id: i64) -> Result<u64> {
            self.0
                .statements
                .lock()
                .unwrap()
                .push(format!("{} [{}]", sql, id));
            Ok(1)
        }

        fn copy(&mut self, cmd: &str, data: &[u8]) -> Result<()> {
            self.0
                .copies
                .lock()
                .unwrap()
                .push((cmd.to_string(), String::from_utf8_lossy(data).into_owned()));
            Ok(())
        }

        fn query_text(&mut self, _sql: &str, _id: i64) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn export() -> ExportList {
        parse_style(
            "node,way highway text linear\n\
             node,way name    text linear\n\
             way      building text polygon\n",
        )
        .unwrap()
        .export
    }

    fn table(kind: TableKind, options: &Options) -> (OutputTable, Log) {
        let log = Log::default();
        let t = OutputTable::new(kind, options, &export(), Box::new(Recorder(log.clone())));
        (t, log)
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().copied().collect()
    }

    #[test]
    fn setup_creates_expected_schema() {
        let (mut t, log) = table(TableKind::Point, &Options::default());
        t.setup().unwrap();
        let statements = log.statements.lock().unwrap();
        assert_eq!(statements[0], "DROP TABLE IF EXISTS planet_osm_point");
        let ddl = &statements[1];
        assert!(ddl.starts_with("CREATE TABLE planet_osm_point (\"osm_id\" BIGINT"));
        assert!(ddl.contains("\"highway\" text"));
        assert!(ddl.contains("\"name\" text"));
        assert!(!ddl.contains("building"), "node table got way column: {}", ddl);
        assert!(ddl.ends_with("\"way\" geometry(POINT,3857))"));
    }

    #[test]
    fn polygon_table_uses_generic_geometry() {
        let (mut t, log) = table(TableKind::Polygon, &Options::default());
        t.setup().unwrap();
        let statements = log.statements.lock().unwrap();
        assert!(statements[1].contains("\"building\" text"));
        assert!(statements[1].ends_with("\"way\" geometry(GEOMETRY,3857))"));
    }

    #[test]
    fn append_mode_creates_nothing() {
        let options = Options {
            append: true,
            slim: true,
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Line, &options);
        t.setup().unwrap();
        assert!(log.statements.lock().unwrap().is_empty());
    }

    #[test]
    fn write_produces_escaped_copy_line() {
        let (mut t, log) = table(TableKind::Line, &Options::default());
        t.write(
            8,
            &tags(&[("highway", "primary"), ("name", "High\tStreet\\")]),
            "LINESTRING(0 0,1 1)",
        )
        .unwrap();
        t.commit().unwrap();

        let copies = log.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        let (cmd, data) = &copies[0];
        assert_eq!(
            cmd,
            "COPY planet_osm_line (\"osm_id\",\"highway\",\"name\",\"building\",\"way\") FROM STDIN"
        );
        assert_eq!(
            data,
            "8\tprimary\tHigh\\tStreet\\\\\t\\N\tSRID=3857;LINESTRING(0 0,1 1)\n"
        );
    }

    #[test]
    fn hstore_mode_appends_residual_tags() {
        let options = Options {
            enable_hstore: true,
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Point, &options);
        t.write(
            42,
            &tags(&[("highway", "bus_stop"), ("shelter", "yes")]),
            "POINT(-0.1 51.5)",
        )
        .unwrap();
        t.commit().unwrap();

        let copies = log.copies.lock().unwrap();
        let (cmd, data) = &copies[0];
        assert!(cmd.contains("\"tags\",\"way\""));
        assert_eq!(
            data,
            "42\tbus_stop\t\\N\t\"shelter\"=>\"yes\"\tSRID=3857;POINT(-0.1 51.5)\n"
        );
    }

    #[test]
    fn hstore_column_collects_prefixed_tags() {
        let options = Options {
            hstore_columns: vec!["name:".to_string()],
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Point, &options);
        t.write(
            1,
            &tags(&[("highway", "bus_stop"), ("name:de", "Haltestelle")]),
            "POINT(0 0)",
        )
        .unwrap();
        t.commit().unwrap();

        let copies = log.copies.lock().unwrap();
        let (_, data) = &copies[0];
        assert!(data.contains("\"de\"=>\"Haltestelle\""));
    }

    #[test]
    fn delete_flushes_pending_copy_first() {
        let (mut t, log) = table(TableKind::Line, &Options::default());
        t.write(5, &tags(&[("highway", "primary")]), "LINESTRING(0 0,1 1)")
            .unwrap();
        t.delete_row(5).unwrap();

        assert_eq!(log.copies.lock().unwrap().len(), 1);
        let statements = log.statements.lock().unwrap();
        assert_eq!(
            statements.last().unwrap(),
            "DELETE FROM planet_osm_line WHERE osm_id = $1 [5]"
        );
    }

    #[test]
    fn finish_clusters_then_indexes() {
        let options = Options {
            slim: true,
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Polygon, &options);
        t.finish().unwrap();
        let statements = log.statements.lock().unwrap();
        let expect = [
            "ANALYZE planet_osm_polygon",
            "CREATE TABLE planet_osm_polygon_tmp AS SELECT * FROM planet_osm_polygon ORDER BY way",
            "DROP TABLE planet_osm_polygon",
            "ALTER TABLE planet_osm_polygon_tmp RENAME TO planet_osm_polygon",
            "CREATE INDEX planet_osm_polygon_index ON planet_osm_polygon USING GIST (way)",
            "CREATE INDEX planet_osm_polygon_pkey ON planet_osm_polygon USING BTREE (osm_id)",
            "GRANT SELECT ON planet_osm_polygon TO PUBLIC",
            "ANALYZE planet_osm_polygon",
        ];
        assert_eq!(statements.as_slice(), &expect);
    }

    #[test]
    fn finish_uses_fillfactor_for_static_imports() {
        let (mut t, log) = table(TableKind::Line, &Options::default());
        t.finish().unwrap();
        let statements = log.statements.lock().unwrap();
        assert!(
            statements
                .iter()
                .any(|s| s.contains("USING GIST (way) WITH (FILLFACTOR=100)"))
        );
        assert!(!statements.iter().any(|s| s.contains("BTREE")));
    }

    #[test]
    fn finish_in_append_mode_only_flushes() {
        let options = Options {
            append: true,
            slim: true,
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Line, &options);
        t.finish().unwrap();
        assert!(log.statements.lock().unwrap().is_empty());
    }

    #[test]
    fn finish_honours_tablespaces() {
        let options = Options {
            tablespace_data: Some("fastdata".to_string()),
            tablespace_index: Some("fastindex".to_string()),
            ..Options::default()
        };
        let (mut t, log) = table(TableKind::Line, &options);
        t.finish().unwrap();
        let statements = log.statements.lock().unwrap();
        assert!(statements.iter().any(|s| s.contains("_tmp TABLESPACE fastdata AS SELECT")));
        assert!(statements.iter().any(|s| s.ends_with("TABLESPACE fastindex")));
    }
}
