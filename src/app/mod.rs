//! Binary orchestration: two passes over the input PBF. Pass 1 loads
//! the middle store (parallel blob decode, single writer). Pass 2
//! replays every primitive serially through the feature emitter, then
//! the deferred way/relation passes run and the tables are finalised.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::bounded;
use osmpbf::{BlobDecode, BlobReader, Element, RelMemberType};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::config::Options;
use crate::db::{Database, PgConnection};
use crate::drive::{RelPass, WayPass};
use crate::emit::Emitter;
use crate::middle::{Member, MemberType, RamMiddle};
use crate::project::Projection;
use crate::style::read_style_file;
use crate::tags::Tags;
use crate::utils::ProgressCounter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Input OSM PBF file
    #[arg(short, long)]
    pub input: PathBuf,

    /// Database connection string
    #[arg(short = 'd', long = "database", env = "OSMGRES_DATABASE")]
    pub database: String,

    /// Style file controlling tag projection
    #[arg(short = 'S', long, default_value = "default.style")]
    pub style: PathBuf,

    /// Output table prefix
    #[arg(short, long, default_value = "planet_osm")]
    pub prefix: String,

    /// Working projection
    #[arg(long, value_enum, default_value = "mercator")]
    pub projection: Projection,

    /// Keep the middle durable so diffs can be applied later
    #[arg(short, long)]
    pub slim: bool,

    /// Add to existing tables instead of recreating them
    #[arg(long)]
    pub append: bool,

    /// Drop slim-mode lookup indexes once the import is done
    #[arg(long = "drop")]
    pub droptemp: bool,

    /// Add an hstore column holding all leftover tags
    #[arg(long = "hstore")]
    pub enable_hstore: bool,

    /// Collect tags with this key prefix into a dedicated hstore
    /// column (repeatable)
    #[arg(long = "hstore-column")]
    pub hstore_columns: Vec<String>,

    /// Build GIN indexes on the hstore columns
    #[arg(long = "hstore-add-index")]
    pub enable_hstore_index: bool,

    /// Emit multipolygons as a single MULTIPOLYGON row
    #[arg(long = "multi-geometry", short = 'G')]
    pub enable_multi: bool,

    /// Drop polygons that fail the validity check
    #[arg(long = "exclude-invalid-polygon")]
    pub exclude_invalid_polygon: bool,

    /// Finalise the four tables one after another
    #[arg(long)]
    pub disable_parallel_indexing: bool,

    /// Tablespace for the clustered tables
    #[arg(long)]
    pub tablespace_main_data: Option<String>,

    /// Tablespace for the indexes
    #[arg(long)]
    pub tablespace_main_index: Option<String>,

    /// Zoom level to record expired tiles at
    #[arg(short = 'e', long = "expire-tiles")]
    pub expire_tiles: Option<u8>,

    /// File to write the expired-tile list to
    #[arg(short = 'o', long = "expire-output")]
    pub expire_output: Option<PathBuf>,

    /// Number of worker threads for PBF decoding (default: all cores)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Show detailed log output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn options(&self) -> Options {
        Options {
            conninfo: self.database.clone(),
            prefix: self.prefix.clone(),
            style: self.style.clone(),
            projection: self.projection,
            slim: self.slim,
            append: self.append,
            droptemp: self.droptemp,
            enable_hstore: self.enable_hstore,
            enable_hstore_index: self.enable_hstore_index,
            hstore_columns: self.hstore_columns.clone(),
            enable_multi: self.enable_multi,
            exclude_broken_polygons: self.exclude_invalid_polygon,
            parallel_indexing: !self.disable_parallel_indexing,
            tablespace_data: self.tablespace_main_data.clone(),
            tablespace_index: self.tablespace_main_index.clone(),
            expire_tiles_zoom: self.expire_tiles,
            expire_output: self.expire_output.clone(),
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("couldn't size the decode thread pool")?;
    }

    let options = cli.options();
    options.validate()?;

    let style = read_style_file(&options.style)?;

    tracing::info!("Pass 1/2: loading the middle store from {:?}", cli.input);
    let middle = pass1_load_middle(&cli.input)?;
    tracing::info!(
        "middle holds {} nodes, {} ways, {} relations",
        middle.node_count(),
        middle.way_count(),
        middle.relation_count()
    );

    let mut emitter = Emitter::new(&options, &middle, style, || {
        PgConnection::connect(&options.conninfo).map(|c| Box::new(c) as Box<dyn Database>)
    })?;

    tracing::info!("Pass 2/2: processing features");
    pass2_emit(&cli.input, &mut emitter, options.append)?;
    emitter.commit()?;

    tracing::info!("processing pending ways");
    let mut way_pass = WayPass::new(&mut emitter)?;
    way_pass.finish(&mut emitter, options.append)?;
    emitter.commit()?;

    tracing::info!("processing pending relations");
    let mut rel_pass = RelPass::new(&mut emitter)?;
    rel_pass.finish(&mut emitter, options.append)?;
    emitter.commit()?;

    emitter.stop()?;
    tracing::info!("import finished");
    Ok(())
}

enum PrimitiveBatch {
    Nodes(Vec<(i64, f64, f64)>),
    Ways(Vec<(i64, Vec<i64>, Tags)>),
    Relations(Vec<(i64, Vec<Member>, Tags)>),
}

fn pass1_load_middle(path: &Path) -> Result<RamMiddle> {
    let reader = BlobReader::from_path(path)
        .with_context(|| format!("couldn't open input file {:?}", path))?;
    let (tx, rx) = bounded::<PrimitiveBatch>(64);

    let writer = std::thread::spawn(move || -> Result<RamMiddle> {
        let mut middle = RamMiddle::new();
        let mut progress = ProgressCounter::new("Pass 1/2: primitives", 100_000);
        for batch in rx {
            match batch {
                PrimitiveBatch::Nodes(nodes) => {
                    progress.inc(nodes.len() as u64);
                    for (id, lat, lon) in nodes {
                        middle.add_node(id, lat, lon);
                    }
                }
                PrimitiveBatch::Ways(ways) => {
                    progress.inc(ways.len() as u64);
                    for (id, refs, tags) in ways {
                        middle.add_way(id, refs, tags);
                    }
                }
                PrimitiveBatch::Relations(rels) => {
                    progress.inc(rels.len() as u64);
                    for (id, members, tags) in rels {
                        middle.add_relation(id, members, tags);
                    }
                }
            }
        }
        progress.finish();
        Ok(middle)
    });

    let decode_result = reader.par_bridge().try_for_each(|blob_result| -> Result<()> {
        let blob = blob_result?;
        let block = match blob.decode() {
            Ok(BlobDecode::OsmHeader(_)) => return Ok(()),
            Ok(BlobDecode::OsmData(block)) => block,
            Ok(BlobDecode::Unknown(unknown)) => {
                tracing::info!("unknown blob: {}", unknown);
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let mut nodes = Vec::new();
        let mut ways = Vec::new();
        let mut rels = Vec::new();
        for element in block.elements() {
            match element {
                Element::Node(node) => {
                    nodes.push((node.id(), node.lat(), node.lon()));
                }
                Element::DenseNode(node) => {
                    nodes.push((node.id(), node.lat(), node.lon()));
                }
                Element::Way(way) => {
                    ways.push((way.id(), way.refs().collect(), collect_tags(way.tags())));
                }
                Element::Relation(rel) => {
                    rels.push((rel.id(), collect_members(&rel), collect_tags(rel.tags())));
                }
            }
        }
        for batch in [
            PrimitiveBatch::Nodes(nodes),
            PrimitiveBatch::Ways(ways),
            PrimitiveBatch::Relations(rels),
        ] {
            if !batch_is_empty(&batch) {
                tx.send(batch)
                    .map_err(|err| anyhow!("failed to queue primitive batch: {}", err))?;
            }
        }
        Ok(())
    });

    drop(tx);

    // Check the writer thread first - it has the real error if the
    // channel disconnected
    let middle = match writer.join() {
        Ok(Ok(middle)) => middle,
        Ok(Err(writer_err)) => {
            return if decode_result.is_err() {
                Err(writer_err.context("middle writer failed (caused channel disconnect)"))
            } else {
                Err(writer_err)
            };
        }
        Err(panic_payload) => {
            let panic_msg = panic_payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic_payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            return Err(anyhow!("middle writer thread panicked: {}", panic_msg));
        }
    };

    decode_result?;
    Ok(middle)
}

fn batch_is_empty(batch: &PrimitiveBatch) -> bool {
    match batch {
        PrimitiveBatch::Nodes(v) => v.is_empty(),
        PrimitiveBatch::Ways(v) => v.is_empty(),
        PrimitiveBatch::Relations(v) => v.is_empty(),
    }
}

/// Serial replay through the emitter. The emitter owns one database
/// connection per table and must only ever see one thread.
fn pass2_emit(path: &Path, emitter: &mut Emitter, append: bool) -> Result<()> {
    let reader = BlobReader::from_path(path)?;
    let mut progress = ProgressCounter::new("Pass 2/2: features", 100_000);

    for blob_result in reader {
        let blob = blob_result?;
        let block = match blob.decode() {
            Ok(BlobDecode::OsmData(block)) => block,
            Ok(_) => continue,
            Err(error) => return Err(error.into()),
        };
        for element in block.elements() {
            progress.inc(1);
            match element {
                Element::Node(node) => {
                    let tags = collect_tags(node.tags());
                    feed_node(emitter, append, node.id(), node.lat(), node.lon(), &tags)?;
                }
                Element::DenseNode(node) => {
                    let tags = collect_tags(node.tags());
                    feed_node(emitter, append, node.id(), node.lat(), node.lon(), &tags)?;
                }
                Element::Way(way) => {
                    let refs: Vec<i64> = way.refs().collect();
                    let tags = collect_tags(way.tags());
                    if append {
                        emitter.way_modify(way.id(), &refs, &tags)?;
                    } else {
                        emitter.way_add(way.id(), &refs, &tags)?;
                    }
                }
                Element::Relation(rel) => {
                    let members = collect_members(&rel);
                    let tags = collect_tags(rel.tags());
                    if append {
                        emitter.relation_modify(rel.id(), &members, &tags)?;
                    } else {
                        emitter.relation_add(rel.id(), &members, &tags)?;
                    }
                }
            }
        }
    }

    progress.finish();
    Ok(())
}

fn feed_node(
    emitter: &mut Emitter,
    append: bool,
    id: i64,
    lat: f64,
    lon: f64,
    tags: &Tags,
) -> Result<()> {
    if append {
        emitter.node_modify(id, lat, lon, tags)
    } else {
        emitter.node_add(id, lat, lon, tags)
    }
}

fn collect_tags<'a, I>(tags: I) -> Tags
where
    I: Iterator<Item = (&'a str, &'a str)>,
{
    tags.collect()
}

fn collect_members(rel: &osmpbf::Relation) -> Vec<Member> {
    rel.members()
        .map(|m| Member {
            member_type: match m.member_type {
                RelMemberType::Node => MemberType::Node,
                RelMemberType::Way => MemberType::Way,
                RelMemberType::Relation => MemberType::Relation,
            },
            id: m.member_id,
            role: m.role().unwrap_or_default().to_string(),
        })
        .collect()
}
