//! Durable ordered sets of OSM ids, one per kind of deferred work.
//!
//! The authoritative copy lives in memory so marks made while
//! processing relations are immediately visible to the way pass; the
//! database table mirrors it for crash durability. Marks are batched
//! and flushed on `commit`, matching the buffered writes of the output
//! tables.

use crate::db::Database;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fmt::Write;

const MARK_BATCH: usize = 1024;

pub struct IdTracker {
    table: String,
    ids: BTreeSet<i64>,
    unflushed: Vec<i64>,
    db: Box<dyn Database>,
}

impl IdTracker {
    /// Creates (or recreates) the backing table `{prefix}_{name}`.
    pub fn new(prefix: &str, name: &str, mut db: Box<dyn Database>) -> Result<IdTracker> {
        let table = format!("{}_{}", prefix, name);
        db.execute(&format!("DROP TABLE IF EXISTS {}", table))
            .with_context(|| format!("couldn't reset tracker table {}", table))?;
        db.execute(&format!(
            "CREATE TABLE {} (id BIGINT PRIMARY KEY)",
            table
        ))
        .with_context(|| format!("couldn't create tracker table {}", table))?;
        Ok(IdTracker {
            table,
            ids: BTreeSet::new(),
            unflushed: Vec::new(),
            db,
        })
    }

    /// Marking the same id twice is fine.
    pub fn mark(&mut self, id: i64) -> Result<()> {
        if self.ids.insert(id) {
            self.unflushed.push(id);
            if self.unflushed.len() >= MARK_BATCH {
                self.flush()?;
            }
        }
        Ok(())
    }

    pub fn is_marked(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Removes and returns the smallest marked id; `None` once empty.
    /// Successive calls yield a strictly increasing sequence.
    pub fn pop_lowest(&mut self) -> Result<Option<i64>> {
        let Some(id) = self.ids.pop_first() else {
            return Ok(None);
        };
        self.flush()?;
        self.db
            .execute_id(&format!("DELETE FROM {} WHERE id = $1", self.table), id)?;
        Ok(Some(id))
    }

    pub fn commit(&mut self) -> Result<()> {
        self.flush()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn flush(&mut self) -> Result<()> {
        if self.unflushed.is_empty() {
            return Ok(());
        }
        let mut sql = format!("INSERT INTO {} (id) VALUES ", self.table);
        for (i, id) in self.unflushed.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            let _ = write!(sql, "({})", id);
        }
        sql.push_str(" ON CONFLICT (id) DO NOTHING");
        self.db
            .execute(&sql)
            .with_context(|| format!("couldn't flush marks to {}", self.table))?;
        self.unflushed.clear();
        Ok(())
    }
}
