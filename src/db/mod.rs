//! Thin seam over the database client so output tables and trackers
//! can be exercised against a recording stand-in in tests.

use anyhow::{Context, Result};
use postgres::{Client, NoTls};
use std::io::Write;

pub trait Database: Send {
    fn execute(&mut self, sql: &str) -> Result<()>;

    /// Parameterised statement with one bigint argument. Returns rows
    /// affected.
    fn execute_id(&mut self, sql: &str, id: i64) -> Result<u64>;

    /// One complete COPY round: start `cmd`, stream `data`, finish.
    fn copy(&mut self, cmd: &str, data: &[u8]) -> Result<()>;

    /// Query with one bigint argument returning a single text column.
    fn query_text(&mut self, sql: &str, id: i64) -> Result<Vec<String>>;
}

pub struct PgConnection {
    client: Client,
}

impl PgConnection {
    pub fn connect(conninfo: &str) -> Result<PgConnection> {
        let client = Client::connect(conninfo, NoTls)
            .with_context(|| "failed to connect to output database")?;
        Ok(PgConnection { client })
    }
}

impl Database for PgConnection {
    fn execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .with_context(|| format!("statement failed: {}", sql))
    }

    fn execute_id(&mut self, sql: &str, id: i64) -> Result<u64> {
        self.client
            .execute(sql, &[&id])
            .with_context(|| format!("statement failed: {}", sql))
    }

    fn copy(&mut self, cmd: &str, data: &[u8]) -> Result<()> {
        let mut writer = self
            .client
            .copy_in(cmd)
            .with_context(|| format!("copy failed to start: {}", cmd))?;
        writer.write_all(data)?;
        writer.finish().with_context(|| "copy stream rejected")?;
        Ok(())
    }

    fn query_text(&mut self, sql: &str, id: i64) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(sql, &[&id])
            .with_context(|| format!("query failed: {}", sql))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}
