//! Sync ledger schema.
//!
//! The version of a ledger database is kept in `PRAGMA user_version`. Each
//! step raises it by one and runs in its own transaction, so an interrupted
//! upgrade resumes from the last completed step.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags};
use tracing::info;

const STEPS: [&str; 2] = [
    include_str!("schema/v1_blog_post_count.sql"),
    include_str!("schema/v2_fixture_path.sql"),
];

/// Version of a fully upgraded ledger.
pub const SCHEMA_VERSION: u32 = STEPS.len() as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaUpgrade {
    pub from: u32,
    pub to: u32,
}

impl SchemaUpgrade {
    pub fn steps_applied(self) -> u32 {
        self.to - self.from
    }
}

pub fn schema_version(connection: &Connection) -> Result<u32> {
    connection
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read ledger schema version")
}

/// Apply every step above the connection's current version.
pub fn upgrade_schema(connection: &Connection) -> Result<SchemaUpgrade> {
    let from = schema_version(connection)?;
    if from > SCHEMA_VERSION {
        bail!("ledger schema v{from} is newer than this build understands (v{SCHEMA_VERSION})");
    }

    for (version, sql) in (1u32..).zip(STEPS).skip(from as usize) {
        let transaction = connection
            .unchecked_transaction()
            .context("failed to start ledger schema upgrade")?;
        transaction
            .execute_batch(sql)
            .with_context(|| format!("ledger schema step v{version} failed"))?;
        transaction
            .pragma_update(None, "user_version", version)
            .with_context(|| format!("failed to stamp ledger schema v{version}"))?;
        transaction
            .commit()
            .with_context(|| format!("failed to commit ledger schema v{version}"))?;
        info!("ledger schema upgraded to v{version}");
    }

    Ok(SchemaUpgrade {
        from,
        to: SCHEMA_VERSION,
    })
}

/// Open the ledger file, creating it and its directory when missing. The
/// schema is left untouched.
pub fn open_ledger_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Connection::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))
}

pub fn upgrade_ledger_db(db_path: &Path) -> Result<SchemaUpgrade> {
    let connection = open_ledger_db(db_path)?;
    upgrade_schema(&connection)
}

/// Schema version of an existing ledger file, read without creating or
/// upgrading anything. `None` when there is no file yet.
pub fn inspect_ledger_db(db_path: &Path) -> Result<Option<u32>> {
    if !db_path.is_file() {
        return Ok(None);
    }
    let connection = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {} read-only", db_path.display()))?;
    schema_version(&connection).map(Some)
}
