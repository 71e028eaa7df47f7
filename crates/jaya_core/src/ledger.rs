//! Local record of primary keys that have already been synced.
//!
//! Each row pairs a remote `pk` (the `counter` column) with the per-article
//! fixture file it was written to. Rows are appended and never updated.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::fixture::parse_fixture_file;
use crate::schema::{open_ledger_db, upgrade_schema};
use crate::runtime::ResolvedPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncLedgerEntry {
    pub counter: i64,
    pub fixture_path: String,
}

pub trait SyncLedger {
    fn is_synced(&self, pk: i64) -> Result<bool>;

    /// Append `pk`. Fails with [`SyncError::DuplicatePk`] if it is already present.
    fn record_sync(&mut self, pk: i64, fixture_path: &str) -> Result<()>;

    fn entry(&self, pk: i64) -> Result<Option<SyncLedgerEntry>>;

    fn entries(&self) -> Result<Vec<SyncLedgerEntry>>;

    /// Pk whose entry points at `fixture_path`, if any.
    fn owner_of(&self, fixture_path: &str) -> Result<Option<i64>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.fixture_path == fixture_path)
            .map(|entry| entry.counter))
    }
}

pub struct SqliteLedger {
    connection: Connection,
}

impl SqliteLedger {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Self::open_at(&paths.db_path)
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        Self::from_connection(open_ledger_db(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory ledger")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        upgrade_schema(&connection).context("failed to prepare sync ledger schema")?;
        Ok(Self { connection })
    }
}

impl SyncLedger for SqliteLedger {
    fn is_synced(&self, pk: i64) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM blog_post_count WHERE counter = ?1)",
                [pk],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to look up pk {pk} in sync ledger"))?;
        Ok(exists == 1)
    }

    fn record_sync(&mut self, pk: i64, fixture_path: &str) -> Result<()> {
        if self.is_synced(pk)? {
            return Err(SyncError::DuplicatePk(pk).into());
        }
        self.connection
            .execute(
                "INSERT INTO blog_post_count (counter, fixture_path) VALUES (?1, ?2)",
                params![pk, fixture_path],
            )
            .with_context(|| format!("failed to record pk {pk} in sync ledger"))?;
        debug!("ledger recorded pk {pk} -> {fixture_path}");
        Ok(())
    }

    fn entry(&self, pk: i64) -> Result<Option<SyncLedgerEntry>> {
        let mut statement = self
            .connection
            .prepare(
                "SELECT counter, fixture_path FROM blog_post_count
                 WHERE counter = ?1 ORDER BY id LIMIT 1",
            )
            .context("failed to prepare sync ledger lookup")?;
        let mut rows = statement
            .query([pk])
            .with_context(|| format!("failed to look up pk {pk} in sync ledger"))?;
        let row = match rows.next().context("failed to decode sync ledger row")? {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(SyncLedgerEntry {
            counter: row.get(0).context("failed to decode ledger counter")?,
            fixture_path: row.get(1).context("failed to decode ledger fixture path")?,
        }))
    }

    fn entries(&self) -> Result<Vec<SyncLedgerEntry>> {
        let mut statement = self
            .connection
            .prepare("SELECT counter, fixture_path FROM blog_post_count ORDER BY counter, id")
            .context("failed to prepare sync ledger query")?;
        let rows = statement
            .query_map([], |row| {
                Ok(SyncLedgerEntry {
                    counter: row.get(0)?,
                    fixture_path: row.get(1)?,
                })
            })
            .context("failed to run sync ledger query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode sync ledger row")?);
        }
        Ok(out)
    }

    fn owner_of(&self, fixture_path: &str) -> Result<Option<i64>> {
        self.connection
            .query_row(
                "SELECT counter FROM blog_post_count WHERE fixture_path = ?1 ORDER BY id LIMIT 1",
                [fixture_path],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up the owner of {fixture_path}"))
    }
}

/// True when the entry's fixture file is still one of the plain files in
/// `fixture_dir`.
pub fn fixture_still_exists(entry: &SyncLedgerEntry, fixture_dir: &Path) -> Result<bool> {
    Ok(list_plain_files(fixture_dir)?.contains(&entry.fixture_path))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    FixtureMissing,
    PkNotFound,
}

impl OrphanReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FixtureMissing => "fixture_missing",
            Self::PkNotFound => "pk_not_found",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanedEntry {
    pub entry: SyncLedgerEntry,
    pub reason: OrphanReason,
}

/// Ledger entries whose fixture has disappeared from `fixture_dir`, either as
/// a file or as a record carrying the entry's pk.
pub fn find_orphaned_entries(
    ledger: &dyn SyncLedger,
    fixture_dir: &Path,
) -> Result<Vec<OrphanedEntry>> {
    let files = list_plain_files(fixture_dir)?;

    let mut fixture_pks = BTreeSet::new();
    for name in files.iter().filter(|name| name.ends_with(".json")) {
        let path = fixture_dir.join(name);
        let records = match parse_fixture_file(&path) {
            Ok(records) => records,
            Err(error) => {
                warn!("skipping unreadable fixture {}: {error}", path.display());
                continue;
            }
        };
        fixture_pks.extend(records.iter().filter_map(|record| record.pk));
    }

    let mut orphans = Vec::new();
    for entry in ledger.entries()? {
        let reason = if !files.contains(&entry.fixture_path) {
            OrphanReason::FixtureMissing
        } else if !fixture_pks.contains(&entry.counter) {
            OrphanReason::PkNotFound
        } else {
            continue;
        };
        orphans.push(OrphanedEntry { entry, reason });
    }
    Ok(orphans)
}

fn list_plain_files(dir: &Path) -> Result<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) => {
                out.insert(name.to_string());
            }
            None => warn!("skipping non-UTF-8 file name {}", entry.path().display()),
        }
    }
    Ok(out)
}
