use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use serde::Serialize;

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::fixture::{FixtureRecord, serialize_fixture};
use crate::ledger::SyncLedger;
use crate::naming::{article_file_name, fixture_file_name};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Updated,
    Unchanged,
}

impl WriteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Writes articles and per-article fixtures, refusing any path outside the
/// article root or the fixture directory respectively.
#[derive(Debug, Clone)]
pub struct ArticleWriter {
    article_root: PathBuf,
    fixture_dir: PathBuf,
}

impl ArticleWriter {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            article_root: settings.article_root.clone(),
            fixture_dir: settings.fixture_dir.clone(),
        }
    }

    pub fn article_path(&self, stem: &str, extension: &str) -> Result<PathBuf> {
        let file_name = article_file_name(stem, extension);
        ensure_single_component(&file_name)?;
        Ok(self.article_root.join(file_name))
    }

    pub fn fixture_path(&self, stem: &str) -> Result<PathBuf> {
        let file_name = fixture_file_name(stem);
        ensure_single_component(&file_name)?;
        Ok(self.fixture_dir.join(file_name))
    }

    pub fn write_article(&self, path: &Path, content: &str) -> Result<WriteOutcome> {
        validate_scoped_path(&self.article_root, path)?;
        write_scoped(path, content)
    }

    /// Write `record` as a one-element fixture. Refused when the ledger already
    /// assigns this file to a different pk.
    pub fn write_fixture_file(
        &self,
        path: &Path,
        record: &FixtureRecord,
        ledger: &dyn SyncLedger,
    ) -> Result<WriteOutcome> {
        validate_scoped_path(&self.fixture_dir, path)?;
        if let Some(file_name) = path.file_name().and_then(|name| name.to_str())
            && let Some(owner) = ledger.owner_of(file_name)?
            && Some(owner) != record.pk
        {
            return Err(SyncError::FixtureOwned {
                path: path.to_path_buf(),
                owner,
            }
            .into());
        }
        write_scoped(path, &serialize_fixture(std::slice::from_ref(record))?)
    }
}

fn write_scoped(path: &Path, content: &str) -> Result<WriteOutcome> {
    let outcome = match fs::read(path) {
        Ok(existing) if existing == content.as_bytes() => return Ok(WriteOutcome::Unchanged),
        Ok(_) => WriteOutcome::Updated,
        Err(_) => WriteOutcome::Created,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| SyncError::io("create", parent, error))?;
    }
    fs::write(path, content).map_err(|error| SyncError::io("write", path, error))?;
    Ok(outcome)
}

fn ensure_single_component(file_name: &str) -> Result<()> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => bail!("refusing to derive a path from unsafe file name {file_name:?}"),
    }
}

pub fn validate_scoped_path(root: &Path, candidate: &Path) -> Result<()> {
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = normalize_pathbuf(&absolute);
    let allowed = normalize_pathbuf(root);

    if normalized != allowed && normalized.starts_with(&allowed) {
        return Ok(());
    }

    bail!(
        "path escapes scoped directory: {}\nallowed root: {}",
        display_path(&normalized),
        display_path(&allowed)
    )
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn normalize_pathbuf(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(std::path::MAIN_SEPARATOR_STR)),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
