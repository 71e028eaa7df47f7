//! Matching local articles against fixture records.
//!
//! One pass over the article directory and the aggregate fixture decides, for
//! every article/record pair, whether anything needs to be written. Records
//! and articles are linked by normalized title (`Foo Bar` <-> `Foo_Bar.md`).
//! In [`MatchMode::PrimaryKey`] a record whose pk is already in the ledger is
//! linked through the fixture file recorded for that pk instead, so renaming
//! the post remotely does not orphan the local file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::SyncError;
use crate::fixture::{FixtureRecord, FixtureSet};
use crate::ledger::SyncLedger;
use crate::naming::{
    EXTENSION_DELIMITER, filesystem_safe, filesystem_to_pretty, names_are_equal, split_extension,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMode {
    #[default]
    #[serde(rename = "pk", alias = "primary_key")]
    PrimaryKey,
    #[serde(rename = "title")]
    Title,
}

impl MatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryKey => "pk",
            Self::Title => "title",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalArticle {
    pub file_name: String,
    pub stem: String,
    pub extension: Option<String>,
    pub path: PathBuf,
}

impl LocalArticle {
    pub fn title(&self) -> String {
        filesystem_to_pretty(&self.file_name)
    }
}

/// Plain files directly under `article_root`, sorted by name. Dotfiles and
/// any path in `exclude` (the aggregate fixture usually lives here) are left
/// out.
pub fn scan_articles(article_root: &Path, exclude: &[&Path]) -> Result<Vec<LocalArticle>> {
    let mut articles = Vec::new();
    for entry in WalkDir::new(article_root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to scan {}", article_root.display()))?;
        if !entry.file_type().is_file() || exclude.contains(&entry.path()) {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            warn!("skipping non-UTF-8 file name {}", entry.path().display());
            continue;
        };
        if file_name.starts_with('.') {
            continue;
        }
        let (stem, extension) = split_extension(file_name);
        articles.push(LocalArticle {
            stem: stem.to_string(),
            extension: extension.map(str::to_string),
            path: entry.path().to_path_buf(),
            file_name: file_name.to_string(),
        });
    }
    Ok(articles)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    /// Linked record's pk is in the ledger.
    Synced { pk: i64 },
    /// Local article with no record; needs a fixture with a null pk.
    NeedsRemoteFixture,
    /// Record with no local article. `recorded` is set when the ledger already
    /// holds the pk, e.g. after the local file was deleted.
    NeedsLocalFile { pk: Option<i64>, recorded: bool },
    /// Linked record has a pk the ledger has not seen yet.
    Unrecorded { pk: i64 },
    /// Linked record still waits for the remote store to assign a pk.
    AwaitingPk,
    /// The stem's per-article fixture already belongs to `owner` in the
    /// ledger, so nothing may be written for it. `pk` is the record or local
    /// article that collided with it.
    Conflict { pk: Option<i64>, owner: i64 },
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced { .. } => "synced",
            Self::NeedsRemoteFixture => "needs_remote_fixture",
            Self::NeedsLocalFile { .. } => "needs_local_file",
            Self::Unrecorded { .. } => "unrecorded",
            Self::AwaitingPk => "awaiting_pk",
            Self::Conflict { .. } => "conflict",
        }
    }

    fn order(&self) -> u8 {
        match self {
            Self::NeedsRemoteFixture => 0,
            Self::NeedsLocalFile { .. } => 1,
            Self::Unrecorded { .. } => 2,
            Self::AwaitingPk => 3,
            Self::Conflict { .. } => 4,
            Self::Synced { .. } => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    PrimaryKey,
    Title,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub stem: String,
    pub title: String,
    pub classification: Classification,
    pub linked_by: Option<LinkKind>,
    pub article: Option<LocalArticle>,
    #[serde(skip)]
    pub record: Option<FixtureRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub synced: usize,
    pub needs_remote_fixture: usize,
    pub needs_local_file: usize,
    pub unrecorded: usize,
    pub awaiting_pk: usize,
    pub conflicts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcilePlan {
    pub mode: MatchMode,
    pub decisions: Vec<Decision>,
}

impl ReconcilePlan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for decision in &self.decisions {
            match decision.classification {
                Classification::Synced { .. } => summary.synced += 1,
                Classification::NeedsRemoteFixture => summary.needs_remote_fixture += 1,
                Classification::NeedsLocalFile { .. } => summary.needs_local_file += 1,
                Classification::Unrecorded { .. } => summary.unrecorded += 1,
                Classification::AwaitingPk => summary.awaiting_pk += 1,
                Classification::Conflict { .. } => summary.conflicts += 1,
            }
        }
        summary
    }

    /// First decision for `stem`, handy when each stem appears once.
    pub fn decision_for(&self, stem: &str) -> Option<&Decision> {
        self.decisions.iter().find(|decision| decision.stem == stem)
    }
}

pub fn reconcile(
    articles: &[LocalArticle],
    fixtures: &FixtureSet,
    ledger: &dyn SyncLedger,
    mode: MatchMode,
) -> Result<ReconcilePlan> {
    check_records(fixtures)?;

    let mut by_stem: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (index, article) in articles.iter().enumerate() {
        by_stem.entry(article.stem.as_str()).or_default().push(index);
    }

    // Stems whose per-article fixture the ledger already assigns to a pk.
    let mut stem_owners: BTreeMap<String, i64> = BTreeMap::new();
    for entry in ledger.entries()? {
        let (stem, _) = split_extension(&entry.fixture_path);
        stem_owners.entry(stem.to_string()).or_insert(entry.counter);
    }

    // First pass: ledger links. Articles claimed here are off limits to the
    // title fallback of every other record.
    let mut pk_links: Vec<Option<Vec<usize>>> = vec![None; fixtures.records.len()];
    let mut claimed_by: Vec<Option<i64>> = vec![None; articles.len()];
    if mode == MatchMode::PrimaryKey {
        for (slot, record) in pk_links.iter_mut().zip(&fixtures.records) {
            let Some(pk) = record.pk else { continue };
            let Some(entry) = ledger.entry(pk)? else {
                continue;
            };
            let (ledger_stem, _) = split_extension(&entry.fixture_path);
            if let Some(indices) = by_stem.get(ledger_stem) {
                for &index in indices {
                    claimed_by[index] = Some(pk);
                }
                *slot = Some(indices.clone());
            }
        }
    }
    let owner_of = |index: usize| {
        claimed_by[index].or_else(|| stem_owners.get(&articles[index].stem).copied())
    };

    let mut claimed = vec![false; articles.len()];
    let mut decisions = Vec::new();

    for (record, pk_link) in fixtures.records.iter().zip(pk_links) {
        let title = record.title().unwrap_or_default();
        let entry = match record.pk {
            Some(pk) => ledger.entry(pk)?,
            None => None,
        };
        let synced = entry.is_some();

        let mut conflict_owner = None;
        let link = match pk_link {
            Some(indices) => Some((LinkKind::PrimaryKey, indices)),
            None => {
                let (allowed, blocked): (Vec<usize>, Vec<usize>) = articles
                    .iter()
                    .enumerate()
                    .filter(|(_, article)| names_are_equal(title, &article.stem))
                    .map(|(index, _)| index)
                    .partition(|&index| {
                        owner_of(index).is_none_or(|owner| Some(owner) == record.pk)
                    });
                conflict_owner = blocked.first().and_then(|&index| owner_of(index));
                (!allowed.is_empty()).then_some((LinkKind::Title, allowed))
            }
        };

        let Some((linked_by, indices)) = link else {
            let stem = match (&entry, mode) {
                (Some(entry), MatchMode::PrimaryKey) => {
                    split_extension(&entry.fixture_path).0.to_string()
                }
                _ => filesystem_safe(title),
            };
            let conflict_owner = conflict_owner.or_else(|| {
                stem_owners
                    .get(&stem)
                    .copied()
                    .filter(|owner| Some(*owner) != record.pk)
            });
            let classification = match conflict_owner {
                Some(owner) => Classification::Conflict {
                    pk: record.pk,
                    owner,
                },
                None => Classification::NeedsLocalFile {
                    pk: record.pk,
                    recorded: synced,
                },
            };
            debug!("{title:?}: {} (no local article)", classification.as_str());
            decisions.push(Decision {
                stem,
                title: title.to_string(),
                classification,
                linked_by: None,
                article: None,
                record: Some(record.clone()),
            });
            continue;
        };

        let classification = match record.pk {
            Some(pk) if synced => Classification::Synced { pk },
            Some(pk) => Classification::Unrecorded { pk },
            None => Classification::AwaitingPk,
        };
        for index in indices {
            claimed[index] = true;
            let article = &articles[index];
            debug!(
                "{}: {} (linked by {linked_by:?})",
                article.file_name,
                classification.as_str()
            );
            decisions.push(Decision {
                stem: article.stem.clone(),
                title: title.to_string(),
                classification,
                linked_by: Some(linked_by),
                article: Some(article.clone()),
                record: Some(record.clone()),
            });
        }
    }

    for (index, article) in articles.iter().enumerate() {
        if claimed[index] {
            continue;
        }
        let title = article.title();
        let classification = match owner_of(index) {
            Some(owner) => Classification::Conflict { pk: None, owner },
            None => Classification::NeedsRemoteFixture,
        };
        if classification == Classification::NeedsRemoteFixture
            && article.stem.contains(EXTENSION_DELIMITER)
        {
            warn!(
                "{}: title {title:?} is cut at the first '{EXTENSION_DELIMITER}'",
                article.file_name
            );
        }
        debug!("{}: {}", article.file_name, classification.as_str());
        decisions.push(Decision {
            stem: article.stem.clone(),
            title,
            classification,
            linked_by: None,
            article: Some(article.clone()),
            record: None,
        });
    }

    decisions.sort_by(|left, right| {
        left.classification
            .order()
            .cmp(&right.classification.order())
            .then_with(|| left.stem.cmp(&right.stem))
    });

    Ok(ReconcilePlan { mode, decisions })
}

/// Every record needs a title, and non-null pks must be unique.
fn check_records(fixtures: &FixtureSet) -> Result<()> {
    let mut seen: HashMap<i64, usize> = HashMap::new();
    for (index, record) in fixtures.records.iter().enumerate() {
        if record.title().is_none() {
            return Err(SyncError::MissingField {
                path: fixtures.path.clone(),
                index,
                field: "fields.title",
            }
            .into());
        }
        if let Some(pk) = record.pk
            && let Some(first) = seen.insert(pk, index)
        {
            return Err(SyncError::MalformedFixture {
                path: fixtures.path.clone(),
                reason: format!("pk {pk} appears in records #{first} and #{index}"),
            }
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::fixture::FixtureTemplate;
    use crate::ledger::SyncLedgerEntry;

    #[derive(Default)]
    struct MockLedger {
        entries: BTreeMap<i64, String>,
    }

    impl MockLedger {
        fn with(entries: &[(i64, &str)]) -> Self {
            Self {
                entries: entries
                    .iter()
                    .map(|(pk, path)| (*pk, path.to_string()))
                    .collect(),
            }
        }
    }

    impl SyncLedger for MockLedger {
        fn is_synced(&self, pk: i64) -> anyhow::Result<bool> {
            Ok(self.entries.contains_key(&pk))
        }

        fn record_sync(&mut self, pk: i64, fixture_path: &str) -> anyhow::Result<()> {
            if self.entries.contains_key(&pk) {
                return Err(SyncError::DuplicatePk(pk).into());
            }
            self.entries.insert(pk, fixture_path.to_string());
            Ok(())
        }

        fn entry(&self, pk: i64) -> anyhow::Result<Option<SyncLedgerEntry>> {
            Ok(self.entries.get(&pk).map(|path| SyncLedgerEntry {
                counter: pk,
                fixture_path: path.clone(),
            }))
        }

        fn entries(&self) -> anyhow::Result<Vec<SyncLedgerEntry>> {
            Ok(self
                .entries
                .iter()
                .map(|(pk, path)| SyncLedgerEntry {
                    counter: *pk,
                    fixture_path: path.clone(),
                })
                .collect())
        }
    }

    fn article(file_name: &str) -> LocalArticle {
        let (stem, extension) = split_extension(file_name);
        LocalArticle {
            file_name: file_name.to_string(),
            stem: stem.to_string(),
            extension: extension.map(str::to_string),
            path: PathBuf::from("/blog/articles").join(file_name),
        }
    }

    fn fixtures(records: &[(Option<i64>, &str)]) -> FixtureSet {
        let template = FixtureTemplate::default();
        FixtureSet {
            path: PathBuf::from("/blog/articles/fixtures.json"),
            records: records
                .iter()
                .map(|(pk, title)| template.construct(*pk, title, "remote body"))
                .collect(),
        }
    }

    fn classification(plan: &ReconcilePlan, stem: &str) -> Classification {
        plan.decision_for(stem)
            .unwrap_or_else(|| panic!("no decision for {stem}"))
            .classification
    }

    #[test]
    fn synced_and_new_local_articles() {
        let articles = [article("A.md"), article("B.md")];
        let fixtures = fixtures(&[(Some(1), "A")]);
        let ledger = MockLedger::with(&[(1, "A.json")]);

        for mode in [MatchMode::PrimaryKey, MatchMode::Title] {
            let plan = reconcile(&articles, &fixtures, &ledger, mode).expect("reconcile");
            assert_eq!(classification(&plan, "A"), Classification::Synced { pk: 1 });
            assert_eq!(classification(&plan, "B"), Classification::NeedsRemoteFixture);
            assert_eq!(plan.decision_for("B").expect("B").title, "B");
        }
    }

    #[test]
    fn record_without_article_needs_local_file() {
        let fixtures = fixtures(&[(Some(5), "Foo Bar")]);
        let plan = reconcile(&[], &fixtures, &MockLedger::default(), MatchMode::PrimaryKey)
            .expect("reconcile");
        assert_eq!(
            classification(&plan, "Foo_Bar"),
            Classification::NeedsLocalFile {
                pk: Some(5),
                recorded: false
            }
        );
        let decision = plan.decision_for("Foo_Bar").expect("decision");
        assert_eq!(decision.title, "Foo Bar");
        assert!(decision.record.is_some());
    }

    #[test]
    fn linked_records_without_ledger_entry() {
        let articles = [article("Posted.md"), article("Draft.md")];
        let fixtures = fixtures(&[(Some(3), "Posted"), (None, "Draft")]);
        let plan = reconcile(&articles, &fixtures, &MockLedger::default(), MatchMode::Title)
            .expect("reconcile");
        assert_eq!(classification(&plan, "Posted"), Classification::Unrecorded { pk: 3 });
        assert_eq!(classification(&plan, "Draft"), Classification::AwaitingPk);
        assert_eq!(
            plan.summary(),
            PlanSummary {
                unrecorded: 1,
                awaiting_pk: 1,
                ..PlanSummary::default()
            }
        );
    }

    #[test]
    fn pk_mode_survives_remote_rename() {
        let articles = [article("Old_Name.md")];
        let fixtures = fixtures(&[(Some(5), "New Name")]);
        let ledger = MockLedger::with(&[(5, "Old_Name.json")]);

        let plan = reconcile(&articles, &fixtures, &ledger, MatchMode::PrimaryKey)
            .expect("reconcile");
        assert_eq!(plan.decisions.len(), 1);
        assert_eq!(classification(&plan, "Old_Name"), Classification::Synced { pk: 5 });
        assert_eq!(plan.decisions[0].linked_by, Some(LinkKind::PrimaryKey));

        let legacy = reconcile(&articles, &fixtures, &ledger, MatchMode::Title)
            .expect("reconcile");
        assert_eq!(
            classification(&legacy, "New_Name"),
            Classification::NeedsLocalFile {
                pk: Some(5),
                recorded: true
            }
        );
        assert_eq!(
            classification(&legacy, "Old_Name"),
            Classification::Conflict { pk: None, owner: 5 }
        );
    }

    #[test]
    fn pk_claimed_article_is_not_reused_by_title() {
        // Y.md was synced as pk 5; the remote renamed pk 5 to "X" and created
        // pk 6 titled "Y".
        let articles = [article("Y.md")];
        let fixtures = fixtures(&[(Some(5), "X"), (Some(6), "Y")]);
        let ledger = MockLedger::with(&[(5, "Y.json")]);

        let plan = reconcile(&articles, &fixtures, &ledger, MatchMode::PrimaryKey)
            .expect("reconcile");
        assert_eq!(
            plan.summary(),
            PlanSummary {
                synced: 1,
                conflicts: 1,
                ..PlanSummary::default()
            }
        );
        let conflict = plan
            .decisions
            .iter()
            .find(|decision| decision.title == "Y")
            .expect("decision for pk 6");
        assert_eq!(
            conflict.classification,
            Classification::Conflict {
                pk: Some(6),
                owner: 5
            }
        );
        assert!(conflict.article.is_none());
    }

    #[test]
    fn record_whose_stem_is_owned_by_deleted_article_conflicts() {
        // The local file for pk 5 is gone and pk 6 now wants the same name.
        let fixtures = fixtures(&[(Some(6), "Y")]);
        let ledger = MockLedger::with(&[(5, "Y.json")]);
        let plan = reconcile(&[], &fixtures, &ledger, MatchMode::PrimaryKey).expect("reconcile");
        assert_eq!(
            classification(&plan, "Y"),
            Classification::Conflict {
                pk: Some(6),
                owner: 5
            }
        );
    }

    #[test]
    fn recorded_record_without_article_keeps_ledger_stem() {
        let fixtures = fixtures(&[(Some(5), "New Name")]);
        let ledger = MockLedger::with(&[(5, "Old_Name.json")]);
        let plan = reconcile(&[], &fixtures, &ledger, MatchMode::PrimaryKey).expect("reconcile");
        assert_eq!(
            classification(&plan, "Old_Name"),
            Classification::NeedsLocalFile {
                pk: Some(5),
                recorded: true
            }
        );
    }

    #[test]
    fn title_matching_is_exact() {
        let articles = [article("foo_bar.md"), article("Foo Bar.md")];
        let fixtures = fixtures(&[(None, "Foo Bar")]);
        let plan = reconcile(&articles, &fixtures, &MockLedger::default(), MatchMode::Title)
            .expect("reconcile");
        assert_eq!(plan.summary().needs_remote_fixture, 2);
        assert_eq!(plan.summary().needs_local_file, 1);
    }

    #[test]
    fn every_extension_of_a_stem_is_linked() {
        let articles = [article("Foo.md"), article("Foo.txt")];
        let fixtures = fixtures(&[(Some(1), "Foo")]);
        let ledger = MockLedger::with(&[(1, "Foo.json")]);
        let plan = reconcile(&articles, &fixtures, &ledger, MatchMode::PrimaryKey)
            .expect("reconcile");
        assert_eq!(plan.summary().synced, 2);
    }

    #[test]
    fn duplicate_pk_in_fixture_is_malformed() {
        let fixtures = fixtures(&[(Some(1), "A"), (Some(1), "B"), (None, "C"), (None, "D")]);
        let error = reconcile(&[], &fixtures, &MockLedger::default(), MatchMode::Title)
            .expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::MalformedFixture { .. })
        ));
    }

    #[test]
    fn record_without_title_is_missing_field() {
        let mut fixtures = fixtures(&[(Some(1), "A")]);
        fixtures.records[0].fields.remove("title");
        let error = reconcile(&[], &fixtures, &MockLedger::default(), MatchMode::Title)
            .expect_err("must fail");
        assert!(matches!(
            error.downcast_ref::<SyncError>(),
            Some(SyncError::MissingField {
                field: "fields.title",
                ..
            })
        ));
    }

    #[test]
    fn scan_articles_skips_fixture_dotfiles_and_dirs() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("articles");
        fs::create_dir_all(root.join("drafts")).expect("create dirs");
        fs::write(root.join("B_Post.md"), "b").expect("write b");
        fs::write(root.join("A_Post.rst"), "a").expect("write a");
        fs::write(root.join("Bare"), "bare").expect("write bare");
        fs::write(root.join(".DS_Store"), "").expect("write dotfile");
        fs::write(root.join("fixtures.json"), "[]").expect("write fixture");
        fs::write(root.join("drafts").join("Nested.md"), "n").expect("write nested");

        let fixture_file = root.join("fixtures.json");
        let articles = scan_articles(&root, &[fixture_file.as_path()]).expect("scan");
        let names: Vec<&str> = articles.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["A_Post.rst", "B_Post.md", "Bare"]);
        assert_eq!(articles[0].stem, "A_Post");
        assert_eq!(articles[0].extension.as_deref(), Some("rst"));
        assert_eq!(articles[0].title(), "A Post");
        assert_eq!(articles[2].extension, None);
    }

    #[test]
    fn scan_articles_keeps_dotted_stems() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("v1.2_notes.md"), "notes").expect("write");
        let articles = scan_articles(temp.path(), &[]).expect("scan");
        assert_eq!(articles[0].stem, "v1.2_notes");

        let fixtures = fixtures(&[(Some(3), "v1.2 notes")]);
        let ledger = MockLedger::with(&[(3, "v1.2_notes.json")]);
        let plan = reconcile(&articles, &fixtures, &ledger, MatchMode::Title).expect("reconcile");
        assert_eq!(classification(&plan, "v1.2_notes"), Classification::Synced { pk: 3 });
    }

    #[cfg(unix)]
    #[test]
    fn scan_articles_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join(OsStr::from_bytes(b"bad\xff.md")), "x").expect("write bad");
        fs::write(temp.path().join("Good.md"), "g").expect("write good");
        let articles = scan_articles(temp.path(), &[]).expect("scan");
        let names: Vec<&str> = articles.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(names, vec!["Good.md"]);
    }
}
