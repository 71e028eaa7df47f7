use std::fs;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::fixture::{FixtureRecord, FixtureSet};
use crate::ledger::SyncLedger;
use crate::naming::fixture_file_name;
use crate::reconcile::{
    Classification, Decision, LocalArticle, PlanSummary, ReconcilePlan, reconcile, scan_articles,
};
use crate::resolver::ExtensionResolver;
use crate::writer::{ArticleWriter, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Write null-pk fixtures for local articles the remote has not seen.
    pub collect: bool,
    /// Write local articles and ledger entries for remote records.
    pub fetch: bool,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            collect: true,
            fetch: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncItemResult {
    pub stem: String,
    pub title: String,
    pub classification: &'static str,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub mode: &'static str,
    pub fetched_records: usize,
    pub local_articles: usize,
    pub plan: PlanSummary,
    pub fixtures_written: usize,
    pub articles_written: usize,
    pub ledger_recorded: usize,
    pub skipped: usize,
    pub pending: usize,
    pub items: Vec<SyncItemResult>,
}

impl SyncReport {
    /// Articles or fixtures this run brought into existence.
    pub fn created(&self) -> usize {
        self.fixtures_written + self.articles_written
    }
}

/// Scan and reconcile without touching anything. Returns the plan plus the
/// number of fetched records and local articles it was built from.
pub fn plan_sync(
    settings: &SyncSettings,
    ledger: &dyn SyncLedger,
) -> Result<(ReconcilePlan, usize, usize)> {
    let fixtures = FixtureSet::load(&settings.fixture_file)?;
    info!(
        "fetched {} posts from {}",
        fixtures.records.len(),
        settings.fixture_file.display()
    );
    let articles = scan_articles(&settings.article_root, &[settings.fixture_file.as_path()])?;
    let plan = reconcile(&articles, &fixtures, ledger, settings.match_mode)?;
    Ok((plan, fixtures.records.len(), articles.len()))
}

pub fn run_sync(
    settings: &SyncSettings,
    ledger: &mut dyn SyncLedger,
    resolver: &mut dyn ExtensionResolver,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let (plan, fetched_records, local_articles) = plan_sync(settings, ledger)?;
    let mut report = SyncReport {
        dry_run: options.dry_run,
        mode: plan.mode.as_str(),
        fetched_records,
        local_articles,
        plan: plan.summary(),
        fixtures_written: 0,
        articles_written: 0,
        ledger_recorded: 0,
        skipped: 0,
        pending: 0,
        items: Vec::new(),
    };
    apply_plan(&plan, settings, ledger, resolver, options, &mut report)?;

    info!(
        "created {} files and skipped {}",
        report.created(),
        report.skipped
    );
    Ok(report)
}

fn apply_plan(
    plan: &ReconcilePlan,
    settings: &SyncSettings,
    ledger: &mut dyn SyncLedger,
    resolver: &mut dyn ExtensionResolver,
    options: &SyncOptions,
    report: &mut SyncReport,
) -> Result<()> {
    let writer = ArticleWriter::new(settings);

    for decision in &plan.decisions {
        let linked = (&decision.classification, &decision.article, &decision.record);
        let (action, detail) = match linked {
            (Classification::Synced { pk }, _, _) => {
                info!("\"{}\" already exists", decision.title);
                report.skipped += 1;
                ("skipped".to_string(), Some(format!("already synced as pk {pk}")))
            }
            (Classification::NeedsRemoteFixture, Some(article), _) if options.collect => {
                collect_article(decision, article, settings, &writer, &*ledger, options, report)?
            }
            (Classification::NeedsLocalFile { pk, recorded }, _, Some(record))
                if options.fetch =>
            {
                let extension = resolver.resolve(&decision.stem, &decision.title)?;
                let article_path = writer.article_path(&decision.stem, &extension)?;
                let content = record.content().unwrap_or_else(|| {
                    warn!(
                        "\"{}\" has no content field; writing an empty article",
                        decision.title
                    );
                    ""
                });
                if options.dry_run {
                    report.articles_written += 1;
                    (
                        "would_create_article".to_string(),
                        Some(article_path.display().to_string()),
                    )
                } else {
                    // Fixture first: it is the write the ledger may refuse.
                    let fixture =
                        write_record_fixture(decision, record, &writer, &*ledger, report)?;
                    info!("creating article \"{}\"", decision.title);
                    let outcome = writer.write_article(&article_path, content)?;
                    report.articles_written += 1;
                    let recorded_now = match (pk, recorded) {
                        (Some(pk), false) => {
                            ledger.record_sync(*pk, &fixture)?;
                            info!("created pk {pk}");
                            report.ledger_recorded += 1;
                            true
                        }
                        (Some(_), true) => false,
                        (None, _) => {
                            warn!("\"{}\" has no pk yet; ledger entry deferred", decision.title);
                            report.pending += 1;
                            false
                        }
                    };
                    (
                        format!("article_{}", outcome.as_str()),
                        Some(format!(
                            "{}{}",
                            article_path.display(),
                            if recorded_now { ", ledger recorded" } else { "" }
                        )),
                    )
                }
            }
            (Classification::Unrecorded { pk }, _, Some(record)) if options.fetch => {
                if options.dry_run {
                    report.ledger_recorded += 1;
                    ("would_record".to_string(), Some(format!("pk {pk}")))
                } else if ledger.is_synced(*pk)? {
                    // Another article with the same stem already recorded it this run.
                    report.skipped += 1;
                    ("skipped".to_string(), Some(format!("pk {pk} already recorded")))
                } else {
                    let fixture =
                        write_record_fixture(decision, record, &writer, &*ledger, report)?;
                    ledger.record_sync(*pk, &fixture)?;
                    info!("recorded pk {pk} for existing article \"{}\"", decision.title);
                    report.ledger_recorded += 1;
                    ("recorded".to_string(), Some(format!("pk {pk} -> {fixture}")))
                }
            }
            (Classification::AwaitingPk, _, _) => {
                warn!("\"{}\" is waiting for a pk from the remote store", decision.title);
                report.pending += 1;
                (
                    "pending".to_string(),
                    Some("waiting for the remote store to assign a pk".to_string()),
                )
            }
            (Classification::Conflict { pk, owner }, _, _) => {
                let subject = match pk {
                    Some(pk) => format!("pk {pk}"),
                    None => "local article".to_string(),
                };
                warn!(
                    "\"{}\" ({subject}) maps to {} which the ledger assigns to pk {owner}; \
                     rename one of them",
                    decision.title,
                    fixture_file_name(&decision.stem)
                );
                report.skipped += 1;
                (
                    "conflict".to_string(),
                    Some(format!("{subject} collides with pk {owner}")),
                )
            }
            _ => {
                report.skipped += 1;
                (
                    "deferred".to_string(),
                    Some("direction disabled for this run".to_string()),
                )
            }
        };

        report.items.push(SyncItemResult {
            stem: decision.stem.clone(),
            title: decision.title.clone(),
            classification: decision.classification.as_str(),
            action,
            detail,
        });
    }
    Ok(())
}

fn collect_article(
    decision: &Decision,
    article: &LocalArticle,
    settings: &SyncSettings,
    writer: &ArticleWriter,
    ledger: &dyn SyncLedger,
    options: &SyncOptions,
    report: &mut SyncReport,
) -> Result<(String, Option<String>)> {
    let fixture_path = writer.fixture_path(&decision.stem)?;
    if options.dry_run {
        report.fixtures_written += 1;
        return Ok((
            "would_create_fixture".to_string(),
            Some(fixture_path.display().to_string()),
        ));
    }

    let content = fs::read_to_string(&article.path)
        .map_err(|error| SyncError::io("read", &article.path, error))?;
    let record = settings
        .template
        .construct(None, &decision.title, &content);
    let outcome = writer.write_fixture_file(&fixture_path, &record, ledger)?;
    info!(
        "wrote fixture {} ({})",
        fixture_path.display(),
        outcome.as_str()
    );
    if outcome != WriteOutcome::Unchanged {
        report.fixtures_written += 1;
    }
    Ok((
        format!("fixture_{}", outcome.as_str()),
        Some(fixture_path.display().to_string()),
    ))
}

/// Write the remote record as the per-article fixture and return the fixture
/// file name the ledger should remember.
fn write_record_fixture(
    decision: &Decision,
    record: &FixtureRecord,
    writer: &ArticleWriter,
    ledger: &dyn SyncLedger,
    report: &mut SyncReport,
) -> Result<String> {
    let file_name = fixture_file_name(&decision.stem);
    let path = writer.fixture_path(&decision.stem)?;
    let outcome = writer.write_fixture_file(&path, record, ledger)?;
    info!("wrote fixture {} to {}", file_name, path.display());
    if outcome != WriteOutcome::Unchanged {
        report.fixtures_written += 1;
    }
    Ok(file_name)
}
