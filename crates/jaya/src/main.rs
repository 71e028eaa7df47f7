use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::exit;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use jaya_core::config::{SyncSettings, load_config};
use jaya_core::fixture::{list_available_fields, parse_fixture_file};
use jaya_core::ledger::{SqliteLedger, SyncLedger, find_orphaned_entries, fixture_still_exists};
use jaya_core::reconcile::{PlanSummary, ReconcilePlan};
use jaya_core::resolver::{ExtensionResolver, TableExtensionResolver, resolver_for};
use jaya_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready_for_sync,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use jaya_core::schema::{SCHEMA_VERSION, inspect_ledger_db, upgrade_ledger_db};
use jaya_core::sync::{SyncOptions, SyncReport, plan_sync, run_sync};
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Parser)]
#[command(
    name = "jaya",
    version,
    about = "Keep a directory of blog articles in sync with Django-style JSON fixtures"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the article, fixture and state directories.
    Init(InitArgs),
    /// Show what a sync would do without writing anything.
    Status(StatusArgs),
    /// Write null-pk fixtures for local articles the remote has not seen.
    Collect(CollectArgs),
    /// Write local articles for records in the aggregate fixture.
    Fetch(FetchArgs),
    /// Collect and fetch in one pass.
    Sync(FetchArgs),
    /// List the field names present in the aggregate fixture.
    Fields,
    Ledger(LedgerArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .jaya/config.toml")]
    no_config: bool,
    #[arg(long, help = "Skip creating an empty aggregate fixture file")]
    no_fixture_file: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(long, help = "Print the plan as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct CollectArgs {
    #[arg(long, help = "Report planned writes without performing them")]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct FetchArgs {
    #[arg(long, help = "Report planned writes without performing them")]
    dry_run: bool,
    #[arg(
        long,
        value_name = "EXT",
        help = "Use this extension for every fetched article instead of asking"
    )]
    extension: Option<String>,
    #[arg(long, help = "Never prompt; use [blog.extensions] and default_extension")]
    no_prompt: bool,
}

#[derive(Debug, Args)]
struct LedgerArgs {
    #[command(subcommand)]
    command: LedgerSubcommand,
}

#[derive(Debug, Subcommand)]
enum LedgerSubcommand {
    /// List recorded primary keys.
    List,
    /// Report entries whose fixture file or record has disappeared.
    Audit,
    /// Record a primary key by hand, e.g. after the remote assigned one.
    Record {
        pk: i64,
        #[arg(value_name = "FIXTURE_FILE")]
        fixture_path: String,
    },
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Collect,
    Fetch,
    Both,
}

fn main() {
    let layer = fmt::layer().compact().with_target(false).without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status(args)) => run_status(&runtime, args),
        Some(Commands::Collect(CollectArgs { dry_run })) => run_sync_command(
            &runtime,
            Direction::Collect,
            FetchArgs {
                dry_run,
                extension: None,
                no_prompt: true,
            },
        ),
        Some(Commands::Fetch(args)) => run_sync_command(&runtime, Direction::Fetch, args),
        Some(Commands::Sync(args)) => run_sync_command(&runtime, Direction::Both, args),
        Some(Commands::Fields) => run_fields(&runtime),
        Some(Commands::Ledger(LedgerArgs { command })) => match command {
            LedgerSubcommand::List => run_ledger_list(&runtime),
            LedgerSubcommand::Audit => run_ledger_audit(&runtime),
            LedgerSubcommand::Record { pk, fixture_path } => {
                run_ledger_record(&runtime, pk, &fixture_path)
            }
        },
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Migrate => run_db_migrate(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            create_fixture_file: !args.no_fixture_file,
            force: args.force,
        },
    )?;
    let upgrade = upgrade_ledger_db(&paths.db_path)?;

    println!("Initialized jaya runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("article_root: {}", normalize_path(&paths.article_root));
    println!("fixture_dir: {}", normalize_path(&paths.fixture_dir));
    println!("fixture_file: {}", normalize_path(&paths.fixture_file));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("wrote_fixture_file: {}", report.wrote_fixture_file);
    println!("schema_version: {}", upgrade.to);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions, args: StatusArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    let settings = load_settings(&paths)?;
    let ledger = SqliteLedger::open(&paths)?;
    let (plan, fetched, local) = plan_sync(&settings, &ledger)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    println!("sync status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("fixture_file: {}", normalize_path(&settings.fixture_file));
    println!("fetched_records: {fetched}");
    println!("local_articles: {local}");
    print_plan(&plan);
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync_command(runtime: &RuntimeOptions, direction: Direction, args: FetchArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)?;
    let settings = load_settings(&paths)?;
    let mut ledger = SqliteLedger::open(&paths)?;

    let mut resolver: Box<dyn ExtensionResolver> = match args.extension {
        Some(extension) => Box::new(TableExtensionResolver::new(BTreeMap::new(), Some(extension))),
        None if args.no_prompt => Box::new(TableExtensionResolver::from_settings(&settings)),
        None => resolver_for(&settings),
    };
    let options = SyncOptions {
        collect: direction != Direction::Fetch,
        fetch: direction != Direction::Collect,
        dry_run: args.dry_run,
    };
    let report = run_sync(&settings, &mut ledger, resolver.as_mut(), &options)?;

    let label = match direction {
        Direction::Collect => "collect",
        Direction::Fetch => "fetch",
        Direction::Both => "sync",
    };
    print_sync_report(label, &report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_fields(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let records = parse_fixture_file(&paths.fixture_file)?;
    let fields = list_available_fields(&records);

    println!("fixture fields");
    println!("fixture_file: {}", normalize_path(&paths.fixture_file));
    println!("records: {}", records.len());
    println!("fields.count: {}", fields.len());
    if fields.is_empty() {
        println!("fields: <none>");
    }
    for field in &fields {
        println!("fields.name: {field}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_ledger_list(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let ledger = SqliteLedger::open(&paths)?;
    let entries = ledger.entries()?;

    println!("sync ledger");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("entries.count: {}", entries.len());
    if entries.is_empty() {
        println!("entries: <none>");
    }
    for entry in &entries {
        let exists = fixture_still_exists(entry, &paths.fixture_dir)?;
        println!(
            "entries.pk.{}: {} (fixture {})",
            entry.counter,
            entry.fixture_path,
            if exists { "present" } else { "missing" }
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_ledger_audit(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let ledger = SqliteLedger::open(&paths)?;
    let orphans = find_orphaned_entries(&ledger, &paths.fixture_dir)?;

    println!("ledger audit");
    println!("fixture_dir: {}", normalize_path(&paths.fixture_dir));
    println!("orphans.count: {}", orphans.len());
    if orphans.is_empty() {
        println!("orphans: <none>");
    }
    for orphan in &orphans {
        println!(
            "orphans.pk.{}: {} ({})",
            orphan.entry.counter,
            orphan.entry.fixture_path,
            orphan.reason.as_str()
        );
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_ledger_record(runtime: &RuntimeOptions, pk: i64, fixture_path: &str) -> Result<()> {
    let fixture_path = fixture_path.trim();
    if fixture_path.is_empty() || Path::new(fixture_path).components().count() != 1 {
        bail!("ledger record expects a bare fixture file name, got {fixture_path:?}");
    }
    let paths = resolve_runtime_paths(runtime)?;
    let mut ledger = SqliteLedger::open(&paths)?;
    ledger
        .record_sync(pk, fixture_path)
        .with_context(|| format!("failed to record pk {pk}"))?;

    println!("ledger record");
    println!("pk: {pk}");
    println!("fixture_path: {fixture_path}");
    println!(
        "fixture_exists: {}",
        format_flag(paths.fixture_dir.join(fixture_path).is_file())
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let upgrade = upgrade_ledger_db(&paths.db_path)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("schema_version.from: {}", upgrade.from);
    println!("schema_version: {}", upgrade.to);
    println!("steps_applied: {}", upgrade.steps_applied());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let version = inspect_ledger_db(&paths.db_path)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "schema_version: {}",
        version
            .map(|version| version.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("schema_version.latest: {SCHEMA_VERSION}");
    if version == Some(SCHEMA_VERSION) {
        let ledger = SqliteLedger::open(&paths)?;
        println!("ledger.entries: {}", ledger.entries()?.len());
    } else {
        println!("ledger.storage: <not migrated> (run `jaya db migrate`)");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_settings(paths: &ResolvedPaths) -> Result<SyncSettings> {
    let config = load_config(&paths.config_path)?;
    SyncSettings::resolve(paths, &config)
}

fn print_plan(plan: &ReconcilePlan) {
    println!("mode: {}", plan.mode.as_str());
    print_plan_summary("plan", &plan.summary());
    for decision in &plan.decisions {
        println!(
            "plan.{}: {} ({})",
            decision.classification.as_str(),
            decision.stem,
            decision.title
        );
    }
}

fn print_plan_summary(prefix: &str, summary: &PlanSummary) {
    println!("{prefix}.synced: {}", summary.synced);
    println!(
        "{prefix}.needs_remote_fixture: {}",
        summary.needs_remote_fixture
    );
    println!("{prefix}.needs_local_file: {}", summary.needs_local_file);
    println!("{prefix}.unrecorded: {}", summary.unrecorded);
    println!("{prefix}.awaiting_pk: {}", summary.awaiting_pk);
    println!("{prefix}.conflicts: {}", summary.conflicts);
}

fn print_sync_report(label: &str, report: &SyncReport) {
    println!("{label}");
    println!("mode: {}", report.mode);
    println!("dry_run: {}", report.dry_run);
    println!("fetched_records: {}", report.fetched_records);
    println!("local_articles: {}", report.local_articles);
    print_plan_summary("plan", &report.plan);
    for item in &report.items {
        println!(
            "items.{}: {} ({})",
            item.action,
            item.stem,
            item.detail.as_deref().unwrap_or("-")
        );
    }
    println!("fixtures_written: {}", report.fixtures_written);
    println!("articles_written: {}", report.articles_written);
    println!("ledger_recorded: {}", report.ledger_recorded);
    println!("skipped: {}", report.skipped);
    println!("pending: {}", report.pending);
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    normalize_for_display(path)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
