use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::{PathsSection, load_config};

pub const STATE_DIR_NAME: &str = ".jaya";
pub const DB_FILENAME: &str = "jaya.db";
pub const DEFAULT_ARTICLE_DIR: &str = "articles";
pub const DEFAULT_FIXTURE_DIR: &str = "fixtures";
pub const DEFAULT_FIXTURE_FILE: &str = "fixtures.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub article_root: PathBuf,
    pub fixture_dir: PathBuf,
    pub fixture_file: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
    pub layout_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub article_root_exists: bool,
    pub fixture_dir_exists: bool,
    pub fixture_file_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    /// Conventional layout rooted at `project_root`, with no config file consulted.
    pub fn under_root(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let state_dir = project_root.join(STATE_DIR_NAME);
        let data_dir = state_dir.join("data");
        let article_root = project_root.join(DEFAULT_ARTICLE_DIR);
        Self {
            fixture_dir: project_root.join(DEFAULT_FIXTURE_DIR),
            fixture_file: article_root.join(DEFAULT_FIXTURE_FILE),
            article_root,
            db_path: data_dir.join(DB_FILENAME),
            config_path: state_dir.join("config.toml"),
            state_dir,
            data_dir,
            project_root,
            root_source: ValueSource::Flag,
            data_source: ValueSource::Default,
            config_source: ValueSource::Default,
            layout_source: ValueSource::Default,
        }
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\narticle_root={} ({})\nfixture_dir={}\nfixture_file={}\nstate_dir={}\ndata_dir={} ({})\ndb_path={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.article_root),
            self.layout_source.as_str(),
            normalize_for_display(&self.fixture_dir),
            normalize_for_display(&self.fixture_file),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            self.data_source.as_str(),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let project_root_exists = paths.project_root.exists();
    let article_root_exists = paths.article_root.is_dir();
    let fixture_dir_exists = paths.fixture_dir.is_dir();
    let fixture_file_exists = paths.fixture_file.is_file();
    let state_dir_exists = paths.state_dir.exists();
    let data_dir_exists = paths.data_dir.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !article_root_exists {
        warnings.push("article root is missing; run `jaya init` before sync commands".to_string());
    }
    if !fixture_dir_exists {
        warnings
            .push("fixture directory is missing; run `jaya init` before sync commands".to_string());
    }
    if !fixture_file_exists {
        warnings.push(format!(
            "aggregate fixture file {} is missing; dump the remote records there before fetching",
            normalize_for_display(&paths.fixture_file)
        ));
    }

    Ok(RuntimeStatus {
        project_root_exists,
        article_root_exists,
        fixture_dir_exists,
        fixture_file_exists,
        state_dir_exists,
        data_dir_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

pub fn ensure_runtime_ready_for_sync(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if !status.article_root_exists || !status.fixture_dir_exists {
        bail!(
            "Runtime layout is not initialized for sync.\nMissing required paths:\n  - {}\n  - {}\nRun: jaya init --project-root {}",
            if status.article_root_exists {
                "article root (ok)"
            } else {
                "article root (missing)"
            },
            if status.fixture_dir_exists {
                "fixture directory (ok)"
            } else {
                "fixture directory (missing)"
            },
            normalize_for_display(&paths.project_root)
        );
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub create_fixture_file: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            create_fixture_file: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
    pub wrote_fixture_file: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = if let Some(path) = overrides.data_dir.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("JAYA_DATA_DIR") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("data"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize_from_project(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = lookup_env("JAYA_CONFIG") {
        (
            absolutize_from_project(Path::new(value.trim()), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join("config.toml"), ValueSource::Default)
    };

    let layout = load_config(&config_path)?.paths;
    let layout_source = if layout == PathsSection::default() {
        ValueSource::Default
    } else {
        ValueSource::Config
    };
    let article_root = layout
        .article_root
        .as_deref()
        .map(|path| absolutize_from_project(path, &project_root))
        .unwrap_or_else(|| project_root.join(DEFAULT_ARTICLE_DIR));
    let fixture_dir = layout
        .fixture_dir
        .as_deref()
        .map(|path| absolutize_from_project(path, &project_root))
        .unwrap_or_else(|| project_root.join(DEFAULT_FIXTURE_DIR));
    // The aggregate dump sits inside the article root unless configured otherwise.
    let fixture_file = layout
        .fixture_file
        .as_deref()
        .map(|path| absolutize_from_project(path, &article_root))
        .unwrap_or_else(|| article_root.join(DEFAULT_FIXTURE_FILE));

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        article_root,
        fixture_dir,
        fixture_file,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
        layout_source,
    })
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();

    let required_dirs = [
        paths.article_root.clone(),
        paths.fixture_dir.clone(),
        paths.state_dir.clone(),
        paths.data_dir.clone(),
    ];
    for dir in &required_dirs {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(
            &paths.config_path,
            &render_materialized_config(paths),
            options.force,
        )?
    } else {
        false
    };

    // Never clobber a real dump, even with --force.
    let wrote_fixture_file = if options.create_fixture_file {
        write_text_file(&paths.fixture_file, "[]\n", false)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
        wrote_fixture_file,
    })
}

pub fn render_materialized_config(paths: &ResolvedPaths) -> String {
    let article_root = normalize_for_display(&paths.article_root);
    let fixture_dir = normalize_for_display(&paths.fixture_dir);
    let fixture_file = normalize_for_display(&paths.fixture_file);

    format!(
        "# jaya configuration (materialized by `jaya init`)\n\n[blog]\nmodel = \"blog.BlogPost\"\nsite_id = 1\n# Ask for a file extension for every article fetched from the remote dump.\nprompt_for_extension = true\ndefault_extension = \"md\"\n# \"pk\" links records through the sync ledger; \"title\" is the legacy title-only mode.\nmatch_mode = \"pk\"\n\n# Extra fields copied into every generated fixture record:\n# [blog.extra_fields]\n# status = 2\n\n# Per-article extensions used when prompting is disabled:\n# [blog.extensions]\n# \"My_Post\" = \"rst\"\n\n[paths]\narticle_root = \"{article_root}\"\nfixture_dir = \"{fixture_dir}\"\nfixture_file = \"{fixture_file}\"\n",
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = lookup_env("JAYA_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    let source = if root == context.cwd {
        ValueSource::Default
    } else {
        ValueSource::Heuristic
    };
    Ok((root, source))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join(STATE_DIR_NAME).is_dir() || candidate.join(DEFAULT_ARTICLE_DIR).is_dir()
        {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = cwd.ancestors().map(Path::to_path_buf).collect();
    if let Some(exe_dir) = executable_dir {
        out.extend(exe_dir.ancestors().map(Path::to_path_buf));
    }
    out
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn absolutize_from_project(path: &Path, project_root: &Path) -> PathBuf {
    absolutize(path, project_root)
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
